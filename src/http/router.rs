//! Trie-based method+path router supporting static, `:name`, and `**` wildcard segments.
//!
//! Preferred over a regex-per-route scanner: lookup cost stays roughly constant as the route
//! count grows, where a per-route regex scan is linear in the number of registered routes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RouteError;
use crate::http::method::Method;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::tcp_connection::SharedTcpConnection;

/// A route handler. Returns `true` if it filled `resp` synchronously (the server serializes and
/// sends it immediately), or `false` if it has adopted `conn` and will call `TcpConnection::send`
/// itself once its (possibly asynchronous) work completes.
///
/// `Arc`-wrapped rather than `Box`-wrapped so a streaming route's handler can be cloned out of the
/// router once, at `HeadersComplete`, and retained in a connection's context across every
/// subsequent buffer delivery until the body finishes arriving — a plain `Box` would tie the
/// handler's lifetime to the single `find` call that looked it up.
pub type Handler = Arc<dyn Fn(&Request, &SharedTcpConnection, &mut Response) -> bool + Send + Sync>;

/// The parameters captured while matching a request path against a registered pattern.
pub type Params = HashMap<String, String>;

struct Route {
    handler: Handler,
    /// Whether this route wants a first invocation at `HeadersComplete`, before the body has
    /// fully arrived, so it can spool a large body to storage instead of buffering it in memory.
    streaming: bool,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    param_child: Option<Box<Node>>,
    param_name: Option<String>,
    wildcard_child: Option<Box<Node>>,
    routes: HashMap<Method, Route>,
}

/// A path-pattern router keyed on method + path segments.
#[derive(Default)]
pub struct Router {
    root: Node,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    /// Registers `handler` for `method` requests matching `pattern`, e.g. `/users/:id/items/**`.
    /// `**`, if present, must be the final segment. The handler is invoked once, at `GotRequest`,
    /// with the complete request.
    pub fn add_route(
        &mut self,
        pattern: &str,
        method: Method,
        handler: Handler,
    ) -> Result<(), RouteError> {
        self.add_route_inner(pattern, method, handler, false)
    }

    /// Like [`Router::add_route`], but the handler is also invoked at `HeadersComplete` with the
    /// partial (body-not-yet-arrived) request, and again on every subsequent buffer delivery until
    /// the body finishes, so it can stream a large request body to storage as it arrives rather
    /// than have it buffered whole in memory.
    pub fn add_streaming_route(
        &mut self,
        pattern: &str,
        method: Method,
        handler: Handler,
    ) -> Result<(), RouteError> {
        self.add_route_inner(pattern, method, handler, true)
    }

    fn add_route_inner(
        &mut self,
        pattern: &str,
        method: Method,
        handler: Handler,
        streaming: bool,
    ) -> Result<(), RouteError> {
        let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();

        let mut node = &mut self.root;
        for (i, seg) in segments.iter().enumerate() {
            if seg.is_empty() {
                return Err(RouteError::EmptySegment);
            }
            if *seg == "**" {
                if i != segments.len() - 1 {
                    return Err(RouteError::WildcardNotLast);
                }
                node = node.wildcard_child.get_or_insert_with(|| Box::new(Node::default()));
                break;
            } else if let Some(name) = seg.strip_prefix(':') {
                node.param_name.get_or_insert_with(|| name.to_string());
                node = node.param_child.get_or_insert_with(|| Box::new(Node::default()));
            } else {
                node = node.children.entry((*seg).to_string()).or_default();
            }
        }

        node.routes.insert(method, Route { handler, streaming });
        Ok(())
    }

    /// Looks up a route for `method` and `path`, preferring an exact static match over a
    /// parameter match over a wildcard match at each segment. Returns the handler (cloned out of
    /// the trie so the caller can retain it independently of this router), whether it is
    /// registered as a streaming route, and the captured path parameters.
    pub fn find(&self, path: &str, method: Method) -> Option<(Handler, bool, Params)> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = Params::new();
        let node = Self::walk(&self.root, &segments, &mut params)?;
        let route = node.routes.get(&method)?;
        Some((route.handler.clone(), route.streaming, params))
    }

    fn walk<'n>(node: &'n Node, segments: &[&str], params: &mut Params) -> Option<&'n Node> {
        let Some((seg, rest)) = segments.split_first() else {
            return Some(node);
        };

        if let Some(child) = node.children.get(*seg) {
            if let Some(found) = Self::walk(child, rest, params) {
                return Some(found);
            }
        }

        if let Some(child) = &node.param_child {
            let mut candidate_params = params.clone();
            if let Some(found) = Self::walk(child, rest, &mut candidate_params) {
                if let Some(name) = &node.param_name {
                    candidate_params.insert(name.clone(), (*seg).to_string());
                }
                *params = candidate_params;
                return Some(found);
            }
        }

        if let Some(child) = &node.wildcard_child {
            params.insert("**".to_string(), segments.join("/"));
            return Some(child);
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http::status::StatusCode;

    fn noop_handler() -> Handler {
        Arc::new(|_req, _conn, resp| {
            resp.set_status(StatusCode::Ok);
            true
        })
    }

    #[test]
    fn exact_match_is_preferred_over_parameter_match() {
        let mut router = Router::new();
        router.add_route("/a/b", Method::Get, noop_handler()).unwrap();
        router.add_route("/a/:x", Method::Get, noop_handler()).unwrap();

        let (_h, _streaming, params) = router.find("/a/b", Method::Get).unwrap();
        assert!(params.is_empty());

        let (_h, _streaming, params) = router.find("/a/c", Method::Get).unwrap();
        assert_eq!(Some(&"c".to_string()), params.get("x"));
    }

    #[test]
    fn wildcard_captures_all_remaining_segments() {
        let mut router = Router::new();
        router.add_route("/files/**", Method::Get, noop_handler()).unwrap();

        let (_h, _streaming, params) = router.find("/files/x/y/z", Method::Get).unwrap();
        assert_eq!(Some(&"x/y/z".to_string()), params.get("**"));
    }

    #[test]
    fn multiple_named_parameters_are_all_captured() {
        let mut router = Router::new();
        router
            .add_route("/users/:id/items/:item", Method::Get, noop_handler())
            .unwrap();

        let (_h, _streaming, params) = router.find("/users/42/items/7", Method::Get).unwrap();
        assert_eq!(Some(&"42".to_string()), params.get("id"));
        assert_eq!(Some(&"7".to_string()), params.get("item"));
    }

    #[test]
    fn wildcard_not_in_final_position_is_rejected() {
        let mut router = Router::new();
        let err = router.add_route("/a/**/b", Method::Get, noop_handler()).unwrap_err();
        assert_eq!(RouteError::WildcardNotLast, err);
    }

    #[test]
    fn unregistered_method_on_a_known_path_does_not_match() {
        let mut router = Router::new();
        router.add_route("/a", Method::Get, noop_handler()).unwrap();
        assert!(router.find("/a", Method::Post).is_none());
    }

    #[test]
    fn streaming_route_is_reported_as_such() {
        let mut router = Router::new();
        router
            .add_streaming_route("/upload", Method::Post, noop_handler())
            .unwrap();
        router.add_route("/a", Method::Post, noop_handler()).unwrap();

        let (_h, streaming, _params) = router.find("/upload", Method::Post).unwrap();
        assert!(streaming);

        let (_h, streaming, _params) = router.find("/a", Method::Post).unwrap();
        assert!(!streaming);
    }
}
