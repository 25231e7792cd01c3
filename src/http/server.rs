//! Wires a `TcpServer`'s byte stream through an `HttpParser` into a `Router`.
//!
//! Each connection's context slot holds its own `ConnState` (parser plus any route adopted for
//! streaming), so a single `HttpServer` can multiplex an arbitrary number of connections across a
//! `LoopPool` without any per-request allocation beyond the parser itself.

use std::time::Instant;

use crate::buffer::Buffer;
use crate::config::ServerConfig;
use crate::error::ParseError;
use crate::event_loop::EventLoopHandle;
use crate::tcp_connection::TcpConnection;
use crate::tcp_server::TcpServer;

use super::parser::{HttpParser, ParseStatus};
use super::request::Request;
use super::response::Response;
use super::router::{Handler, Router};
use super::status::StatusCode;

/// An HTTP/1.1 server: a `TcpServer` whose message callback feeds each connection's bytes through
/// its own `HttpParser` and dispatches completed requests to a `Router`.
pub struct HttpServer {
    inner: TcpServer,
    router: std::sync::Arc<Router>,
}

/// Per-connection state stashed in `TcpConnection`'s context slot.
struct ConnState {
    parser: HttpParser,
    /// Set once a streaming route is resolved at `HeadersComplete`, so every later buffer
    /// delivery for this request reuses the same handler instead of re-querying the router.
    adopted: Option<Handler>,
    /// Set once a handler has synchronously sent a response before the body finished arriving
    /// (an unusual but legal `true` return at `HeadersComplete`), so the eventual `GotRequest`
    /// for the same request is dropped rather than dispatched a second time.
    finalized: bool,
}

impl ConnState {
    fn new() -> Self {
        ConnState {
            parser: HttpParser::new(),
            adopted: None,
            finalized: false,
        }
    }

    fn reset_for_next_request(&mut self) {
        self.parser.reset();
        self.adopted = None;
        self.finalized = false;
    }
}

impl HttpServer {
    /// Binds per `config` and installs the message callback that drives `router`. Does not start
    /// accepting connections until [`HttpServer::start`] is called.
    pub fn new(
        name: impl Into<String>,
        acceptor_loop: EventLoopHandle,
        config: &ServerConfig,
        router: Router,
    ) -> std::io::Result<Self> {
        let mut inner = TcpServer::new(name, acceptor_loop, config)?;
        let router = std::sync::Arc::new(router);

        let router_for_message = router.clone();
        inner.set_message_callback(move |conn, buf, now| {
            handle_bytes(conn, buf, now, &router_for_message);
        });

        Ok(HttpServer { inner, router })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    /// The router this server dispatches requests to.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Starts accepting connections.
    pub fn start(&mut self) {
        self.inner.start();
    }

    /// Number of currently tracked connections.
    pub fn num_connections(&self) -> usize {
        self.inner.num_connections()
    }

    /// Stops the server's IO loops and force-closes any connections still open.
    pub fn stop(&mut self) {
        self.inner.stop();
    }
}

fn state_mut(conn: &mut TcpConnection) -> &mut ConnState {
    if conn.context().is_none() {
        conn.set_context(Box::new(ConnState::new()));
    }
    conn.context_mut()
        .as_mut()
        .expect("context set above")
        .downcast_mut::<ConnState>()
        .expect("HttpServer owns this connection's context slot exclusively")
}

fn handle_bytes(conn: &mut TcpConnection, buf: &mut Buffer, now: Instant, router: &Router) {
    loop {
        let status = state_mut(conn).parser.parse(buf);

        match status {
            Ok(ParseStatus::NeedMore) => {
                if let Some(handler) = state_mut(conn).adopted.clone() {
                    invoke_streaming(conn, &handler, now);
                }
                return;
            }
            Ok(ParseStatus::HeadersComplete) => {
                resolve_streaming_route(conn, router);
                if let Some(handler) = state_mut(conn).adopted.clone() {
                    invoke_streaming(conn, &handler, now);
                }
                continue;
            }
            Ok(ParseStatus::GotRequest) => {
                let state = state_mut(conn);
                let request = state.parser.take_request();
                let adopted = state.adopted.take();
                let already_finalized = state.finalized;
                state.reset_for_next_request();

                if already_finalized {
                    // already handled
                } else if let Some(handler) = adopted {
                    finish_request(conn, request, &handler);
                } else {
                    dispatch(conn, request, router);
                }

                if conn.is_disconnected() {
                    return;
                }
            }
            Err(e) => {
                handle_parse_error(conn, e);
                return;
            }
        }
    }
}

/// At `HeadersComplete`, looks up the matched route once and, if it is a streaming route, stores
/// its handler in the connection's context so every later buffer delivery for this request reuses
/// it without re-querying `router`.
fn resolve_streaming_route(conn: &mut TcpConnection, router: &Router) {
    let state = state_mut(conn);
    if state.adopted.is_some() {
        return;
    }

    let (path, method) = {
        let req = state.parser.request();
        (req.path.clone(), req.method)
    };

    let Some((handler, streaming, params)) = router.find(&path, method) else {
        return;
    };
    if !streaming {
        return;
    }

    state.parser.request_mut().path_params = params;
    state.adopted = Some(handler);
}

/// Invokes a streaming route's handler with whatever of the request (headers plus however much
/// of the body has arrived so far) the parser currently holds. A `true` return means the handler
/// considers itself done even though the body hasn't fully arrived; the response is sent now and
/// the eventual `GotRequest` for this request is dropped.
fn invoke_streaming(conn: &mut TcpConnection, handler: &Handler, _now: Instant) {
    let snapshot = state_mut(conn).parser.request().clone();
    let keep_alive = snapshot.keep_alive();
    let conn_handle = conn.shared();

    let mut response = Response::new(StatusCode::Ok);
    let done = handler(&snapshot, &conn_handle, &mut response);
    if !done {
        return;
    }

    state_mut(conn).finalized = true;
    send_response(conn, response, keep_alive);
}

fn finish_request(conn: &mut TcpConnection, request: Request, handler: &Handler) {
    let keep_alive = request.keep_alive();
    let conn_handle = conn.shared();

    let mut response = Response::new(StatusCode::Ok);
    let sent_synchronously = handler(&request, &conn_handle, &mut response);
    if !sent_synchronously {
        return;
    }
    send_response(conn, response, keep_alive);
}

fn dispatch(conn: &mut TcpConnection, request: Request, router: &Router) {
    let keep_alive = request.keep_alive();

    let mut response = Response::new(StatusCode::Ok);
    let sent_synchronously = match router.find(&request.path, request.method) {
        Some((handler, _streaming, params)) => {
            let mut request = request;
            request.path_params = params;
            let conn_handle = conn.shared();
            handler(&request, &conn_handle, &mut response)
        }
        None => {
            log::debug!(
                "{}: no route for {} {}",
                conn.name(),
                request.method,
                request.path
            );
            response
                .set_status(StatusCode::NotFound)
                .set_body(&b"404 Not Found"[..])
                .set_keep_alive(false);
            true
        }
    };

    if !sent_synchronously {
        return;
    }
    send_response(conn, response, keep_alive);
}

fn send_response(conn: &mut TcpConnection, mut response: Response, keep_alive: bool) {
    response.set_keep_alive(keep_alive);
    conn.send(&response.serialize());
    if !keep_alive {
        conn.shutdown();
    }
}

fn handle_parse_error(conn: &mut TcpConnection, err: ParseError) {
    log::warn!("{}: malformed request: {err}", conn.name());
    let response = Response::new(StatusCode::BadRequest)
        .body(err.to_string().into_bytes())
        .keep_alive(false);
    conn.send(&response.serialize());
    conn.shutdown();
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};

    use crate::http::method::Method;
    use crate::http::router::Router;
    use crate::tcp_connection::TcpConnection;

    #[test]
    fn missing_route_produces_a_404_response() {
        let router = Router::new();
        assert!(router.find("/nope", Method::Get).is_none());

        let mut response = Response::new(StatusCode::Ok);
        response
            .set_status(StatusCode::NotFound)
            .set_body(&b"404 Not Found"[..]);
        let text = String::from_utf8(response.serialize()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404"));
        assert!(text.contains("404 Not Found"));
    }

    fn make_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// An upload route fed across several buffer deliveries, the way a large body arrives as a
    /// sequence of non-blocking reads rather than in one shot. Tracks how many new body bytes it
    /// has seen since its last call and accumulates the total into `written`.
    fn streaming_upload_handler(written: Arc<Mutex<usize>>) -> Handler {
        let seen = Arc::new(Mutex::new(0usize));
        std::sync::Arc::new(move |req, _conn, resp| {
            let mut seen = seen.lock().unwrap();
            let new_bytes = req.body.len() - *seen;
            *written.lock().unwrap() += new_bytes;
            *seen = req.body.len();

            let done = req.body.len() >= 10;
            if done {
                resp.set_status(StatusCode::Ok).set_body(&b"ok"[..]);
            }
            done
        })
    }

    #[test]
    fn streaming_route_is_reinvoked_across_buffer_deliveries_until_body_completes() {
        let (mut client, server) = make_pair();
        let event_loop = crate::event_loop::EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let conn = TcpConnection::new("test-upload".into(), server, handle, 64 * 1024 * 1024).unwrap();
        TcpConnection::connect_established(&conn);

        let written = Arc::new(Mutex::new(0usize));
        let mut router = Router::new();
        router
            .add_streaming_route("/upload", Method::Post, streaming_upload_handler(written.clone()))
            .unwrap();

        let mut buf = Buffer::new();
        buf.append(b"POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        {
            let mut c = conn.lock().unwrap();
            handle_bytes(&mut c, &mut buf, Instant::now(), &router);
        }
        assert_eq!(0, *written.lock().unwrap());

        buf.append(b"01234");
        {
            let mut c = conn.lock().unwrap();
            handle_bytes(&mut c, &mut buf, Instant::now(), &router);
        }
        assert_eq!(5, *written.lock().unwrap());

        buf.append(b"56789");
        {
            let mut c = conn.lock().unwrap();
            handle_bytes(&mut c, &mut buf, Instant::now(), &router);
        }
        assert_eq!(10, *written.lock().unwrap());

        let mut out = [0u8; 128];
        let n = client.read(&mut out).unwrap();
        let response = String::from_utf8_lossy(&out[..n]);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));
    }
}
