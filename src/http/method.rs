//! Representation of a parsed HTTP request method.

use std::fmt::Display;

/// The request method, restricted to the literal set this server understands. Anything else
/// parses to `Invalid` rather than failing outright, so a handler can still respond `405`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Invalid,
}

impl Method {
    /// Parses a method token from the request line. Unrecognized tokens produce `Invalid` rather
    /// than an error; callers that require a known method should check for it explicitly.
    pub fn parse(token: &[u8]) -> Method {
        match token {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"HEAD" => Method::Head,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            _ => Method::Invalid,
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Invalid => "INVALID",
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_known_methods() {
        assert_eq!(Method::Get, Method::parse(b"GET"));
        assert_eq!(Method::Delete, Method::parse(b"DELETE"));
    }

    #[test]
    fn unknown_token_is_invalid() {
        assert_eq!(Method::Invalid, Method::parse(b"PATCH"));
    }
}
