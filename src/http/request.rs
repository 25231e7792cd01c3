//! Owned representation of a fully or partially parsed HTTP request.

use std::collections::HashMap;
use std::time::Instant;

use super::method::Method;
use super::version::Version;

/// One header as it appeared on the wire: original-case field name, raw value.
#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Header collection that is case-insensitive on lookup but case-preserving on iteration. Stored
/// as a plain association list rather than a lowercased map: request header counts are small
/// (single digits to low tens), so a linear scan is both simpler and at least as fast as hashing.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: String, value: String) {
        self.0.push(Header { name, value });
    }

    /// Looks up a header by name, case-insensitively. Returns the first match if the field was
    /// repeated on the wire.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Iterates headers in wire order, with their original casing.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A parsed HTTP request, complete or (while a body is still streaming in) partial.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    pub path: String,
    pub raw_query: Option<String>,
    pub headers: Headers,
    pub path_params: HashMap<String, String>,
    pub body: Vec<u8>,
    pub receive_time: Instant,
}

impl Request {
    /// Case-insensitive header lookup, forwarding to `Headers::get`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// True if the request asked to keep the connection alive, the RFC 7230 default for
    /// HTTP/1.1, and the exception rather than the rule for HTTP/1.0.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == Version::Http11,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.push("Content-Type".to_string(), "text/plain".to_string());
        assert_eq!(Some("text/plain"), headers.get("content-type"));
    }

    #[test]
    fn iteration_preserves_original_casing() {
        let mut headers = Headers::new();
        headers.push("X-Request-Id".to_string(), "abc".to_string());
        let names: Vec<&str> = headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(vec!["X-Request-Id"], names);
    }
}
