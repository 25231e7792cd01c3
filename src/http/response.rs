//! Response assembly and RFC-7230 serialization.

use super::status::StatusCode;

/// A response under construction. Serializes to the wire form
/// `HTTP/1.1 <code> <reason>\r\n<field>: <value>\r\n...\r\n\r\n<body>`.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    /// Starts a response with `status` and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets whether the `Connection` response header will read `Keep-Alive` or `close`. Normally
    /// decided for the caller by `HttpServer` from the request's own `Connection` header; exposed
    /// here so a handler can force a close (e.g. after a fatal application error).
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// In-place status setter, for handlers that build a `Response` via `&mut self` rather than
    /// the consuming builder methods above.
    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Serializes the response line, headers, `Content-Length`, and `Connection`, followed by the
    /// body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("HTTP/1.1 {}\r\n", self.status).as_bytes());

        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(
            format!(
                "Connection: {}\r\n",
                if self.keep_alive { "Keep-Alive" } else { "close" }
            )
            .as_bytes(),
        );
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serializes_status_line_and_body() {
        let resp = Response::new(StatusCode::Ok).body(&b"hi"[..]);
        let bytes = resp.serialize();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn close_connection_header_reflects_keep_alive_flag() {
        let resp = Response::new(StatusCode::NotFound).keep_alive(false);
        let text = String::from_utf8(resp.serialize()).unwrap();
        assert!(text.contains("Connection: close\r\n"));
    }
}
