//! Incremental HTTP/1.1 request parser, owned by a connection through its context slot.
//!
//! Driven by `HttpServer`'s message callback, which feeds it the connection's input buffer on
//! every read. Unlike a parser that buffers a whole request before returning, this one surfaces a
//! `HeadersComplete` event the moment headers finish, so a handler can start streaming a large
//! body to storage instead of waiting for it to land in memory in full.

use std::collections::HashMap;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::error::ParseError;

use super::method::Method;
use super::request::{Headers, Request};
use super::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    GotAll,
}

/// What the most recent call to [`HttpParser::parse`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Not enough bytes buffered yet; wait for the next read.
    NeedMore,
    /// The request line and headers are complete; a body, if any, is still arriving.
    HeadersComplete,
    /// The full request, including any body, is available via [`HttpParser::take_request`].
    GotRequest,
}

/// Stateful per-connection parser. One instance handles an unbounded number of pipelined requests
/// on a persistent connection via [`HttpParser::reset`].
#[derive(Debug)]
pub struct HttpParser {
    state: ParseState,
    content_length: usize,
    body_received: usize,
    chunked: bool,
    request: Request,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpParser {
    pub fn new() -> Self {
        HttpParser {
            state: ParseState::ExpectRequestLine,
            content_length: 0,
            body_received: 0,
            chunked: false,
            request: empty_request(),
        }
    }

    /// Feeds newly available bytes from `buf` to the parser, consuming as much as can be
    /// interpreted without blocking. Returns after every event a caller might need to act on
    /// (`HeadersComplete`, `GotRequest`) rather than looping ahead on its own, so a pipelined
    /// buffer is drained one request at a time by the caller re-invoking `parse`.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<ParseStatus, ParseError> {
        loop {
            match self.state {
                ParseState::ExpectRequestLine => {
                    if !self.parse_request_line(buf)? {
                        return Ok(ParseStatus::NeedMore);
                    }
                    self.state = ParseState::ExpectHeaders;
                }
                ParseState::ExpectHeaders => match self.parse_headers(buf)? {
                    HeaderProgress::NeedMore => return Ok(ParseStatus::NeedMore),
                    HeaderProgress::GotAll => {
                        self.state = ParseState::GotAll;
                        return Ok(ParseStatus::GotRequest);
                    }
                    HeaderProgress::HeadersComplete => {
                        self.state = ParseState::ExpectBody;
                        return Ok(ParseStatus::HeadersComplete);
                    }
                },
                ParseState::ExpectBody => {
                    if self.parse_body(buf) {
                        self.state = ParseState::GotAll;
                        return Ok(ParseStatus::GotRequest);
                    }
                    return Ok(ParseStatus::NeedMore);
                }
                ParseState::GotAll => return Ok(ParseStatus::GotRequest),
            }
        }
    }

    /// Takes the completed (or partially streamed) request, leaving an empty one in its place.
    /// Does not reset parser state; call [`HttpParser::reset`] once the request has been fully
    /// handled so the next pipelined request can be parsed.
    pub fn take_request(&mut self) -> Request {
        std::mem::replace(&mut self.request, empty_request())
    }

    /// Read-only access to the in-progress request, for a streaming handler inspecting headers
    /// before the body has fully arrived.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Mutable access to the in-progress request, so a caller that already resolved path
    /// parameters for this request (at `HeadersComplete`, before the body has arrived) can stash
    /// them without waiting for `take_request`.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// Bytes of the body received so far, relative to `Content-Length`.
    pub fn body_received(&self) -> usize {
        self.body_received
    }

    /// Resets the parser to start parsing the next pipelined request.
    pub fn reset(&mut self) {
        *self = HttpParser::new();
    }

    fn parse_request_line(&mut self, buf: &mut Buffer) -> Result<bool, ParseError> {
        let Some(pos) = buf.find_crlf() else {
            return Ok(false);
        };

        let line = buf.peek()[..pos].to_vec();
        buf.retrieve(pos + 2);

        let mut parts = line.split(|&b| b == b' ').filter(|s| !s.is_empty());
        let method_tok = parts.next().ok_or(ParseError::Method)?;
        let target = parts.next().ok_or(ParseError::Target)?;
        let version_tok = parts.next().ok_or(ParseError::Version)?;
        if parts.next().is_some() {
            return Err(ParseError::NewLine);
        }

        let method = Method::parse(method_tok);
        if method == Method::Invalid {
            return Err(ParseError::Method);
        }

        let version = parse_version(version_tok)?;

        let target = std::str::from_utf8(target).map_err(|_| ParseError::Target)?;
        let (path, raw_query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };
        if path.is_empty() {
            return Err(ParseError::Target);
        }

        self.request.method = method;
        self.request.version = version;
        self.request.path = path;
        self.request.raw_query = raw_query;
        Ok(true)
    }

    fn parse_headers(&mut self, buf: &mut Buffer) -> Result<HeaderProgress, ParseError> {
        loop {
            let Some(pos) = buf.find_crlf() else {
                return Ok(HeaderProgress::NeedMore);
            };

            if pos == 0 {
                buf.retrieve(2);
                if self.chunked {
                    return Err(ParseError::ChunkedUnsupported);
                }
                return Ok(if self.content_length == 0 {
                    HeaderProgress::GotAll
                } else {
                    HeaderProgress::HeadersComplete
                });
            }

            let line = buf.peek()[..pos].to_vec();
            buf.retrieve(pos + 2);
            self.apply_header_line(&line)?;
        }
    }

    fn apply_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let colon = line.iter().position(|&b| b == b':').ok_or(ParseError::HeaderName)?;
        let name = std::str::from_utf8(&line[..colon]).map_err(|_| ParseError::HeaderName)?;
        if name.is_empty() {
            return Err(ParseError::HeaderName);
        }
        let value = std::str::from_utf8(&line[colon + 1..]).map_err(|_| ParseError::HeaderValue)?;
        let value = value.trim_matches(|c| c == ' ' || c == '\t');

        if name.eq_ignore_ascii_case("content-length") {
            self.content_length = value.parse().map_err(|_| ParseError::ContentLength)?;
        } else if name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked") {
            self.chunked = true;
        }

        self.request.headers.push(name.to_string(), value.to_string());
        Ok(())
    }

    /// Drains as much of `remaining = content_length - body_received` as is currently buffered.
    /// Returns true once the whole body has arrived.
    fn parse_body(&mut self, buf: &mut Buffer) -> bool {
        let remaining = self.content_length - self.body_received;
        let take = remaining.min(buf.readable_bytes());
        if take > 0 {
            self.request.body.extend_from_slice(&buf.peek()[..take]);
            buf.retrieve(take);
            self.body_received += take;
        }
        self.body_received >= self.content_length
    }
}

enum HeaderProgress {
    NeedMore,
    HeadersComplete,
    GotAll,
}

fn parse_version(tok: &[u8]) -> Result<Version, ParseError> {
    if !tok.starts_with(b"HTTP/") || tok.len() != 8 {
        return Err(ParseError::Version);
    }
    let version = Version::parse(tok[5], tok[7]);
    if version == Version::Unknown || tok[6] != b'.' {
        return Err(ParseError::Version);
    }
    Ok(version)
}

fn empty_request() -> Request {
    Request {
        method: Method::Invalid,
        version: Version::Unknown,
        path: String::new(),
        raw_query: None,
        headers: Headers::new(),
        path_params: HashMap::new(),
        body: Vec::new(),
        receive_time: Instant::now(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_simple_get() {
        let mut parser = HttpParser::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /hello?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");

        let status = parser.parse(&mut buf).unwrap();
        assert_eq!(ParseStatus::GotRequest, status);

        let req = parser.take_request();
        assert_eq!(Method::Get, req.method);
        assert_eq!(Version::Http11, req.version);
        assert_eq!("/hello", req.path);
        assert_eq!(Some("x=1".to_string()), req.raw_query);
        assert_eq!(Some("example.com"), req.header("host"));
    }

    #[test]
    fn needs_more_on_partial_request_line() {
        let mut parser = HttpParser::new();
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost:");
        assert_eq!(ParseStatus::NeedMore, parser.parse(&mut buf).unwrap());
    }

    #[test]
    fn headers_complete_then_streams_body_across_multiple_feeds() {
        let mut parser = HttpParser::new();
        let mut buf = Buffer::new();
        buf.append(b"POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(ParseStatus::HeadersComplete, parser.parse(&mut buf).unwrap());

        buf.append(b"012345");
        assert_eq!(ParseStatus::NeedMore, parser.parse(&mut buf).unwrap());
        assert_eq!(6, parser.body_received());

        buf.append(b"6789");
        assert_eq!(ParseStatus::GotRequest, parser.parse(&mut buf).unwrap());
        assert_eq!(b"0123456789", parser.take_request().body.as_slice());
    }

    #[test]
    fn rejects_chunked_transfer_encoding() {
        let mut parser = HttpParser::new();
        let mut buf = Buffer::new();
        buf.append(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(Err(ParseError::ChunkedUnsupported), parser.parse(&mut buf));
    }

    #[test]
    fn resets_cleanly_for_the_next_pipelined_request() {
        let mut parser = HttpParser::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        assert_eq!(ParseStatus::GotRequest, parser.parse(&mut buf).unwrap());
        assert_eq!("/a", parser.take_request().path);
        parser.reset();

        assert_eq!(ParseStatus::GotRequest, parser.parse(&mut buf).unwrap());
        assert_eq!("/b", parser.take_request().path);
    }
}
