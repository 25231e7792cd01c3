//! Structured error enums for the two protocol-level boundaries this core raises to its own
//! callers. I/O boundary errors continue to flow as `std::io::Error` throughout the rest of the
//! crate's own `Result<T> = std::io::Result<T>` convention.

use thiserror::Error;

/// Failures while parsing an HTTP/1.1 request.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    /// Invalid byte in the method token, or method not in the supported literal set.
    #[error("invalid request method")]
    Method,
    /// Invalid byte in the request target.
    #[error("invalid request target")]
    Target,
    /// Unsupported or malformed HTTP version.
    #[error("invalid or unsupported HTTP version")]
    Version,
    /// Invalid byte in a header field name.
    #[error("invalid token in header name")]
    HeaderName,
    /// Invalid byte in a header field value.
    #[error("invalid token in header value")]
    HeaderValue,
    /// Missing or malformed CRLF line terminator.
    #[error("invalid or missing line terminator")]
    NewLine,
    /// `Content-Length` header value is not a valid non-negative integer.
    #[error("invalid Content-Length value")]
    ContentLength,
    /// `Transfer-Encoding: chunked` was present; chunked request bodies are not supported.
    #[error("chunked transfer encoding is not supported")]
    ChunkedUnsupported,
    /// The request line, a header, or the body exceeded a configured size limit.
    #[error("request exceeded configured size limit")]
    TooLarge,
}

/// Terminal (non-retryable) failures from [`Connector`](crate::connector::Connector).
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The requested address family or socket type is unsupported on this platform.
    #[error("unsupported address family or socket type: {0}")]
    Unsupported(#[source] std::io::Error),
    /// The OS refused the connection attempt (e.g. `EACCES`).
    #[error("connection attempt rejected: {0}")]
    Rejected(#[source] std::io::Error),
    /// The connect attempt resolved to a self-connect (local addr == peer addr) and was rejected.
    #[error("rejected self-connect")]
    SelfConnect,
}

/// Failures while registering or matching a route.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RouteError {
    /// Pattern contains a wildcard segment (`**`) that is not the final segment.
    #[error("wildcard segment `**` must be the last segment in the pattern")]
    WildcardNotLast,
    /// Pattern contains an empty segment, e.g. a stray `//`.
    #[error("route pattern contains an empty segment")]
    EmptySegment,
}
