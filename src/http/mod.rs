//! Streaming HTTP/1.1 layer built on the reactor core. Translates connection-level byte streams
//! into parsed requests routed to application handlers, and serializes their responses back onto
//! the wire.

pub mod method;
pub mod parser;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod status;
pub mod version;

pub use method::Method;
pub use parser::{HttpParser, ParseStatus};
pub use request::{Header, Headers, Request};
pub use response::Response;
pub use router::{Handler, Params, Router};
pub use server::HttpServer;
pub use status::StatusCode;
pub use version::Version;
