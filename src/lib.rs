//! A multi-reactor TCP core, modeled on the one-loop-per-thread design popularized by muduo,
//! with a streaming HTTP/1.1 layer built on top.
//!
//! The reactor half (`event_loop`, `channel`, `poll`, `timer`, `acceptor`, `connector`,
//! `tcp_connection`, `loop_pool`, `tcp_server`, `tcp_client`) is transport-agnostic: it knows
//! about file descriptors, readiness, and buffers, not HTTP. The `http` module is a consumer of
//! that core, translating connection-level byte streams into parsed requests routed to handlers.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod interest;
pub mod loop_pool;
pub mod poll;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_server;
pub mod timer;

pub use buffer::Buffer;
pub use config::ServerConfig;
pub use error::{ConnectError, ParseError, RouteError};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use tcp_server::TcpServer;
