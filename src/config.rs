//! Ambient configuration surface. Plain struct, no config-file format — matching the rest of the
//! ambient stack, which favors explicit construction over a dedicated configuration crate.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;
const DEFAULT_CONNECTOR_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_CONNECTOR_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Runtime configuration for a [`TcpServer`](crate::tcp_server::TcpServer) or
/// [`HttpServer`](crate::http::server::HttpServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the acceptor listens on.
    pub bind_addr: SocketAddr,
    /// Number of IO loops in the server's loop pool, in addition to the acceptor's own loop.
    /// Zero means the acceptor's loop also handles all connections.
    pub io_threads: usize,
    /// Bytes of unsent output buffered on a connection before its high-water-mark callback fires.
    pub high_water_mark: usize,
    /// Selects the `poll(2)`-based demultiplexer backend instead of the scalable default.
    pub use_poll: bool,
    /// Initial delay before a `Connector`'s first retry.
    pub connector_initial_backoff: Duration,
    /// Ceiling a `Connector`'s exponential backoff saturates at.
    pub connector_max_backoff: Duration,
}

impl ServerConfig {
    /// Builds a config for `bind_addr` with every other field at its default.
    pub fn new(bind_addr: SocketAddr) -> Self {
        ServerConfig {
            bind_addr,
            io_threads: 0,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            use_poll: use_poll_requested(),
            connector_initial_backoff: DEFAULT_CONNECTOR_INITIAL_BACKOFF,
            connector_max_backoff: DEFAULT_CONNECTOR_MAX_BACKOFF,
        }
    }

    /// Builds a config for `bind_addr`, reading `USE_POLL` from the environment to decide the
    /// demultiplexer backend; all other fields take their defaults.
    pub fn from_env(bind_addr: SocketAddr) -> Self {
        Self::new(bind_addr)
    }

    /// Sets the number of IO loops in the pool.
    pub fn with_io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads;
        self
    }

    /// Sets the high-water-mark threshold, in bytes.
    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }
}

fn use_poll_requested() -> bool {
    std::env::var("USE_POLL").map(|v| v == "1").unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        assert_eq!(64 * 1024 * 1024, cfg.high_water_mark);
        assert_eq!(Duration::from_millis(500), cfg.connector_initial_backoff);
        assert_eq!(Duration::from_secs(30), cfg.connector_max_backoff);
        assert_eq!(0, cfg.io_threads);
    }

    #[test]
    fn builder_methods_override_fields() {
        let cfg = ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_io_threads(4)
            .with_high_water_mark(1024);
        assert_eq!(4, cfg.io_threads);
        assert_eq!(1024, cfg.high_water_mark);
    }
}
