//! Readiness polling abstraction. Two interchangeable backends exist: [`epoll`], the
//! default scalable backend built on `mio::Poll`, and [`simple_poll`], a plain `poll(2)`-based
//! backend selected by setting the `USE_POLL` environment variable to `1`.
//!
//! Both backends operate in terms of a [`mio::Token`] identifying a registered descriptor, so that
//! [`crate::channel::Channel`] and [`crate::event_loop::EventLoop`] don't need to know which
//! backend is active.

mod epoll;
mod simple_poll;

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::Token;

use crate::interest::Interest;

pub use epoll::EpollDemultiplexer;
pub use simple_poll::SimplePollDemultiplexer;

/// A single readiness notification returned from [`Demultiplexer::poll`].
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    /// Token identifying the registered descriptor this event applies to.
    pub token: Token,
    /// Which of the descriptor's registered interests are ready.
    pub ready: Interest,
    /// True if the peer half-closed or hung up (`POLLHUP`-equivalent) without readable data.
    pub hup: bool,
    /// True if an error condition was reported on the descriptor.
    pub error: bool,
}

/// Tracks whether a descriptor has ever been registered with a backend: never registered,
/// registered with active interest, or registered with an empty interest mask (kept registered
/// to make re-enabling cheap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never registered with any backend.
    New,
    /// Registered; a non-empty interest mask may or may not be installed.
    Added,
    /// Explicitly removed from the backend.
    Deleted,
}

/// Uniform contract over both demultiplexer backends.
pub trait Demultiplexer {
    /// Waits up to `timeout` (blocking indefinitely if `None`) for readiness, returning the set of
    /// ready events and the instant at which `poll` returned.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<(Instant, Vec<ReadyEvent>)>;

    /// Registers or updates the interest mask for `fd` under `token`.
    fn update(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Removes `fd` from the backend entirely. `fd` must not be interacted with via this backend
    /// afterwards.
    fn remove(&mut self, fd: RawFd, token: Token) -> io::Result<()>;

    /// True if `token` is currently registered (in any interest state) with this backend.
    fn has_token(&self, token: Token) -> bool;
}

/// Picks the default backend, or the simple `poll(2)` backend if the `USE_POLL` environment
/// variable is set to `1`.
pub fn default_backend() -> io::Result<Box<dyn Demultiplexer + Send>> {
    if use_poll_requested() {
        log::info!("USE_POLL=1: selecting the simple poll(2) demultiplexer backend");
        Ok(Box::new(SimplePollDemultiplexer::new()))
    } else {
        Ok(Box::new(EpollDemultiplexer::new()?))
    }
}

fn use_poll_requested() -> bool {
    std::env::var("USE_POLL").map(|v| v == "1").unwrap_or(false)
}
