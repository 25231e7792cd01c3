//! Per-fd event registration and dispatch.
//!
//! A `Channel` is bound to exactly one [`EventLoop`](crate::event_loop::EventLoop) and exactly one
//! file descriptor. It is owned by whichever component created it (`Acceptor`, `Connector`,
//! `TcpConnection`, or the loop's own wakeup fd) and is registered with that loop's demultiplexer
//! for the lifetime of the owner.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::interest::Interest;
use crate::poll::ChannelState;

type ReadCallback = Box<dyn FnMut(Instant) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

/// The per-fd piece of state inside a loop that holds the interest mask and callbacks.
pub struct Channel {
    fd: RawFd,
    interest: Interest,
    state: ChannelState,
    /// Weak handle to the owning object. Dispatch promotes this once at entry; if promotion fails
    /// (the owner has already been destroyed) dispatch returns immediately without invoking any
    /// callback, mirroring muduo's `tie_` mechanism.
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .field("state", &self.state)
            .finish()
    }
}

impl Channel {
    /// Creates a new, unregistered channel for `fd`.
    pub fn new(fd: RawFd) -> Self {
        Channel {
            fd,
            interest: Interest::NONE,
            state: ChannelState::New,
            tie: None,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }
    }

    /// The underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The interest mask that should be installed with the demultiplexer.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Registration state, private to the demultiplexer in spirit; exposed read-only so
    /// `EventLoop` can decide whether to `register` or `reregister`.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Records the demultiplexer's view of this channel's registration state.
    pub fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    /// Ties this channel's dispatch to the lifetime of `owner`. Dispatch skips all callbacks once
    /// `owner` has been dropped.
    pub fn tie(&mut self, owner: Weak<dyn Any + Send + Sync>) {
        self.tie = Some(owner);
    }

    /// Installs the read callback, invoked with the poll-return timestamp.
    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_cb = Some(cb);
    }

    /// Installs the write callback.
    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_cb = Some(cb);
    }

    /// Installs the close callback.
    pub fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_cb = Some(cb);
    }

    /// Installs the error callback.
    pub fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_cb = Some(cb);
    }

    /// Adds read interest.
    pub fn enable_reading(&mut self) {
        self.interest |= Interest::READABLE;
    }

    /// Adds write interest.
    pub fn enable_writing(&mut self) {
        self.interest |= Interest::WRITABLE;
    }

    /// Removes write interest.
    pub fn disable_writing(&mut self) {
        self.interest = self.interest.without_writable();
    }

    /// Removes all interest. The channel may remain registered with an empty mask rather than
    /// being deregistered.
    pub fn disable_all(&mut self) {
        self.interest = Interest::NONE;
    }

    /// True if write interest is currently set.
    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    /// True if this channel carries no interest at all.
    pub fn is_none_interest(&self) -> bool {
        self.interest.is_none()
    }

    /// Dispatches a readiness notification in priority order:
    /// 1. hangup without readable data → close callback
    /// 2. error bits → error callback
    /// 3. readable/priority/peer-closed → read callback
    /// 4. writable → write callback
    pub fn handle_event(&mut self, now: Instant, ready: Interest, hup: bool, error: bool) {
        if hup && !ready.is_readable() {
            if let Some(ref mut cb) = self.close_cb {
                cb();
            }
            return;
        }

        if error {
            if let Some(ref mut cb) = self.error_cb {
                cb();
            }
        }

        if ready.is_readable() {
            if let Some(ref mut cb) = self.read_cb {
                cb(now);
            }
        }

        if ready.is_writable() {
            if let Some(ref mut cb) = self.write_cb {
                cb();
            }
        }
    }

    /// Dispatches a readiness notification, first checking that the tied owner (if any) is still
    /// alive. Returns without dispatching if the owner has been dropped.
    pub fn handle_event_tied(&mut self, now: Instant, ready: Interest, hup: bool, error: bool) {
        if let Some(ref tie) = self.tie {
            if tie.upgrade().is_none() {
                return;
            }
        }
        self.handle_event(now, ready, hup, error);
    }
}

/// Shared ownership of a channel, threaded between its owner and the loop's registration table.
pub type SharedChannel = Arc<std::sync::Mutex<Channel>>;
