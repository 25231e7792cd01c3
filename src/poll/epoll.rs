//! Default scalable backend, built on `mio::Poll` (epoll on Linux, kqueue on BSD/macOS). Arbitrary
//! raw descriptors are registered via `mio::unix::SourceFd`, which lets the rest of the crate stay
//! in terms of `RawFd` rather than `mio`'s `Source` trait.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Token};

use super::{Demultiplexer, ReadyEvent};
use crate::interest::Interest;

const EVENT_CAPACITY: usize = 1024;

/// The scalable, edge-triggered-under-the-hood backend used by default.
pub struct EpollDemultiplexer {
    poll: Poll,
    events: Events,
    registered: std::collections::HashSet<Token>,
}

impl EpollDemultiplexer {
    /// Creates a new backend. Fails only on `epoll_create`-class setup errors, which are fatal per
    /// treated as fatal setup errors, expected to be `.expect()`-ed by the caller.
    pub fn new() -> io::Result<Self> {
        Ok(EpollDemultiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            registered: std::collections::HashSet::new(),
        })
    }

    fn to_mio_interest(interest: Interest) -> MioInterest {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => MioInterest::READABLE | MioInterest::WRITABLE,
            (true, false) => MioInterest::READABLE,
            (false, true) => MioInterest::WRITABLE,
            (false, false) => MioInterest::READABLE, // mio requires a non-empty interest
        }
    }
}

impl Demultiplexer for EpollDemultiplexer {
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<(Instant, Vec<ReadyEvent>)> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let mut mask = Interest::NONE;
            if event.is_readable() || event.is_read_closed() || event.is_priority() {
                mask |= Interest::READABLE;
            }
            if event.is_writable() {
                mask |= Interest::WRITABLE;
            }

            ready.push(ReadyEvent {
                token: event.token(),
                ready: mask,
                hup: event.is_hup(),
                error: event.is_error(),
            });
        }

        Ok((now, ready))
    }

    fn update(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mio_interest = Self::to_mio_interest(interest);
        let mut source = SourceFd(&fd);
        if self.registered.contains(&token) {
            self.poll.registry().reregister(&mut source, token, mio_interest)
        } else {
            self.poll.registry().register(&mut source, token, mio_interest)?;
            self.registered.insert(token);
            Ok(())
        }
    }

    fn remove(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        let mut source = SourceFd(&fd);
        self.poll.registry().deregister(&mut source)?;
        self.registered.remove(&token);
        Ok(())
    }

    fn has_token(&self, token: Token) -> bool {
        self.registered.contains(&token)
    }
}
