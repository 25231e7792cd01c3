//! Readiness interest mask shared by both demultiplexer backends.
//!
//! Kept independent of `mio::Interest` so that [`Channel`](crate::channel::Channel) and the
//! `Demultiplexer` trait read the same way regardless of which backend (`USE_POLL=1` or the
//! scalable default) is active.

use std::ops::{BitOr, BitOrAssign};

/// A readiness interest mask: some combination of readable/writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

const READABLE_BIT: u8 = 0b01;
const WRITABLE_BIT: u8 = 0b10;

impl Interest {
    /// No interest registered; a channel in this state is commonly left registered (rather than
    /// deregistered) so re-enabling it later is cheap.
    pub const NONE: Interest = Interest(0);
    /// Interested in read-readiness (including peer half-close).
    pub const READABLE: Interest = Interest(READABLE_BIT);
    /// Interested in write-readiness.
    pub const WRITABLE: Interest = Interest(WRITABLE_BIT);

    /// True if this mask carries no interest at all.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True if readable interest is set.
    pub fn is_readable(self) -> bool {
        self.0 & READABLE_BIT != 0
    }

    /// True if writable interest is set.
    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE_BIT != 0
    }

    /// Returns this mask with the readable bit cleared.
    pub fn without_readable(self) -> Interest {
        Interest(self.0 & !READABLE_BIT)
    }

    /// Returns this mask with the writable bit cleared.
    pub fn without_writable(self) -> Interest {
        Interest(self.0 & !WRITABLE_BIT)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn combining_masks_sets_both_bits() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
    }

    #[test]
    fn clearing_one_bit_leaves_the_other() {
        let both = Interest::READABLE | Interest::WRITABLE;
        let read_only = both.without_writable();
        assert!(read_only.is_readable());
        assert!(!read_only.is_writable());
    }
}
