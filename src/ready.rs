use std::{fmt, ops};

/// A set of readiness events, over `{Readable, Writable, Error, Hup,
/// PeerHup, Priority}`.
///
/// The bit layout mirrors the kernel's epoll event constants one to
/// one so the hot path (`Poller::poll` -> `Channel::handle_event`)
/// never needs a translation table.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Default)]
pub struct Ready(usize);

const READABLE: usize = 0b00_0001;
const WRITABLE: usize = 0b00_0010;
const ERROR: usize = 0b00_0100;
const HUP: usize = 0b00_1000;
const PEER_HUP: usize = 0b01_0000;
const PRIORITY: usize = 0b10_0000;
const READY_ALL: usize = READABLE | WRITABLE | ERROR | HUP | PEER_HUP | PRIORITY;

impl Ready {
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// Full hang-up: the notifier reports the descriptor is gone for both
    /// directions.
    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    /// The peer has shut down its writing half (`EPOLLRDHUP`); distinct
    /// from `hup` because a read can still drain the remaining bytes.
    #[inline]
    pub fn peer_hup() -> Ready {
        Ready(PEER_HUP)
    }

    /// Out-of-band / priority data is ready to read (`EPOLLPRI`).
    #[inline]
    pub fn priority() -> Ready {
        Ready(PRIORITY)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Ready::empty()
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready::hup())
    }

    #[inline]
    pub fn is_peer_hup(&self) -> bool {
        self.contains(Ready::peer_hup())
    }

    #[inline]
    pub fn is_priority(&self) -> bool {
        self.contains(Ready::priority())
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitXor for Ready {
    type Output = Ready;

    #[inline]
    fn bitxor(self, other: Ready) -> Ready {
        Ready(self.0 ^ other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl From<usize> for Ready {
    fn from(bits: usize) -> Ready {
        Ready(bits)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
            (Ready::peer_hup(), "PeerHup"),
            (Ready::priority(), "Priority"),
        ];

        write!(fmt, "Ready {{")?;
        for &(flag, name) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        write!(fmt, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn union_and_containment() {
        let r = Ready::readable() | Ready::priority();
        assert!(r.is_readable());
        assert!(r.is_priority());
        assert!(!r.is_writable());
        assert!(r.contains(Ready::readable()));
    }

    #[test]
    fn remove() {
        let mut r = Ready::readable() | Ready::writable();
        r.remove(Ready::readable());
        assert!(!r.is_readable());
        assert!(r.is_writable());
    }
}
