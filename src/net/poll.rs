//! Readiness contract between the I/O core and the event loop.

use std::fmt;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::rc::Weak;

/// Bit set of readiness conditions delivered to a [`PollTarget`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const READABLE: EventMask = EventMask(0b0001);
    pub const WRITABLE: EventMask = EventMask(0b0010);
    pub const ERR: EventMask = EventMask(0b0100);
    pub const HUP: EventMask = EventMask(0b1000);

    pub const fn empty() -> EventMask {
        EventMask(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for (bit, name) in [
            (EventMask::READABLE, "READABLE"),
            (EventMask::WRITABLE, "WRITABLE"),
            (EventMask::ERR, "ERR"),
            (EventMask::HUP, "HUP"),
        ] {
            if self.contains(bit) {
                write!(f, "{sep}{name}")?;
                sep = "|";
            }
        }
        if sep.is_empty() {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}

/// A resource that receives readiness notifications.
pub trait PollTarget {
    fn on_event(&self, events: EventMask);
}

/// Capability exposed by the event loop: register a descriptor with an
/// interest mask, adjust that mask, or forget the descriptor entirely.
///
/// Targets are held weakly; the loop drops registrations whose target has
/// gone away. Delivery may be level- or edge-triggered. Consumers must not
/// leave writable interest on permanently (a level-triggered backend would
/// report it on every poll) and must not rely on re-notification for data
/// they have never tried to read (an edge-triggered backend reports only
/// changes).
pub trait Poller {
    fn watch(&self, fd: RawFd, mask: EventMask, target: Weak<dyn PollTarget>);
    fn adjust(&self, fd: RawFd, mask: EventMask);
    fn forget(&self, fd: RawFd);
}
