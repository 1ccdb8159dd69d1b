//! Nonblocking connection and listener engine.
//!
//! Everything here is single-threaded by construction: handles are `!Send`
//! and every resource is driven from the thread that registered it with the
//! poller.

pub mod conn;
pub mod listener;
pub mod poll;
pub mod reactor;

pub use conn::{
    ConnCtx, Connection, NetError, ReadBufferedHandler, ReadExactHandler, WriteExactHandler,
};
pub use listener::{AcceptHandler, Listener};
pub use poll::{EventMask, PollTarget, Poller};
pub use reactor::Reactor;
