//! `mio`-backed implementation of the poller contract.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Weak;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use crate::config::Limits;
use crate::net::poll::{EventMask, PollTarget, Poller};

struct Registration {
    fd: RawFd,
    target: Weak<dyn PollTarget>,
}

struct ReactorState {
    poll: Poll,
    events: Events,
    targets: HashMap<Token, Registration>,
    tokens: HashMap<RawFd, Token>,
    next_token: usize,
}

/// Single-threaded readiness pump over `mio::Poll`.
///
/// Registered targets are held weakly; a registration whose target has gone
/// away is dropped the next time it would fire.
pub struct Reactor {
    state: RefCell<ReactorState>,
}

impl Reactor {
    pub fn new(limits: &Limits) -> io::Result<Reactor> {
        Ok(Reactor {
            state: RefCell::new(ReactorState {
                poll: Poll::new()?,
                events: Events::with_capacity(limits.reactor_events_capacity),
                targets: HashMap::new(),
                tokens: HashMap::new(),
                next_token: 0,
            }),
        })
    }

    /// Wait for readiness and dispatch one batch of events. Returns the
    /// number of events delivered.
    pub fn poll_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let batch: Vec<(Token, EventMask)> = {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            state.poll.poll(&mut state.events, timeout)?;
            state
                .events
                .iter()
                .map(|event| {
                    let mut mask = EventMask::empty();
                    if event.is_readable() {
                        mask = mask | EventMask::READABLE;
                    }
                    if event.is_writable() {
                        mask = mask | EventMask::WRITABLE;
                    }
                    if event.is_error() {
                        mask = mask | EventMask::ERR;
                    }
                    if event.is_read_closed() && event.is_write_closed() {
                        mask = mask | EventMask::HUP;
                    }
                    (event.token(), mask)
                })
                .collect()
        };

        let delivered = batch.len();
        for (token, mask) in batch {
            // The registration may have been adjusted or forgotten by an
            // earlier callback in this same batch.
            let target = {
                let state = self.state.borrow();
                state.targets.get(&token).map(|reg| reg.target.clone())
            };
            let Some(target) = target else { continue };
            match target.upgrade() {
                Some(target) => {
                    trace!(?token, ?mask, "dispatching readiness");
                    target.on_event(mask);
                }
                None => {
                    // Target dropped without deregistering.
                    let mut state = self.state.borrow_mut();
                    if let Some(reg) = state.targets.remove(&token) {
                        state.tokens.remove(&reg.fd);
                        let _ = state.poll.registry().deregister(&mut SourceFd(&reg.fd));
                    }
                }
            }
        }
        Ok(delivered)
    }
}

fn interest_for(mask: EventMask) -> Interest {
    let readable = mask.contains(EventMask::READABLE);
    let writable = mask.contains(EventMask::WRITABLE);
    match (readable, writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("registration requires readable or writable interest"),
    }
}

impl Poller for Reactor {
    fn watch(&self, fd: RawFd, mask: EventMask, target: Weak<dyn PollTarget>) {
        let mut state = self.state.borrow_mut();
        assert!(
            !state.tokens.contains_key(&fd),
            "descriptor is already registered"
        );
        let token = Token(state.next_token);
        state.next_token += 1;
        state
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest_for(mask))
            .expect("could not register descriptor");
        state.tokens.insert(fd, token);
        state.targets.insert(token, Registration { fd, target });
    }

    fn adjust(&self, fd: RawFd, mask: EventMask) {
        let state = self.state.borrow();
        let token = *state
            .tokens
            .get(&fd)
            .expect("descriptor is not registered");
        state
            .poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest_for(mask))
            .expect("could not adjust descriptor interest");
    }

    fn forget(&self, fd: RawFd) {
        let mut state = self.state.borrow_mut();
        let token = state
            .tokens
            .remove(&fd)
            .expect("descriptor is not registered");
        state.targets.remove(&token);
        let _ = state.poll.registry().deregister(&mut SourceFd(&fd));
    }
}
