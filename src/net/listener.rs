//! Accepting listener socket.

use std::cell::RefCell;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use mio::net::TcpListener;
use tracing::warn;

use crate::config::Limits;
use crate::net::conn::Connection;
use crate::net::poll::{EventMask, PollTarget, Poller};

/// Callback invoked with each accepted connection. Ownership of the new
/// connection transfers to the callback.
pub trait AcceptHandler {
    fn on_accept(&self, conn: Connection);
}

struct ListenerCore {
    me: Weak<ListenerCore>,
    poller: Rc<dyn Poller>,
    limits: Limits,
    /// `None` when the listener is defunct (bind failed).
    socket: RefCell<Option<TcpListener>>,
    callback: RefCell<Option<Rc<dyn AcceptHandler>>>,
}

impl ListenerCore {
    fn fd(&self) -> RawFd {
        self.socket
            .borrow()
            .as_ref()
            .expect("listener socket present")
            .as_raw_fd()
    }
}

impl PollTarget for ListenerCore {
    fn on_event(&self, events: EventMask) {
        if self.socket.borrow().is_none() {
            return;
        }
        if events != EventMask::READABLE {
            warn!(?events, "unexpected event mask on listener");
        }
        let Some(cb) = self.callback.borrow().clone() else {
            return;
        };

        // Drain the accept queue; the poller only tells us once per wakeup.
        loop {
            let accepted = {
                let socket_ref = self.socket.borrow();
                let socket = socket_ref.as_ref().expect("listener socket present");
                socket.accept()
            };
            match accepted {
                Ok((stream, _peer)) => {
                    // Nagle interacts badly with request/response
                    // pipelining: coalescing delays small replies by tens of
                    // milliseconds.
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(error = %err, "could not set TCP_NODELAY on accepted socket");
                    }
                    let conn = Connection::from_stream(stream, self.poller.clone(), &self.limits);
                    cb.on_accept(conn);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if accept_error_is_transient(&err) => continue,
                Err(err) => {
                    // Failing to accept one connection must not take down
                    // the ones we are already serving.
                    warn!(error = %err, "cannot accept new connection");
                    continue;
                }
            }
        }
    }
}

fn accept_error_is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(
            libc::EPROTO
                | libc::ENOPROTOOPT
                | libc::ENETDOWN
                | libc::ENONET
                | libc::ENETUNREACH
                | libc::EINTR
        )
    )
}

/// Listening socket bound to `INADDR_ANY:port`.
///
/// A bind failure does not abort construction: the listener comes back
/// defunct, `set_callback` and destruction become no-ops, and the
/// surrounding server can still drive an orderly shutdown.
pub struct Listener {
    core: Rc<ListenerCore>,
}

impl Listener {
    pub fn bind(port: u16, poller: Rc<dyn Poller>, limits: &Limits) -> Listener {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = match TcpListener::bind(addr) {
            Ok(socket) => Some(socket),
            Err(err) => {
                warn!(port, error = %err, "could not bind listener");
                None
            }
        };
        Listener {
            core: Rc::new_cyclic(|me| ListenerCore {
                me: me.clone(),
                poller,
                limits: limits.clone(),
                socket: RefCell::new(socket),
                callback: RefCell::new(None),
            }),
        }
    }

    pub fn is_defunct(&self) -> bool {
        self.core.socket.borrow().is_none()
    }

    /// Address actually bound, for callers that asked for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core
            .socket
            .borrow()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Install the acceptor and start watching for incoming connections.
    /// No-op when defunct.
    pub fn set_callback(&self, cb: Rc<dyn AcceptHandler>) {
        if self.is_defunct() {
            return;
        }
        {
            let mut slot = self.core.callback.borrow_mut();
            assert!(slot.is_none(), "listener callback already installed");
            *slot = Some(cb);
        }
        let target: Weak<dyn PollTarget> = self.core.me.clone();
        self.core
            .poller
            .watch(self.core.fd(), EventMask::READABLE, target);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.is_defunct() {
            return;
        }
        if self.core.callback.borrow().is_some() {
            self.core.poller.forget(self.core.fd());
        }
        // Dropping the socket closes the descriptor.
        self.core.socket.borrow_mut().take();
    }
}
