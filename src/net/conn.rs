//! Stream connections with exact-size and buffered read-ahead I/O.
//!
//! A [`Connection`] owns one nonblocking stream descriptor and supports one
//! active read and one active write at a time. Reads come in two flavors: an
//! exact-size read that fills a buffer of a known length, and a buffered read
//! that repeatedly offers whatever has arrived so far to the callback until
//! the callback accepts a prefix with [`ConnCtx::accept_buffer`]. Read-ahead
//! left over from a buffered read is drained by later exact-size reads before
//! the descriptor is touched again.
//!
//! Every operation must happen on the thread where the connection first did
//! I/O. Handles are `!Send`, and the first-use thread is latched and asserted.

use std::cell::{Cell, RefCell};
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::thread::{self, ThreadId};

use bytes::Bytes;
use mio::net::TcpStream;
use thiserror::Error;
use tracing::warn;

use crate::config::Limits;
use crate::net::poll::{EventMask, PollTarget, Poller};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetError {
    /// Outbound connections would need a resolver; connections are built
    /// from accepted streams.
    #[error("client-side connect is not supported")]
    ConnectUnsupported,
}

/// Callback for [`Connection::read_exact`].
pub trait ReadExactHandler {
    fn on_read_exact(&self, conn: &ConnCtx, data: Bytes);
    fn on_close(&self, conn: &ConnCtx);
}

/// Callback for [`Connection::read_buffered`].
///
/// The offered bytes are everything that has arrived and not yet been
/// consumed. The callback either calls [`ConnCtx::accept_buffer`] to consume
/// a prefix, which also ends the read so another may start before the
/// callback returns, or returns without accepting, in which case the offer
/// is retried once more data arrives and the read-ahead buffer is left
/// byte-identical.
pub trait ReadBufferedHandler {
    fn on_read_buffered(&self, conn: &ConnCtx, data: &[u8]);
    fn on_close(&self, conn: &ConnCtx);
}

/// Callback for [`Connection::write_exact`].
pub trait WriteExactHandler {
    fn on_write_exact(&self, conn: &ConnCtx);
    fn on_close(&self, conn: &ConnCtx);
}

enum ReadMode {
    None,
    Exact {
        buf: Vec<u8>,
        filled: usize,
        cb: Rc<dyn ReadExactHandler>,
    },
    Buffered {
        cb: Rc<dyn ReadBufferedHandler>,
    },
}

enum WriteMode {
    None,
    Exact {
        buf: Bytes,
        written: usize,
        cb: Rc<dyn WriteExactHandler>,
    },
}

enum Dispatch {
    Idle,
    Exact,
    Buffered,
}

pub(crate) struct ConnCore {
    me: Weak<ConnCore>,
    poller: Rc<dyn Poller>,
    io_buffer_bytes: usize,
    /// `None` once the descriptor has been taken by the destructor.
    stream: RefCell<Option<TcpStream>>,
    /// Thread of first I/O; all later operations must happen there.
    registration: Cell<Option<ThreadId>>,
    read_mode: RefCell<ReadMode>,
    write_mode: RefCell<WriteMode>,
    /// Read-ahead available to buffered offers, drained by exact reads.
    peek_buffer: RefCell<Vec<u8>>,
    read_was_shut_down: Cell<bool>,
    write_was_shut_down: Cell<bool>,
    /// Whether the poller currently includes writable interest for us.
    registered_for_writes: Cell<bool>,
    /// True while the buffered callback runs; gates `accept_buffer`.
    in_read_buffered_cb: Cell<bool>,
    /// Deletion sentinel: set by the handle's `Drop` so an event-dispatch
    /// frame further up the stack can tell the connection is gone.
    dropped: Cell<bool>,
}

impl ConnCore {
    fn new(stream: TcpStream, poller: Rc<dyn Poller>, limits: &Limits) -> Rc<ConnCore> {
        Rc::new_cyclic(|me| ConnCore {
            me: me.clone(),
            poller,
            io_buffer_bytes: limits.io_buffer_bytes,
            stream: RefCell::new(Some(stream)),
            registration: Cell::new(None),
            read_mode: RefCell::new(ReadMode::None),
            write_mode: RefCell::new(WriteMode::None),
            peek_buffer: RefCell::new(Vec::new()),
            read_was_shut_down: Cell::new(false),
            write_was_shut_down: Cell::new(false),
            registered_for_writes: Cell::new(false),
            in_read_buffered_cb: Cell::new(false),
            dropped: Cell::new(false),
        })
    }

    fn rc(&self) -> Rc<ConnCore> {
        self.me.upgrade().expect("connection core still referenced")
    }

    fn fd(&self) -> RawFd {
        self.stream
            .borrow()
            .as_ref()
            .expect("connection descriptor already closed")
            .as_raw_fd()
    }

    /// Register with the event loop on first I/O and latch the home thread.
    fn ensure_registered(&self) {
        match self.registration.get() {
            None => {
                self.registration.set(Some(thread::current().id()));
                let target: Weak<dyn PollTarget> = self.me.clone();
                self.poller.watch(self.fd(), EventMask::READABLE, target);
            }
            Some(home) => {
                assert_eq!(
                    home,
                    thread::current().id(),
                    "connection used off its home thread"
                );
            }
        }
    }

    fn read_exact(&self, len: usize, cb: Rc<dyn ReadExactHandler>) {
        assert!(!self.read_was_shut_down.get(), "read half is shut down");
        self.ensure_registered();
        assert!(
            matches!(*self.read_mode.borrow(), ReadMode::None),
            "a read is already in progress"
        );

        let mut buf = vec![0u8; len];
        // A previous buffered read may have read ahead; drain that first.
        let filled = {
            let mut peek = self.peek_buffer.borrow_mut();
            let n = peek.len().min(len);
            buf[..n].copy_from_slice(&peek[..n]);
            peek.drain(..n);
            n
        };
        *self.read_mode.borrow_mut() = ReadMode::Exact { buf, filled, cb };
        self.try_read_exact();
    }

    fn try_read_exact(&self) {
        loop {
            let remaining = {
                let mode = self.read_mode.borrow();
                let ReadMode::Exact { buf, filled, .. } = &*mode else {
                    unreachable!("read mode changed under an exact read");
                };
                buf.len() - filled
            };
            if remaining == 0 {
                break;
            }

            let res = {
                let stream_ref = self.stream.borrow();
                let stream = stream_ref.as_ref().expect("descriptor present during read");
                let mut mode = self.read_mode.borrow_mut();
                let ReadMode::Exact { buf, filled, .. } = &mut *mode else {
                    unreachable!("read mode changed under an exact read");
                };
                match (&*stream).read(&mut buf[*filled..]) {
                    Ok(n) => {
                        *filled += n;
                        Ok(n)
                    }
                    Err(err) => Err(err),
                }
            };
            match res {
                // Peer closed its end of the stream.
                Ok(0) => {
                    self.on_shutdown_read();
                    return;
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    // Resumed from on_event when the descriptor is readable.
                    return;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::NotConnected
                    ) =>
                {
                    self.on_shutdown_read();
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "could not read from socket");
                    self.on_shutdown_read();
                    return;
                }
            }
        }

        let (buf, cb) = {
            let mut mode = self.read_mode.borrow_mut();
            match std::mem::replace(&mut *mode, ReadMode::None) {
                ReadMode::Exact { buf, cb, .. } => (buf, cb),
                _ => unreachable!("read mode changed under an exact read"),
            }
        };
        let ctx = ConnCtx { core: self.rc() };
        cb.on_read_exact(&ctx, Bytes::from(buf));
    }

    fn read_buffered(&self, cb: Rc<dyn ReadBufferedHandler>) {
        assert!(!self.read_was_shut_down.get(), "read half is shut down");
        self.ensure_registered();
        assert!(
            matches!(*self.read_mode.borrow(), ReadMode::None),
            "a read is already in progress"
        );
        *self.read_mode.borrow_mut() = ReadMode::Buffered { cb };

        // There may already be read-ahead, and the callback might even be
        // satisfied with an empty offer.
        if !self.offer_peek_buffer() {
            self.fill_peek_buffer();
        }
    }

    /// Offer the current read-ahead to the buffered callback. Returns true
    /// when the read is over: the callback accepted, or deleted us.
    fn offer_peek_buffer(&self) -> bool {
        assert!(!self.in_read_buffered_cb.get());
        let cb = match &*self.read_mode.borrow() {
            ReadMode::Buffered { cb } => cb.clone(),
            _ => unreachable!("read mode changed under a buffered read"),
        };

        self.in_read_buffered_cb.set(true);
        // Offer a copy so the callback can consume and start new I/O while
        // the offer slice stays valid.
        let offer = self.peek_buffer.borrow().clone();
        let ctx = ConnCtx { core: self.rc() };
        cb.on_read_buffered(&ctx, &offer);

        if self.dropped.get() {
            return true;
        }
        if self.in_read_buffered_cb.get() {
            // accept_buffer was not called; the offer was rejected.
            self.in_read_buffered_cb.set(false);
            false
        } else {
            // accept_buffer consumed a prefix and ended the read. The
            // callback may have started another read already, so the read
            // mode is not necessarily `None` here.
            true
        }
    }

    fn fill_peek_buffer(&self) {
        loop {
            let res = {
                let stream_ref = self.stream.borrow();
                let stream = stream_ref.as_ref().expect("descriptor present during read");
                let mut peek = self.peek_buffer.borrow_mut();
                let old_len = peek.len();
                peek.resize(old_len + self.io_buffer_bytes, 0);
                match (&*stream).read(&mut peek[old_len..]) {
                    Ok(n) => {
                        // Keep only what actually arrived.
                        peek.truncate(old_len + n);
                        Ok(n)
                    }
                    Err(err) => {
                        peek.truncate(old_len);
                        Err(err)
                    }
                }
            };
            match res {
                Ok(0) => {
                    self.on_shutdown_read();
                    return;
                }
                Ok(_) => {
                    if self.offer_peek_buffer() {
                        return;
                    }
                    // Rejected again; the kernel may have more for us.
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::NotConnected
                    ) =>
                {
                    self.on_shutdown_read();
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "could not read from socket");
                    self.on_shutdown_read();
                    return;
                }
            }
        }
    }

    fn accept_buffer(&self, n: usize) {
        assert!(
            matches!(*self.read_mode.borrow(), ReadMode::Buffered { .. }),
            "accept_buffer outside a buffered read"
        );
        assert!(
            self.in_read_buffered_cb.get(),
            "accept_buffer outside the buffered callback"
        );
        {
            let mut peek = self.peek_buffer.borrow_mut();
            assert!(n <= peek.len(), "accepted more bytes than were offered");
            peek.drain(..n);
        }
        // Let the callback start another read before it returns.
        self.in_read_buffered_cb.set(false);
        *self.read_mode.borrow_mut() = ReadMode::None;
    }

    fn write_exact(&self, data: Bytes, cb: Rc<dyn WriteExactHandler>) {
        assert!(!self.write_was_shut_down.get(), "write half is shut down");
        self.ensure_registered();
        assert!(
            matches!(*self.write_mode.borrow(), WriteMode::None),
            "a write is already in progress"
        );
        *self.write_mode.borrow_mut() = WriteMode::Exact {
            buf: data,
            written: 0,
            cb,
        };
        self.try_write_exact();
    }

    fn try_write_exact(&self) {
        loop {
            let remaining = {
                let mode = self.write_mode.borrow();
                let WriteMode::Exact { buf, written, .. } = &*mode else {
                    unreachable!("write mode changed under an exact write");
                };
                buf.len() - written
            };
            if remaining == 0 {
                break;
            }

            let res = {
                let stream_ref = self.stream.borrow();
                let stream = stream_ref.as_ref().expect("descriptor present during write");
                let mut mode = self.write_mode.borrow_mut();
                let WriteMode::Exact { buf, written, .. } = &mut *mode else {
                    unreachable!("write mode changed under an exact write");
                };
                match (&*stream).write(&buf[*written..]) {
                    Ok(n) => {
                        *written += n;
                        Ok(n)
                    }
                    Err(err) => Err(err),
                }
            };
            match res {
                Ok(0) => {
                    warn!("write returned 0");
                    self.on_shutdown_write();
                    return;
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    // Ask for writable readiness only now. Keeping writable
                    // interest on permanently would make a level-triggered
                    // poller spin and starve everything else.
                    self.poller
                        .adjust(self.fd(), EventMask::READABLE | EventMask::WRITABLE);
                    self.registered_for_writes.set(true);
                    return;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::BrokenPipe
                            | ErrorKind::NotConnected
                            | ErrorKind::HostUnreachable
                            | ErrorKind::NetworkDown
                            | ErrorKind::ConnectionReset
                    ) =>
                {
                    self.on_shutdown_write();
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "could not write to socket");
                    self.on_shutdown_write();
                    return;
                }
            }
        }

        // Drop the writable interest before handing control back, so a
        // level-triggered poller stops reporting writability.
        if self.registered_for_writes.get() {
            self.poller.adjust(self.fd(), EventMask::READABLE);
            self.registered_for_writes.set(false);
        }
        let cb = {
            let mut mode = self.write_mode.borrow_mut();
            match std::mem::replace(&mut *mode, WriteMode::None) {
                WriteMode::Exact { cb, .. } => cb,
                WriteMode::None => unreachable!("write mode changed under an exact write"),
            }
        };
        let ctx = ConnCtx { core: self.rc() };
        cb.on_write_exact(&ctx);
    }

    fn shutdown_read(&self) {
        assert!(
            !self.in_read_buffered_cb.get(),
            "shutdown_read inside a buffered callback requires accept_buffer first"
        );
        let res = {
            let stream_ref = self.stream.borrow();
            let stream = stream_ref
                .as_ref()
                .expect("descriptor present during shutdown");
            stream.shutdown(Shutdown::Read)
        };
        if let Err(err) = res
            && err.kind() != ErrorKind::NotConnected
        {
            warn!(error = %err, "could not shutdown socket for reading");
        }
        self.on_shutdown_read();
    }

    fn on_shutdown_read(&self) {
        assert!(!self.read_was_shut_down.get());
        self.read_was_shut_down.set(true);

        // Match the poller registration to whatever half remains.
        if self.registration.get().is_some() {
            if self.write_was_shut_down.get() {
                self.poller.forget(self.fd());
            } else {
                self.poller.adjust(self.fd(), EventMask::WRITABLE);
            }
        }

        // Tell the active reader, if any, that the stream is gone.
        let reader = std::mem::replace(&mut *self.read_mode.borrow_mut(), ReadMode::None);
        let ctx = ConnCtx { core: self.rc() };
        match reader {
            ReadMode::None => {}
            ReadMode::Exact { cb, .. } => cb.on_close(&ctx),
            ReadMode::Buffered { cb } => cb.on_close(&ctx),
        }
    }

    fn shutdown_write(&self) {
        let res = {
            let stream_ref = self.stream.borrow();
            let stream = stream_ref
                .as_ref()
                .expect("descriptor present during shutdown");
            stream.shutdown(Shutdown::Write)
        };
        if let Err(err) = res
            && err.kind() != ErrorKind::NotConnected
        {
            warn!(error = %err, "could not shutdown socket for writing");
        }
        self.on_shutdown_write();
    }

    fn on_shutdown_write(&self) {
        assert!(!self.write_was_shut_down.get());
        self.write_was_shut_down.set(true);

        if self.registration.get().is_some() {
            if self.read_was_shut_down.get() {
                self.poller.forget(self.fd());
            } else {
                self.poller.adjust(self.fd(), EventMask::READABLE);
            }
        }

        let writer = std::mem::replace(&mut *self.write_mode.borrow_mut(), WriteMode::None);
        let ctx = ConnCtx { core: self.rc() };
        match writer {
            WriteMode::None => {}
            WriteMode::Exact { cb, .. } => cb.on_close(&ctx),
        }
    }

    fn is_read_open(&self) -> bool {
        !self.read_was_shut_down.get()
    }

    fn is_write_open(&self) -> bool {
        !self.write_was_shut_down.get()
    }
}

impl PollTarget for ConnCore {
    fn on_event(&self, events: EventMask) {
        assert!(self.stream.borrow().is_some());

        if events.contains(EventMask::READABLE) {
            assert!(!self.read_was_shut_down.get());
            let dispatch = match &*self.read_mode.borrow() {
                ReadMode::None => Dispatch::Idle,
                ReadMode::Exact { .. } => Dispatch::Exact,
                ReadMode::Buffered { .. } => Dispatch::Buffered,
            };
            match dispatch {
                Dispatch::Idle => {}
                Dispatch::Exact => self.try_read_exact(),
                Dispatch::Buffered => self.fill_peek_buffer(),
            }
            if self.dropped.get() {
                return;
            }
        }

        // A read callback may have shut the write half down.
        if events.contains(EventMask::WRITABLE) && !self.write_was_shut_down.get() {
            let writing = matches!(*self.write_mode.borrow(), WriteMode::Exact { .. });
            if writing {
                self.try_write_exact();
            }
            if self.dropped.get() {
                return;
            }
        }

        if events.contains(EventMask::ERR) && events.contains(EventMask::HUP) {
            // The peer hung up while data was still queued. The read and
            // write paths surface this on their own.
        } else if events.contains(EventMask::ERR) {
            warn!(?events, "unexpected error event on connection");
            if !self.read_was_shut_down.get() {
                self.shutdown_read();
            }
            if self.dropped.get() {
                return;
            }
            if !self.write_was_shut_down.get() {
                self.shutdown_write();
            }
        }
    }
}

/// Owning handle for a stream connection.
///
/// Dropping the handle closes the descriptor; both halves must have been
/// shut down first. Dropping is legal from inside the connection's own
/// callbacks: the dispatch frames detect the deletion and unwind without
/// touching the connection again.
pub struct Connection {
    core: Rc<ConnCore>,
}

impl Connection {
    /// Wrap an accepted, already nonblocking stream.
    pub fn from_stream(stream: TcpStream, poller: Rc<dyn Poller>, limits: &Limits) -> Connection {
        Connection {
            core: ConnCore::new(stream, poller, limits),
        }
    }

    /// Outbound connections are not supported; connections are built from
    /// accepted streams.
    pub fn connect(_host: &str, _port: u16) -> Result<Connection, NetError> {
        Err(NetError::ConnectUnsupported)
    }

    /// Read exactly `len` bytes, draining read-ahead first, then deliver
    /// them to `cb.on_read_exact`. Peer close or a read error delivers
    /// `cb.on_close` instead.
    pub fn read_exact(&self, len: usize, cb: Rc<dyn ReadExactHandler>) {
        self.core.read_exact(len, cb);
    }

    /// Offer arriving bytes to `cb.on_read_buffered` until a prefix is
    /// accepted with [`ConnCtx::accept_buffer`].
    pub fn read_buffered(&self, cb: Rc<dyn ReadBufferedHandler>) {
        self.core.read_buffered(cb);
    }

    /// Write all of `data`, then deliver `cb.on_write_exact`. A write error
    /// delivers `cb.on_close` instead.
    pub fn write_exact(&self, data: Bytes, cb: Rc<dyn WriteExactHandler>) {
        self.core.write_exact(data, cb);
    }

    pub fn shutdown_read(&self) {
        self.core.shutdown_read();
    }

    pub fn shutdown_write(&self) {
        self.core.shutdown_write();
    }

    pub fn is_read_open(&self) -> bool {
        self.core.is_read_open()
    }

    pub fn is_write_open(&self) -> bool {
        self.core.is_write_open()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.core.stream.borrow().is_some() {
            // So in-flight event dispatch does not touch us after this.
            self.core.dropped.set(true);
            assert!(
                self.core.read_was_shut_down.get() && self.core.write_was_shut_down.get(),
                "connection dropped with a half still open"
            );
            // Shutting down both halves already removed the poller
            // registration; closing is all that is left.
            let stream = self.core.stream.borrow_mut().take();
            drop(stream);
        }
    }
}

/// Borrowed view of a connection handed to its callbacks.
///
/// Exposes the same operations as [`Connection`] plus
/// [`accept_buffer`](ConnCtx::accept_buffer), which is only meaningful from
/// inside a buffered-read callback.
pub struct ConnCtx {
    core: Rc<ConnCore>,
}

impl ConnCtx {
    /// Consume the first `n` offered bytes and end the buffered read. Only
    /// valid inside `on_read_buffered`, at most once per offer.
    pub fn accept_buffer(&self, n: usize) {
        self.core.accept_buffer(n);
    }

    pub fn read_exact(&self, len: usize, cb: Rc<dyn ReadExactHandler>) {
        self.core.read_exact(len, cb);
    }

    pub fn read_buffered(&self, cb: Rc<dyn ReadBufferedHandler>) {
        self.core.read_buffered(cb);
    }

    pub fn write_exact(&self, data: Bytes, cb: Rc<dyn WriteExactHandler>) {
        self.core.write_exact(data, cb);
    }

    pub fn shutdown_read(&self) {
        self.core.shutdown_read();
    }

    pub fn shutdown_write(&self) {
        self.core.shutdown_write();
    }

    pub fn is_read_open(&self) -> bool {
        self.core.is_read_open()
    }

    pub fn is_write_open(&self) -> bool {
        self.core.is_write_open()
    }
}
