//! Registered socket handles.
//!
//! A [`Handle`] wraps the socket that a completion key is associated with.
//! Cancellation is close-based: [`Handle::close`] shuts the socket down and
//! tells the port to complete every in-flight operation on the handle with
//! [`OP_ABORTED`](crate::ops::OP_ABORTED). The in-flight contexts are
//! released only after those abort completions have been consumed, which is
//! what keeps cancellation free of use-after-free.

use crate::port::PortShared;
use polling::{Event, Poller};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// The socket behind a handle.
#[derive(Debug)]
pub(crate) enum HandleIo {
    /// A listening socket (accept operations).
    Listener(TcpListener),
    /// A connected socket (recv/send operations).
    Stream(TcpStream),
}

impl HandleIo {
    /// Adds the socket to the poller with the given interest.
    pub(crate) fn poller_add(&self, poller: &Poller, interest: Event) -> io::Result<()> {
        // SAFETY: the socket stays alive for the lifetime of the poller
        // registration. The port's slot table holds a clone of the owning
        // `Handle` from `register` until `poller_delete` (cancel or close),
        // so the descriptor cannot be freed while registered.
        match self {
            Self::Listener(l) => unsafe { poller.add(l, interest) },
            Self::Stream(s) => unsafe { poller.add(s, interest) },
        }
    }

    /// Updates the interest set for the socket's registration.
    pub(crate) fn poller_modify(&self, poller: &Poller, interest: Event) -> io::Result<()> {
        match self {
            Self::Listener(l) => poller.modify(l, interest),
            Self::Stream(s) => poller.modify(s, interest),
        }
    }

    /// Removes the socket from the poller.
    pub(crate) fn poller_delete(&self, poller: &Poller) -> io::Result<()> {
        match self {
            Self::Listener(l) => poller.delete(l),
            Self::Stream(s) => poller.delete(s),
        }
    }

    /// Shuts the socket down in both directions.
    ///
    /// On a listening socket this refuses further handshakes; on a stream it
    /// interrupts blocked peers. Errors are ignored: a socket that is
    /// already dead is exactly what we want.
    fn shutdown(&self) {
        match self {
            Self::Listener(l) => {
                let _ = socket2::SockRef::from(l).shutdown(Shutdown::Both);
            }
            Self::Stream(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
        }
    }
}

#[derive(Debug)]
struct HandleInner {
    id: u64,
    io: HandleIo,
    closed: AtomicBool,
    /// Set at registration time so `close` can reach the port.
    port: OnceLock<Weak<PortShared>>,
}

/// A socket registered (or registrable) with a completion port.
///
/// Clones share the same socket; the handle is closed when any clone calls
/// [`close`](Handle::close), and the socket itself is released when the last
/// clone drops.
#[derive(Debug, Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    fn new(io: HandleIo) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                io,
                closed: AtomicBool::new(false),
                port: OnceLock::new(),
            }),
        }
    }

    /// Wraps a listening socket, switching it to non-blocking mode.
    pub fn listener(listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self::new(HandleIo::Listener(listener)))
    }

    /// Wraps a connected socket, switching it to non-blocking mode.
    pub fn stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(HandleIo::Stream(stream)))
    }

    /// The process-unique handle id (also the poller key).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes the handle: shuts the socket down and cancels every operation
    /// in flight on it. The cancelled operations complete through dispatch
    /// with [`OP_ABORTED`](crate::ops::OP_ABORTED). Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.io.shutdown();
        if let Some(port) = self.inner.port.get().and_then(Weak::upgrade) {
            port.cancel_handle(self.inner.id);
        }
    }

    /// The local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner.io {
            HandleIo::Listener(l) => l.local_addr(),
            HandleIo::Stream(s) => s.local_addr(),
        }
    }

    /// The peer address, for stream handles.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner.io {
            HandleIo::Listener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listening sockets have no peer",
            )),
            HandleIo::Stream(s) => s.peer_addr(),
        }
    }

    pub(crate) fn io(&self) -> &HandleIo {
        &self.inner.io
    }

    /// Records the owning port; called once at registration.
    pub(crate) fn bind_port(&self, port: Weak<PortShared>) {
        let _ = self.inner.port.set(port);
    }
}
