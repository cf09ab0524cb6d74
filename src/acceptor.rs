//! The acceptor: turns inbound connections into sockets for the server.
//!
//! While listening, exactly one accept operation is kept outstanding on the
//! listening socket (modulo the narrow window between observing a
//! completion and reissuing). Cancellation is close-based: `stop()` closes
//! the listening handle, the in-flight accept completes as aborted, and the
//! acceptor finishes its transition to idle only when that completion has
//! been observed — the pending context is never freed earlier.
//!
//! ```text
//!  Idle ──start()──▶ Listening ──stop()──▶ Stopping ──(abort observed)──▶ Idle
//!                     │    ▲
//!                     └────┘  reissue after each completion
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::ops::{CompletionResult, OperationContext, OperationKind};
use crate::port::{Handle, PortHandle};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

/// Completion key under which the listening socket registers.
pub const ACCEPTOR_KEY: u64 = 0;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Callback receiving each newly accepted socket.
///
/// The callback owns the socket; the server facade uses it to construct a
/// session, register it, and issue its first receive.
pub type AcceptCallback = Arc<dyn Fn(TcpStream) + Send + Sync>;

/// Acceptor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    /// Not listening.
    Idle,
    /// Listening with one accept outstanding.
    Listening,
    /// `stop()` called; waiting for the aborted accept to be observed.
    Stopping,
}

struct Inner {
    state: AcceptorState,
    port: Option<PortHandle>,
    listen: Option<Handle>,
    on_accept: Option<AcceptCallback>,
    local_addr: Option<SocketAddr>,
}

/// Keeps a listening socket saturated with an outstanding accept.
pub struct Acceptor {
    inner: parking_lot::Mutex<Inner>,
}

impl Acceptor {
    /// Creates an idle acceptor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                state: AcceptorState::Idle,
                port: None,
                listen: None,
                on_accept: None,
                local_addr: None,
            }),
        }
    }

    /// Starts listening on `0.0.0.0:listen_port` with the default backlog.
    pub fn start(
        &self,
        port: &PortHandle,
        listen_port: u16,
        on_accept: AcceptCallback,
    ) -> Result<()> {
        self.start_with_backlog(port, listen_port, DEFAULT_BACKLOG, on_accept)
    }

    /// Starts listening with an explicit backlog.
    ///
    /// Binds `INADDR_ANY:listen_port` (0 = ephemeral), registers the
    /// listening socket under [`ACCEPTOR_KEY`], and issues the first accept.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AlreadyRunning`] when not idle, otherwise the startup
    /// fault that occurred (`SocketCreateFailed`, `BindFailed`,
    /// `ListenFailed`, `RegisterFailed`, `SubmitFailed`).
    pub fn start_with_backlog(
        &self,
        port: &PortHandle,
        listen_port: u16,
        backlog: i32,
        on_accept: AcceptCallback,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != AcceptorState::Idle {
            tracing::warn!("acceptor already listening");
            return Err(Error::new(ErrorKind::AlreadyRunning));
        }

        let listener = build_listener(listen_port, backlog)?;
        let handle = Handle::listener(listener)
            .map_err(|e| Error::new(ErrorKind::SocketCreateFailed).with_source(e))?;
        let local_addr = handle.local_addr().ok();

        port.register(&handle, ACCEPTOR_KEY)?;

        inner.state = AcceptorState::Listening;
        inner.port = Some(port.clone());
        inner.listen = Some(handle);
        inner.on_accept = Some(on_accept);
        inner.local_addr = local_addr;

        if let Err(e) = Self::issue_accept(&inner) {
            Self::reset_to_idle(&mut inner);
            return Err(e);
        }

        tracing::info!(addr = ?local_addr, "acceptor listening");
        Ok(())
    }

    /// Stops listening: closes the listening socket so the outstanding
    /// accept completes as aborted. Idempotent. The transition back to idle
    /// finishes when that completion is observed by a worker.
    pub fn stop(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            if inner.state != AcceptorState::Listening {
                return;
            }
            inner.state = AcceptorState::Stopping;
            inner.listen.clone()
        };
        if let Some(handle) = handle {
            handle.close();
        }
        tracing::info!("acceptor stopping");
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AcceptorState {
        self.inner.lock().state
    }

    /// The bound listening address, while listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Routes an accept completion: release-and-idle on abort, log and
    /// reissue on failure, hand the socket to the callback and reissue on
    /// success.
    pub fn on_accept_complete(&self, result: CompletionResult) {
        let aborted = result.is_aborted();
        let Some(mut ctx) = result.context else {
            tracing::warn!("accept completion without context");
            return;
        };
        debug_assert_eq!(ctx.kind(), OperationKind::Accept);

        let mut inner = self.inner.lock();
        if !result.success {
            if aborted || inner.state == AcceptorState::Stopping {
                // Orderly cancellation: the pending context is released now
                // that its completion has been observed. Never reissue.
                tracing::debug!("accept cancelled; acceptor idle");
                Self::reset_to_idle(&mut inner);
                return;
            }
            tracing::warn!(error_code = result.error_code, "accept failed; reissuing");
            if inner.state == AcceptorState::Listening {
                if let Err(e) = Self::issue_accept(&inner) {
                    tracing::error!(error = %e, "accept reissue failed; acceptor idle");
                    Self::reset_to_idle(&mut inner);
                }
            }
            return;
        }

        let Some(stream) = ctx.take_accepted() else {
            tracing::warn!("successful accept completion carried no socket");
            if inner.state == AcceptorState::Listening {
                let _ = Self::issue_accept(&inner);
            }
            return;
        };
        if inner.state == AcceptorState::Stopping {
            // The accept raced with stop(): this completion is the last one
            // outstanding, so it finishes the transition. The socket is
            // dropped, not delivered.
            tracing::debug!("accept raced with stop; acceptor idle");
            drop(stream);
            Self::reset_to_idle(&mut inner);
            return;
        }
        // Local-address inheritance is a no-op on this proactor: accepted
        // sockets answer local_addr queries without extra setup.
        if let Some((local, peer)) = ctx.accepted_addrs() {
            tracing::debug!(%local, %peer, "connection accepted");
        }
        drop(ctx);

        let callback = inner.on_accept.clone();
        let reissue_needed = inner.state == AcceptorState::Listening;
        drop(inner);

        if let Some(callback) = callback {
            callback(stream);
        }

        if reissue_needed {
            let mut inner = self.inner.lock();
            if inner.state == AcceptorState::Listening {
                if let Err(e) = Self::issue_accept(&inner) {
                    tracing::error!(error = %e, "accept reissue failed; acceptor idle");
                    Self::reset_to_idle(&mut inner);
                }
            }
        }
    }

    /// Issues one accept on the listening handle.
    fn issue_accept(inner: &Inner) -> Result<()> {
        let (Some(port), Some(listen)) = (&inner.port, &inner.listen) else {
            return Err(Error::new(ErrorKind::SubmitFailed).with_context("acceptor not started"));
        };
        port.submit(listen, OperationContext::accept())
    }

    fn reset_to_idle(inner: &mut Inner) {
        if let Some(handle) = inner.listen.take() {
            handle.close();
        }
        inner.port = None;
        inner.on_accept = None;
        inner.local_addr = None;
        inner.state = AcceptorState::Idle;
    }
}

impl Default for Acceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Acceptor")
            .field("state", &inner.state)
            .field("local_addr", &inner.local_addr)
            .finish()
    }
}

/// Builds a non-blocking listening socket bound to `INADDR_ANY:port`.
fn build_listener(port: u16, backlog: i32) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::new(ErrorKind::SocketCreateFailed).with_source(e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::new(ErrorKind::SocketCreateFailed).with_source(e))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into()).map_err(|e| {
        Error::new(ErrorKind::BindFailed)
            .with_source(e)
            .with_context(format!("port {port}"))
    })?;
    socket
        .listen(backlog)
        .map_err(|e| Error::new(ErrorKind::ListenFailed).with_source(e))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::SHUTDOWN_KEY;
    use crate::port::CompletionPort;
    use crate::test_utils::init_test_logging;
    use crate::worker::WorkerPool;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Core + pool routing accept completions into the acceptor.
    fn accept_rig(acceptor: &Arc<Acceptor>) -> (CompletionPort, PortHandle, WorkerPool) {
        init_test_logging();
        let mut core = CompletionPort::new();
        core.init(0).expect("init");
        let port = core.handle().expect("handle");
        let pool = WorkerPool::new();
        let router = Arc::clone(acceptor);
        pool.start(
            &port,
            move |result| {
                if result
                    .context
                    .as_ref()
                    .is_some_and(|c| c.kind() == OperationKind::Accept)
                {
                    router.on_accept_complete(result);
                }
            },
            2,
        )
        .expect("pool start");
        (core, port, pool)
    }

    fn teardown(port: &PortHandle, pool: &WorkerPool) {
        for _ in 0..pool.thread_count() {
            let _ = port.post_completion(SHUTDOWN_KEY, None);
        }
        pool.stop();
    }

    #[test]
    fn accept_roundtrip_and_stop() {
        let acceptor = Arc::new(Acceptor::new());
        let (_core, port, pool) = accept_rig(&acceptor);

        let accepted = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&accepted);
        acceptor
            .start(
                &port,
                0,
                Arc::new(move |stream: TcpStream| {
                    assert!(stream.peer_addr().is_ok());
                    seen.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }),
            )
            .expect("start");
        let addr = acceptor.local_addr().expect("bound address");

        let client = TcpStream::connect(addr).expect("connect");
        assert!(
            wait_for(
                || accepted.load(Ordering::SeqCst) == 1,
                Duration::from_millis(500)
            ),
            "accept callback did not fire"
        );
        drop(client);

        acceptor.stop();
        assert!(
            wait_for(
                || acceptor.state() == AcceptorState::Idle,
                Duration::from_secs(2)
            ),
            "aborted accept was not drained"
        );

        // No further callbacks fire; subsequent connects are not served.
        if let Ok(stray) = TcpStream::connect(addr) {
            let _ = stray.set_read_timeout(Some(Duration::from_millis(100)));
            use std::io::Read;
            let mut buf = [0u8; 1];
            let _ = (&stray).read(&mut buf);
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        teardown(&port, &pool);
    }

    #[test]
    fn accept_reissues_after_each_completion() {
        let acceptor = Arc::new(Acceptor::new());
        let (_core, port, pool) = accept_rig(&acceptor);

        let accepted = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&accepted);
        acceptor
            .start(
                &port,
                0,
                Arc::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("start");
        let addr = acceptor.local_addr().expect("bound address");

        for expected in 1..=3u64 {
            let client = TcpStream::connect(addr).expect("connect");
            assert!(
                wait_for(
                    || accepted.load(Ordering::SeqCst) == expected,
                    Duration::from_secs(1)
                ),
                "accept {expected} did not fire"
            );
            drop(client);
        }

        acceptor.stop();
        assert!(wait_for(
            || acceptor.state() == AcceptorState::Idle,
            Duration::from_secs(2)
        ));
        teardown(&port, &pool);
    }

    #[test]
    fn start_twice_fails() {
        let acceptor = Arc::new(Acceptor::new());
        let (_core, port, pool) = accept_rig(&acceptor);

        acceptor.start(&port, 0, Arc::new(|_| {})).expect("start");
        let err = acceptor
            .start(&port, 0, Arc::new(|_| {}))
            .expect_err("second start");
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        acceptor.stop();
        assert!(wait_for(
            || acceptor.state() == AcceptorState::Idle,
            Duration::from_secs(2)
        ));
        teardown(&port, &pool);
    }

    #[test]
    fn stop_is_idempotent() {
        let acceptor = Arc::new(Acceptor::new());
        let (_core, port, pool) = accept_rig(&acceptor);

        acceptor.stop(); // idle: no-op
        assert_eq!(acceptor.state(), AcceptorState::Idle);

        acceptor.start(&port, 0, Arc::new(|_| {})).expect("start");
        acceptor.stop();
        acceptor.stop();
        assert!(wait_for(
            || acceptor.state() == AcceptorState::Idle,
            Duration::from_secs(2)
        ));
        teardown(&port, &pool);
    }

    #[test]
    fn restart_after_stop() {
        let acceptor = Arc::new(Acceptor::new());
        let (_core, port, pool) = accept_rig(&acceptor);

        acceptor.start(&port, 0, Arc::new(|_| {})).expect("start");
        acceptor.stop();
        assert!(wait_for(
            || acceptor.state() == AcceptorState::Idle,
            Duration::from_secs(2)
        ));

        let accepted = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&accepted);
        acceptor
            .start(
                &port,
                0,
                Arc::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("restart");
        let addr = acceptor.local_addr().expect("bound");
        let _client = TcpStream::connect(addr).expect("connect");
        assert!(wait_for(
            || accepted.load(Ordering::SeqCst) == 1,
            Duration::from_secs(1)
        ));

        acceptor.stop();
        assert!(wait_for(
            || acceptor.state() == AcceptorState::Idle,
            Duration::from_secs(2)
        ));
        teardown(&port, &pool);
    }
}
