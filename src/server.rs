//! The server facade: composes core, workers, acceptor, and sessions.
//!
//! Startup order: completion port → worker pool (with the routing
//! dispatcher) → acceptor (with a callback that establishes sessions).
//! Shutdown runs in reverse: stop the acceptor and close the sessions so
//! their aborted contexts drain through the still-running workers, post one
//! shutdown packet per worker, join the pool, then close the port. Closing
//! the port before the workers have exited is undefined, so the facade
//! never does it.

use crate::acceptor::{Acceptor, AcceptorState};
use crate::config::ServerConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::ops::{CompletionResult, OperationKind, SHUTDOWN_KEY};
use crate::port::CompletionPort;
use crate::session::{EchoHandler, Session, SessionHandler, SessionRegistry};
use crate::worker::WorkerPool;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long `stop()` waits for sessions and the acceptor to drain before
/// posting shutdown packets.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Monotonic counters describing server activity.
///
/// All counters are updated by the dispatcher on worker threads; reads are
/// snapshots and may trail in-flight work by a completion or two.
#[derive(Debug, Default)]
pub struct ServerStats {
    sessions_accepted: AtomicU64,
    sessions_rejected: AtomicU64,
    sessions_closed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    recv_errors: AtomicU64,
    send_errors: AtomicU64,
    accept_errors: AtomicU64,
}

impl ServerStats {
    /// Sessions successfully established.
    #[must_use]
    pub fn sessions_accepted(&self) -> u64 {
        self.sessions_accepted.load(Ordering::Relaxed)
    }

    /// Connections dropped because the session cap was reached.
    #[must_use]
    pub fn sessions_rejected(&self) -> u64 {
        self.sessions_rejected.load(Ordering::Relaxed)
    }

    /// Sessions whose teardown was observed by the dispatcher.
    #[must_use]
    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    /// Total payload bytes received.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Total payload bytes sent.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Receive completions that failed for a reason other than
    /// cancellation or peer close.
    #[must_use]
    pub fn recv_errors(&self) -> u64 {
        self.recv_errors.load(Ordering::Relaxed)
    }

    /// Send completions that failed for a reason other than cancellation.
    #[must_use]
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Accept completions that failed for a reason other than cancellation,
    /// plus sessions that could not be established.
    #[must_use]
    pub fn accept_errors(&self) -> u64 {
        self.accept_errors.load(Ordering::Relaxed)
    }

    /// Sum of all error counters.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.recv_errors() + self.send_errors() + self.accept_errors()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// TCP echo server built on the completion-port engine.
///
/// The handler is pluggable; [`EchoHandler`] is the default.
pub struct Server {
    config: ServerConfig,
    core: CompletionPort,
    pool: WorkerPool,
    acceptor: Arc<Acceptor>,
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
    handler: Arc<dyn SessionHandler>,
    running: bool,
}

impl Server {
    /// Creates a stopped server with the default echo handler.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_handler(config, Arc::new(EchoHandler))
    }

    /// Creates a stopped server with a custom session handler.
    #[must_use]
    pub fn with_handler(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            config,
            core: CompletionPort::new(),
            pool: WorkerPool::new(),
            acceptor: Arc::new(Acceptor::new()),
            registry: Arc::new(SessionRegistry::new()),
            stats: Arc::new(ServerStats::default()),
            handler,
            running: false,
        }
    }

    /// Brings the server up: completion port, worker pool, acceptor.
    ///
    /// # Errors
    ///
    /// Startup faults abort the whole start; any component already brought
    /// up is torn down again before returning.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::new(ErrorKind::AlreadyRunning));
        }
        self.core.init(0)?;
        let port = self.core.handle()?;

        let acceptor = Arc::clone(&self.acceptor);
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let handler = Arc::clone(&self.handler);
        let dispatcher = move |result: CompletionResult| {
            route_completion(&acceptor, &registry, &stats, handler.as_ref(), result);
        };
        if let Err(e) = self.pool.start(&port, dispatcher, self.config.worker_threads) {
            self.core.close();
            return Err(e);
        }

        let cb_port = port.clone();
        let cb_registry = Arc::clone(&self.registry);
        let cb_stats = Arc::clone(&self.stats);
        let max_sessions = self.config.max_sessions;
        let on_accept = Arc::new(move |stream: TcpStream| {
            if let Some(max) = max_sessions {
                if cb_registry.active_count() >= max {
                    tracing::warn!(max, "session capacity reached; dropping connection");
                    ServerStats::bump(&cb_stats.sessions_rejected);
                    return;
                }
            }
            match Session::establish(stream, cb_port.clone(), &cb_registry) {
                Ok(_) => ServerStats::bump(&cb_stats.sessions_accepted),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to establish session");
                    ServerStats::bump(&cb_stats.accept_errors);
                }
            }
        });
        if let Err(e) = self.acceptor.start_with_backlog(
            &port,
            self.config.port,
            self.config.backlog,
            on_accept,
        ) {
            for _ in 0..self.pool.thread_count() {
                let _ = port.post_completion(SHUTDOWN_KEY, None);
            }
            self.pool.stop();
            self.core.close();
            return Err(e);
        }

        self.running = true;
        tracing::info!(addr = ?self.local_addr(), "server started");
        Ok(())
    }

    /// Tears the server down in reverse startup order. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        // 1. Stop accepting; close sessions. Their aborted contexts drain
        //    through the workers, which are still running.
        self.acceptor.stop();
        self.registry.close_all();
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            if self.acceptor.state() == AcceptorState::Idle && self.registry.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        // 2. One shutdown packet per worker, then join.
        if let Ok(port) = self.core.handle() {
            for _ in 0..self.pool.thread_count() {
                let _ = port.post_completion(SHUTDOWN_KEY, None);
            }
        }
        self.pool.stop();

        // 3. Close the core last; no worker can touch it anymore.
        self.core.close();
        self.registry.clear();
        tracing::info!("server stopped");
    }

    /// Returns true while the server is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The bound listening address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// The live-session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("running", &self.running)
            .field("addr", &self.local_addr())
            .field("sessions", &self.registry.active_count())
            .finish()
    }
}

/// Routes one completion to its owner, updating stats on the way.
///
/// Accept completions go to the acceptor; recv/send completions resolve
/// their session through the registry by completion key.
fn route_completion(
    acceptor: &Acceptor,
    registry: &SessionRegistry,
    stats: &ServerStats,
    handler: &dyn SessionHandler,
    result: CompletionResult,
) {
    let Some(kind) = result.context.as_ref().map(|c| c.kind()) else {
        tracing::trace!(
            key = result.completion_key,
            "synthetic completion without context"
        );
        return;
    };
    match kind {
        OperationKind::Accept => {
            if !result.success && !result.is_aborted() {
                ServerStats::bump(&stats.accept_errors);
            }
            acceptor.on_accept_complete(result);
        }
        OperationKind::Recv => {
            let Some(session) = registry.get(result.completion_key) else {
                tracing::trace!(
                    key = result.completion_key,
                    "recv completion for unknown session"
                );
                return;
            };
            if result.success && result.bytes_transferred > 0 {
                stats
                    .bytes_received
                    .fetch_add(u64::from(result.bytes_transferred), Ordering::Relaxed);
            } else {
                if !result.success && !result.is_aborted() {
                    ServerStats::bump(&stats.recv_errors);
                }
                ServerStats::bump(&stats.sessions_closed);
            }
            session.on_recv_complete(result, handler);
        }
        OperationKind::Send => {
            let Some(session) = registry.get(result.completion_key) else {
                return;
            };
            if result.success {
                stats
                    .bytes_sent
                    .fetch_add(u64::from(result.bytes_transferred), Ordering::Relaxed);
            } else if !result.is_aborted() {
                ServerStats::bump(&stats.send_errors);
            }
            session.on_send_complete(result);
        }
        OperationKind::Disconnect => {
            if let Some(session) = registry.get(result.completion_key) {
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::io::{Read, Write};

    #[test]
    fn start_stop_lifecycle() {
        init_test_logging();
        let mut server = Server::new(ServerConfig::new().with_port(0).with_worker_threads(2));
        server.start().expect("start");
        assert!(server.is_running());
        assert!(server.local_addr().is_some());

        let err = server.start().expect_err("double start");
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        server.stop();
        assert!(!server.is_running());
        server.stop(); // idempotent
    }

    #[test]
    fn echo_smoke() {
        init_test_logging();
        let mut server = Server::new(ServerConfig::new().with_port(0).with_worker_threads(2));
        server.start().expect("start");
        let addr = server.local_addr().expect("addr");

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        client.write_all(b"ping").expect("write");
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).expect("echo");
        assert_eq!(&buf, b"ping");

        drop(client);
        server.stop();
        assert!(server.registry().is_empty());
        assert_eq!(server.stats().error_count(), 0);
    }

    #[test]
    fn session_cap_drops_excess_connections() {
        init_test_logging();
        let mut server = Server::new(
            ServerConfig::new()
                .with_port(0)
                .with_worker_threads(2)
                .with_max_sessions(Some(1)),
        );
        server.start().expect("start");
        let addr = server.local_addr().expect("addr");

        let mut first = TcpStream::connect(addr).expect("connect");
        first
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        first.write_all(b"a").expect("write");
        let mut buf = [0u8; 1];
        first.read_exact(&mut buf).expect("echo");

        // Second connection is accepted by the kernel but dropped by the
        // capacity check; its socket closes without any echo.
        let second = TcpStream::connect(addr).expect("connect");
        let _ = second.set_read_timeout(Some(Duration::from_millis(500)));
        let mut probe = [0u8; 1];
        let outcome = (&second).read(&mut probe);
        assert!(matches!(outcome, Ok(0) | Err(_)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.stats().sessions_rejected() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.stats().sessions_rejected(), 1);
        assert_eq!(server.stats().sessions_accepted(), 1);

        drop(first);
        server.stop();
    }
}
