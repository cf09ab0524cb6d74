//! Per-connection sessions and the registry the dispatcher resolves them
//! through.
//!
//! A session owns one connected socket, one receive context that is reused
//! for the session's whole lifetime, and a FIFO send path. The invariants:
//!
//! - At most one receive is outstanding per session. The next receive is
//!   issued only from the completion handler of the previous one, so the
//!   receive buffer is touched by a single thread at a time — an invariant
//!   of the state machine, not of a lock.
//! - At most one send is outstanding; additional sends queue behind a
//!   per-session mutex and are issued, in order, from the send completion
//!   handler.
//! - The session is released only after every context loaned to the engine
//!   has been returned (successful, failed, or aborted).

use crate::error::{Error, ErrorKind, Result};
use crate::ops::{CompletionResult, OperationContext, MAX_BUFFER_SIZE};
use crate::port::{Handle, PortHandle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a session id. Strictly monotonic, never reused in-process.
pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Established and exchanging data.
    Connected,
    /// Teardown begun; waiting for loaned contexts to return.
    Closing,
    /// Fully released.
    Closed,
}

/// Application hook invoked for every successful non-empty receive.
///
/// Handlers run on whichever worker picked the completion up; per-session
/// calls are naturally serialized by the one-receive-in-flight invariant,
/// but different sessions invoke the handler concurrently.
pub trait SessionHandler: Send + Sync {
    /// Called with the received bytes. `session` can be used to reply.
    fn on_receive(&self, session: &Arc<Session>, data: &[u8]);
}

/// The default handler: sends every received byte straight back.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl SessionHandler for EchoHandler {
    fn on_receive(&self, session: &Arc<Session>, data: &[u8]) {
        if let Err(e) = session.send(data) {
            if e.kind() != ErrorKind::SessionClosed {
                tracing::warn!(session = session.id(), error = %e, "echo send failed");
            }
        }
    }
}

struct SendState {
    in_flight: bool,
    queue: VecDeque<Box<OperationContext>>,
}

/// State for one connected client.
pub struct Session {
    id: u64,
    handle: Handle,
    port: PortHandle,
    registry: Weak<SessionRegistry>,
    peer: Option<SocketAddr>,
    state: Mutex<SessionState>,
    send_state: Mutex<SendState>,
    /// Contexts currently loaned to the engine.
    outstanding: AtomicUsize,
}

impl Session {
    /// Builds a session for an accepted socket: allocates an id, registers
    /// the socket under that id, inserts into the registry, and issues the
    /// first receive.
    pub fn establish(
        stream: TcpStream,
        port: PortHandle,
        registry: &Arc<SessionRegistry>,
    ) -> Result<Arc<Self>> {
        let peer = stream.peer_addr().ok();
        let handle = Handle::stream(stream)
            .map_err(|e| Error::new(ErrorKind::SocketCreateFailed).with_source(e))?;
        let id = next_session_id();
        port.register(&handle, id)?;

        let session = Arc::new(Self {
            id,
            handle,
            port,
            registry: Arc::downgrade(registry),
            peer,
            state: Mutex::new(SessionState::Connected),
            send_state: Mutex::new(SendState {
                in_flight: false,
                queue: VecDeque::new(),
            }),
            outstanding: AtomicUsize::new(0),
        });
        registry.insert(&session);

        if let Err(e) = session.issue_recv(OperationContext::recv(id)) {
            session.close();
            return Err(e);
        }
        tracing::debug!(session = id, peer = ?peer, "session established");
        Ok(session)
    }

    /// The session id (also the completion key of its socket).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Peer address recorded at accept time.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Number of contexts currently loaned to the engine.
    #[must_use]
    pub fn outstanding_operations(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Queues `data` for transmission. Bytes are sent in FIFO order across
    /// all callers; payloads larger than [`MAX_BUFFER_SIZE`] are chunked.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::SessionClosed`] once teardown has begun; submission
    /// faults transition the session to closing.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if *self.state.lock() != SessionState::Connected {
            return Err(Error::new(ErrorKind::SessionClosed));
        }
        for chunk in data.chunks(MAX_BUFFER_SIZE) {
            self.enqueue_send(OperationContext::send(self.id, chunk))?;
        }
        Ok(())
    }

    /// Begins teardown: cancels in-flight operations by closing the socket
    /// and releases the session once they have all been returned.
    pub fn close(&self) {
        self.begin_close();
        self.maybe_release();
    }

    /// Routes a receive completion: terminal conditions tear the session
    /// down, data is delivered to the handler and the receive reissued.
    pub(crate) fn on_recv_complete(
        self: &Arc<Self>,
        result: CompletionResult,
        handler: &dyn SessionHandler,
    ) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let aborted = result.is_aborted();
        let Some(mut ctx) = result.context else {
            tracing::warn!(session = self.id, "receive completion without context");
            return;
        };

        if !result.success || result.bytes_transferred == 0 {
            if result.success {
                tracing::debug!(session = self.id, "peer closed connection");
            } else if aborted {
                tracing::trace!(session = self.id, "receive aborted");
            } else {
                tracing::warn!(
                    session = self.id,
                    error_code = result.error_code,
                    "receive failed"
                );
            }
            drop(ctx);
            self.begin_close();
            self.maybe_release();
            return;
        }

        let n = result.bytes_transferred as usize;
        handler.on_receive(self, ctx.data(n));

        if *self.state.lock() != SessionState::Connected {
            drop(ctx);
            self.maybe_release();
            return;
        }
        ctx.reset_for_recv(self.id);
        if let Err(e) = self.issue_recv(ctx) {
            tracing::warn!(session = self.id, error = %e, "receive reissue failed");
            self.begin_close();
            self.maybe_release();
        }
    }

    /// Routes a send completion: on success issues the next queued send,
    /// on failure tears the session down.
    pub(crate) fn on_send_complete(&self, result: CompletionResult) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        if !result.success {
            if result.is_aborted() {
                tracing::trace!(session = self.id, "send aborted");
            } else {
                tracing::warn!(
                    session = self.id,
                    error_code = result.error_code,
                    "send failed"
                );
            }
            self.send_state.lock().in_flight = false;
            self.begin_close();
            self.maybe_release();
            return;
        }

        let next = {
            let mut send_state = self.send_state.lock();
            match send_state.queue.pop_front() {
                Some(ctx) => Some(ctx),
                None => {
                    send_state.in_flight = false;
                    None
                }
            }
        };
        match next {
            Some(ctx) => {
                self.outstanding.fetch_add(1, Ordering::AcqRel);
                if let Err(e) = self.port.submit(&self.handle, ctx) {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    self.send_state.lock().in_flight = false;
                    tracing::warn!(session = self.id, error = %e, "queued send failed to issue");
                    self.begin_close();
                    self.maybe_release();
                }
            }
            None => self.maybe_release(),
        }
    }

    fn issue_recv(&self, ctx: Box<OperationContext>) -> Result<()> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.port.submit(&self.handle, ctx) {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    fn enqueue_send(&self, ctx: Box<OperationContext>) -> Result<()> {
        let submit_now = {
            let mut send_state = self.send_state.lock();
            if send_state.in_flight {
                send_state.queue.push_back(ctx);
                None
            } else {
                send_state.in_flight = true;
                Some(ctx)
            }
        };
        if let Some(ctx) = submit_now {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = self.port.submit(&self.handle, ctx) {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                self.send_state.lock().in_flight = false;
                self.begin_close();
                self.maybe_release();
                return Err(e);
            }
        }
        Ok(())
    }

    fn begin_close(&self) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Connected {
                return;
            }
            *state = SessionState::Closing;
        }
        // Queued sends were never loaned to the engine; drop them here.
        self.send_state.lock().queue.clear();
        self.handle.close();
        tracing::debug!(session = self.id, "session closing");
    }

    /// Finishes teardown once every loaned context has been returned.
    fn maybe_release(&self) {
        if self.outstanding.load(Ordering::Acquire) != 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state != SessionState::Closing {
                return;
            }
            // Re-check under the state lock so two workers cannot both
            // observe zero and race the transition.
            if self.outstanding.load(Ordering::Acquire) != 0 {
                return;
            }
            *state = SessionState::Closed;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        tracing::debug!(session = self.id, "session released");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding_operations())
            .finish()
    }
}

/// Registry mapping session ids to live sessions.
///
/// The dispatcher resolves the completion key of recv/send completions here
/// instead of following raw owner pointers.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, session: &Arc<Session>) {
        self.sessions
            .lock()
            .insert(session.id(), Arc::clone(session));
    }

    /// Resolves a session id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().remove(&id)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true when no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }

    /// Begins teardown of every live session.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.close();
        }
    }

    /// Drops every entry regardless of state. Used by the facade after the
    /// worker pool has stopped, when no completion can arrive anymore.
    pub(crate) fn clear(&self) {
        self.sessions.lock().clear();
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OperationKind, SHUTDOWN_KEY};
    use crate::port::CompletionPort;
    use crate::test_utils::init_test_logging;
    use crate::worker::WorkerPool;
    use std::io::{Read, Write};
    use std::net::TcpListener;
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

    #[test]
    fn session_ids_are_strictly_monotonic() {
        let a = next_session_id();
        let b = next_session_id();
        let c = next_session_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn registry_tracks_membership() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(1).is_none());
        assert_eq!(registry.active_count(), 0);
    }

    /// Core + pool routing recv/send completions into sessions.
    struct Rig {
        core: CompletionPort,
        port: PortHandle,
        pool: WorkerPool,
        registry: Arc<SessionRegistry>,
    }

    fn session_rig(handler: Arc<dyn SessionHandler>) -> Rig {
        init_test_logging();
        let mut core = CompletionPort::new();
        core.init(0).expect("init");
        let port = core.handle().expect("handle");
        let registry = Arc::new(SessionRegistry::new());
        let pool = WorkerPool::new();

        let route_registry = Arc::clone(&registry);
        pool.start(
            &port,
            move |result| {
                let Some(kind) = result.context.as_ref().map(|c| c.kind()) else {
                    return;
                };
                let Some(session) = route_registry.get(result.completion_key) else {
                    return;
                };
                match kind {
                    OperationKind::Recv => session.on_recv_complete(result, handler.as_ref()),
                    OperationKind::Send => session.on_send_complete(result),
                    OperationKind::Accept | OperationKind::Disconnect => {}
                }
            },
            2,
        )
        .expect("pool start");

        Rig {
            core,
            port,
            pool,
            registry,
        }
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server_side, _) = listener.accept().expect("accept");
        (client, server_side)
    }

    fn teardown(rig: Rig) {
        for _ in 0..rig.pool.thread_count() {
            let _ = rig.port.post_completion(SHUTDOWN_KEY, None);
        }
        rig.pool.stop();
        drop(rig.core);
    }

    #[test]
    fn echo_roundtrip_through_session() {
        let rig = session_rig(Arc::new(EchoHandler));
        crate::test_phase!("echo_roundtrip_through_session");
        let (mut client, server_side) = connected_pair();

        let session =
            Session::establish(server_side, rig.port.clone(), &rig.registry).expect("establish");
        let state = session.state();
        crate::assert_with_log!(
            state == SessionState::Connected,
            "session connected",
            SessionState::Connected,
            state
        );
        assert_eq!(rig.registry.active_count(), 1);

        client.write_all(b"Hello Server").expect("write");
        let mut buf = [0u8; 12];
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        client.read_exact(&mut buf).expect("echo");
        assert_eq!(&buf, b"Hello Server");

        // Peer close tears the session down and empties the registry.
        drop(client);
        assert!(
            wait_for(|| rig.registry.is_empty(), Duration::from_secs(2)),
            "session was not released"
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.outstanding_operations(), 0);

        teardown(rig);
        crate::test_complete!("echo_roundtrip_through_session");
    }

    #[test]
    fn sends_are_fifo_across_queueing() {
        // Handler that answers each received byte with three ordered
        // payloads; queueing must preserve order.
        struct Burst;
        impl SessionHandler for Burst {
            fn on_receive(&self, session: &Arc<Session>, _data: &[u8]) {
                for part in [&b"first."[..], &b"second."[..], &b"third."[..]] {
                    let _ = session.send(part);
                }
            }
        }

        let rig = session_rig(Arc::new(Burst));
        let (mut client, server_side) = connected_pair();
        let _session =
            Session::establish(server_side, rig.port.clone(), &rig.registry).expect("establish");

        client.write_all(b"x").expect("write");
        let expected = b"first.second.third.";
        let mut buf = vec![0u8; expected.len()];
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        client.read_exact(&mut buf).expect("read");
        assert_eq!(buf, expected);

        drop(client);
        assert!(wait_for(|| rig.registry.is_empty(), Duration::from_secs(2)));
        teardown(rig);
    }

    #[test]
    fn oversized_send_is_chunked() {
        let rig = session_rig(Arc::new(EchoHandler));
        let (mut client, server_side) = connected_pair();
        let session =
            Session::establish(server_side, rig.port.clone(), &rig.registry).expect("establish");

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        session.send(&payload).expect("send");

        let mut buf = vec![0u8; payload.len()];
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        client.read_exact(&mut buf).expect("read");
        assert_eq!(buf, payload);

        drop(client);
        assert!(wait_for(|| rig.registry.is_empty(), Duration::from_secs(2)));
        teardown(rig);
    }

    #[test]
    fn send_after_close_is_rejected() {
        let rig = session_rig(Arc::new(EchoHandler));
        let (client, server_side) = connected_pair();
        let session =
            Session::establish(server_side, rig.port.clone(), &rig.registry).expect("establish");

        session.close();
        let err = session.send(b"late").expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::SessionClosed);

        assert!(wait_for(|| rig.registry.is_empty(), Duration::from_secs(2)));
        assert_eq!(session.outstanding_operations(), 0);
        drop(client);
        teardown(rig);
    }

    #[test]
    fn explicit_close_aborts_inflight_recv() {
        let rig = session_rig(Arc::new(EchoHandler));
        let (client, server_side) = connected_pair();
        let session =
            Session::establish(server_side, rig.port.clone(), &rig.registry).expect("establish");
        assert_eq!(session.outstanding_operations(), 1);

        session.close();
        assert!(
            wait_for(
                || session.state() == SessionState::Closed,
                Duration::from_secs(2)
            ),
            "close did not drain the loaned recv context"
        );
        assert!(rig.registry.is_empty());
        drop(client);
        teardown(rig);
    }
}
