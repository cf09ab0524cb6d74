//! The completion core: a proactor-style completion port.
//!
//! [`CompletionPort`] owns the port lifecycle; [`PortHandle`] is the
//! cloneable capability that worker threads, the acceptor, and sessions use
//! to register sockets, submit operations, and drain completions.
//!
//! # Realization
//!
//! The port is realized in user space:
//!
//! - Completions live in a lock-free queue; [`dispatch`](PortHandle::dispatch)
//!   parks on a condvar until one arrives or the timeout elapses, and
//!   [`post_completion`](PortHandle::post_completion) feeds the queue
//!   directly.
//! - A single driver thread waits on an OS poller. Submitted operations
//!   attach to the registered handle's read or write lane; when the OS
//!   reports readiness the driver runs the non-blocking call and enqueues a
//!   fully populated [`CompletionResult`].
//!
//! The contract seen by callers is the completion-port contract: every
//! submission goes pending, ownership of the [`OperationContext`] is loaned
//! to the engine while in flight, and exactly one completion returns it.
//!
//! # Thread safety
//!
//! All `PortHandle` methods are callable from any thread. Draining the port
//! from several worker threads concurrently is the intended idiom; the port
//! itself serializes nothing beyond the queue.

mod driver;
mod handle;

pub use handle::Handle;
pub(crate) use handle::HandleIo;

use crate::error::{Error, ErrorKind, Result};
use crate::ops::{CompletionResult, OperationContext, OperationKind};
use crossbeam_queue::SegQueue;
use driver::{interest_for, Lane, Slot};
use polling::{Event, Poller};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Shared state behind an initialized completion port.
pub(crate) struct PortShared {
    /// Delivered completions, drained by `dispatch`.
    completions: SegQueue<CompletionResult>,
    /// Parking lot for dispatchers waiting on an empty queue.
    dispatch_lock: Mutex<()>,
    available: Condvar,
    /// Registered handles and their pending operations, keyed by handle id.
    pub(crate) slots: parking_lot::Mutex<HashMap<u64, Slot>>,
    /// The OS readiness poller the driver waits on.
    pub(crate) poller: Poller,
    /// Cleared by `close`; the driver and blocked dispatchers observe it.
    open: AtomicBool,
    /// Resolved concurrency hint (informational).
    concurrency: u32,
}

impl PortShared {
    /// Enqueues a completion and wakes one waiting dispatcher.
    pub(crate) fn push_completion(&self, result: CompletionResult) {
        self.completions.push(result);
        let _guard = self.dispatch_lock.lock().expect("dispatch lock poisoned");
        self.available.notify_one();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn dispatch(&self, timeout: Duration) -> Option<CompletionResult> {
        if let Some(result) = self.completions.pop() {
            return Some(result);
        }
        if !self.is_open() || timeout.is_zero() {
            return None;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.dispatch_lock.lock().expect("dispatch lock poisoned");
        loop {
            if let Some(result) = self.completions.pop() {
                return Some(result);
            }
            if !self.is_open() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _) = self
                .available
                .wait_timeout(guard, deadline - now)
                .expect("dispatch lock poisoned");
            guard = g;
        }
    }

    fn post_completion(&self, key: u64, context: Option<Box<OperationContext>>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::new(ErrorKind::NotInitialized));
        }
        self.push_completion(CompletionResult::synthetic(key, context));
        Ok(())
    }

    fn register(self: &Arc<Self>, handle: &Handle, completion_key: u64) -> Result<()> {
        if !self.is_open() {
            return Err(Error::new(ErrorKind::NotInitialized));
        }
        if handle.is_closed() {
            return Err(Error::new(ErrorKind::RegisterFailed).with_context("handle is closed"));
        }
        let mut slots = self.slots.lock();
        if slots.contains_key(&handle.id()) {
            return Err(
                Error::new(ErrorKind::RegisterFailed).with_context("handle already registered")
            );
        }
        handle
            .io()
            .poller_add(&self.poller, Event::none(handle.id() as usize))
            .map_err(|e| Error::new(ErrorKind::RegisterFailed).with_source(e))?;
        slots.insert(handle.id(), Slot::new(completion_key, handle.clone()));
        drop(slots);
        handle.bind_port(Arc::downgrade(self));
        Ok(())
    }

    fn submit(&self, handle: &Handle, ctx: Box<OperationContext>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::new(ErrorKind::NotInitialized));
        }
        if handle.is_closed() {
            return Err(Error::new(ErrorKind::SubmitFailed).with_context("handle is closed"));
        }
        let lane = match ctx.kind() {
            OperationKind::Recv | OperationKind::Accept => Lane::Read,
            OperationKind::Send => Lane::Write,
            OperationKind::Disconnect => {
                return Err(
                    Error::new(ErrorKind::SubmitFailed).with_context("disconnect is not issuable")
                )
            }
        };
        let compatible = matches!(
            (ctx.kind(), handle.io()),
            (OperationKind::Accept, HandleIo::Listener(_))
                | (OperationKind::Recv | OperationKind::Send, HandleIo::Stream(_))
        );
        if !compatible {
            return Err(Error::new(ErrorKind::SubmitFailed)
                .with_context("operation kind does not match handle type"));
        }
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&handle.id()).ok_or_else(|| {
            Error::new(ErrorKind::SubmitFailed).with_context("handle is not registered")
        })?;
        let lane_slot = slot.lane_mut(lane);
        if lane_slot.is_some() {
            return Err(Error::new(ErrorKind::SlotBusy));
        }
        *lane_slot = Some(ctx);
        let interest = interest_for(handle.id(), slot.read.is_some(), slot.write.is_some());
        if let Err(e) = slot.handle.io().poller_modify(&self.poller, interest) {
            *slot.lane_mut(lane) = None;
            return Err(Error::new(ErrorKind::SubmitFailed).with_source(e));
        }
        Ok(())
    }
}

/// Thin wrapper over the completion-port primitive.
///
/// Owns the port lifecycle. Movable but not copyable: moving transfers the
/// port, and [`close`](Self::close) invalidates it. Cloneable access for
/// workers and sessions goes through [`handle`](Self::handle).
pub struct CompletionPort {
    inner: Option<Arc<PortShared>>,
    driver: Option<JoinHandle<()>>,
}

impl CompletionPort {
    /// Creates an uninitialized port.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: None,
            driver: None,
        }
    }

    /// Creates the port with the given concurrency hint (0 = CPU count).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AlreadyInitialized`] on double init and
    /// [`ErrorKind::InitFailed`] when the OS poller cannot be created.
    pub fn init(&mut self, concurrency_hint: u32) -> Result<()> {
        if self.inner.is_some() {
            tracing::warn!("completion port already initialized");
            return Err(Error::new(ErrorKind::AlreadyInitialized));
        }
        let concurrency = if concurrency_hint == 0 {
            thread::available_parallelism().map_or(1, |n| n.get() as u32)
        } else {
            concurrency_hint
        };
        let poller = Poller::new().map_err(|e| Error::new(ErrorKind::InitFailed).with_source(e))?;
        let shared = Arc::new(PortShared {
            completions: SegQueue::new(),
            dispatch_lock: Mutex::new(()),
            available: Condvar::new(),
            slots: parking_lot::Mutex::new(HashMap::new()),
            poller,
            open: AtomicBool::new(true),
            concurrency,
        });
        let driver_shared = Arc::clone(&shared);
        let driver = thread::Builder::new()
            .name("portside-driver".to_string())
            .spawn(move || driver::run(&driver_shared))
            .expect("failed to spawn driver thread");
        self.inner = Some(shared);
        self.driver = Some(driver);
        tracing::info!(concurrency, "completion port initialized");
        Ok(())
    }

    /// Returns true while the port is initialized and open.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.as_ref().is_some_and(|s| s.is_open())
    }

    /// Returns the resolved concurrency hint.
    #[must_use]
    pub fn concurrency(&self) -> u32 {
        self.inner.as_ref().map_or(0, |s| s.concurrency)
    }

    /// Returns a cloneable capability to the port.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotInitialized`] before [`init`](Self::init).
    pub fn handle(&self) -> Result<PortHandle> {
        self.inner
            .as_ref()
            .map(|shared| PortHandle {
                shared: Arc::clone(shared),
            })
            .ok_or_else(|| Error::new(ErrorKind::NotInitialized))
    }

    /// Associates a socket with the port under `completion_key`.
    pub fn register(&self, handle: &Handle, completion_key: u64) -> Result<()> {
        match &self.inner {
            Some(shared) => shared.register(handle, completion_key),
            None => Err(Error::new(ErrorKind::NotInitialized)),
        }
    }

    /// Issues an overlapped operation on a registered handle.
    pub fn submit(&self, handle: &Handle, ctx: Box<OperationContext>) -> Result<()> {
        match &self.inner {
            Some(shared) => shared.submit(handle, ctx),
            None => Err(Error::new(ErrorKind::NotInitialized)),
        }
    }

    /// Blocks up to `timeout` for the next completion.
    ///
    /// `None` means no completion arrived within the timeout; a failed
    /// operation still yields `Some` with `success = false`.
    #[must_use]
    pub fn dispatch(&self, timeout: Duration) -> Option<CompletionResult> {
        self.inner.as_ref()?.dispatch(timeout)
    }

    /// Injects a synthetic completion (zero bytes, success).
    pub fn post_completion(
        &self,
        key: u64,
        context: Option<Box<OperationContext>>,
    ) -> Result<()> {
        match &self.inner {
            Some(shared) => shared.post_completion(key, context),
            None => Err(Error::new(ErrorKind::NotInitialized)),
        }
    }

    /// Releases the port: stops the driver, aborts what it can, and drains
    /// the completion queue. Idempotent. Workers must be stopped first.
    pub fn close(&mut self) {
        let Some(shared) = self.inner.take() else {
            return;
        };
        shared.open.store(false, Ordering::Release);
        let _ = shared.poller.notify();
        {
            let _guard = shared.dispatch_lock.lock().expect("dispatch lock poisoned");
            shared.available.notify_all();
        }
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
        // Remaining slots and queued completions are dropped here. By the
        // shutdown contract all dispatch consumers are gone, so the loaned
        // contexts have no observer left and releasing them is final.
        shared.slots.lock().clear();
        while shared.completions.pop().is_some() {}
        tracing::info!("completion port closed");
    }
}

impl Default for CompletionPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CompletionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionPort")
            .field("initialized", &self.is_initialized())
            .field("concurrency", &self.concurrency())
            .finish()
    }
}

/// Cloneable capability to an initialized completion port.
#[derive(Clone)]
pub struct PortHandle {
    shared: Arc<PortShared>,
}

impl PortHandle {
    /// Associates a socket with the port under `completion_key`.
    pub fn register(&self, handle: &Handle, completion_key: u64) -> Result<()> {
        self.shared.register(handle, completion_key)
    }

    /// Issues an overlapped operation on a registered handle.
    pub fn submit(&self, handle: &Handle, ctx: Box<OperationContext>) -> Result<()> {
        self.shared.submit(handle, ctx)
    }

    /// Blocks up to `timeout` for the next completion.
    #[must_use]
    pub fn dispatch(&self, timeout: Duration) -> Option<CompletionResult> {
        self.shared.dispatch(timeout)
    }

    /// Injects a synthetic completion (zero bytes, success).
    pub fn post_completion(
        &self,
        key: u64,
        context: Option<Box<OperationContext>>,
    ) -> Result<()> {
        self.shared.post_completion(key, context)
    }

    /// Returns true while the port is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Number of handles currently registered.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.shared.slots.lock().len()
    }
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("open", &self.is_open())
            .field("registered", &self.registered_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OperationKind, MAX_BUFFER_SIZE, OP_ABORTED};
    use crate::test_utils::init_test_logging;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn init_port() -> CompletionPort {
        init_test_logging();
        let mut port = CompletionPort::new();
        port.init(0).expect("init");
        port
    }

    #[test]
    fn synthetic_completion_roundtrip() {
        // Post a context under key 100, expect the exact same allocation back.
        let port = init_port();
        let mut ctx = OperationContext::recv(42);
        ctx.reset_for_recv(42);
        let addr = std::ptr::from_ref::<OperationContext>(&*ctx);
        port.post_completion(100, Some(ctx)).expect("post");

        let result = port.dispatch(Duration::from_millis(1000)).expect("dispatch");
        assert_eq!(result.completion_key, 100);
        assert_eq!(result.bytes_transferred, 0);
        assert!(result.success);
        let returned = result.context.expect("context");
        assert_eq!(returned.session_id(), 42);
        assert_eq!(returned.kind(), OperationKind::Recv);
        assert_eq!(std::ptr::from_ref::<OperationContext>(&*returned), addr);
    }

    #[test]
    fn dispatch_timeout_returns_none() {
        let port = init_port();
        assert!(port.dispatch(Duration::ZERO).is_none());
        assert!(port.dispatch(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn double_init_fails_without_state_change() {
        let mut port = init_port();
        let err = port.init(0).expect_err("double init");
        assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);
        assert!(port.is_initialized());
    }

    #[test]
    fn init_close_init_roundtrip() {
        let mut port = init_port();
        port.close();
        assert!(!port.is_initialized());
        port.init(2).expect("re-init");
        assert!(port.is_initialized());
        assert_eq!(port.concurrency(), 2);

        port.post_completion(7, None).expect("post");
        let result = port.dispatch(Duration::from_millis(500)).expect("dispatch");
        assert_eq!(result.completion_key, 7);
    }

    #[test]
    fn close_is_idempotent() {
        let mut port = init_port();
        port.close();
        port.close();
        assert!(!port.is_initialized());
    }

    #[test]
    fn operations_fail_before_init() {
        let port = CompletionPort::new();
        assert!(port.dispatch(Duration::ZERO).is_none());
        let err = port.post_completion(1, None).expect_err("post");
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert_eq!(
            port.handle().expect_err("handle").kind(),
            ErrorKind::NotInitialized
        );
    }

    #[test]
    fn register_fails_after_close() {
        let mut port = init_port();
        let handle = port.handle().expect("handle");
        port.close();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let socket = Handle::listener(listener).expect("handle");
        let err = handle.register(&socket, 5).expect_err("register");
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn moving_the_port_keeps_it_valid() {
        let port = init_port();
        port.post_completion(11, None).expect("post");
        let moved = port;
        let result = moved.dispatch(Duration::from_millis(500)).expect("dispatch");
        assert_eq!(result.completion_key, 11);
    }

    #[test]
    fn handle_outlives_port_binding() {
        let mut port = init_port();
        let handle = port.handle().expect("handle");
        port.post_completion(3, None).expect("post");
        drop(port);
        // The handle observes the closed port: the queue was drained.
        assert!(!handle.is_open());
        assert!(handle.dispatch(Duration::ZERO).is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let port = init_port();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let handle = Handle::listener(listener).expect("handle");
        port.register(&handle, 1).expect("register");
        let err = port.register(&handle, 2).expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::RegisterFailed);
    }

    #[test]
    fn submit_requires_registration() {
        let port = init_port();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let handle = Handle::listener(listener).expect("handle");
        let err = port
            .submit(&handle, OperationContext::accept())
            .expect_err("unregistered");
        assert_eq!(err.kind(), ErrorKind::SubmitFailed);
    }

    #[test]
    fn second_recv_on_same_lane_is_rejected() {
        let port = init_port();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server_side, _) = listener.accept().expect("accept");
        let handle = Handle::stream(server_side).expect("handle");
        port.register(&handle, 9).expect("register");
        port.submit(&handle, OperationContext::recv(9)).expect("first recv");
        let err = port
            .submit(&handle, OperationContext::recv(9))
            .expect_err("second recv");
        assert_eq!(err.kind(), ErrorKind::SlotBusy);
        drop(client);
    }

    #[test]
    fn recv_completion_delivers_bytes() {
        let port = init_port();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut client = TcpStream::connect(addr).expect("connect");
        let (server_side, _) = listener.accept().expect("accept");

        let handle = Handle::stream(server_side).expect("handle");
        port.register(&handle, 77).expect("register");
        port.submit(&handle, OperationContext::recv(77)).expect("submit");

        client.write_all(b"ping").expect("write");
        let result = port.dispatch(Duration::from_secs(2)).expect("completion");
        assert_eq!(result.completion_key, 77);
        assert!(result.success);
        assert_eq!(result.bytes_transferred, 4);
        let ctx = result.context.expect("context");
        assert_eq!(ctx.data(4), b"ping");
    }

    #[test]
    fn zero_byte_recv_signals_peer_close() {
        let port = init_port();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server_side, _) = listener.accept().expect("accept");

        let handle = Handle::stream(server_side).expect("handle");
        port.register(&handle, 5).expect("register");
        port.submit(&handle, OperationContext::recv(5)).expect("submit");

        drop(client);
        let result = port.dispatch(Duration::from_secs(2)).expect("completion");
        assert!(result.success);
        assert_eq!(result.bytes_transferred, 0);
    }

    #[test]
    fn send_completion_reports_full_payload() {
        let port = init_port();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server_side, _) = listener.accept().expect("accept");

        let handle = Handle::stream(server_side).expect("handle");
        port.register(&handle, 8).expect("register");
        let payload = vec![0xAB; MAX_BUFFER_SIZE];
        port.submit(&handle, OperationContext::send(8, &payload))
            .expect("submit");

        let result = port.dispatch(Duration::from_secs(2)).expect("completion");
        assert!(result.success);
        assert_eq!(result.bytes_transferred as usize, MAX_BUFFER_SIZE);

        use std::io::Read;
        let mut buf = vec![0u8; MAX_BUFFER_SIZE];
        let mut client = client;
        client.read_exact(&mut buf).expect("read");
        assert_eq!(buf, payload);
    }

    #[test]
    fn closing_the_handle_aborts_inflight_recv() {
        let port = init_port();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _client = TcpStream::connect(addr).expect("connect");
        let (server_side, _) = listener.accept().expect("accept");

        let handle = Handle::stream(server_side).expect("handle");
        port.register(&handle, 21).expect("register");
        let ctx = OperationContext::recv(21);
        let ctx_addr = std::ptr::from_ref::<OperationContext>(&*ctx);
        port.submit(&handle, ctx).expect("submit");

        handle.close();
        let result = port.dispatch(Duration::from_secs(2)).expect("completion");
        assert_eq!(result.completion_key, 21);
        assert!(result.is_aborted());
        assert_eq!(result.error_code, OP_ABORTED);
        let returned = result.context.expect("context returned on abort");
        assert_eq!(std::ptr::from_ref::<OperationContext>(&*returned), ctx_addr);
    }

    #[test]
    fn submit_after_handle_close_fails() {
        let port = init_port();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let handle = Handle::listener(listener).expect("handle");
        port.register(&handle, 1).expect("register");
        handle.close();
        let err = port
            .submit(&handle, OperationContext::accept())
            .expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::SubmitFailed);
    }
}
