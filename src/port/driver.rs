//! The readiness driver behind the completion port.
//!
//! One thread waits on the OS poller. Each registered handle owns a slot
//! with two operation lanes (read: recv/accept, write: send). When the OS
//! reports readiness, the driver takes the pending context out of its lane,
//! runs the non-blocking call, and either enqueues a completion or puts the
//! context back and re-arms the registration.
//!
//! Lane discipline is single-writer: the issuing thread writes the context,
//! submission hands it to the driver, and the worker that pops the
//! completion has exclusive access afterwards. No locks guard the contexts
//! themselves; the slot table mutex only guards the hand-off points.

use crate::ops::{CompletionResult, OperationContext, OP_FAILED};
use crate::port::{Handle, HandleIo, PortShared};
use polling::{Event, Events};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

/// A registered handle and its pending operations.
pub(crate) struct Slot {
    /// Completion key delivered with every completion for this handle.
    pub(crate) key: u64,
    /// Keeps the socket alive while it is registered with the poller.
    pub(crate) handle: Handle,
    /// Pending recv or accept context.
    pub(crate) read: Option<Box<OperationContext>>,
    /// Pending send context.
    pub(crate) write: Option<Box<OperationContext>>,
}

impl Slot {
    pub(crate) fn new(key: u64, handle: Handle) -> Self {
        Self {
            key,
            handle,
            read: None,
            write: None,
        }
    }

    pub(crate) fn lane_mut(&mut self, lane: Lane) -> &mut Option<Box<OperationContext>> {
        match lane {
            Lane::Read => &mut self.read,
            Lane::Write => &mut self.write,
        }
    }
}

/// Which half of a slot an operation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Read,
    Write,
}

/// Builds the poller interest set for a slot's pending lanes.
pub(crate) fn interest_for(handle_id: u64, read: bool, write: bool) -> Event {
    let key = handle_id as usize;
    match (read, write) {
        (true, true) => Event::all(key),
        (true, false) => Event::readable(key),
        (false, true) => Event::writable(key),
        (false, false) => Event::none(key),
    }
}

fn raw_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(OP_FAILED)
}

/// Driver thread entry point: drain readiness until the port closes.
pub(crate) fn run(shared: &Arc<PortShared>) {
    let mut events = Events::new();
    tracing::debug!("driver thread started");
    while shared.is_open() {
        events.clear();
        match shared.poller.wait(&mut events, None) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "poller wait failed; driver exiting");
                break;
            }
        }
        for event in events.iter() {
            shared.service_slot(event.key as u64, event.readable, event.writable);
        }
    }
    tracing::debug!("driver thread exiting");
}

impl PortShared {
    /// Cancels every pending operation on a handle and frees its slot.
    ///
    /// Contexts found in the lanes complete through dispatch with
    /// `OP_ABORTED`; a context the driver is currently servicing is aborted
    /// by the service path when it observes the closed handle or the missing
    /// slot.
    pub(crate) fn cancel_handle(&self, handle_id: u64) {
        let slot = self.slots.lock().remove(&handle_id);
        let Some(mut slot) = slot else {
            return;
        };
        if let Err(e) = slot.handle.io().poller_delete(&self.poller) {
            tracing::trace!(handle = handle_id, error = %e, "poller delete during cancel");
        }
        let key = slot.key;
        for ctx in [slot.read.take(), slot.write.take()].into_iter().flatten() {
            tracing::debug!(handle = handle_id, key, kind = ?ctx.kind(), "aborting in-flight operation");
            self.push_completion(CompletionResult::aborted(key, ctx));
        }
    }

    fn service_slot(&self, handle_id: u64, readable: bool, writable: bool) {
        let (key, handle, read_op, write_op) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&handle_id) else {
                return;
            };
            (
                slot.key,
                slot.handle.clone(),
                if readable { slot.read.take() } else { None },
                if writable { slot.write.take() } else { None },
            )
        };
        if let Some(ctx) = read_op {
            self.drive_read(handle_id, key, &handle, ctx);
        }
        if let Some(ctx) = write_op {
            self.drive_write(handle_id, key, &handle, ctx);
        }
        self.rearm(handle_id);
    }

    fn drive_read(&self, handle_id: u64, key: u64, handle: &Handle, mut ctx: Box<OperationContext>) {
        if handle.is_closed() {
            self.push_completion(CompletionResult::aborted(key, ctx));
            return;
        }
        match handle.io() {
            HandleIo::Listener(listener) => match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        tracing::warn!(error = %e, "accepted socket could not be made non-blocking");
                    }
                    let local = listener
                        .local_addr()
                        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                    ctx.set_accepted(stream, local, peer);
                    self.push_completion(CompletionResult::success(key, ctx, 0));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.reattach(handle_id, key, Lane::Read, ctx);
                }
                Err(e) => {
                    self.push_completion(CompletionResult::failure(key, ctx, raw_code(&e)));
                }
            },
            HandleIo::Stream(stream) => {
                let mut sock: &TcpStream = stream;
                match sock.read(ctx.data_mut()) {
                    Ok(n) => {
                        self.push_completion(CompletionResult::success(key, ctx, n as u32));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.reattach(handle_id, key, Lane::Read, ctx);
                    }
                    Err(e) => {
                        self.push_completion(CompletionResult::failure(key, ctx, raw_code(&e)));
                    }
                }
            }
        }
    }

    fn drive_write(
        &self,
        handle_id: u64,
        key: u64,
        handle: &Handle,
        mut ctx: Box<OperationContext>,
    ) {
        if handle.is_closed() {
            self.push_completion(CompletionResult::aborted(key, ctx));
            return;
        }
        let HandleIo::Stream(stream) = handle.io() else {
            self.push_completion(CompletionResult::failure(key, ctx, OP_FAILED));
            return;
        };
        let mut sock: &TcpStream = stream;
        // A send completes only once the whole payload has been handed to
        // the socket, preserving per-session FIFO byte order.
        loop {
            let pending = ctx.pending_payload();
            if pending.is_empty() {
                let total = ctx.payload_len() as u32;
                self.push_completion(CompletionResult::success(key, ctx, total));
                return;
            }
            match sock.write(pending) {
                Ok(0) => {
                    let err = io::Error::from(io::ErrorKind::WriteZero);
                    self.push_completion(CompletionResult::failure(key, ctx, raw_code(&err)));
                    return;
                }
                Ok(n) => {
                    ctx.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.reattach(handle_id, key, Lane::Write, ctx);
                    return;
                }
                Err(e) => {
                    self.push_completion(CompletionResult::failure(key, ctx, raw_code(&e)));
                    return;
                }
            }
        }
    }

    /// Puts a still-pending context back into its lane. If the slot has been
    /// cancelled in the meantime, the context completes as aborted instead.
    fn reattach(&self, handle_id: u64, key: u64, lane: Lane, ctx: Box<OperationContext>) {
        let mut slots = self.slots.lock();
        match slots.get_mut(&handle_id) {
            Some(slot) => {
                debug_assert!(slot.lane_mut(lane).is_none(), "lane refilled while serviced");
                *slot.lane_mut(lane) = Some(ctx);
            }
            None => {
                drop(slots);
                self.push_completion(CompletionResult::aborted(key, ctx));
            }
        }
    }

    /// Re-arms the poller registration to match the slot's pending lanes.
    fn rearm(&self, handle_id: u64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&handle_id) else {
            return;
        };
        let read = slot.read.is_some();
        let write = slot.write.is_some();
        if !read && !write {
            return;
        }
        let interest = interest_for(handle_id, read, write);
        if let Err(e) = slot.handle.io().poller_modify(&self.poller, interest) {
            tracing::warn!(handle = handle_id, error = %e, "re-arm failed; failing pending operations");
            let key = slot.key;
            for ctx in [slot.read.take(), slot.write.take()].into_iter().flatten() {
                self.push_completion(CompletionResult::failure(key, ctx, raw_code(&e)));
            }
        }
    }
}
