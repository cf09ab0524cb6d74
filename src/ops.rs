//! Operation contexts and completion records.
//!
//! Every asynchronous operation is described by an [`OperationContext`]: a
//! heap allocation that is *loaned to the engine* while the operation is in
//! flight and returned, at the same address, inside exactly one
//! [`CompletionResult`]. Ownership transfer is expressed with
//! `Box<OperationContext>` moves, which is what makes the loan discipline
//! checkable: the issuer gives the box up at submit time and gets it back
//! from `dispatch`, and nothing else can free or move the allocation in
//! between.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};

/// Capacity of the recv/send data buffer carried by an [`OperationContext`].
pub const MAX_BUFFER_SIZE: usize = 1024;

/// Size of one endpoint-address slot in the accept buffer.
///
/// Matches the completion-port accept convention of an IPv4 sockaddr plus
/// 16 bytes of padding per endpoint.
pub const ADDR_SLOT_LEN: usize = 16 + 16;

/// Size of the accept address buffer: two endpoint slots, local then remote.
pub const ACCEPT_ADDR_BUF_LEN: usize = 2 * ADDR_SLOT_LEN;

/// Reserved completion key signalling a worker thread to exit.
pub const SHUTDOWN_KEY: u64 = u64::MAX;

/// Error code reported for operations cancelled by closing their handle.
///
/// Real OS error codes are positive, so the sentinel cannot collide.
pub const OP_ABORTED: i32 = -1;

/// Fallback error code when the OS did not supply one.
pub(crate) const OP_FAILED: i32 = -2;

/// The kind of asynchronous operation a context describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// An overlapped receive on a connected socket.
    Recv,
    /// An overlapped send on a connected socket.
    Send,
    /// An overlapped accept on a listening socket.
    Accept,
    /// A disconnect notification. No component issues this kind; it exists
    /// so synthetic completions can carry it.
    Disconnect,
}

/// Non-owning back-reference to the entity that observes a completion.
///
/// The dispatcher resolves `Session` ids through the session registry; the
/// reference is an identifier, never a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerRef {
    /// No owner (synthetic contexts).
    None,
    /// The acceptor owns this context.
    Acceptor,
    /// The session with this id owns this context.
    Session(u64),
}

/// Operation-specific scratch space.
#[derive(Debug)]
enum Scratch {
    /// Accept: fixed address buffer (local slot then remote slot) and the
    /// accepted socket, populated by the engine on completion.
    Accept {
        addr_buf: [u8; ACCEPT_ADDR_BUF_LEN],
        accepted: Option<TcpStream>,
    },
    /// Recv/Send/Disconnect: a byte region of capacity [`MAX_BUFFER_SIZE`].
    /// `len` is the number of valid bytes (send payload length), `sent` the
    /// transmit progress cursor.
    Data {
        data: Box<[u8; MAX_BUFFER_SIZE]>,
        len: usize,
        sent: usize,
    },
}

/// Extended completion record for one outstanding I/O operation.
///
/// While the operation is in flight the context's memory must not be freed,
/// reused, or moved; the engine enforces this by taking ownership of the
/// `Box` at submit time and handing it back inside the completion.
#[derive(Debug)]
pub struct OperationContext {
    kind: OperationKind,
    session_id: u64,
    owner: OwnerRef,
    scratch: Scratch,
}

impl OperationContext {
    /// Creates a receive context owned by the given session.
    #[must_use]
    pub fn recv(session_id: u64) -> Box<Self> {
        Box::new(Self {
            kind: OperationKind::Recv,
            session_id,
            owner: OwnerRef::Session(session_id),
            scratch: Scratch::Data {
                data: Box::new([0u8; MAX_BUFFER_SIZE]),
                len: 0,
                sent: 0,
            },
        })
    }

    /// Creates a send context carrying a copy of `payload`.
    ///
    /// # Panics
    ///
    /// Panics if `payload` exceeds [`MAX_BUFFER_SIZE`]; callers chunk larger
    /// messages.
    #[must_use]
    pub fn send(session_id: u64, payload: &[u8]) -> Box<Self> {
        assert!(
            payload.len() <= MAX_BUFFER_SIZE,
            "send payload exceeds MAX_BUFFER_SIZE"
        );
        let mut data = Box::new([0u8; MAX_BUFFER_SIZE]);
        data[..payload.len()].copy_from_slice(payload);
        Box::new(Self {
            kind: OperationKind::Send,
            session_id,
            owner: OwnerRef::Session(session_id),
            scratch: Scratch::Data {
                data,
                len: payload.len(),
                sent: 0,
            },
        })
    }

    /// Creates an accept context owned by the acceptor.
    #[must_use]
    pub fn accept() -> Box<Self> {
        Box::new(Self {
            kind: OperationKind::Accept,
            session_id: 0,
            owner: OwnerRef::Acceptor,
            scratch: Scratch::Accept {
                addr_buf: [0u8; ACCEPT_ADDR_BUF_LEN],
                accepted: None,
            },
        })
    }

    /// Creates a disconnect context for the given session.
    #[must_use]
    pub fn disconnect(session_id: u64) -> Box<Self> {
        Box::new(Self {
            kind: OperationKind::Disconnect,
            session_id,
            owner: OwnerRef::Session(session_id),
            scratch: Scratch::Data {
                data: Box::new([0u8; MAX_BUFFER_SIZE]),
                len: 0,
                sent: 0,
            },
        })
    }

    /// Returns the operation kind.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Returns the owning session id (0 = none).
    #[must_use]
    pub const fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Returns the owner back-reference.
    #[must_use]
    pub const fn owner(&self) -> OwnerRef {
        self.owner
    }

    /// Resets a recv context for reissue: clears progress and rebinds the
    /// owning session id.
    pub fn reset_for_recv(&mut self, session_id: u64) {
        self.kind = OperationKind::Recv;
        self.session_id = session_id;
        self.owner = OwnerRef::Session(session_id);
        if let Scratch::Data { len, sent, .. } = &mut self.scratch {
            *len = 0;
            *sent = 0;
        }
    }

    /// Returns the first `n` valid bytes of the data buffer.
    ///
    /// # Panics
    ///
    /// Panics if the context is an accept context or `n` exceeds the buffer.
    #[must_use]
    pub fn data(&self, n: usize) -> &[u8] {
        match &self.scratch {
            Scratch::Data { data, .. } => &data[..n],
            Scratch::Accept { .. } => panic!("accept contexts carry no data buffer"),
        }
    }

    /// Mutable access to the full data buffer, for the engine's recv path.
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.scratch {
            Scratch::Data { data, .. } => &mut data[..],
            Scratch::Accept { .. } => panic!("accept contexts carry no data buffer"),
        }
    }

    /// The untransmitted tail of a send payload.
    pub(crate) fn pending_payload(&self) -> &[u8] {
        match &self.scratch {
            Scratch::Data { data, len, sent } => &data[*sent..*len],
            Scratch::Accept { .. } => &[],
        }
    }

    /// Advances the send progress cursor; returns true when fully sent.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        match &mut self.scratch {
            Scratch::Data { len, sent, .. } => {
                *sent = (*sent + n).min(*len);
                *sent == *len
            }
            Scratch::Accept { .. } => true,
        }
    }

    /// Total payload length of a send context.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match &self.scratch {
            Scratch::Data { len, .. } => *len,
            Scratch::Accept { .. } => 0,
        }
    }

    /// Stores the accepted socket and encodes the endpoint addresses into
    /// the accept buffer (local slot first, remote second).
    pub(crate) fn set_accepted(&mut self, stream: TcpStream, local: SocketAddr, peer: SocketAddr) {
        if let Scratch::Accept { addr_buf, accepted } = &mut self.scratch {
            encode_addr(&mut addr_buf[..ADDR_SLOT_LEN], local);
            encode_addr(&mut addr_buf[ADDR_SLOT_LEN..], peer);
            *accepted = Some(stream);
        }
    }

    /// Takes the accepted socket out of the context, leaving the slot empty
    /// so dropping the context does not close the socket.
    #[must_use]
    pub fn take_accepted(&mut self) -> Option<TcpStream> {
        match &mut self.scratch {
            Scratch::Accept { accepted, .. } => accepted.take(),
            Scratch::Data { .. } => None,
        }
    }

    /// Decodes the (local, remote) endpoint pair from the accept buffer.
    #[must_use]
    pub fn accepted_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        match &self.scratch {
            Scratch::Accept { addr_buf, .. } => {
                let local = decode_addr(&addr_buf[..ADDR_SLOT_LEN])?;
                let remote = decode_addr(&addr_buf[ADDR_SLOT_LEN..])?;
                Some((local, remote))
            }
            Scratch::Data { .. } => None,
        }
    }
}

// Address slot layout: [0] family tag (4 or 6), [1] reserved, [2..4] port in
// network byte order, [4..] address octets. A zero family tag means empty.
fn encode_addr(slot: &mut [u8], addr: SocketAddr) {
    slot.fill(0);
    slot[2..4].copy_from_slice(&addr.port().to_be_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => {
            slot[0] = 4;
            slot[4..8].copy_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            slot[0] = 6;
            slot[4..20].copy_from_slice(&ip.octets());
        }
    }
}

fn decode_addr(slot: &[u8]) -> Option<SocketAddr> {
    let port = u16::from_be_bytes([slot[2], slot[3]]);
    match slot[0] {
        4 => {
            let octets: [u8; 4] = slot[4..8].try_into().ok()?;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        6 => {
            let octets: [u8; 16] = slot[4..20].try_into().ok()?;
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// One completion delivered by [`dispatch`](crate::port::PortHandle::dispatch).
///
/// Even failed operations produce a result (`success = false`) as long as
/// their context was recovered; only a timeout yields no result at all.
#[derive(Debug)]
pub struct CompletionResult {
    /// The key supplied when the handle was registered, or the caller-chosen
    /// key of a synthetic completion.
    pub completion_key: u64,
    /// The context loaned at submit time, returned to the consumer.
    /// `None` only for synthetic completions posted without a context.
    pub context: Option<Box<OperationContext>>,
    /// Bytes transferred by the operation.
    pub bytes_transferred: u32,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Raw error code; 0 on success, [`OP_ABORTED`] on cancellation.
    pub error_code: i32,
}

impl CompletionResult {
    /// A synthetic completion: zero bytes, success.
    #[must_use]
    pub fn synthetic(completion_key: u64, context: Option<Box<OperationContext>>) -> Self {
        Self {
            completion_key,
            context,
            bytes_transferred: 0,
            success: true,
            error_code: 0,
        }
    }

    /// A successful completion with a byte count.
    pub(crate) fn success(completion_key: u64, context: Box<OperationContext>, bytes: u32) -> Self {
        Self {
            completion_key,
            context: Some(context),
            bytes_transferred: bytes,
            success: true,
            error_code: 0,
        }
    }

    /// A failed completion carrying an error code.
    pub(crate) fn failure(completion_key: u64, context: Box<OperationContext>, code: i32) -> Self {
        Self {
            completion_key,
            context: Some(context),
            bytes_transferred: 0,
            success: false,
            error_code: code,
        }
    }

    /// A completion for an operation cancelled by closing its handle.
    pub(crate) fn aborted(completion_key: u64, context: Box<OperationContext>) -> Self {
        Self::failure(completion_key, context, OP_ABORTED)
    }

    /// Returns true if this completion reports a cancelled operation.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        !self.success && self.error_code == OP_ABORTED
    }
}
