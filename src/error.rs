//! Error types for the completion-port engine.
//!
//! Error handling follows two tiers:
//!
//! - Startup and misuse faults (double init, failed bind, failed
//!   registration) are returned as [`Error`] values from the offending call
//!   and never change component state.
//! - In-flight I/O failures are not `Error`s at all: they travel inside
//!   [`CompletionResult`](crate::ops::CompletionResult) as `success = false`
//!   plus a raw error code, and are handled by whichever component owns the
//!   completed context.
//!
//! Nothing in the engine terminates the process on error.

use core::fmt;
use std::sync::Arc;

/// The kind of engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Lifecycle misuse ===
    /// The completion port is already initialized.
    AlreadyInitialized,
    /// The completion port has not been initialized (or has been closed).
    NotInitialized,
    /// The component is already running / already listening.
    AlreadyRunning,

    // === Startup faults ===
    /// Building the completion port's internals failed.
    InitFailed,
    /// Creating a socket failed.
    SocketCreateFailed,
    /// Binding the listening socket failed.
    BindFailed,
    /// `listen()` on the bound socket failed.
    ListenFailed,
    /// Associating a socket with the completion port failed.
    RegisterFailed,

    // === Submission faults ===
    /// Issuing an overlapped operation failed.
    SubmitFailed,
    /// An operation of the same lane (read or write) is already in flight
    /// on this handle.
    SlotBusy,
    /// The session is closing or closed and accepts no further work.
    SessionClosed,
}

impl ErrorKind {
    /// Short static description of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyInitialized => "already initialized",
            Self::NotInitialized => "not initialized",
            Self::AlreadyRunning => "already running",
            Self::InitFailed => "initialization failed",
            Self::SocketCreateFailed => "socket creation failed",
            Self::BindFailed => "bind failed",
            Self::ListenFailed => "listen failed",
            Self::RegisterFailed => "registration failed",
            Self::SubmitFailed => "submit failed",
            Self::SlotBusy => "operation already outstanding on this lane",
            Self::SessionClosed => "session closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The engine error type.
///
/// Carries a kind, optional context text, and an optional source error.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns true if this error is a caller-misuse fault that left state
    /// unchanged.
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::AlreadyInitialized
                | ErrorKind::NotInitialized
                | ErrorKind::AlreadyRunning
                | ErrorKind::SlotBusy
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
