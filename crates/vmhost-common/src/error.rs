//! Error types for vmhost.
//!
//! This module defines the error taxonomy shared by every crate:
//! - [`ErrorCode`]: Stable integer codes surfaced to embedding hosts
//! - [`VmError`]: Structured VM lifecycle and execution errors
//! - [`ProtocolError`]: Wire framing violations on the command channel
//! - [`LoggingError`]: Failures while setting up output capture
//! - [`ErrorSlot`]: Per-instance "last error" storage

use std::fmt;
use std::io;

use parking_lot::Mutex;
use thiserror::Error;

/// Stable error codes.
///
/// The numeric values are part of the host-facing contract: start failures
/// are reported as these negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error.
    Ok = 0,
    /// A required parameter was missing or malformed.
    InvalidParam = -1,
    /// The command channel could not be allocated.
    ChannelCreation = -2,
    /// A worker, dispatcher or logger thread could not be spawned.
    ThreadCreation = -3,
    /// Output capture could not be set up.
    Logging = -4,
    /// The execution engine failed to initialize.
    RuntimeInit = -5,
    /// The execution engine failed while running.
    RuntimeExec = -6,
    /// An operation timed out.
    Timeout = -7,
    /// The VM has already been started.
    AlreadyStarted = -8,
    /// The peer sent a malformed frame or closed the channel mid round trip.
    ProtocolViolation = -9,
    /// A buffer could not be grown.
    Allocation = -10,
    /// The installation directory could not be materialized.
    InstallFailed = -11,
}

impl ErrorCode {
    /// Human-readable description of the code.
    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::InvalidParam => "Invalid parameter",
            Self::ChannelCreation => "Failed to create communication channel",
            Self::ThreadCreation => "Failed to create thread",
            Self::Logging => "Logging system error",
            Self::RuntimeInit => "Runtime initialization failed",
            Self::RuntimeExec => "Runtime execution failed",
            Self::Timeout => "Operation timed out",
            Self::AlreadyStarted => "VM already started",
            Self::ProtocolViolation => "Protocol violation on command channel",
            Self::Allocation => "Memory allocation failed",
            Self::InstallFailed => "Installation failed",
        }
    }

    /// The integer value of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// VM lifecycle and execution errors.
#[derive(Error, Debug)]
pub enum VmError {
    /// A parameter was missing or malformed.
    #[error("Invalid parameter: {reason}")]
    InvalidParam {
        /// Description of the invalid parameter.
        reason: String,
    },

    /// The command channel could not be allocated.
    #[error("Failed to create communication channel: {source}")]
    ChannelCreation {
        #[source]
        source: io::Error,
    },

    /// A thread could not be spawned.
    #[error("Failed to create {role} thread: {source}")]
    ThreadCreation {
        /// Which thread failed to spawn.
        role: &'static str,
        #[source]
        source: io::Error,
    },

    /// The VM was started twice.
    #[error("VM is already started")]
    AlreadyStarted,

    /// Output capture failed.
    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    /// The execution engine failed to come up.
    #[error("Runtime initialization failed: {reason}")]
    RuntimeInit {
        /// Description of the initialization failure.
        reason: String,
    },

    /// The execution engine failed while running a script.
    #[error("Runtime execution failed: {reason}")]
    RuntimeExec {
        /// Description of the execution failure.
        reason: String,
    },

    /// The command channel carried a malformed frame.
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The installation step failed before the engine could start.
    #[error("Installation failed for '{path}': {source}")]
    InstallFailed {
        /// Directory that could not be materialized.
        path: String,
        #[source]
        source: io::Error,
    },
}

impl VmError {
    /// Create a new `InvalidParam` error.
    pub fn invalid_param(reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            reason: reason.into(),
        }
    }

    /// Create a new `RuntimeInit` error.
    pub fn runtime_init(reason: impl Into<String>) -> Self {
        Self::RuntimeInit {
            reason: reason.into(),
        }
    }

    /// Create a new `RuntimeExec` error.
    pub fn runtime_exec(reason: impl Into<String>) -> Self {
        Self::RuntimeExec {
            reason: reason.into(),
        }
    }

    /// Create a new `ThreadCreation` error.
    pub fn thread_creation(role: &'static str, source: io::Error) -> Self {
        Self::ThreadCreation { role, source }
    }

    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParam { .. } => ErrorCode::InvalidParam,
            Self::ChannelCreation { .. } => ErrorCode::ChannelCreation,
            Self::ThreadCreation { .. } => ErrorCode::ThreadCreation,
            Self::AlreadyStarted => ErrorCode::AlreadyStarted,
            Self::Logging(LoggingError::Allocation { .. }) => ErrorCode::Allocation,
            Self::Logging(_) => ErrorCode::Logging,
            Self::RuntimeInit { .. } => ErrorCode::RuntimeInit,
            Self::RuntimeExec { .. } => ErrorCode::RuntimeExec,
            Self::Protocol(_) => ErrorCode::ProtocolViolation,
            Self::InstallFailed { .. } => ErrorCode::InstallFailed,
        }
    }
}

/// Wire framing violations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The peer closed the channel before a full frame was exchanged.
    #[error("channel closed by peer")]
    Closed,

    /// The response did not have the `<digit>\n` shape.
    #[error("malformed response: expected 2 bytes '<digit>\\n', got {got:?}")]
    MalformedResponse {
        /// The bytes actually received.
        got: Vec<u8>,
    },

    /// The request length line was not a positive decimal within limits.
    #[error("invalid length prefix: {line:?}")]
    InvalidLength {
        /// The offending length line.
        line: String,
    },

    /// The declared body exceeds the accepted size. The body was consumed.
    #[error("request of {len} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Declared length.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Fewer body bytes arrived than the length prefix declared.
    #[error("truncated request body: expected {expected} bytes, got {got}")]
    Truncated {
        /// Declared length.
        expected: usize,
        /// Bytes actually read.
        got: usize,
    },

    /// The underlying read or write failed.
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Output capture setup errors.
#[derive(Error, Debug)]
pub enum LoggingError {
    /// Output capture is already running.
    #[error("logging thread already running")]
    AlreadyRunning,

    /// A socket pair for a stream could not be created.
    #[error("socketpair() failed for {stream}: {source}")]
    Channel {
        /// Stream name.
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    /// A standard descriptor could not be duplicated or replaced.
    #[error("descriptor redirection failed for {stream}: {reason}")]
    Redirect {
        /// Stream name.
        stream: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// The logging thread could not be spawned.
    #[error("failed to create logging thread: {0}")]
    Thread(#[source] io::Error),

    /// A line buffer could not be grown.
    #[error("buffer allocation of {requested} bytes failed")]
    Allocation {
        /// Requested capacity in bytes.
        requested: usize,
    },
}

/// A recorded error: code plus detailed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code.
    pub code: ErrorCode,
    /// Detailed message.
    pub message: String,
}

impl ErrorInfo {
    /// The detailed message, or the code's description if it is empty.
    pub fn message(&self) -> &str {
        if self.message.is_empty() {
            self.code.description()
        } else {
            &self.message
        }
    }
}

impl From<&VmError> for ErrorInfo {
    fn from(err: &VmError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Thread-safe "last error" storage for a VM instance.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    inner: Mutex<Option<ErrorInfo>>,
}

impl ErrorSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, replacing any previous one.
    pub fn set(&self, err: &VmError) {
        *self.inner.lock() = Some(ErrorInfo::from(err));
    }

    /// Clear the slot.
    pub fn clear(&self) {
        *self.inner.lock() = None;
    }

    /// The last recorded error.
    pub fn get(&self) -> Option<ErrorInfo> {
        self.inner.lock().clone()
    }

    /// The code of the last error, [`ErrorCode::Ok`] when empty.
    pub fn code(&self) -> ErrorCode {
        self.inner.lock().as_ref().map_or(ErrorCode::Ok, |e| e.code)
    }
}
