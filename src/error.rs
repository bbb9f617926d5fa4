use crate::types::{DataType, Rank, ReduceOp};

pub type Result<T> = std::result::Result<T, PlexusError>;

/// Errors raised by the process group, its transport and its work items.
///
/// The type is `Clone`: a failure captured inside a work item is re-raised
/// from every `wait()` call, so source errors are folded into the message
/// at construction instead of being carried as non-clonable values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlexusError {
    #[error("{op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("connection to rank {rank} failed: {reason}")]
    ConnectionFailed { rank: Rank, reason: String },

    #[error("peer {rank} disconnected unexpectedly")]
    PeerDisconnected { rank: Rank },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{op} timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("store error: {0}")]
    Store(String),

    #[error("key not found in store: {0}")]
    KeyNotFound(String),

    #[error("message size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("reduce op {op} is not defined for {dtype}")]
    UnsupportedReduce { dtype: DataType, op: ReduceOp },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("device error: {0}")]
    Device(String),
}

impl PlexusError {
    /// Create a validation error attributed to the named operation.
    pub(crate) fn invalid_argument(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    /// Create a `Transport` error with just a message.
    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a `Transport` error from an operation description and a source.
    pub(crate) fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::fmt::Display,
    ) -> Self {
        Self::Transport(format!("{}: {}", msg.into(), source))
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn device_with_source(
        msg: impl Into<String>,
        source: impl std::fmt::Display,
    ) -> Self {
        Self::Device(format!("{}: {}", msg.into(), source))
    }
}
