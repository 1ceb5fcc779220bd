//! Error types for kayak

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Non-monotonic log index: expected {expected}, got {got}")]
    NonMonotonicIndex { expected: u64, got: u64 },

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    // === Config Errors ===
    #[error("Invalid peer set signature")]
    InvalidSignature,

    #[error("Malformed peer set: {0}")]
    MalformedConfig(String),

    #[error("Stale peer set: accepted term {accepted}, got {got}")]
    StaleConfig { accepted: u64, got: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    // === Transport Errors ===
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Remote error: {0}")]
    Remote(String),

    // === 2PC Errors ===
    #[error("Prepare failed for log {index} on {node}: {reason}")]
    PrepareFailed {
        index: u64,
        node: String,
        reason: String,
    },

    #[error("Commit failed for log {index} on {node}: {reason}")]
    CommitFailed {
        index: u64,
        node: String,
        reason: String,
    },

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or stale peer set, bad node configuration. Fatal to startup.
    Config,
    /// Dial/request/accept failures, including cancellation and shutdown.
    Transport,
    /// A peer refused or timed out during prepare. The write was rolled back.
    Prepare,
    /// A peer failed during commit. The cluster may have diverged.
    Commit,
    /// Log or stable store failure.
    Storage,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_)
            | Error::NotFound(_)
            | Error::NonMonotonicIndex { .. }
            | Error::Corrupted(_)
            | Error::Storage(_) => ErrorKind::Storage,
            Error::InvalidSignature
            | Error::MalformedConfig(_)
            | Error::StaleConfig { .. }
            | Error::InvalidConfig(_)
            | Error::NotLeader(_) => ErrorKind::Config,
            Error::Cancelled
            | Error::DeadlineExceeded
            | Error::ShuttingDown
            | Error::ConnectionFailed(_)
            | Error::Codec(_)
            | Error::Remote(_) => ErrorKind::Transport,
            Error::PrepareFailed { .. } => ErrorKind::Prepare,
            Error::CommitFailed { .. } => ErrorKind::Commit,
            Error::Internal(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DeadlineExceeded | Error::ConnectionFailed(_) | Error::PrepareFailed { .. }
        )
    }

    /// Missing key, as opposed to a failing store
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
