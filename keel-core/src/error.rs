//! Error taxonomy shared by the storage and state-machine seams.
//!
//! Transport and protocol rejections are expressed as state updates inside
//! the consensus core and never surface through this type; only persistence
//! and invariant failures propagate.

use std::fmt;

/// The result type for fallible keel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the storage and state-machine seams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A durable-storage operation failed. Fatal to the leader role.
    Storage(StorageErrorKind),

    /// A network operation failed.
    Network(NetworkErrorKind),

    /// An operation did not complete within its wait bound.
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// How long we waited, in milliseconds.
        waited_ms: u64,
    },

    /// A resource limit was exceeded.
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The observed value.
        actual: u64,
    },

    /// An invalid argument was provided.
    InvalidArgument {
        /// The argument name.
        name: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The requested resource does not exist.
    NotFound {
        /// The resource kind.
        resource: &'static str,
        /// An identifier for the resource.
        id: u64,
    },

    /// The operation is not permitted in the current state.
    InvalidState {
        /// The current state.
        current: &'static str,
        /// The state the operation requires.
        required: &'static str,
    },
}

/// Kinds of storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The storage device is full.
    DeviceFull,
    /// Data corruption was detected.
    Corruption,
    /// An I/O error occurred.
    Io,
    /// The file or directory does not exist.
    NotFound,
}

/// Kinds of network errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused by the peer.
    ConnectionRefused,
    /// Connection reset by the peer.
    ConnectionReset,
    /// The operation timed out.
    TimedOut,
    /// The address is not reachable.
    Unreachable,
    /// The message exceeded the frame limit.
    MessageTooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(kind) => write!(f, "storage error: {kind:?}"),
            Self::Network(kind) => write!(f, "network error: {kind:?}"),
            Self::Timeout {
                operation,
                waited_ms,
            } => write!(f, "timeout: {operation} after {waited_ms}ms"),
            Self::LimitExceeded { limit, max, actual } => {
                write!(f, "limit exceeded: {limit} (max={max}, actual={actual})")
            }
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{name}': {reason}")
            }
            Self::NotFound { resource, id } => write!(f, "{resource} not found: {id}"),
            Self::InvalidState { current, required } => {
                write!(f, "invalid state: in {current}, need {required}")
            }
        }
    }
}

impl std::error::Error for Error {}
