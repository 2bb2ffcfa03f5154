//! Error types for Ermes
//!
//! Every variant belongs to one [`ErrorKind`], which tells the caller how
//! to react: report, redirect, fix the request, or retry the whole atomic
//! operation.

use crate::keyspace::KeySpaceError;
use crate::types::SessionIdError;
use thiserror::Error;

/// Common result type for Ermes operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Session or node absent
    NotFound,
    /// The request collides with the current state of the session
    Conflict,
    /// Malformed input (cursor, count, session id)
    InvalidArgument,
    /// Caller-initiated abort of a streaming operation
    Cancelled,
    /// The store or a peer is unavailable; the operation may be retried
    Transient,
    /// Bug or corrupted data
    Internal,
}

/// Common error type for Ermes
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("current node is not set")]
    CurrentNodeNotSet,

    // Lifecycle conflicts
    #[error("session id already exists: {0}")]
    SessionIdAlreadyExists(String),

    #[error("session is offloading: {0}")]
    SessionIsOffloading(String),

    #[error("session is not offloaded: {0}")]
    SessionIsNotOffloaded(String),

    #[error("session is already acquired: {0}")]
    SessionAlreadyAcquired(String),

    #[error("unable to offload acquired session: {0}")]
    UnableToOffloadAcquiredSession(String),

    #[error("session already onloaded: {0}")]
    SessionAlreadyOnloaded(String),

    // Argument errors
    #[error("invalid session id: {0}")]
    InvalidSessionId(#[from] SessionIdError),

    #[error("invalid keyspace access: {0}")]
    KeySpace(#[from] KeySpaceError),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("invalid count: {0}")]
    InvalidCount(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Streaming
    #[error("operation cancelled")]
    Cancelled,

    // Transient errors
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a store unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) | Self::NodeNotFound(_) => ErrorKind::NotFound,
            Self::SessionIdAlreadyExists(_)
            | Self::SessionIsOffloading(_)
            | Self::SessionIsNotOffloaded(_)
            | Self::SessionAlreadyAcquired(_)
            | Self::UnableToOffloadAcquiredSession(_)
            | Self::SessionAlreadyOnloaded(_) => ErrorKind::Conflict,
            Self::InvalidSessionId(_)
            | Self::KeySpace(_)
            | Self::InvalidCursor(_)
            | Self::InvalidCount(_)
            | Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::StoreUnavailable(_) | Self::Transport(_) => ErrorKind::Transient,
            Self::CurrentNodeNotSet
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this is a state conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::store_unavailable("down").is_retryable());
        assert!(Error::transport("reset").is_retryable());
        assert!(!Error::SessionNotFound("s".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert!(Error::SessionNotFound("s".into()).is_not_found());
        assert!(Error::NodeNotFound("n".into()).is_not_found());
        assert!(Error::SessionIdAlreadyExists("s".into()).is_conflict());
        assert!(Error::UnableToOffloadAcquiredSession("s".into()).is_conflict());
        assert_eq!(
            Error::InvalidCursor("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            Error::from(SessionIdError::InvalidLength(3)).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
