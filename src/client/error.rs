//! Client-side error types.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::SettingsError;
use crate::worker::protocol::ErrorDescriptor;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Failures of the channel between caller and worker.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The reply channel closed before a reply arrived.
    #[error("reply channel closed before a reply arrived")]
    ReplyChannelUnavailable,

    /// The worker is gone.
    #[error("worker exited")]
    WorkerExited,

    /// No reply within the configured deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to spawn the worker process.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Failed to write to the worker.
    #[error("failed to write to worker: {0}")]
    WriteFailed(#[source] io::Error),

    /// Failed to encode a call.
    #[error("failed to serialize call: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Remote error names callers commonly match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyMounted,
    MissingKey,
    InvalidEncryptionKey,
    StorageDirRequired,
    InvalidIdentifier,
    NotInitialized,
    AlreadyClosed,
    NotMounted,
    StillMounted,
    DatabaseNotFound,
    UnknownStatementId,
    StatementClosed,
    UnknownOperation,
    OperationNotWhitelisted,
    InvalidArguments,
    Engine,
    NothingToPrepare,
    UnknownBindType,
    Storage,
    Internal,
    /// A name this client does not know.
    Other,
}

impl ErrorKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "AlreadyMounted" => Self::AlreadyMounted,
            "MissingKey" => Self::MissingKey,
            "InvalidEncryptionKey" => Self::InvalidEncryptionKey,
            "StorageDirRequired" => Self::StorageDirRequired,
            "InvalidIdentifier" => Self::InvalidIdentifier,
            "NotInitialized" => Self::NotInitialized,
            "AlreadyClosed" => Self::AlreadyClosed,
            "NotMounted" => Self::NotMounted,
            "StillMounted" => Self::StillMounted,
            "DatabaseNotFound" => Self::DatabaseNotFound,
            "UnknownStatementId" => Self::UnknownStatementId,
            "StatementClosed" => Self::StatementClosed,
            "UnknownOperation" => Self::UnknownOperation,
            "OperationNotWhitelisted" => Self::OperationNotWhitelisted,
            "InvalidArguments" => Self::InvalidArguments,
            "EngineError" => Self::Engine,
            "NothingToPrepare" => Self::NothingToPrepare,
            "UnknownBindType" => Self::UnknownBindType,
            "StorageError" => Self::Storage,
            "InternalError" => Self::Internal,
            _ => Self::Other,
        }
    }

    /// Whether the error is a rejected call rather than a failed one.
    pub fn is_dispatch(self) -> bool {
        matches!(
            self,
            Self::UnknownOperation | Self::OperationNotWhitelisted | Self::InvalidArguments
        )
    }
}

/// An error raised inside the worker, rebuilt on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_name(&self.name)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<ErrorDescriptor> for RemoteError {
    fn from(e: ErrorDescriptor) -> Self {
        Self {
            name: e.name,
            message: e.message,
            stack: e.stack,
        }
    }
}

/// Errors returned by [`super::Database`] and [`super::Statement`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Settings(#[from] SettingsError),

    /// The worker replied with an output of the wrong shape.
    #[error("unexpected output from {operation}: {source}")]
    Decode {
        operation: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    /// Kind of the remote error, if this is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(e) => Some(e.kind()),
            _ => None,
        }
    }

    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_keeps_descriptor() {
        let err = RemoteError::from(ErrorDescriptor {
            name: "AlreadyMounted".into(),
            message: "Database is already mounted".into(),
            stack: Some("trace".into()),
        });
        assert_eq!(err.kind(), ErrorKind::AlreadyMounted);
        assert_eq!(err.to_string(), "AlreadyMounted: Database is already mounted");
        assert_eq!(err.stack.as_deref(), Some("trace"));

        let client = ClientError::from(err);
        assert_eq!(client.kind(), Some(ErrorKind::AlreadyMounted));
    }

    #[test]
    fn test_unknown_names_map_to_other() {
        assert_eq!(ErrorKind::from_name("TypeError"), ErrorKind::Other);
        assert!(ErrorKind::from_name("UnknownOperation").is_dispatch());
    }
}
