//! Error taxonomy for the worker-side core.

use thiserror::Error;

use crate::engine::EngineError;
use crate::storage::StorageError;
use crate::value::MarshalError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse grouping of core errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    Mount,
    State,
    Handle,
    Dispatch,
    Engine,
    Marshal,
    Storage,
    Internal,
}

impl ErrorFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorFamily::Mount => "MountError",
            ErrorFamily::State => "StateError",
            ErrorFamily::Handle => "HandleError",
            ErrorFamily::Dispatch => "DispatchError",
            ErrorFamily::Engine => "EngineError",
            ErrorFamily::Marshal => "MarshalError",
            ErrorFamily::Storage => "StorageError",
            ErrorFamily::Internal => "InternalError",
        }
    }
}

/// Errors raised by the database and statement cores and the dispatcher.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database is already mounted")]
    AlreadyMounted,

    #[error("An encryption key must be set, aborting the mount operation")]
    MissingKey,

    /// The bootstrap statement failed right after opening.
    #[error("Encryption key is most likely invalid, you will either need to wipe the database or use another identifier. Original message: {0}")]
    InvalidEncryptionKey(String),

    #[error("You need to specify a directory to use to store the database")]
    StorageDirRequired,

    #[error("invalid database identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Database is not initialized, call the constructor first")]
    NotInitialized,

    #[error("Database is already closed")]
    AlreadyClosed,

    #[error("Database closed")]
    NotMounted,

    #[error("Database instance needs to be closed first, use close()")]
    StillMounted,

    #[error("Database either does not exist or is already deleted ({0})")]
    DatabaseNotFound(String),

    #[error("unknown statement id {0}")]
    UnknownStatementId(i64),

    #[error("Statement closed")]
    StatementClosed,

    #[error("unknown operation {0:?}")]
    UnknownOperation(String),

    #[error("{0:?} is not allowed from the proxy")]
    OperationNotWhitelisted(String),

    #[error("invalid arguments for {operation}: {reason}")]
    InvalidArguments { operation: String, reason: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Nothing to prepare")]
    NothingToPrepare,

    #[error(transparent)]
    UnknownBindType(#[from] MarshalError),

    #[error(transparent)]
    Storage(StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn invalid_arguments(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Stable name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AlreadyMounted => "AlreadyMounted",
            Self::MissingKey => "MissingKey",
            Self::InvalidEncryptionKey(_) => "InvalidEncryptionKey",
            Self::StorageDirRequired => "StorageDirRequired",
            Self::InvalidIdentifier(_) => "InvalidIdentifier",
            Self::NotInitialized => "NotInitialized",
            Self::AlreadyClosed => "AlreadyClosed",
            Self::NotMounted => "NotMounted",
            Self::StillMounted => "StillMounted",
            Self::DatabaseNotFound(_) => "DatabaseNotFound",
            Self::UnknownStatementId(_) => "UnknownStatementId",
            Self::StatementClosed => "StatementClosed",
            Self::UnknownOperation(_) => "UnknownOperation",
            Self::OperationNotWhitelisted(_) => "OperationNotWhitelisted",
            Self::InvalidArguments { .. } => "InvalidArguments",
            Self::Engine(_) => "EngineError",
            Self::NothingToPrepare => "NothingToPrepare",
            Self::UnknownBindType(_) => "UnknownBindType",
            Self::Storage(_) => "StorageError",
            Self::Internal(_) => "InternalError",
        }
    }

    pub fn family(&self) -> ErrorFamily {
        match self {
            Self::AlreadyMounted
            | Self::MissingKey
            | Self::InvalidEncryptionKey(_)
            | Self::StorageDirRequired
            | Self::InvalidIdentifier(_) => ErrorFamily::Mount,
            Self::NotInitialized
            | Self::AlreadyClosed
            | Self::NotMounted
            | Self::StillMounted
            | Self::DatabaseNotFound(_) => ErrorFamily::State,
            Self::UnknownStatementId(_) | Self::StatementClosed => ErrorFamily::Handle,
            Self::UnknownOperation(_)
            | Self::OperationNotWhitelisted(_)
            | Self::InvalidArguments { .. } => ErrorFamily::Dispatch,
            Self::Engine(_) | Self::NothingToPrepare => ErrorFamily::Engine,
            Self::UnknownBindType(_) => ErrorFamily::Marshal,
            Self::Storage(_) => ErrorFamily::Storage,
            Self::Internal(_) => ErrorFamily::Internal,
        }
    }

    /// Engine status code, when the error came from the engine.
    pub fn engine_code(&self) -> Option<i32> {
        match self {
            Self::Engine(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DirRequired => Self::StorageDirRequired,
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_families() {
        assert_eq!(CoreError::AlreadyMounted.name(), "AlreadyMounted");
        assert_eq!(CoreError::AlreadyMounted.family(), ErrorFamily::Mount);
        assert_eq!(CoreError::StatementClosed.family().as_str(), "HandleError");
        let err = CoreError::OperationNotWhitelisted("__proto__".into());
        assert_eq!(err.family(), ErrorFamily::Dispatch);
        assert_eq!(err.to_string(), "\"__proto__\" is not allowed from the proxy");
    }

    #[test]
    fn test_engine_errors_keep_message_verbatim() {
        let err = CoreError::from(EngineError::new(1, "no such table: nope"));
        assert_eq!(err.to_string(), "no such table: nope");
        assert_eq!(err.engine_code(), Some(1));
        assert_eq!(err.name(), "EngineError");
    }

    #[test]
    fn test_storage_dir_required_maps_to_mount_error() {
        let err = CoreError::from(StorageError::DirRequired);
        assert!(matches!(err, CoreError::StorageDirRequired));
    }
}
