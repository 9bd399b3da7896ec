use thiserror::Error;

use crate::types::VirtanceEvent;

#[derive(Error, Debug)]
pub enum VirtanceError {
    #[error("Storage error: {0}")]
    StorageError(#[from] redb::Error),

    #[error("Storage transaction error: {0}")]
    StorageTransactionError(String),

    #[error("Storage table error: {0}")]
    StorageTableError(String),

    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Virtance {virtance_id} is busy with {in_flight}")]
    Busy {
        virtance_id: u64,
        in_flight: VirtanceEvent,
    },

    #[error("Password hashing failed: {message}")]
    PasswordHash { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type VirtanceResult<T> = std::result::Result<T, VirtanceError>;

impl From<redb::TransactionError> for VirtanceError {
    fn from(err: redb::TransactionError) -> Self {
        VirtanceError::StorageTransactionError(err.to_string())
    }
}

impl From<redb::TableError> for VirtanceError {
    fn from(err: redb::TableError) -> Self {
        VirtanceError::StorageTableError(err.to_string())
    }
}

impl From<redb::StorageError> for VirtanceError {
    fn from(err: redb::StorageError) -> Self {
        VirtanceError::StorageError(err.into())
    }
}

impl From<redb::DatabaseError> for VirtanceError {
    fn from(err: redb::DatabaseError) -> Self {
        VirtanceError::StorageError(err.into())
    }
}

impl From<redb::CommitError> for VirtanceError {
    fn from(err: redb::CommitError) -> Self {
        VirtanceError::StorageError(err.into())
    }
}

impl VirtanceError {
    /// Whether this error is a uniqueness violation raised by the storage layer
    pub fn is_conflict(&self) -> bool {
        matches!(self, VirtanceError::AlreadyExists { .. })
    }
}
