//! Error types for baton-state

use thiserror::Error;

/// Errors that can occur in the workflow persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// A record with this id is already stored
    #[error("workflow already exists: {workflow_id}")]
    AlreadyExists { workflow_id: String },

    /// No record with this id
    #[error("workflow not found: {workflow_id}")]
    NotFound { workflow_id: String },

    /// Compare-and-swap lost: the stored revision moved on
    #[error("revision conflict on {workflow_id}: expected {expected}, found {actual}")]
    RevisionConflict {
        workflow_id: String,
        expected: u64,
        actual: u64,
    },

    /// Id cannot be used as a storage key
    #[error("invalid workflow id: {workflow_id:?}")]
    InvalidWorkflowId { workflow_id: String },

    /// Database connection error
    #[error("database connection failed: {0}")]
    Connection(String),

    /// Backend query or driver error
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
