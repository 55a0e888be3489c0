//! Storage trait definitions for Baton
//!
//! One durable record per workflow id. The record carries a monotonic
//! `revision`; every successful write bumps it by exactly one, and
//! [`WorkflowStore::compare_and_swap`] only succeeds when the caller saw the
//! latest revision. That is the whole concurrency contract the registry needs.
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persisted envelope for one workflow.
///
/// `phase` is duplicated out of `document` so backends can index and filter on
/// it without understanding the document schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredWorkflow {
    /// Stable workflow identifier (derived from the issue number)
    pub workflow_id: String,
    /// Write counter, starts at 1 on insert
    pub revision: u64,
    /// Current phase spelling, e.g. "PLAN"
    pub phase: String,
    /// Full workflow document (history, artifacts, blockers)
    pub document: serde_json::Value,
    /// Time of the last write
    pub updated_at: DateTime<Utc>,
}

impl StoredWorkflow {
    /// Build the next revision of this record with a new phase and document.
    pub fn next(&self, phase: impl Into<String>, document: serde_json::Value) -> Self {
        Self {
            workflow_id: self.workflow_id.clone(),
            revision: self.revision + 1,
            phase: phase.into(),
            document,
            updated_at: Utc::now(),
        }
    }
}

/// Reject ids that cannot be used as file names or record keys.
///
/// Allowed: ASCII alphanumerics plus `-`, `_` and `.`, not starting with `.`,
/// at most 128 characters.
pub fn validate_workflow_id(workflow_id: &str) -> StorageResult<()> {
    let ok = !workflow_id.is_empty()
        && workflow_id.len() <= 128
        && !workflow_id.starts_with('.')
        && workflow_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidWorkflowId {
            workflow_id: workflow_id.to_string(),
        })
    }
}

/// Durable workflow store.
///
/// Guarantees:
/// - A write is durable before the call returns.
/// - `insert` never overwrites: a second insert for the same id fails with
///   `StorageError::AlreadyExists`.
/// - `compare_and_swap` is atomic per record: it fails with
///   `StorageError::RevisionConflict` unless the stored revision equals
///   `expected_revision`, and with `StorageError::NotFound` if absent.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Store a brand-new record.
    async fn insert(&self, record: StoredWorkflow) -> StorageResult<()>;

    /// Load a record, `None` if absent.
    async fn load(&self, workflow_id: &str) -> StorageResult<Option<StoredWorkflow>>;

    /// Replace a record if and only if its stored revision is `expected_revision`.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: StoredWorkflow,
    ) -> StorageResult<()>;

    /// All stored records, ordered by workflow id.
    async fn list(&self) -> StorageResult<Vec<StoredWorkflow>>;
}
