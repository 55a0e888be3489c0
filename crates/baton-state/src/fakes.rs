//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryWorkflowStore`, which satisfies the `WorkflowStore`
//! contract without any external dependencies, plus a switch for simulating
//! a storage outage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory workflow store backed by a `BTreeMap<workflow_id, StoredWorkflow>`.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    records: Mutex<BTreeMap<String, StoredWorkflow>>,
    fail_writes: AtomicBool,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StorageError::Backend`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, StoredWorkflow>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("simulated write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert(&self, record: StoredWorkflow) -> StorageResult<()> {
        validate_workflow_id(&record.workflow_id)?;
        self.check_writable()?;
        let mut records = self.records();
        if records.contains_key(&record.workflow_id) {
            return Err(StorageError::AlreadyExists {
                workflow_id: record.workflow_id,
            });
        }
        records.insert(record.workflow_id.clone(), record);
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> StorageResult<Option<StoredWorkflow>> {
        Ok(self.records().get(workflow_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: StoredWorkflow,
    ) -> StorageResult<()> {
        self.check_writable()?;
        let mut records = self.records();
        let current = records
            .get(&record.workflow_id)
            .ok_or_else(|| StorageError::NotFound {
                workflow_id: record.workflow_id.clone(),
            })?;
        if current.revision != expected_revision {
            return Err(StorageError::RevisionConflict {
                workflow_id: record.workflow_id.clone(),
                expected: expected_revision,
                actual: current.revision,
            });
        }
        records.insert(record.workflow_id.clone(), record);
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<StoredWorkflow>> {
        Ok(self.records().values().cloned().collect())
    }
}
