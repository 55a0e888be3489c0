//! Filesystem workflow store: one JSON document per workflow, replaced by
//! atomic rename under a per-workflow advisory lock.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{validate_workflow_id, StorageResult, StoredWorkflow, WorkflowStore};

/// Filesystem-backed workflow store.
///
/// Layout: `<root>/workflows/<workflow_id>.json`, one pretty-printed JSON
/// document per workflow. Writes go to a temp file in the same directory,
/// are fsynced, then atomically renamed over the target, so a crash never
/// leaves a half-written record behind.
///
/// Read-check-write runs under an exclusive lock on
/// `<root>/locks/<workflow_id>.lock`, so separate processes sharing the
/// directory see each other's revisions.
pub struct FsWorkflowStore {
    workflows_dir: PathBuf,
    locks_dir: PathBuf,
}

impl FsWorkflowStore {
    /// Open a store rooted at `root`. Creates `root/workflows/` if needed.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let workflows_dir = root.as_ref().join("workflows");
        let locks_dir = root.as_ref().join("locks");
        fs::create_dir_all(&workflows_dir)?;
        fs::create_dir_all(&locks_dir)?;
        Ok(Self {
            workflows_dir,
            locks_dir,
        })
    }

    /// Block until this handle holds the workflow's lock. Released on drop.
    fn lock(&self, workflow_id: &str) -> StorageResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.locks_dir.join(format!("{workflow_id}.lock")))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn record_path(&self, workflow_id: &str) -> PathBuf {
        self.workflows_dir.join(format!("{workflow_id}.json"))
    }

    fn read_record(&self, workflow_id: &str) -> StorageResult<Option<StoredWorkflow>> {
        let path = self.record_path(workflow_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn stage(&self, record: &StoredWorkflow) -> StorageResult<NamedTempFile> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let mut tmp = NamedTempFile::new_in(&self.workflows_dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

#[async_trait]
impl WorkflowStore for FsWorkflowStore {
    async fn insert(&self, record: StoredWorkflow) -> StorageResult<()> {
        validate_workflow_id(&record.workflow_id)?;
        let path = self.record_path(&record.workflow_id);
        let _lock = self.lock(&record.workflow_id)?;

        let tmp = self.stage(&record)?;
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                StorageError::AlreadyExists {
                    workflow_id: record.workflow_id.clone(),
                }
            } else {
                StorageError::Io(e.error)
            }
        })?;

        debug!(workflow_id = %record.workflow_id, path = %path.display(), "workflow inserted");
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> StorageResult<Option<StoredWorkflow>> {
        validate_workflow_id(workflow_id)?;
        self.read_record(workflow_id)
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: StoredWorkflow,
    ) -> StorageResult<()> {
        validate_workflow_id(&record.workflow_id)?;
        let _lock = self.lock(&record.workflow_id)?;

        let current =
            self.read_record(&record.workflow_id)?
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

        let tmp = self.stage(&record)?;
        tmp.persist(self.record_path(&record.workflow_id))
            .map_err(|e| e.error)?;

        debug!(
            workflow_id = %record.workflow_id,
            revision = record.revision,
            "workflow record replaced"
        );
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<StoredWorkflow>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.workflows_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            records.push(serde_json::from_slice::<StoredWorkflow>(&bytes)?);
        }
        records.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(records)
    }
}
