//! SurrealDB-backed WorkflowStore implementation
//!
//! Rows keep the workflow document as a JSON string; the envelope fields
//! (`workflow_id`, `revision`, `phase`) are plain columns so the
//! compare-and-swap can be expressed as a single conditional `UPDATE`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::storage_traits::{validate_workflow_id, StorageResult, StoredWorkflow, WorkflowStore};

const NAMESPACE: &str = "baton";
const DATABASE: &str = "main";

/// Database row for a workflow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowRow {
    workflow_id: String,
    revision: u64,
    phase: String,
    document: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_record(record: &StoredWorkflow) -> StorageResult<Self> {
        Ok(Self {
            workflow_id: record.workflow_id.clone(),
            revision: record.revision,
            phase: record.phase.clone(),
            document: serde_json::to_string(&record.document)?,
            updated_at: record.updated_at.to_rfc3339(),
        })
    }

    fn into_record(self) -> StorageResult<StoredWorkflow> {
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| StorageError::Serialization(e.to_string()))?
            .with_timezone(&Utc);
        Ok(StoredWorkflow {
            workflow_id: self.workflow_id,
            revision: self.revision,
            phase: self.phase,
            document: serde_json::from_str(&self.document)?,
            updated_at,
        })
    }
}

/// SurrealDB-backed implementation of [`WorkflowStore`].
pub struct SurrealWorkflowStore {
    db: Surreal<Any>,
}

impl SurrealWorkflowStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `baton/main`, and runs `init_schema`.
    pub async fn in_memory() -> StorageResult<Self> {
        let store = Self::connect("mem://").await?;
        info!("SurrealWorkflowStore connected (in-memory)");
        Ok(store)
    }

    /// Connect to `SURREALDB_URL` if set, otherwise persist locally under
    /// `<home>/db` using the SurrealKV engine.
    pub async fn from_env(home: &Path) -> StorageResult<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            let store = Self::connect(&url).await?;
            info!("SurrealWorkflowStore connected ({})", url);
            return Ok(store);
        }

        let path = home.join("db");
        std::fs::create_dir_all(&path).map_err(|e| {
            StorageError::Connection(format!(
                "failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        info!("No SURREALDB_URL found, using local persistence: {}", url);
        Self::connect(&url).await
    }

    /// Connect to an explicit endpoint URL.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self { db })
    }

    async fn fetch_row(&self, workflow_id: &str) -> StorageResult<Option<WorkflowRow>> {
        let mut res = self
            .db
            .query(
                "SELECT workflow_id, revision, phase, document, updated_at \
                 FROM workflows WHERE workflow_id = $wid",
            )
            .bind(("wid", workflow_id.to_string()))
            .await?;

        let rows: Vec<WorkflowRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl WorkflowStore for SurrealWorkflowStore {
    async fn insert(&self, record: StoredWorkflow) -> StorageResult<()> {
        validate_workflow_id(&record.workflow_id)?;
        if self.fetch_row(&record.workflow_id).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                workflow_id: record.workflow_id,
            });
        }

        let row = WorkflowRow::from_record(&record)?;
        debug!(workflow_id = %record.workflow_id, "creating workflow row");

        let created: StorageResult<Option<WorkflowRow>> = self
            .db
            .create("workflows")
            .content(row)
            .await
            .map_err(StorageError::from);

        match created {
            Ok(_) => Ok(()),
            // The unique index lost a race against another writer.
            Err(e) => match self.fetch_row(&record.workflow_id).await? {
                Some(_) => Err(StorageError::AlreadyExists {
                    workflow_id: record.workflow_id,
                }),
                None => Err(e),
            },
        }
    }

    async fn load(&self, workflow_id: &str) -> StorageResult<Option<StoredWorkflow>> {
        self.fetch_row(workflow_id)
            .await?
            .map(WorkflowRow::into_record)
            .transpose()
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: StoredWorkflow,
    ) -> StorageResult<()> {
        let row = WorkflowRow::from_record(&record)?;

        let mut res = self
            .db
            .query(
                "UPDATE workflows SET revision = $revision, phase = $phase, \
                 document = $document, updated_at = $updated_at \
                 WHERE workflow_id = $wid AND revision = $expected \
                 RETURN workflow_id, revision, phase, document, updated_at",
            )
            .bind(("revision", row.revision))
            .bind(("phase", row.phase))
            .bind(("document", row.document))
            .bind(("updated_at", row.updated_at))
            .bind(("wid", row.workflow_id))
            .bind(("expected", expected_revision))
            .await?;

        let updated: Vec<WorkflowRow> = res.take(0)?;
        if !updated.is_empty() {
            return Ok(());
        }

        match self.fetch_row(&record.workflow_id).await? {
            None => Err(StorageError::NotFound {
                workflow_id: record.workflow_id,
            }),
            Some(current) => Err(StorageError::RevisionConflict {
                workflow_id: record.workflow_id,
                expected: expected_revision,
                actual: current.revision,
            }),
        }
    }

    async fn list(&self) -> StorageResult<Vec<StoredWorkflow>> {
        let mut res = self
            .db
            .query(
                "SELECT workflow_id, revision, phase, document, updated_at \
                 FROM workflows ORDER BY workflow_id ASC",
            )
            .await?;

        let rows: Vec<WorkflowRow> = res.take(0)?;
        rows.into_iter().map(WorkflowRow::into_record).collect()
    }
}
