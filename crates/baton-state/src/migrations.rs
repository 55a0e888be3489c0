//! SurrealDB schema initialization
//!
//! Sets up the `workflows` table with its uniqueness constraint.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all Baton tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing Baton SurrealDB schema");
    init_workflows_table(db).await?;
    info!("Baton schema initialization complete");
    Ok(())
}

/// Initialize `workflows` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE workflows {
///   workflow_id:  STRING (unique)
///   revision:     INT    (compare-and-swap token)
///   phase:        STRING (indexed)
///   document:     STRING (JSON-encoded workflow document)
///   updated_at:   STRING (RFC 3339)
/// }
/// ```
///
/// Records are never deleted: terminal workflows stay as the audit log.
async fn init_workflows_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing workflows table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS workflows AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        -- One record per workflow id
        DEFINE INDEX IF NOT EXISTS idx_workflow_id ON TABLE workflows COLUMNS workflow_id UNIQUE;

        -- Filter by phase for status views
        DEFINE INDEX IF NOT EXISTS idx_phase ON TABLE workflows COLUMNS phase;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(format!("schema setup failed: {e}")))?
        .check()
        .map_err(|e| StorageError::Backend(format!("schema setup failed: {e}")))?;

    Ok(())
}
