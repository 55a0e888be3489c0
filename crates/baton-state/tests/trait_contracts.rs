//! Contract tests run against every `WorkflowStore` backend.

use std::sync::Arc;

use baton_state::fakes::MemoryWorkflowStore;
use baton_state::{
    FsWorkflowStore, StorageError, StoredWorkflow, SurrealWorkflowStore, WorkflowStore,
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::Barrier;

fn fresh(id: &str) -> StoredWorkflow {
    StoredWorkflow {
        workflow_id: id.to_string(),
        revision: 1,
        phase: "INTAKE".to_string(),
        document: json!({ "history": [], "artifacts": {}, "blockers": [] }),
        updated_at: Utc::now(),
    }
}

async fn insert_then_load(store: &dyn WorkflowStore) {
    store.insert(fresh("42")).await.unwrap();
    let loaded = store.load("42").await.unwrap().expect("record should exist");
    assert_eq!(loaded.workflow_id, "42");
    assert_eq!(loaded.revision, 1);
    assert_eq!(loaded.document["blockers"], json!([]));
    assert!(store.load("43").await.unwrap().is_none());
}

async fn duplicate_insert_rejected(store: &dyn WorkflowStore) {
    store.insert(fresh("dup")).await.unwrap();
    let err = store.insert(fresh("dup")).await.unwrap_err();
    assert!(
        matches!(err, StorageError::AlreadyExists { .. }),
        "expected AlreadyExists, got {err:?}"
    );
}

async fn cas_succeeds_on_current_revision(store: &dyn WorkflowStore) {
    let first = fresh("cas");
    store.insert(first.clone()).await.unwrap();

    let second = first.next("PLAN", json!({ "history": ["PLAN"] }));
    store.compare_and_swap(1, second).await.unwrap();

    let loaded = store.load("cas").await.unwrap().unwrap();
    assert_eq!(loaded.revision, 2);
    assert_eq!(loaded.phase, "PLAN");
    assert_eq!(loaded.document["history"], json!(["PLAN"]));
}

async fn cas_rejects_stale_revision(store: &dyn WorkflowStore) {
    let first = fresh("stale");
    store.insert(first.clone()).await.unwrap();
    store
        .compare_and_swap(1, first.next("PLAN", json!({})))
        .await
        .unwrap();

    // A second writer still holding revision 1 loses.
    let err = store
        .compare_and_swap(1, first.next("FAILED", json!({})))
        .await
        .unwrap_err();
    match err {
        StorageError::RevisionConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected RevisionConflict, got {other:?}"),
    }
    assert_eq!(store.load("stale").await.unwrap().unwrap().phase, "PLAN");
}

async fn cas_on_missing_record_is_not_found(store: &dyn WorkflowStore) {
    let err = store
        .compare_and_swap(1, fresh("ghost").next("PLAN", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }), "got {err:?}");
}

async fn list_is_ordered_by_id(store: &dyn WorkflowStore) {
    for id in ["b", "a", "c"] {
        store.insert(fresh(id)).await.unwrap();
    }
    let ids: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.workflow_id)
        .filter(|id| id.len() == 1)
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

async fn run_all(store: &dyn WorkflowStore) {
    insert_then_load(store).await;
    duplicate_insert_rejected(store).await;
    cas_succeeds_on_current_revision(store).await;
    cas_rejects_stale_revision(store).await;
    cas_on_missing_record_is_not_found(store).await;
    list_is_ordered_by_id(store).await;
}

#[tokio::test]
async fn memory_store_satisfies_contract() {
    run_all(&MemoryWorkflowStore::new()).await;
}

#[tokio::test]
async fn fs_store_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsWorkflowStore::open(dir.path()).unwrap();
    run_all(&store).await;
}

#[tokio::test]
async fn surreal_store_satisfies_contract() {
    let store = SurrealWorkflowStore::in_memory().await.unwrap();
    run_all(&store).await;
}

/// Race two writers holding revision 1; exactly one may land.
async fn race_cas(a: Arc<dyn WorkflowStore>, b: Arc<dyn WorkflowStore>, id: &str) {
    let base = fresh(id);
    a.insert(base.clone()).await.unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut tasks = Vec::new();
    for (store, phase) in [(a.clone(), "PLAN"), (b, "FAILED")] {
        let next = base.next(phase, json!({}));
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            store.compare_and_swap(1, next).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => wins += 1,
            Err(StorageError::RevisionConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!((wins, conflicts), (1, 1), "workflow {id}");
    assert_eq!(a.load(id).await.unwrap().unwrap().revision, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_cas_has_exactly_one_winner() {
    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryWorkflowStore::new());
    race_cas(store.clone(), store, "race").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn separate_fs_handles_share_one_winner() {
    // Two handles on one directory stand in for two CLI processes.
    let dir = tempfile::tempdir().unwrap();
    let a: Arc<dyn WorkflowStore> = Arc::new(FsWorkflowStore::open(dir.path()).unwrap());
    let b: Arc<dyn WorkflowStore> = Arc::new(FsWorkflowStore::open(dir.path()).unwrap());
    for round in 0..50 {
        race_cas(a.clone(), b.clone(), &format!("race-{round}")).await;
    }
}

#[tokio::test]
async fn memory_store_simulated_outage() {
    let store = MemoryWorkflowStore::new();
    store.set_fail_writes(true);
    let err = store.insert(fresh("down")).await.unwrap_err();
    assert!(matches!(err, StorageError::Backend(_)));
    store.set_fail_writes(false);
    assert!(store.load("down").await.unwrap().is_none());
}
