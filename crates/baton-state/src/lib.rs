//! Baton-State: durable workflow storage
//!
//! This crate provides the persistence layer for the Baton orchestrator.
//! It stores exactly one record per workflow and exposes a compare-and-swap
//! primitive so the registry above it can implement optimistic locking.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durability before acknowledgement, single-record atomicity.
//!
//! ## Key Components
//!
//! - `WorkflowStore`: backend-agnostic storage trait
//! - `StoredWorkflow`: the persisted envelope (id, revision, phase, document)
//! - `FsWorkflowStore`: one JSON file per workflow, atomic rename on write
//! - `SurrealWorkflowStore`: SurrealDB backend (`mem://`, `surrealkv://`, remote)
//! - `fakes::MemoryWorkflowStore`: in-memory store for tests

mod error;
pub mod fakes;
pub mod fs_store;
mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use fs_store::FsWorkflowStore;
pub use storage_traits::{validate_workflow_id, StorageResult, StoredWorkflow, WorkflowStore};
pub use surreal_store::SurrealWorkflowStore;
