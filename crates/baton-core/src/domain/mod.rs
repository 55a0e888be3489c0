//! Domain models for Baton.
//!
//! Canonical definitions for the core entities:
//! - `Phase` / `PhaseToken`: the fixed state machine and its operator spelling
//! - `Workflow`: durable per-issue record with append-only history
//! - `OrchestratorError`: the error taxonomy and CLI exit codes

pub mod error;
pub mod phase;
pub mod workflow;

// Re-export main types and errors
pub use error::{OrchestratorError, Result};
pub use phase::{Phase, PhaseToken};
pub use workflow::{
    ArtifactKind, ArtifactMap, Blocker, BlockerSource, HistoryEntry, Outcome, Workflow,
};
