//! Orchestrator error taxonomy.
//!
//! Three families, matching how callers must react:
//! - usage/state errors: surfaced immediately, never retried automatically
//! - blocking diagnostics: gate failures and handoff rejections, recorded as
//!   blockers and reported verbatim
//! - infrastructure: storage and configuration faults

use baton_state::StorageError;

use crate::domain::phase::{Phase, PhaseToken};
use crate::domain::workflow::{ArtifactKind, Blocker};

/// Exit code for a committed transition.
pub const EXIT_COMMITTED: i32 = 0;
/// Exit code for a rejection (missing artifacts, gate failure, agent failure).
pub const EXIT_REJECTED: i32 = 1;
/// Exit code for operator errors (stale state, unexpected token, ...).
pub const EXIT_USAGE: i32 = 2;
/// Exit code for storage or internal failures.
pub const EXIT_INTERNAL: i32 = 3;

/// Errors produced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("workflow {workflow_id} already exists")]
    AlreadyExists { workflow_id: String },

    #[error("workflow {workflow_id} not found")]
    NotFound { workflow_id: String },

    #[error("workflow {workflow_id} moved on: expected phase {expected}, found {actual}; re-read and retry")]
    StaleState {
        workflow_id: String,
        expected: Phase,
        actual: Phase,
    },

    #[error("handoff into {to_phase} for workflow {workflow_id} was superseded; re-issue the token")]
    HandoffSuperseded { workflow_id: String, to_phase: Phase },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("{}", unexpected_token_message(.workflow_id.as_deref(), .expected.as_ref(), .got))]
    UnexpectedToken {
        workflow_id: Option<String>,
        expected: Option<PhaseToken>,
        got: String,
    },

    #[error("workflow {workflow_id} is terminal ({phase}); start a new workflow instead")]
    Terminal { workflow_id: String, phase: Phase },

    #[error("quality gates failed for {phase}: {}", join_blockers(.blockers))]
    GateFailure { phase: Phase, blockers: Vec<Blocker> },

    #[error("handoff from {from_agent} to {to_phase} rejected: missing {}", join_kinds(.missing))]
    HandoffRejection {
        workflow_id: String,
        from_agent: String,
        to_phase: Phase,
        missing: Vec<ArtifactKind>,
    },

    #[error("handoff certificate for {to_phase} is invalid: {reason}")]
    InvalidCertificate { to_phase: Phase, reason: String },

    #[error("agent {agent} failed during {phase}: {reason}")]
    AgentRunnerFailure {
        phase: Phase,
        agent: String,
        reason: String,
        diagnostics: Vec<String>,
    },

    #[error("advance of workflow {workflow_id} into {phase} was cancelled")]
    Cancelled { workflow_id: String, phase: Phase },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Process exit code for the `orchestrator` CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::GateFailure { .. }
            | OrchestratorError::HandoffRejection { .. }
            | OrchestratorError::InvalidCertificate { .. }
            | OrchestratorError::AgentRunnerFailure { .. }
            | OrchestratorError::Cancelled { .. } => EXIT_REJECTED,
            OrchestratorError::AlreadyExists { .. }
            | OrchestratorError::NotFound { .. }
            | OrchestratorError::StaleState { .. }
            | OrchestratorError::HandoffSuperseded { .. }
            | OrchestratorError::InvalidTransition { .. }
            | OrchestratorError::UnexpectedToken { .. }
            | OrchestratorError::Terminal { .. }
            | OrchestratorError::Storage(StorageError::InvalidWorkflowId { .. }) => EXIT_USAGE,
            OrchestratorError::Configuration(_)
            | OrchestratorError::Storage(_)
            | OrchestratorError::Serialization(_) => EXIT_INTERNAL,
        }
    }

    /// Usage and state errors are the caller's to handle; they are not
    /// system faults and are not logged as such.
    pub fn is_usage_error(&self) -> bool {
        self.exit_code() == EXIT_USAGE
    }
}

fn unexpected_token_message(
    workflow_id: Option<&str>,
    expected: Option<&PhaseToken>,
    got: &str,
) -> String {
    let subject = workflow_id
        .map(|id| format!(" for workflow {id}"))
        .unwrap_or_default();
    match expected {
        Some(token) => format!(
            "unexpected token {got:?}{subject}: next token is {token:?}",
            token = token.as_str()
        ),
        None => format!("unexpected token {got:?}{subject}"),
    }
}

fn join_blockers(blockers: &[Blocker]) -> String {
    blockers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

fn join_kinds(kinds: &[ArtifactKind]) -> String {
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
