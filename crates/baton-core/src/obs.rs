//! Structured observability hooks for workflow lifecycle events.
//!
//! These are log events, distinct from the in-process [`crate::bus`]: they
//! land in whatever `tracing` subscriber the binary installed and carry a
//! stable `event = "..."` field for log aggregation.

use tracing::{info, warn, Span};

use crate::domain::Phase;

/// Span covering one `advance` call.
///
/// Attach it with [`tracing::Instrument`] rather than entering it, since the
/// advance future crosses `.await` points and may move between threads.
///
/// ```ignore
/// controller.advance_inner(id, token).instrument(advance_span("42", Phase::Apply)).await
/// ```
pub fn advance_span(workflow_id: &str, target: Phase) -> Span {
    tracing::info_span!(
        "baton.advance",
        workflow_id = %workflow_id,
        target_phase = %target
    )
}

pub fn emit_advance_started(workflow_id: &str, from: Phase, target: Phase) {
    info!(event = "advance.started", workflow_id = %workflow_id, from = %from, target = %target);
}

pub fn emit_phase_committed(workflow_id: &str, phase: Phase, revision: u64) {
    info!(
        event = "phase.committed",
        workflow_id = %workflow_id,
        phase = %phase,
        revision = revision,
    );
}

/// Gate run finished; `failed` lists failing gate names.
pub fn emit_gate_evaluated(workflow_id: &str, phase: Phase, passed: bool, failed: &[String]) {
    info!(
        event = "gate.evaluated",
        workflow_id = %workflow_id,
        phase = %phase,
        passed = passed,
        failed = ?failed,
    );
}

pub fn emit_handoff_rejected(workflow_id: &str, phase: Phase, missing: &[String]) {
    info!(
        event = "handoff.rejected",
        workflow_id = %workflow_id,
        phase = %phase,
        missing = ?missing,
    );
}

pub fn emit_attempt_recorded(workflow_id: &str, phase: Phase, outcome: &str) {
    info!(
        event = "attempt.recorded",
        workflow_id = %workflow_id,
        phase = %phase,
        outcome = %outcome,
    );
}

/// Agent failure drove the workflow to FAILED (warning level).
pub fn emit_workflow_failed(workflow_id: &str, phase: Phase, reason: &str) {
    warn!(event = "workflow.failed", workflow_id = %workflow_id, phase = %phase, reason = %reason);
}
