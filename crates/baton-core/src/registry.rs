//! Workflow registry: the durable state machine.
//!
//! Every mutation goes through [`WorkflowRegistry::commit_transition`] or
//! [`WorkflowRegistry::record_attempt`]. Both re-read the record from the
//! store, validate against what they find, and write back with a
//! compare-and-swap on the storage revision. The write is durable before the
//! in-memory index is touched, so the index can never run ahead of storage.
//!
//! Conflicts are reported, never retried here: the caller decides.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use baton_state::{validate_workflow_id, StorageError, StoredWorkflow, WorkflowStore};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{
    ArtifactMap, Blocker, HistoryEntry, OrchestratorError, Outcome, Phase, Result, Workflow,
};
use crate::gate::GateReport;

/// A phase-moving commit.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub outcome: Outcome,
    /// Merged into the workflow's artifacts.
    pub artifacts: ArtifactMap,
    /// Gate report for `to`. Ignored for `FAILED`.
    pub gates: Option<GateReport>,
    /// When the advance that produced this commit started.
    pub started_at: DateTime<Utc>,
}

impl Transition {
    pub fn committed(from: Phase, to: Phase, started_at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            outcome: Outcome::Committed,
            artifacts: ArtifactMap::new(),
            gates: None,
            started_at,
        }
    }

    pub fn failed(
        from: Phase,
        reason: impl Into<String>,
        diagnostics: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            from,
            to: Phase::Failed,
            outcome: Outcome::Failed {
                reason: reason.into(),
                diagnostics,
            },
            artifacts: ArtifactMap::new(),
            gates: None,
            started_at,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactMap) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_gates(mut self, report: GateReport) -> Self {
        self.gates = Some(report);
        self
    }
}

/// A non-committing attempt: history grows, phase stays put.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub from: Phase,
    pub attempted: Phase,
    /// `Blocked` or `Cancelled`.
    pub outcome: Outcome,
    /// Replaces the blocker set when the outcome is `Blocked`.
    pub blockers: Vec<Blocker>,
    pub started_at: DateTime<Utc>,
}

impl Attempt {
    pub fn blocked(
        from: Phase,
        attempted: Phase,
        blockers: Vec<Blocker>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            from,
            attempted,
            outcome: Outcome::Blocked {
                reasons: blockers.iter().map(ToString::to_string).collect(),
            },
            blockers,
            started_at,
        }
    }

    pub fn cancelled(
        from: Phase,
        attempted: Phase,
        reason: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            from,
            attempted,
            outcome: Outcome::Cancelled {
                reason: reason.into(),
            },
            blockers: Vec::new(),
            started_at,
        }
    }
}

/// Single-writer store of workflows with optimistic locking.
pub struct WorkflowRegistry {
    store: Arc<dyn WorkflowStore>,
    index: RwLock<HashMap<String, Workflow>>,
}

impl WorkflowRegistry {
    /// Open the registry and hydrate the index from `store`.
    pub async fn open(store: Arc<dyn WorkflowStore>) -> Result<Self> {
        let mut index = HashMap::new();
        for stored in store.list().await? {
            let workflow = decode(stored)?;
            index.insert(workflow.id.clone(), workflow);
        }
        debug!(workflows = index.len(), "workflow registry hydrated");
        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    /// Register a new workflow in `INTAKE`.
    ///
    /// Never resumes: an existing id is `AlreadyExists`.
    pub async fn create(&self, workflow_id: &str) -> Result<Workflow> {
        validate_workflow_id(workflow_id)?;
        let workflow = Workflow::new(workflow_id);
        let record = StoredWorkflow {
            workflow_id: workflow.id.clone(),
            revision: 1,
            phase: workflow.phase.to_string(),
            document: serde_json::to_value(&workflow)?,
            updated_at: workflow.created_at,
        };
        self.store.insert(record).await.map_err(|e| match e {
            StorageError::AlreadyExists { workflow_id } => {
                OrchestratorError::AlreadyExists { workflow_id }
            }
            other => other.into(),
        })?;

        let workflow = Workflow {
            revision: 1,
            ..workflow
        };
        self.cache(&workflow);
        Ok(workflow)
    }

    /// Authoritative read from storage.
    pub async fn get(&self, workflow_id: &str) -> Result<Workflow> {
        let workflow = self.load(workflow_id).await?;
        self.cache(&workflow);
        Ok(workflow)
    }

    /// Last committed view held in memory, without touching storage.
    pub fn cached(&self, workflow_id: &str) -> Option<Workflow> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .cloned()
    }

    /// All workflows, ordered by id.
    pub async fn list(&self) -> Result<Vec<Workflow>> {
        self.store
            .list()
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// The append-only audit log.
    pub async fn history(&self, workflow_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self.load(workflow_id).await?.history)
    }

    /// Move `from -> to` atomically.
    ///
    /// Refused with `InvalidTransition` for an illegal edge, `Terminal` on a
    /// finished workflow, `StaleState` if the stored phase is not `from` (or
    /// another writer got there first), and `GateFailure` when entering a
    /// non-`FAILED` phase with a failing gate report, or with no report
    /// while blockers are outstanding.
    pub async fn commit_transition(&self, workflow_id: &str, t: Transition) -> Result<Workflow> {
        if !t.from.can_transition_to(t.to) {
            return Err(OrchestratorError::InvalidTransition {
                from: t.from,
                to: t.to,
            });
        }
        let current = self.load(workflow_id).await?;
        check_expected_phase(&current, t.from)?;

        if t.to != Phase::Failed {
            match &t.gates {
                Some(report) if report.phase != t.to => {
                    return Err(OrchestratorError::Configuration(format!(
                        "gate report for {} cannot commit {}",
                        report.phase, t.to
                    )));
                }
                Some(report) if !report.passed() => {
                    return Err(OrchestratorError::GateFailure {
                        phase: t.to,
                        blockers: report.blockers(),
                    });
                }
                None if !current.blockers.is_empty() => {
                    return Err(OrchestratorError::GateFailure {
                        phase: t.to,
                        blockers: current.blockers.clone(),
                    });
                }
                _ => {}
            }
        }

        let now = Utc::now();
        let mut next = current.clone();
        let exited_at = (!t.to.is_terminal()).then_some(now);
        next.append(t.to, t.started_at, exited_at, t.outcome);
        next.artifacts.extend(t.artifacts);
        next.blockers.clear();
        next.phase = t.to;

        self.persist(&current, next).await
    }

    /// Append a `Blocked` or `Cancelled` entry without moving the phase.
    pub async fn record_attempt(&self, workflow_id: &str, a: Attempt) -> Result<Workflow> {
        if !matches!(a.outcome, Outcome::Blocked { .. } | Outcome::Cancelled { .. }) {
            return Err(OrchestratorError::Configuration(
                "only blocked or cancelled attempts can be recorded without a transition"
                    .to_string(),
            ));
        }
        let current = self.load(workflow_id).await?;
        check_expected_phase(&current, a.from)?;

        let mut next = current.clone();
        let blocked = matches!(a.outcome, Outcome::Blocked { .. });
        next.append(a.attempted, a.started_at, Some(Utc::now()), a.outcome);
        if blocked {
            next.blockers = a.blockers;
        }

        self.persist(&current, next).await
    }

    async fn load(&self, workflow_id: &str) -> Result<Workflow> {
        match self.store.load(workflow_id).await? {
            Some(stored) => decode(stored),
            None => Err(OrchestratorError::NotFound {
                workflow_id: workflow_id.to_string(),
            }),
        }
    }

    /// CAS `next` over `current`; durable first, then the index.
    async fn persist(&self, current: &Workflow, mut next: Workflow) -> Result<Workflow> {
        let record = StoredWorkflow {
            workflow_id: next.id.clone(),
            revision: current.revision + 1,
            phase: next.phase.to_string(),
            document: serde_json::to_value(&next)?,
            updated_at: Utc::now(),
        };

        match self.store.compare_and_swap(current.revision, record).await {
            Ok(()) => {}
            Err(StorageError::RevisionConflict { .. }) => {
                let actual = self.load(&current.id).await?.phase;
                return Err(OrchestratorError::StaleState {
                    workflow_id: current.id.clone(),
                    expected: current.phase,
                    actual,
                });
            }
            Err(StorageError::NotFound { workflow_id }) => {
                return Err(OrchestratorError::NotFound { workflow_id });
            }
            Err(other) => return Err(other.into()),
        }

        next.revision = current.revision + 1;
        self.cache(&next);
        Ok(next)
    }

    fn cache(&self, workflow: &Workflow) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        // Never replace a newer view with an older one.
        let stale = index
            .get(&workflow.id)
            .is_some_and(|cached| cached.revision > workflow.revision);
        if !stale {
            index.insert(workflow.id.clone(), workflow.clone());
        }
    }
}

fn check_expected_phase(current: &Workflow, expected: Phase) -> Result<()> {
    if current.is_terminal() {
        return Err(OrchestratorError::Terminal {
            workflow_id: current.id.clone(),
            phase: current.phase,
        });
    }
    if current.phase != expected {
        return Err(OrchestratorError::StaleState {
            workflow_id: current.id.clone(),
            expected,
            actual: current.phase,
        });
    }
    Ok(())
}

fn decode(stored: StoredWorkflow) -> Result<Workflow> {
    let mut workflow: Workflow = serde_json::from_value(stored.document)?;
    workflow.revision = stored.revision;
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ArtifactKind;
    use crate::gate::GateResult;
    use baton_state::fakes::MemoryWorkflowStore;

    async fn registry() -> WorkflowRegistry {
        WorkflowRegistry::open(Arc::new(MemoryWorkflowStore::new()))
            .await
            .unwrap()
    }

    fn report(phase: Phase, failing: &[&str]) -> GateReport {
        let mut results: Vec<GateResult> = ["build", "lint", "test"]
            .iter()
            .map(|name| GateResult {
                name: name.to_string(),
                passed: !failing.contains(name),
                diagnostics: if failing.contains(name) {
                    vec![format!("{name} failed")]
                } else {
                    vec![]
                },
                duration_ms: 1,
            })
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        GateReport { phase, results }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let reg = registry().await;
        let wf = reg.create("42").await.unwrap();
        assert_eq!(wf.phase, Phase::Intake);
        assert_eq!(wf.revision, 1);
        assert!(matches!(
            reg.create("42").await,
            Err(OrchestratorError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_ids() {
        let reg = registry().await;
        let err = reg.create("../etc").await.unwrap_err();
        assert_eq!(err.exit_code(), crate::domain::error::EXIT_USAGE);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let reg = registry().await;
        assert!(matches!(
            reg.get("nope").await,
            Err(OrchestratorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_appends_and_merges() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let mut artifacts = ArtifactMap::new();
        artifacts.insert(ArtifactKind::Spec, "docs/specs/ISSUE-42.mdx".into());
        let wf = reg
            .commit_transition(
                "42",
                Transition::committed(Phase::Intake, Phase::Plan, Utc::now())
                    .with_artifacts(artifacts),
            )
            .await
            .unwrap();
        assert_eq!(wf.phase, Phase::Plan);
        assert_eq!(wf.revision, 2);
        assert_eq!(wf.history.len(), 1);
        assert!(wf.history[0].exited_at.is_some());
        assert_eq!(wf.artifacts[&ArtifactKind::Spec], "docs/specs/ISSUE-42.mdx");
        assert_eq!(reg.cached("42").unwrap(), wf);
    }

    #[tokio::test]
    async fn test_skip_is_invalid_transition() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let err = reg
            .commit_transition("42", Transition::committed(Phase::Intake, Phase::Apply, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_wrong_from_phase_is_stale() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let err = reg
            .commit_transition("42", Transition::committed(Phase::Plan, Phase::Apply, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::StaleState {
                expected: Phase::Plan,
                actual: Phase::Intake,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failing_report_blocks_commit() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let err = reg
            .commit_transition(
                "42",
                Transition::committed(Phase::Intake, Phase::Plan, Utc::now())
                    .with_gates(report(Phase::Plan, &["lint"])),
            )
            .await
            .unwrap_err();
        match err {
            OrchestratorError::GateFailure { phase, blockers } => {
                assert_eq!(phase, Phase::Plan);
                assert_eq!(blockers.len(), 1);
                assert_eq!(blockers[0].name, "lint");
            }
            other => panic!("expected GateFailure, got {other:?}"),
        }
        assert_eq!(reg.get("42").await.unwrap().phase, Phase::Intake);
    }

    #[tokio::test]
    async fn test_blockers_cleared_only_by_passing_run() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let blockers = report(Phase::Plan, &["test"]).blockers();
        let wf = reg
            .record_attempt(
                "42",
                Attempt::blocked(Phase::Intake, Phase::Plan, blockers, Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(wf.phase, Phase::Intake);
        assert_eq!(wf.blockers.len(), 1);

        // No fresh report: still blocked.
        let err = reg
            .commit_transition("42", Transition::committed(Phase::Intake, Phase::Plan, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::GateFailure { .. }));

        let wf = reg
            .commit_transition(
                "42",
                Transition::committed(Phase::Intake, Phase::Plan, Utc::now())
                    .with_gates(report(Phase::Plan, &[])),
            )
            .await
            .unwrap();
        assert!(wf.blockers.is_empty());
        assert_eq!(wf.history.len(), 2);
        assert!(matches!(wf.history[0].outcome, Outcome::Blocked { .. }));
        assert!(wf.history[1].outcome.is_committed());
    }

    #[tokio::test]
    async fn test_report_for_other_phase_is_refused() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let err = reg
            .commit_transition(
                "42",
                Transition::committed(Phase::Intake, Phase::Plan, Utc::now())
                    .with_gates(report(Phase::Apply, &[])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_failed_bypasses_gates_and_is_terminal() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let blockers = report(Phase::Plan, &["build"]).blockers();
        reg.record_attempt(
            "42",
            Attempt::blocked(Phase::Intake, Phase::Plan, blockers, Utc::now()),
        )
        .await
        .unwrap();

        let wf = reg
            .commit_transition(
                "42",
                Transition::failed(Phase::Intake, "spec agent crashed", vec![], Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(wf.phase, Phase::Failed);
        assert!(wf.history.last().unwrap().exited_at.is_none());

        let err = reg
            .commit_transition("42", Transition::failed(Phase::Failed, "again", vec![], Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

        let err = reg
            .record_attempt(
                "42",
                Attempt::cancelled(Phase::Failed, Phase::Plan, "ctrl-c", Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Terminal { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_attempt_keeps_blockers() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let blockers = report(Phase::Plan, &["lint"]).blockers();
        reg.record_attempt(
            "42",
            Attempt::blocked(Phase::Intake, Phase::Plan, blockers, Utc::now()),
        )
        .await
        .unwrap();
        let wf = reg
            .record_attempt(
                "42",
                Attempt::cancelled(Phase::Intake, Phase::Plan, "operator interrupt", Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(wf.blockers.len(), 1);
        assert_eq!(wf.history.len(), 2);
    }

    #[tokio::test]
    async fn test_committed_outcome_cannot_be_recorded_as_attempt() {
        let reg = registry().await;
        reg.create("42").await.unwrap();
        let attempt = Attempt {
            from: Phase::Intake,
            attempted: Phase::Plan,
            outcome: Outcome::Committed,
            blockers: vec![],
            started_at: Utc::now(),
        };
        assert!(reg.record_attempt("42", attempt).await.is_err());
    }

    #[tokio::test]
    async fn test_open_hydrates_index() {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemoryWorkflowStore::new());
        {
            let reg = WorkflowRegistry::open(Arc::clone(&store)).await.unwrap();
            reg.create("7").await.unwrap();
            reg.commit_transition(
                "7",
                Transition::committed(Phase::Intake, Phase::Plan, Utc::now()),
            )
            .await
            .unwrap();
        }
        let reopened = WorkflowRegistry::open(store).await.unwrap();
        let cached = reopened.cached("7").unwrap();
        assert_eq!(cached.phase, Phase::Plan);
        assert_eq!(cached.revision, 2);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
        assert_eq!(reopened.history("7").await.unwrap().len(), 1);
    }
}
