//! Orchestrator controller: turns an operator token into exactly one of a
//! committed transition, a committed failure, or a reported rejection.
//!
//! `advance` flow for a workflow sitting in phase `P` with successor `T`:
//!
//! 1. Check the token names `T`; the first `APPROVE PLAN` creates the workflow.
//! 2. Run the crew registered for `T` against a copy of the artifacts.
//! 3. Declare the handoff; a rejection is recorded as a blocked attempt.
//! 4. Run the gates for `T` against committed plus candidate artifacts.
//! 5. Commit `P -> T` through the registry's optimistic check.
//! 6. After `MERGE`, commit `DONE` straight away.
//!
//! An agent failure commits `FAILED`. Nothing holds a registry lock while
//! agents or gates run; the only synchronisation is the compare-and-swap at
//! the end, so a concurrent advance of the same workflow loses with
//! `StaleState` and other workflows are never held up.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, info, Instrument};

use crate::agent::{AgentInvocation, AgentRegistry};
use crate::bus::{panic_message, Event, EventBus, Topic};
use crate::domain::error::{EXIT_COMMITTED, EXIT_REJECTED};
use crate::domain::{
    ArtifactMap, Blocker, OrchestratorError, Phase, PhaseToken, Result, Workflow,
};
use crate::gate::{ExecutionContext, GateContext, GateRegistry, GateReport};
use crate::handoff::{HandoffCertificate, HandoffRejection, HandoffService};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::{Attempt, Transition, WorkflowRegistry};

/// How a non-rejected advance ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// The target phase was committed (and `DONE` too, after `MERGE`).
    Committed {
        workflow: Workflow,
        gates: GateReport,
    },
    /// An agent failed and the workflow was committed to `FAILED`.
    Failed {
        workflow: Workflow,
        agent: String,
        reason: String,
        diagnostics: Vec<String>,
    },
}

impl AdvanceOutcome {
    pub fn workflow(&self) -> &Workflow {
        match self {
            AdvanceOutcome::Committed { workflow, .. } | AdvanceOutcome::Failed { workflow, .. } => {
                workflow
            }
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            AdvanceOutcome::Committed { .. } => EXIT_COMMITTED,
            AdvanceOutcome::Failed { .. } => EXIT_REJECTED,
        }
    }
}

/// Agent output that failed the workflow.
struct CrewFailure {
    agent: String,
    reason: String,
    diagnostics: Vec<String>,
}

/// Result of the side-effect-free part of an advance.
/// Gate runs allowed after the first when a newer declaration keeps
/// superseding the certificate under evaluation.
const MAX_GATE_RERUNS: usize = 3;

enum Evaluation {
    AgentFailed(CrewFailure),
    Rejected(HandoffRejection),
    Evaluated {
        certificate: HandoffCertificate,
        gates: GateReport,
    },
}

/// The top-level controller.
pub struct Orchestrator {
    registry: Arc<WorkflowRegistry>,
    agents: AgentRegistry,
    gates: Arc<GateRegistry>,
    handoff: Arc<HandoffService>,
    bus: Arc<EventBus>,
    exec: ExecutionContext,
}

impl Orchestrator {
    pub fn new(registry: Arc<WorkflowRegistry>, agents: AgentRegistry) -> Self {
        Self {
            registry,
            agents,
            gates: Arc::new(GateRegistry::new()),
            handoff: Arc::new(HandoffService::new()),
            bus: Arc::new(EventBus::new()),
            exec: ExecutionContext::default(),
        }
    }

    pub fn with_gates(mut self, gates: Arc<GateRegistry>) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_handoff(mut self, handoff: Arc<HandoffService>) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_exec(mut self, exec: ExecutionContext) -> Self {
        self.exec = exec;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn gates(&self) -> &Arc<GateRegistry> {
        &self.gates
    }

    pub fn handoff(&self) -> &Arc<HandoffService> {
        &self.handoff
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Advance `workflow_id` by `token`. Never cancelled.
    pub async fn advance(&self, workflow_id: &str, token: &str) -> Result<AdvanceOutcome> {
        self.advance_until(workflow_id, token, std::future::pending())
            .await
    }

    /// Like [`Orchestrator::advance`], abandoning agents and gates when
    /// `cancel` resolves first. A cancelled advance records a retry-eligible
    /// `Cancelled` attempt and returns [`OrchestratorError::Cancelled`].
    pub async fn advance_until<C>(
        &self,
        workflow_id: &str,
        token: &str,
        cancel: C,
    ) -> Result<AdvanceOutcome>
    where
        C: Future<Output = ()>,
    {
        METRICS.inc_advances();
        let started_at = Utc::now();

        let token = match token.parse::<PhaseToken>() {
            Ok(t) => t,
            Err(_) => {
                let expected = self
                    .registry
                    .get(workflow_id)
                    .await
                    .ok()
                    .and_then(|wf| wf.phase.successor())
                    .and_then(PhaseToken::for_target);
                return Err(OrchestratorError::UnexpectedToken {
                    workflow_id: Some(workflow_id.to_string()),
                    expected,
                    got: token.to_string(),
                });
            }
        };

        let workflow = self.load_or_create(workflow_id, token).await?;
        if workflow.is_terminal() {
            return Err(OrchestratorError::Terminal {
                workflow_id: workflow.id,
                phase: workflow.phase,
            });
        }

        // A workflow only rests in MERGE if finishing it failed; the MERGE
        // token completes it.
        if workflow.phase == Phase::Merge && token == PhaseToken::Merge {
            let workflow = self.finish(workflow, started_at).await?;
            return Ok(AdvanceOutcome::Committed {
                workflow,
                gates: GateReport {
                    phase: Phase::Done,
                    results: Vec::new(),
                },
            });
        }

        let Some(target) = workflow
            .phase
            .successor()
            .filter(|t| PhaseToken::for_target(*t).is_some())
        else {
            return Err(OrchestratorError::UnexpectedToken {
                workflow_id: Some(workflow.id),
                expected: (workflow.phase == Phase::Merge).then_some(PhaseToken::Merge),
                got: token.as_str().to_string(),
            });
        };
        if token.target() != target {
            return Err(OrchestratorError::UnexpectedToken {
                workflow_id: Some(workflow.id),
                expected: PhaseToken::for_target(target),
                got: token.as_str().to_string(),
            });
        }

        let span = obs::advance_span(workflow_id, target);
        self.run_phase(workflow, target, token, started_at, cancel)
            .instrument(span)
            .await
    }

    async fn load_or_create(&self, workflow_id: &str, token: PhaseToken) -> Result<Workflow> {
        match self.registry.get(workflow_id).await {
            Ok(workflow) => Ok(workflow),
            Err(OrchestratorError::NotFound { .. }) if token == PhaseToken::ApprovePlan => {
                match self.registry.create(workflow_id).await {
                    Ok(workflow) => {
                        info!(workflow_id = %workflow_id, "workflow created");
                        Ok(workflow)
                    }
                    // Lost a creation race; carry on with the winner's record.
                    Err(OrchestratorError::AlreadyExists { .. }) => {
                        self.registry.get(workflow_id).await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(OrchestratorError::NotFound { .. }) => Err(OrchestratorError::UnexpectedToken {
                workflow_id: Some(workflow_id.to_string()),
                expected: Some(PhaseToken::ApprovePlan),
                got: token.as_str().to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn run_phase<C>(
        &self,
        workflow: Workflow,
        target: Phase,
        token: PhaseToken,
        started_at: DateTime<Utc>,
        cancel: C,
    ) -> Result<AdvanceOutcome>
    where
        C: Future<Output = ()>,
    {
        let from = workflow.phase;
        obs::emit_advance_started(&workflow.id, from, target);
        self.publish(
            Topic::PhaseStarted,
            &workflow.id,
            target,
            json!({ "from": from, "token": token.as_str() }),
        );

        let evaluation = tokio::select! {
            evaluation = self.evaluate(&workflow, target) => evaluation?,
            _ = cancel => {
                info!(workflow_id = %workflow.id, phase = %target, "advance cancelled");
                self.registry
                    .record_attempt(
                        &workflow.id,
                        Attempt::cancelled(from, target, "cancelled by operator", started_at),
                    )
                    .await?;
                obs::emit_attempt_recorded(&workflow.id, target, "cancelled");
                return Err(OrchestratorError::Cancelled {
                    workflow_id: workflow.id,
                    phase: target,
                });
            }
        };

        match evaluation {
            Evaluation::AgentFailed(failure) => self.fail(workflow, failure, started_at).await,
            Evaluation::Rejected(rejection) => {
                METRICS.inc_handoff_rejections();
                let missing: Vec<String> =
                    rejection.missing.iter().map(|k| k.to_string()).collect();
                obs::emit_handoff_rejected(&workflow.id, target, &missing);
                let blocker = Blocker::handoff(target, &rejection.missing);
                self.registry
                    .record_attempt(
                        &workflow.id,
                        Attempt::blocked(from, target, vec![blocker.clone()], started_at),
                    )
                    .await?;
                self.publish(
                    Topic::HandoffRejected,
                    &workflow.id,
                    target,
                    json!({ "from_agent": rejection.from_agent, "missing": missing }),
                );
                self.publish(
                    Topic::GateFailed,
                    &workflow.id,
                    target,
                    json!({ "source": "handoff", "blockers": [blocker] }),
                );
                Err(rejection.into())
            }
            Evaluation::Evaluated { certificate, gates } => {
                obs::emit_gate_evaluated(
                    &workflow.id,
                    target,
                    gates.passed(),
                    &gates.failed_names(),
                );
                if !gates.passed() {
                    METRICS.inc_gate_failures();
                    let blockers = gates.blockers();
                    self.registry
                        .record_attempt(
                            &workflow.id,
                            Attempt::blocked(from, target, blockers.clone(), started_at),
                        )
                        .await?;
                    self.publish(
                        Topic::GateFailed,
                        &workflow.id,
                        target,
                        json!({ "source": "gate", "blockers": blockers }),
                    );
                    return Err(OrchestratorError::GateFailure {
                        phase: target,
                        blockers,
                    });
                }
                self.commit(workflow, target, certificate, gates, started_at)
                    .await
            }
        }
    }

    /// Agents, handoff and gates. Mutates nothing but the certificate table.
    async fn evaluate(&self, workflow: &Workflow, target: Phase) -> Result<Evaluation> {
        let (from_agent, produced) = match self.run_crew(workflow, target).await? {
            Ok(output) => output,
            Err(failure) => return Ok(Evaluation::AgentFailed(failure)),
        };

        let issued = match self
            .handoff
            .declare_ready(workflow, &from_agent, target, produced)
        {
            Ok(cert) => cert,
            Err(rejection) => return Ok(Evaluation::Rejected(rejection)),
        };
        issued.verify()?;
        self.publish(
            Topic::HandoffReady,
            &workflow.id,
            target,
            json!({
                "from_agent": issued.from_agent,
                "sequence": issued.sequence,
                "artifacts": issued.artifacts,
            }),
        );

        // Gates always judge the certificate that is current once they finish.
        let mut certificate = issued;
        let mut reruns = 0;
        loop {
            let ctx = GateContext::for_candidate(
                workflow,
                target,
                &certificate.artifacts,
                self.exec.clone(),
            );
            let gates = self.gates.run_gates(target, &ctx).await;
            match self.handoff.latest(&workflow.id, target) {
                Some(latest) if latest.sequence == certificate.sequence => {
                    return Ok(Evaluation::Evaluated { certificate, gates });
                }
                Some(latest) if reruns < MAX_GATE_RERUNS => {
                    debug!(
                        workflow_id = %workflow.id,
                        superseded = certificate.sequence,
                        current = latest.sequence,
                        "certificate superseded while gates ran; re-running gates"
                    );
                    latest.verify()?;
                    certificate = latest;
                    reruns += 1;
                }
                _ => {
                    return Err(OrchestratorError::HandoffSuperseded {
                        workflow_id: workflow.id.clone(),
                        to_phase: target,
                    })
                }
            }
        }
    }

    /// Run the crew for `target` in order. The outer `Result` is for
    /// configuration faults; the inner one for agent failure.
    async fn run_crew(
        &self,
        workflow: &Workflow,
        target: Phase,
    ) -> Result<std::result::Result<(String, ArtifactMap), CrewFailure>> {
        let crew = self.agents.crew(target);
        if crew.is_empty() {
            return Err(OrchestratorError::Configuration(format!(
                "no agent registered for phase {target}"
            )));
        }

        let mut produced = ArtifactMap::new();
        let mut last_agent = String::new();
        for runner in crew {
            let name = runner.name();
            let mut artifacts = workflow.artifacts.clone();
            artifacts.extend(produced.iter().map(|(k, v)| (*k, v.clone())));
            let invocation = AgentInvocation {
                workflow_id: workflow.id.clone(),
                phase: target,
                artifacts,
                work_dir: self.exec.work_dir.clone(),
                env: self.exec.env.clone(),
            };

            debug!(agent = %name, phase = %target, "agent started");
            let report = match AssertUnwindSafe(runner.run(&invocation))
                .catch_unwind()
                .await
            {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    return Ok(Err(CrewFailure {
                        agent: name,
                        reason: format!("{e:#}"),
                        diagnostics: Vec::new(),
                    }))
                }
                Err(panic) => {
                    return Ok(Err(CrewFailure {
                        agent: name,
                        reason: format!("agent panicked: {}", panic_message(panic.as_ref())),
                        diagnostics: Vec::new(),
                    }))
                }
            };
            if !report.is_success() {
                return Ok(Err(CrewFailure {
                    agent: name,
                    reason: "agent reported FAILURE".to_string(),
                    diagnostics: report.diagnostics,
                }));
            }
            debug!(
                agent = %name,
                produced = report.produced_artifacts.len(),
                "agent finished"
            );
            produced.extend(report.produced_artifacts);
            last_agent = name;
        }
        Ok(Ok((last_agent, produced)))
    }

    async fn commit(
        &self,
        workflow: Workflow,
        target: Phase,
        certificate: HandoffCertificate,
        gates: GateReport,
        started_at: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        let from = workflow.phase;
        if !self.handoff.is_current(&certificate) {
            return Err(OrchestratorError::HandoffSuperseded {
                workflow_id: workflow.id,
                to_phase: target,
            });
        }
        let committed = self
            .registry
            .commit_transition(
                &workflow.id,
                Transition::committed(from, target, started_at)
                    .with_artifacts(certificate.artifacts)
                    .with_gates(gates.clone()),
            )
            .await?;
        METRICS.inc_commits();
        obs::emit_phase_committed(&committed.id, target, committed.revision);
        self.publish(
            Topic::PhaseCompleted,
            &committed.id,
            target,
            json!({
                "from": from,
                "revision": committed.revision,
                "artifacts": committed.artifacts,
            }),
        );

        let workflow = if target == Phase::Merge {
            self.finish(committed, started_at).await?
        } else {
            committed
        };
        Ok(AdvanceOutcome::Committed { workflow, gates })
    }

    /// `MERGE -> DONE`: no agents, gates or handoff.
    async fn finish(&self, workflow: Workflow, started_at: DateTime<Utc>) -> Result<Workflow> {
        let done = self
            .registry
            .commit_transition(
                &workflow.id,
                Transition::committed(Phase::Merge, Phase::Done, started_at),
            )
            .await?;
        METRICS.inc_commits();
        obs::emit_phase_committed(&done.id, Phase::Done, done.revision);
        self.handoff.clear(&done.id);
        self.publish(
            Topic::WorkflowTerminated,
            &done.id,
            Phase::Done,
            json!({ "outcome": Phase::Done }),
        );
        Ok(done)
    }

    async fn fail(
        &self,
        workflow: Workflow,
        failure: CrewFailure,
        started_at: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        METRICS.inc_agent_failures();
        let CrewFailure {
            agent,
            reason,
            diagnostics,
        } = failure;
        let phase = workflow
            .phase
            .successor()
            .unwrap_or(workflow.phase);
        let failed = self
            .registry
            .commit_transition(
                &workflow.id,
                Transition::failed(
                    workflow.phase,
                    format!("agent {agent} failed during {phase}: {reason}"),
                    diagnostics.clone(),
                    started_at,
                ),
            )
            .await?;
        obs::emit_workflow_failed(&failed.id, phase, &reason);
        self.handoff.clear(&failed.id);
        self.publish(
            Topic::WorkflowTerminated,
            &failed.id,
            Phase::Failed,
            json!({ "outcome": Phase::Failed, "agent": agent, "reason": reason }),
        );
        Ok(AdvanceOutcome::Failed {
            workflow: failed,
            agent,
            reason,
            diagnostics,
        })
    }

    fn publish(&self, topic: Topic, workflow_id: &str, phase: Phase, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(topic, workflow_id, phase, payload));
    }
}
