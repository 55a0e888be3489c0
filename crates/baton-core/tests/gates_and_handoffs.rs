//! Gate and handoff behaviour as seen through the controller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use baton_core::{
    AdvanceOutcome, AgentInvocation, AgentKind, AgentRegistry, AgentReport, AgentRunner,
    ArtifactKind, ArtifactMap, BlockerSource, CheckOutcome, Event, GateRegistry,
    HandoffService, Orchestrator, OrchestratorError, Outcome, Phase, StaticAgent, Topic,
    Workflow, WorkflowRegistry, EXIT_REJECTED, EXIT_USAGE,
};
use baton_state::fakes::MemoryWorkflowStore;

fn artifacts(pairs: &[(ArtifactKind, &str)]) -> ArtifactMap {
    pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
}

fn spec_agent() -> StaticAgent {
    StaticAgent::producing(
        AgentKind::Spec,
        artifacts(&[(ArtifactKind::Spec, "docs/specs/ISSUE-42.mdx")]),
    )
}

async fn orchestrator(agents: AgentRegistry, gates: Arc<GateRegistry>) -> Orchestrator {
    let registry = WorkflowRegistry::open(Arc::new(MemoryWorkflowStore::new()))
        .await
        .unwrap();
    Orchestrator::new(Arc::new(registry), agents).with_gates(gates)
}

fn record_topic(orch: &Orchestrator, topic: Topic) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    orch.bus().subscribe(topic, move |e| {
        sink.lock().unwrap().push(e.clone());
        Ok(())
    });
    seen
}

#[tokio::test]
async fn test_gate_failure_blocks_and_keeps_phase() {
    let lint_clean = Arc::new(AtomicBool::new(false));
    let gates = Arc::new(GateRegistry::new());
    let flag = Arc::clone(&lint_clean);
    gates.register_fn(Phase::Apply, "lint", move |_| {
        if flag.load(Ordering::SeqCst) {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail(vec!["src/invoice.rs:12: unused variable `total`".into()])
        }
    });
    gates.register_fn(Phase::Apply, "build", |_| CheckOutcome::pass());
    gates.register_fn(Phase::Apply, "test", |_| {
        CheckOutcome::fail(vec!["2 of 48 tests failed".into()])
    });

    let agents = AgentRegistry::new().with(Phase::Plan, spec_agent()).with(
        Phase::Apply,
        StaticAgent::producing(AgentKind::Impl, artifacts(&[(ArtifactKind::Diff, "patch-1")])),
    );
    let orch = orchestrator(agents, Arc::clone(&gates)).await;
    let gate_events = record_topic(&orch, Topic::GateFailed);

    orch.advance("42", "APPROVE PLAN").await.unwrap();
    let err = orch.advance("42", "APPLY").await.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_REJECTED);
    match &err {
        OrchestratorError::GateFailure { phase, blockers } => {
            assert_eq!(*phase, Phase::Apply);
            // Every failing gate is reported, not just the first.
            let names: Vec<&str> = blockers.iter().map(|b| b.name.as_str()).collect();
            assert_eq!(names, vec!["lint", "test"]);
        }
        other => panic!("expected GateFailure, got {other:?}"),
    }
    assert!(err.to_string().contains("unused variable `total`"));

    let wf = orch.registry().get("42").await.unwrap();
    assert_eq!(wf.phase, Phase::Plan);
    assert_eq!(wf.blockers.len(), 2);
    assert!(!wf.artifacts.contains_key(&ArtifactKind::Diff));
    assert!(matches!(
        wf.history.last().unwrap().outcome,
        Outcome::Blocked { .. }
    ));
    assert_eq!(gate_events.lock().unwrap().len(), 1);

    // Fix one gate: still blocked by the other.
    lint_clean.store(true, Ordering::SeqCst);
    let err = orch.advance("42", "APPLY").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::GateFailure { ref blockers, .. } if blockers.len() == 1
    ));
    assert_eq!(orch.registry().get("42").await.unwrap().blockers.len(), 1);

    // Fresh all-pass run clears blockers and commits.
    gates.register_fn(Phase::Apply, "test", |_| CheckOutcome::pass());
    let outcome = orch.advance("42", "APPLY").await.unwrap();
    let wf = outcome.workflow();
    assert_eq!(wf.phase, Phase::Apply);
    assert!(wf.blockers.is_empty());
    // PLAN, blocked APPLY, blocked APPLY, APPLY
    assert_eq!(wf.history.len(), 4);
    assert!(wf.history.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn test_handoff_rejection_names_missing_artifacts() {
    let agents = AgentRegistry::new()
        .with(Phase::Plan, spec_agent())
        .with(
            Phase::Apply,
            StaticAgent::producing(AgentKind::Impl, artifacts(&[(ArtifactKind::Diff, "patch-1")])),
        )
        .with(
            Phase::Test,
            // QA forgets the test report.
            StaticAgent::producing(AgentKind::Qa, artifacts(&[(ArtifactKind::QaReport, "qa.md")])),
        );
    let orch = orchestrator(agents, Arc::new(GateRegistry::new())).await;
    let rejections = record_topic(&orch, Topic::HandoffRejected);
    let gate_failed = record_topic(&orch, Topic::GateFailed);

    orch.advance("42", "APPROVE PLAN").await.unwrap();
    orch.advance("42", "APPLY").await.unwrap();
    let err = orch.advance("42", "TEST").await.unwrap_err();
    match &err {
        OrchestratorError::HandoffRejection {
            from_agent,
            to_phase,
            missing,
            ..
        } => {
            assert_eq!(from_agent, "qa");
            assert_eq!(*to_phase, Phase::Test);
            assert_eq!(missing, &vec![ArtifactKind::TestReport]);
        }
        other => panic!("expected HandoffRejection, got {other:?}"),
    }
    assert_eq!(err.exit_code(), EXIT_REJECTED);

    let wf = orch.registry().get("42").await.unwrap();
    assert_eq!(wf.phase, Phase::Apply);
    assert_eq!(wf.blockers.len(), 1);
    assert_eq!(wf.blockers[0].source, BlockerSource::Handoff);
    assert!(!wf.artifacts.contains_key(&ArtifactKind::QaReport));

    assert_eq!(rejections.lock().unwrap().len(), 1);
    let gate_event = gate_failed.lock().unwrap()[0].clone();
    assert_eq!(gate_event.payload["source"], "handoff");
}

/// Impl agent that declares an early handoff itself before retrying and
/// returning its final patch.
struct RetryingImpl {
    handoff: Arc<HandoffService>,
    registry: Arc<WorkflowRegistry>,
}

#[async_trait]
impl AgentRunner for RetryingImpl {
    fn kind(&self) -> AgentKind {
        AgentKind::Impl
    }

    async fn run(&self, invocation: &AgentInvocation) -> anyhow::Result<AgentReport> {
        let workflow = self.registry.get(&invocation.workflow_id).await?;
        self.handoff
            .declare_ready(
                &workflow,
                "impl",
                Phase::Apply,
                artifacts(&[(ArtifactKind::Diff, "patch-draft")]),
            )
            .map_err(|r| anyhow::anyhow!("unexpected rejection: {:?}", r.missing))?;
        Ok(AgentReport::success(artifacts(&[(
            ArtifactKind::Diff,
            "patch-final",
        )])))
    }
}

#[tokio::test]
async fn test_only_latest_declaration_is_honoured() {
    let registry = Arc::new(
        WorkflowRegistry::open(Arc::new(MemoryWorkflowStore::new()))
            .await
            .unwrap(),
    );
    let handoff = Arc::new(HandoffService::new());
    let agents = AgentRegistry::new().with(Phase::Plan, spec_agent()).with(
        Phase::Apply,
        RetryingImpl {
            handoff: Arc::clone(&handoff),
            registry: Arc::clone(&registry),
        },
    );
    let orch = Orchestrator::new(Arc::clone(&registry), agents).with_handoff(Arc::clone(&handoff));

    orch.advance("42", "APPROVE PLAN").await.unwrap();
    let wf = orch.advance("42", "APPLY").await.unwrap().workflow().clone();
    assert_eq!(wf.artifacts[&ArtifactKind::Diff], "patch-final");

    let honoured = handoff.latest("42", Phase::Apply).unwrap();
    assert_eq!(honoured.artifacts[&ArtifactKind::Diff], "patch-final");
    assert!(handoff.is_current(&honoured));
    // PLAN certificate plus the two APPLY declarations.
    assert_eq!(honoured.sequence, 3);
}

#[tokio::test]
async fn test_missing_requirement_satisfied_by_committed_artifact() {
    // PR requires diff and prUrl; diff was committed in APPLY.
    let agents = AgentRegistry::new()
        .with(Phase::Plan, spec_agent())
        .with(
            Phase::Apply,
            StaticAgent::producing(AgentKind::Impl, artifacts(&[(ArtifactKind::Diff, "patch-1")])),
        )
        .with(
            Phase::Test,
            StaticAgent::producing(
                AgentKind::Qa,
                artifacts(&[(ArtifactKind::TestReport, "junit.xml")]),
            ),
        )
        .with(
            Phase::Pr,
            StaticAgent::producing(
                AgentKind::Docs,
                artifacts(&[(ArtifactKind::PrUrl, "https://git.example/acme/pull/42")]),
            ),
        );
    let orch = orchestrator(agents, Arc::new(GateRegistry::new())).await;
    for token in ["APPROVE PLAN", "APPLY", "TEST", "PR"] {
        let outcome = orch.advance("42", token).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Committed { .. }));
    }
    let cert = orch.handoff().latest("42", Phase::Pr).unwrap();
    assert!(cert.required_artifacts_present);
    cert.verify().unwrap();
}

#[tokio::test]
async fn test_gates_see_committed_and_candidate_artifacts() {
    let gates = Arc::new(GateRegistry::new());
    gates.register_fn(Phase::Apply, "spec-and-diff", |ctx| {
        let ok = ctx.artifacts.contains_key(&ArtifactKind::Spec)
            && ctx.artifacts.get(&ArtifactKind::Diff).map(String::as_str) == Some("patch-1");
        if ok {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail(vec![format!("saw {:?}", ctx.artifacts)])
        }
    });
    let agents = AgentRegistry::new().with(Phase::Plan, spec_agent()).with(
        Phase::Apply,
        StaticAgent::producing(AgentKind::Impl, artifacts(&[(ArtifactKind::Diff, "patch-1")])),
    );
    let orch = orchestrator(agents, gates).await;
    orch.advance("42", "APPROVE PLAN").await.unwrap();
    orch.advance("42", "APPLY").await.unwrap();
}

#[tokio::test]
async fn test_redeclaration_during_gates_is_the_one_committed() {
    let handoff = Arc::new(HandoffService::new());
    let gates = Arc::new(GateRegistry::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let (svc, counter) = (Arc::clone(&handoff), Arc::clone(&runs));
    gates.register_fn(Phase::Apply, "review", move |ctx| {
        // The first run sees the controller's certificate and a reviewer
        // re-declares with a revised patch before it finishes.
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            let wf = Workflow::new(&ctx.workflow_id);
            svc.declare_ready(
                &wf,
                "impl",
                Phase::Apply,
                artifacts(&[(ArtifactKind::Diff, "patch-2")]),
            )
            .unwrap();
        }
        CheckOutcome::pass()
    });
    let agents = AgentRegistry::new().with(Phase::Plan, spec_agent()).with(
        Phase::Apply,
        StaticAgent::producing(AgentKind::Impl, artifacts(&[(ArtifactKind::Diff, "patch-1")])),
    );
    let registry = WorkflowRegistry::open(Arc::new(MemoryWorkflowStore::new()))
        .await
        .unwrap();
    let orch = Orchestrator::new(Arc::new(registry), agents)
        .with_gates(gates)
        .with_handoff(Arc::clone(&handoff));

    orch.advance("42", "APPROVE PLAN").await.unwrap();
    let wf = orch.advance("42", "APPLY").await.unwrap().workflow().clone();

    let honoured = handoff.latest("42", Phase::Apply).unwrap();
    assert_eq!(honoured.artifacts[&ArtifactKind::Diff], "patch-2");
    assert_eq!(wf.artifacts[&ArtifactKind::Diff], "patch-2");
    // Gates ran again against the newer certificate.
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_endless_redeclaration_is_refused_without_commit() {
    let handoff = Arc::new(HandoffService::new());
    let gates = Arc::new(GateRegistry::new());
    let svc = Arc::clone(&handoff);
    gates.register_fn(Phase::Apply, "review", move |ctx| {
        let wf = Workflow::new(&ctx.workflow_id);
        svc.declare_ready(
            &wf,
            "impl",
            Phase::Apply,
            artifacts(&[(ArtifactKind::Diff, "patch-again")]),
        )
        .unwrap();
        CheckOutcome::pass()
    });
    let agents = AgentRegistry::new().with(Phase::Plan, spec_agent()).with(
        Phase::Apply,
        StaticAgent::producing(AgentKind::Impl, artifacts(&[(ArtifactKind::Diff, "patch-1")])),
    );
    let registry = WorkflowRegistry::open(Arc::new(MemoryWorkflowStore::new()))
        .await
        .unwrap();
    let orch = Orchestrator::new(Arc::new(registry), agents)
        .with_gates(gates)
        .with_handoff(handoff);

    orch.advance("42", "APPROVE PLAN").await.unwrap();
    let err = orch.advance("42", "APPLY").await.unwrap_err();
    assert!(
        matches!(err, OrchestratorError::HandoffSuperseded { to_phase: Phase::Apply, .. }),
        "{err:?}"
    );
    assert_eq!(err.exit_code(), EXIT_USAGE);
    let wf = orch.registry().get("42").await.unwrap();
    assert_eq!(wf.phase, Phase::Plan);
    assert!(!wf.artifacts.contains_key(&ArtifactKind::Diff));
}
