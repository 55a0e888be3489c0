//! Quality gate framework.
//!
//! Gates are registered per `(phase, name)`; re-registering a key replaces
//! the previous check. [`GateRegistry::run_gates`] runs every gate for a
//! phase to completion, concurrently, and never stops at the first failure.
//! The phase verdict is the AND of all results.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::bus::panic_message;
use crate::domain::{ArtifactMap, Blocker, Phase, Workflow};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Where external tools run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub work_dir: PathBuf,
    /// Extra environment passed to child processes.
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            env: BTreeMap::new(),
        }
    }
}

impl ExecutionContext {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Everything a gate may look at: a copy of the workflow's artifacts
/// (committed plus the candidate handoff's) and the execution context.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub workflow_id: String,
    pub phase: Phase,
    pub artifacts: ArtifactMap,
    pub exec: ExecutionContext,
}

impl GateContext {
    /// Build a context for `phase` from the workflow's committed artifacts
    /// overlaid with `candidate`.
    pub fn for_candidate(
        workflow: &Workflow,
        phase: Phase,
        candidate: &ArtifactMap,
        exec: ExecutionContext,
    ) -> Self {
        let mut artifacts = workflow.artifacts.clone();
        artifacts.extend(candidate.iter().map(|(k, v)| (*k, v.clone())));
        Self {
            workflow_id: workflow.id.clone(),
            phase,
            artifacts,
            exec,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a check returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub diagnostics: Vec<String>,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn fail(diagnostics: Vec<String>) -> Self {
        Self {
            passed: false,
            diagnostics,
        }
    }
}

/// One gate's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub diagnostics: Vec<String>,
    pub duration_ms: u64,
}

/// Every result for one phase, sorted by gate name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub phase: Phase,
    pub results: Vec<GateResult>,
}

impl GateReport {
    /// A phase with no registered gates passes.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &GateResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failures().map(|r| r.name.clone()).collect()
    }

    /// Blockers for every failed gate.
    pub fn blockers(&self) -> Vec<Blocker> {
        self.failures()
            .map(|r| Blocker::gate(r.name.clone(), r.diagnostics.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// A named validation check bound to a phase.
///
/// An `Err` (or a panic) counts as a failed result carrying the error text.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn check(&self, ctx: &GateContext) -> anyhow::Result<CheckOutcome>;

    /// Short description for `orchestrator gates`.
    fn describe(&self) -> String {
        String::new()
    }
}

/// Adapts a pure function over the gate context.
pub struct FnGate<F> {
    check: F,
}

impl<F> FnGate<F>
where
    F: Fn(&GateContext) -> CheckOutcome + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F> QualityGate for FnGate<F>
where
    F: Fn(&GateContext) -> CheckOutcome + Send + Sync,
{
    async fn check(&self, ctx: &GateContext) -> anyhow::Result<CheckOutcome> {
        Ok((self.check)(ctx))
    }

    fn describe(&self) -> String {
        "function check".to_string()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type GateKey = (Phase, String);

/// Registry of gates keyed by `(phase, name)`.
#[derive(Default)]
pub struct GateRegistry {
    gates: RwLock<BTreeMap<GateKey, Arc<dyn QualityGate>>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `gate`, replacing any gate with the same `(phase, name)`.
    pub fn register_gate(
        &self,
        phase: Phase,
        name: impl Into<String>,
        gate: impl QualityGate + 'static,
    ) {
        let name = name.into();
        let replaced = self
            .gates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((phase, name.clone()), Arc::new(gate))
            .is_some();
        if replaced {
            tracing::debug!(phase = %phase, gate = %name, "gate replaced");
        }
    }

    pub fn register_fn<F>(&self, phase: Phase, name: impl Into<String>, check: F)
    where
        F: Fn(&GateContext) -> CheckOutcome + Send + Sync + 'static,
    {
        self.register_gate(phase, name, FnGate::new(check));
    }

    pub fn unregister(&self, phase: Phase, name: &str) -> bool {
        self.gates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(phase, name.to_string()))
            .is_some()
    }

    pub fn gate_names(&self, phase: Phase) -> Vec<String> {
        self.snapshot(phase).into_iter().map(|(n, _)| n).collect()
    }

    /// `(phase, name, description)` for every registered gate.
    pub fn registered(&self) -> Vec<(Phase, String, String)> {
        self.gates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|((phase, name), gate)| (*phase, name.clone(), gate.describe()))
            .collect()
    }

    fn snapshot(&self, phase: Phase) -> Vec<(String, Arc<dyn QualityGate>)> {
        self.gates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((p, _), _)| *p == phase)
            .map(|((_, name), gate)| (name.clone(), Arc::clone(gate)))
            .collect()
    }

    /// Run every gate registered for `phase`.
    pub async fn run_gates(&self, phase: Phase, ctx: &GateContext) -> GateReport {
        let gates = self.snapshot(phase);
        let runs = gates.into_iter().map(|(name, gate)| async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(gate.check(ctx)).catch_unwind().await;
            let (passed, diagnostics) = match outcome {
                Ok(Ok(o)) => (o.passed, o.diagnostics),
                Ok(Err(e)) => (false, vec![format!("gate error: {e:#}")]),
                Err(panic) => (
                    false,
                    vec![format!("gate panicked: {}", panic_message(panic.as_ref()))],
                ),
            };
            GateResult {
                name,
                passed,
                diagnostics,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        });

        // Snapshot order is (phase, name), so results come back sorted.
        let results = join_all(runs).await;
        GateReport { phase, results }
    }
}
