//! Agent runner seam.
//!
//! Agents are typed executors resolved at startup into per-phase crews. The
//! controller invokes the crew for the *target* phase, in order, each member
//! seeing the artifacts produced by the members before it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactMap, OrchestratorError, Phase, Result};

/// The seven agent archetypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Spec,
    Tests,
    Impl,
    Qa,
    Security,
    Docs,
    Release,
}

impl AgentKind {
    pub const ALL: [AgentKind; 7] = [
        AgentKind::Spec,
        AgentKind::Tests,
        AgentKind::Impl,
        AgentKind::Qa,
        AgentKind::Security,
        AgentKind::Docs,
        AgentKind::Release,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Spec => "spec",
            AgentKind::Tests => "tests",
            AgentKind::Impl => "impl",
            AgentKind::Qa => "qa",
            AgentKind::Security => "security",
            AgentKind::Docs => "docs",
            AgentKind::Release => "release",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        AgentKind::ALL
            .into_iter()
            .find(|k| k.as_str() == lowered)
            .ok_or_else(|| OrchestratorError::Configuration(format!("unknown agent kind: {s}")))
    }
}

/// Default crew for each working phase.
pub fn default_crew(phase: Phase) -> &'static [AgentKind] {
    match phase {
        Phase::Plan => &[AgentKind::Spec],
        Phase::Apply => &[AgentKind::Tests, AgentKind::Impl],
        Phase::Test => &[AgentKind::Qa, AgentKind::Security],
        Phase::Pr => &[AgentKind::Docs],
        Phase::Merge => &[AgentKind::Release],
        Phase::Intake | Phase::Done | Phase::Failed => &[],
    }
}

/// Input handed to an agent. Owned copy; agents never see the live record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub workflow_id: String,
    pub phase: Phase,
    pub artifacts: ArtifactMap,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Success,
    Failure,
}

/// What an agent hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub produced_artifacts: ArtifactMap,
    pub status: AgentStatus,
    pub diagnostics: Vec<String>,
}

impl AgentReport {
    pub fn success(produced_artifacts: ArtifactMap) -> Self {
        Self {
            produced_artifacts,
            status: AgentStatus::Success,
            diagnostics: Vec::new(),
        }
    }

    pub fn failure(diagnostics: Vec<String>) -> Self {
        Self {
            produced_artifacts: ArtifactMap::new(),
            status: AgentStatus::Failure,
            diagnostics,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Success
    }
}

/// A phase-specific executor.
///
/// Returning `Err` or a `FAILURE` report is unrecoverable for the workflow.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Display name used in certificates and logs.
    fn name(&self) -> String {
        self.kind().as_str().to_string()
    }

    async fn run(&self, invocation: &AgentInvocation) -> anyhow::Result<AgentReport>;
}

/// Phase -> ordered crew of runners.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    crews: BTreeMap<Phase, Vec<Arc<dyn AgentRunner>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `runner` to the crew for `phase`.
    pub fn register(&mut self, phase: Phase, runner: Arc<dyn AgentRunner>) -> &mut Self {
        self.crews.entry(phase).or_default().push(runner);
        self
    }

    /// Builder form of [`AgentRegistry::register`].
    pub fn with(mut self, phase: Phase, runner: impl AgentRunner + 'static) -> Self {
        self.register(phase, Arc::new(runner));
        self
    }

    pub fn crew(&self, phase: Phase) -> &[Arc<dyn AgentRunner>] {
        self.crews.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every working phase needs at least one runner.
    pub fn validate_complete(&self) -> Result<()> {
        let missing: Vec<&str> = Phase::WORKING
            .into_iter()
            .filter(|p| self.crew(*p).is_empty())
            .map(Phase::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Configuration(format!(
                "no agent registered for phase(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// `(phase, runner names)` for display.
    pub fn describe(&self) -> Vec<(Phase, Vec<String>)> {
        self.crews
            .iter()
            .map(|(phase, crew)| (*phase, crew.iter().map(|r| r.name()).collect()))
            .collect()
    }
}

/// Runner with a fixed answer. Useful for dry runs and tests.
#[derive(Debug, Clone)]
pub struct StaticAgent {
    kind: AgentKind,
    report: AgentReport,
}

impl StaticAgent {
    pub fn producing(kind: AgentKind, artifacts: ArtifactMap) -> Self {
        Self {
            kind,
            report: AgentReport::success(artifacts),
        }
    }

    pub fn failing(kind: AgentKind, diagnostics: Vec<String>) -> Self {
        Self {
            kind,
            report: AgentReport::failure(diagnostics),
        }
    }
}

#[async_trait]
impl AgentRunner for StaticAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn run(&self, _invocation: &AgentInvocation) -> anyhow::Result<AgentReport> {
        Ok(self.report.clone())
    }
}
