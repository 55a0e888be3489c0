//! The durable workflow record: phase pointer, append-only history,
//! committed artifacts and outstanding blockers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::OrchestratorError;
use crate::domain::phase::Phase;

/// Kinds of artifact an agent can hand over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactKind {
    Spec,
    Diff,
    TestReport,
    QaReport,
    SecurityReport,
    Docs,
    PrUrl,
    MergeCommit,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 8] = [
        ArtifactKind::Spec,
        ArtifactKind::Diff,
        ArtifactKind::TestReport,
        ArtifactKind::QaReport,
        ArtifactKind::SecurityReport,
        ArtifactKind::Docs,
        ArtifactKind::PrUrl,
        ArtifactKind::MergeCommit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Spec => "spec",
            ArtifactKind::Diff => "diff",
            ArtifactKind::TestReport => "testReport",
            ArtifactKind::QaReport => "qaReport",
            ArtifactKind::SecurityReport => "securityReport",
            ArtifactKind::Docs => "docs",
            ArtifactKind::PrUrl => "prUrl",
            ArtifactKind::MergeCommit => "mergeCommit",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = OrchestratorError;

    /// Accepts `testReport`, `test_report`, `TEST_REPORT` and `test-report`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();
        ArtifactKind::ALL
            .into_iter()
            .find(|k| k.as_str().to_ascii_lowercase() == folded)
            .ok_or_else(|| OrchestratorError::Configuration(format!("unknown artifact kind: {s}")))
    }
}

/// Artifact kind -> reference (path, URL or hash).
pub type ArtifactMap = BTreeMap<ArtifactKind, String>;

/// Where a blocker came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerSource {
    Gate,
    Handoff,
}

/// An unresolved failure that prevents advancing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub source: BlockerSource,
    /// Gate name, or the target phase for handoff blockers.
    pub name: String,
    pub diagnostics: Vec<String>,
}

impl Blocker {
    pub fn gate(name: impl Into<String>, diagnostics: Vec<String>) -> Self {
        Self {
            source: BlockerSource::Gate,
            name: name.into(),
            diagnostics,
        }
    }

    pub fn handoff(to_phase: Phase, missing: &[ArtifactKind]) -> Self {
        Self {
            source: BlockerSource::Handoff,
            name: format!("handoff:{to_phase}"),
            diagnostics: missing
                .iter()
                .map(|k| format!("missing required artifact `{k}`"))
                .collect(),
        }
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            BlockerSource::Gate => write!(f, "gate `{}` failed", self.name)?,
            BlockerSource::Handoff => write!(f, "{} rejected", self.name)?,
        }
        if !self.diagnostics.is_empty() {
            write!(f, ": {}", self.diagnostics.join("; "))?;
        }
        Ok(())
    }
}

/// How a history entry ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Phase entered and committed.
    Committed,
    /// Attempt rejected by a gate or handoff; phase unchanged.
    Blocked { reasons: Vec<String> },
    /// Operator cancelled the attempt; retry-eligible.
    Cancelled { reason: String },
    /// Unrecoverable agent failure; only ever on a `FAILED` entry.
    Failed {
        reason: String,
        diagnostics: Vec<String>,
    },
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed)
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// 1-based commit order within the workflow.
    pub seq: u64,
    /// Phase entered (or attempted).
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    /// `None` for terminal entries.
    pub exited_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
}

/// The durable record for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub phase: Phase,
    pub history: Vec<HistoryEntry>,
    pub artifacts: ArtifactMap,
    pub blockers: Vec<Blocker>,
    pub created_at: DateTime<Utc>,
    /// Storage revision this view was read at; not part of the document.
    #[serde(skip)]
    pub revision: u64,
}

impl Workflow {
    /// A new workflow waiting in `INTAKE`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: Phase::Intake,
            history: Vec::new(),
            artifacts: ArtifactMap::new(),
            blockers: Vec::new(),
            created_at: Utc::now(),
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Only the entries that moved the phase pointer.
    pub fn committed_phases(&self) -> Vec<Phase> {
        self.history
            .iter()
            .filter(|e| e.outcome.is_committed() || e.phase == Phase::Failed)
            .map(|e| e.phase)
            .collect()
    }

    /// Human-readable one-line blocker summary.
    pub fn blocker_summary(&self) -> Option<String> {
        if self.blockers.is_empty() {
            return None;
        }
        Some(
            self.blockers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" | "),
        )
    }

    pub(crate) fn append(
        &mut self,
        phase: Phase,
        entered_at: DateTime<Utc>,
        exited_at: Option<DateTime<Utc>>,
        outcome: Outcome,
    ) {
        let seq = self.history.len() as u64 + 1;
        self.history.push(HistoryEntry {
            seq,
            phase,
            entered_at,
            exited_at,
            outcome,
        });
    }
}
