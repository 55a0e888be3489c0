//! Phase state machine and the operator tokens that drive it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::OrchestratorError;

/// Position of a workflow in the fixed phase order.
///
/// `Intake` is where a freshly created workflow waits for its first token;
/// it never appears in history. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Intake,
    Plan,
    Apply,
    Test,
    Pr,
    Merge,
    Done,
    Failed,
}

impl Phase {
    /// The working phases that run agents, in order.
    pub const WORKING: [Phase; 5] = [
        Phase::Plan,
        Phase::Apply,
        Phase::Test,
        Phase::Pr,
        Phase::Merge,
    ];

    /// Immediate successor in `INTAKE -> PLAN -> APPLY -> TEST -> PR -> MERGE -> DONE`.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Intake => Some(Phase::Plan),
            Phase::Plan => Some(Phase::Apply),
            Phase::Apply => Some(Phase::Test),
            Phase::Test => Some(Phase::Pr),
            Phase::Pr => Some(Phase::Merge),
            Phase::Merge => Some(Phase::Done),
            Phase::Done | Phase::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    pub fn is_working(self) -> bool {
        Phase::WORKING.contains(&self)
    }

    /// Whether `self -> to` is a legal edge: the immediate successor, or
    /// `FAILED` from any non-terminal phase.
    pub fn can_transition_to(self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Phase::Failed || self.successor() == Some(to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Intake => "INTAKE",
            Phase::Plan => "PLAN",
            Phase::Apply => "APPLY",
            Phase::Test => "TEST",
            Phase::Pr => "PR",
            Phase::Merge => "MERGE",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let phase = match s.trim().to_ascii_uppercase().as_str() {
            "INTAKE" => Phase::Intake,
            "PLAN" => Phase::Plan,
            "APPLY" => Phase::Apply,
            "TEST" => Phase::Test,
            "PR" => Phase::Pr,
            "MERGE" => Phase::Merge,
            "DONE" => Phase::Done,
            "FAILED" => Phase::Failed,
            other => {
                return Err(OrchestratorError::Configuration(format!(
                    "unknown phase: {other}"
                )))
            }
        };
        Ok(phase)
    }
}

/// Operator-facing instruction naming the next phase to advance into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseToken {
    ApprovePlan,
    Apply,
    Test,
    Pr,
    Merge,
}

impl PhaseToken {
    /// The phase this token advances into.
    pub fn target(self) -> Phase {
        match self {
            PhaseToken::ApprovePlan => Phase::Plan,
            PhaseToken::Apply => Phase::Apply,
            PhaseToken::Test => Phase::Test,
            PhaseToken::Pr => Phase::Pr,
            PhaseToken::Merge => Phase::Merge,
        }
    }

    /// The token an operator must issue to enter `phase`, if one exists.
    pub fn for_target(phase: Phase) -> Option<PhaseToken> {
        match phase {
            Phase::Plan => Some(PhaseToken::ApprovePlan),
            Phase::Apply => Some(PhaseToken::Apply),
            Phase::Test => Some(PhaseToken::Test),
            Phase::Pr => Some(PhaseToken::Pr),
            Phase::Merge => Some(PhaseToken::Merge),
            Phase::Intake | Phase::Done | Phase::Failed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseToken::ApprovePlan => "APPROVE PLAN",
            PhaseToken::Apply => "APPLY",
            PhaseToken::Test => "TEST",
            PhaseToken::Pr => "PR",
            PhaseToken::Merge => "MERGE",
        }
    }
}

impl fmt::Display for PhaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseToken {
    type Err = OrchestratorError;

    /// Case-insensitive; `_`, `-` and runs of whitespace all separate words.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        match normalized.as_str() {
            "APPROVE PLAN" => Ok(PhaseToken::ApprovePlan),
            "APPLY" => Ok(PhaseToken::Apply),
            "TEST" => Ok(PhaseToken::Test),
            "PR" => Ok(PhaseToken::Pr),
            "MERGE" => Ok(PhaseToken::Merge),
            _ => Err(OrchestratorError::UnexpectedToken {
                workflow_id: None,
                expected: None,
                got: s.to_string(),
            }),
        }
    }
}
