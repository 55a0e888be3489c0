//! `pipeline.toml`: which commands run as agents and gates for each phase.
//!
//! ```toml
//! [defaults]
//! timeout_secs = 900
//!
//! [[agents]]
//! phase = "APPLY"
//! kind = "impl"
//! command = ["./scripts/agents/impl.sh"]
//!
//! [[gates]]
//! phase = "APPLY"
//! check = "lint"
//!
//! [[gates]]
//! phase = "TEST"
//! name = "coverage"
//! command = ["./scripts/coverage.sh", "--min", "80"]
//! timeout_secs = 1200
//!
//! [[gates]]
//! phase = "MERGE"
//! name = "reports"
//! require = ["qaReport", "securityReport"]
//! ```

use std::path::Path;

use baton_core::{AgentKind, AgentRegistry, ArtifactKind, GateRegistry, Phase};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::CommandAgent;
use crate::error::{CommandError, Result};
use crate::gate::{ArtifactGate, CommandGate};
use crate::stage::{BuiltinCheck, CommandSpec, DEFAULT_TIMEOUT_SECS};

/// Built-in pipeline used when no config file exists.
///
/// Agents are scripts under `scripts/agents/` in the work directory, one per
/// agent kind; gates are the builtin Cargo checks.
pub const DEFAULT_PIPELINE: &str = r#"
[defaults]
timeout_secs = 600

[[agents]]
phase = "PLAN"
kind = "spec"
command = ["scripts/agents/spec.sh"]

[[agents]]
phase = "APPLY"
kind = "tests"
command = ["scripts/agents/tests.sh"]

[[agents]]
phase = "APPLY"
kind = "impl"
command = ["scripts/agents/impl.sh"]
timeout_secs = 1800

[[agents]]
phase = "TEST"
kind = "qa"
command = ["scripts/agents/qa.sh"]

[[agents]]
phase = "TEST"
kind = "security"
command = ["scripts/agents/security.sh"]

[[agents]]
phase = "PR"
kind = "docs"
command = ["scripts/agents/docs.sh"]

[[agents]]
phase = "MERGE"
kind = "release"
command = ["scripts/agents/release.sh"]

[[gates]]
check = "build"

[[gates]]
check = "typecheck"

[[gates]]
check = "lint"

[[gates]]
check = "test"

[[gates]]
check = "security_audit"
"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentEntry {
    pub phase: Phase,
    pub kind: AgentKind,
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// One gate: a builtin `check`, a custom `command`, or a `require` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GateEntry {
    /// Defaults to the builtin check's phase.
    pub phase: Option<Phase>,
    pub name: Option<String>,
    pub check: Option<BuiltinCheck>,
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub require: Vec<ArtifactKind>,
    pub timeout_secs: Option<u64>,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub gates: Vec<GateEntry>,
}

/// A gate entry resolved to its phase, name and implementation.
enum ResolvedGate {
    Command(CommandSpec),
    Artifacts(Vec<ArtifactKind>),
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(DEFAULT_PIPELINE)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CommandError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(
            path = %path.display(),
            agents = config.agents.len(),
            gates = config.gates.len(),
            "pipeline config loaded"
        );
        Ok(config)
    }

    /// `path` if it exists, otherwise the built-in pipeline.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no pipeline config, using built-in defaults");
            Self::builtin()
        }
    }

    fn validate(&self) -> Result<()> {
        for agent in &self.agents {
            if !agent.phase.is_working() {
                return Err(CommandError::Config(format!(
                    "agent `{}` is bound to {}, which runs no agents",
                    agent.kind, agent.phase
                )));
            }
            if agent.command.is_empty() {
                return Err(CommandError::Config(format!(
                    "agent `{}` for {} has an empty command",
                    agent.kind, agent.phase
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for gate in &self.gates {
            let (phase, name, _) = self.resolve_gate(gate)?;
            if !seen.insert((phase, name.clone())) {
                return Err(CommandError::Config(format!(
                    "gate `{name}` declared twice for {phase}"
                )));
            }
        }
        Ok(())
    }

    fn resolve_gate(&self, gate: &GateEntry) -> Result<(Phase, String, ResolvedGate)> {
        let timeout = gate.timeout_secs.unwrap_or(self.defaults.timeout_secs);
        let sources = [
            gate.check.is_some(),
            gate.command.is_some(),
            !gate.require.is_empty(),
        ];
        if sources.iter().filter(|s| **s).count() != 1 {
            return Err(CommandError::Config(format!(
                "gate {} must set exactly one of `check`, `command` or `require`",
                gate.name.as_deref().unwrap_or("<unnamed>")
            )));
        }

        let (phase, name, resolved) = match (&gate.check, &gate.command) {
            (Some(check), _) => (
                gate.phase.unwrap_or_else(|| check.default_phase()),
                gate.name.clone().unwrap_or_else(|| check.name().to_string()),
                ResolvedGate::Command(CommandSpec::from_builtin(*check, timeout)),
            ),
            (None, Some(command)) => {
                let (phase, name) = self.require_phase_and_name(gate, "command")?;
                (
                    phase,
                    name.clone(),
                    ResolvedGate::Command(CommandSpec::custom(name, command.clone(), timeout)),
                )
            }
            (None, None) => {
                let (phase, name) = self.require_phase_and_name(gate, "require")?;
                (phase, name, ResolvedGate::Artifacts(gate.require.clone()))
            }
        };

        if !phase.is_working() {
            return Err(CommandError::Config(format!(
                "gate `{name}` is bound to {phase}, which has no gates"
            )));
        }
        Ok((phase, name, resolved))
    }

    fn require_phase_and_name(&self, gate: &GateEntry, what: &str) -> Result<(Phase, String)> {
        match (gate.phase, &gate.name) {
            (Some(phase), Some(name)) if !name.trim().is_empty() => Ok((phase, name.clone())),
            _ => Err(CommandError::Config(format!(
                "`{what}` gates need both `phase` and `name`"
            ))),
        }
    }

    /// Command agents for every configured phase, in file order.
    pub fn build_agents(&self) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for entry in &self.agents {
            let spec = CommandSpec::custom(
                format!("{}-agent", entry.kind),
                entry.command.clone(),
                entry.timeout_secs.unwrap_or(self.defaults.timeout_secs),
            );
            registry.register(
                entry.phase,
                std::sync::Arc::new(CommandAgent::new(entry.kind, spec)),
            );
        }
        registry
    }

    /// Register every enabled gate into `registry`.
    pub fn register_gates(&self, registry: &GateRegistry) -> Result<usize> {
        let mut count = 0;
        for entry in self.gates.iter().filter(|g| g.enabled) {
            let (phase, name, resolved) = self.resolve_gate(entry)?;
            match resolved {
                ResolvedGate::Command(spec) => {
                    registry.register_gate(phase, name, CommandGate::new(spec))
                }
                ResolvedGate::Artifacts(kinds) => {
                    registry.register_gate(phase, name, ArtifactGate::new(kinds))
                }
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn build_gates(&self) -> Result<GateRegistry> {
        let registry = GateRegistry::new();
        self.register_gates(&registry)?;
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_pipeline_is_complete() {
        let config = PipelineConfig::builtin().unwrap();
        let agents = config.build_agents();
        agents.validate_complete().unwrap();
        assert_eq!(
            agents.crew(Phase::Apply).iter().map(|a| a.kind()).collect::<Vec<_>>(),
            vec![AgentKind::Tests, AgentKind::Impl]
        );

        let gates = config.build_gates().unwrap();
        assert_eq!(gates.gate_names(Phase::Apply), vec!["build", "lint", "typecheck"]);
        assert_eq!(gates.gate_names(Phase::Test), vec!["security_audit", "test"]);
    }

    #[test]
    fn test_builtin_check_phase_override() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [[gates]]
            phase = "PR"
            check = "test"
            "#,
        )
        .unwrap();
        let gates = config.build_gates().unwrap();
        assert_eq!(gates.gate_names(Phase::Pr), vec!["test"]);
        assert!(gates.gate_names(Phase::Test).is_empty());
    }

    #[test]
    fn test_custom_and_require_gates() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [defaults]
            timeout_secs = 42

            [[gates]]
            phase = "TEST"
            name = "coverage"
            command = ["./coverage.sh"]

            [[gates]]
            phase = "MERGE"
            name = "reports"
            require = ["qaReport", "securityReport"]

            [[gates]]
            check = "lint"
            enabled = false
            "#,
        )
        .unwrap();
        let gates = config.build_gates().unwrap();
        let registered = gates.registered();
        assert_eq!(registered.len(), 2);
        assert!(registered.contains(&(
            Phase::Test,
            "coverage".to_string(),
            "./coverage.sh (timeout 42s)".to_string()
        )));
        assert!(registered.contains(&(
            Phase::Merge,
            "reports".to_string(),
            "requires qaReport, securityReport".to_string()
        )));
    }

    #[test]
    fn test_gate_needs_exactly_one_source() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[gates]]
            phase = "TEST"
            name = "both"
            check = "test"
            command = ["true"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one"), "{err}");

        let err = PipelineConfig::from_toml_str(
            r#"
            [[gates]]
            command = ["true"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("need both"), "{err}");
    }

    #[test]
    fn test_rejects_terminal_and_duplicate_bindings() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[agents]]
            phase = "DONE"
            kind = "release"
            command = ["true"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("runs no agents"), "{err}");

        let err = PipelineConfig::from_toml_str(
            r#"
            [[gates]]
            check = "lint"

            [[gates]]
            check = "lint"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("declared twice"), "{err}");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = PipelineConfig::from_toml_str(
            "[[agents]]\nphase = \"PLAN\"\nkind = \"spec\"\ncmd = [\"x\"]\n",
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::ConfigParse(_)));
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("pipeline.toml");
        let config = PipelineConfig::load_or_default(&missing).unwrap();
        assert_eq!(config, PipelineConfig::builtin().unwrap());

        std::fs::write(
            &missing,
            "[[agents]]\nphase = \"PLAN\"\nkind = \"spec\"\ncommand = [\"./spec.sh\"]\n",
        )
        .unwrap();
        let config = PipelineConfig::load_or_default(&missing).unwrap();
        assert_eq!(config.agents.len(), 1);
        assert!(config.build_agents().validate_complete().is_err());
    }
}
