//! Check and command definitions.

use std::fmt;
use std::str::FromStr;

use baton_core::Phase;
use serde::{Deserialize, Serialize};

use crate::error::{CommandError, Result};

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Built-in quality checks for a Cargo workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinCheck {
    /// cargo build --workspace
    Build,

    /// cargo check --workspace --all-targets
    Typecheck,

    /// cargo clippy --workspace --all-targets -- -D warnings
    Lint,

    /// cargo test --workspace
    Test,

    /// cargo audit
    SecurityAudit,
}

impl BuiltinCheck {
    pub const ALL: [BuiltinCheck; 5] = [
        BuiltinCheck::Build,
        BuiltinCheck::Typecheck,
        BuiltinCheck::Lint,
        BuiltinCheck::Test,
        BuiltinCheck::SecurityAudit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinCheck::Build => "build",
            BuiltinCheck::Typecheck => "typecheck",
            BuiltinCheck::Lint => "lint",
            BuiltinCheck::Test => "test",
            BuiltinCheck::SecurityAudit => "security_audit",
        }
    }

    pub fn command(&self) -> Vec<String> {
        let args: &[&str] = match self {
            BuiltinCheck::Build => &["cargo", "build", "--workspace"],
            BuiltinCheck::Typecheck => &["cargo", "check", "--workspace", "--all-targets"],
            BuiltinCheck::Lint => &[
                "cargo",
                "clippy",
                "--workspace",
                "--all-targets",
                "--",
                "-D",
                "warnings",
            ],
            BuiltinCheck::Test => &["cargo", "test", "--workspace"],
            BuiltinCheck::SecurityAudit => &["cargo", "audit"],
        };
        args.iter().map(|s| s.to_string()).collect()
    }

    /// Phase the check guards when the config does not say otherwise.
    pub fn default_phase(&self) -> Phase {
        match self {
            BuiltinCheck::Build | BuiltinCheck::Typecheck | BuiltinCheck::Lint => Phase::Apply,
            BuiltinCheck::Test | BuiltinCheck::SecurityAudit => Phase::Test,
        }
    }
}

impl fmt::Display for BuiltinCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BuiltinCheck {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        BuiltinCheck::ALL
            .into_iter()
            .find(|c| c.name() == wanted)
            .ok_or_else(|| CommandError::Config(format!("unknown builtin check `{s}`")))
    }
}

/// An external command with a name and timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Human-readable name, used as the gate name.
    pub name: String,

    /// Command to execute (first element is the executable).
    pub command: Vec<String>,

    /// Timeout in seconds; 0 disables the timeout.
    pub timeout_secs: u64,

    pub enabled: bool,
}

impl CommandSpec {
    pub fn from_builtin(check: BuiltinCheck, timeout_secs: u64) -> Self {
        Self {
            name: check.name().to_string(),
            command: check.command(),
            timeout_secs,
            enabled: true,
        }
    }

    pub fn custom(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            timeout_secs,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Executable and arguments.
    pub fn program(&self) -> Result<(&str, &[String])> {
        match self.command.split_first() {
            Some((exe, args)) if !exe.trim().is_empty() => Ok((exe.as_str(), args)),
            _ => Err(CommandError::EmptyCommand {
                name: self.name.clone(),
            }),
        }
    }

    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_check_names() {
        assert_eq!(BuiltinCheck::Build.name(), "build");
        assert_eq!(BuiltinCheck::Typecheck.name(), "typecheck");
        assert_eq!(BuiltinCheck::Lint.name(), "lint");
        assert_eq!(BuiltinCheck::Test.name(), "test");
        assert_eq!(BuiltinCheck::SecurityAudit.name(), "security_audit");
    }

    #[test]
    fn test_builtin_check_commands() {
        let lint = BuiltinCheck::Lint.command();
        assert_eq!(lint[0], "cargo");
        assert!(lint.contains(&"warnings".to_string()));

        let audit = BuiltinCheck::SecurityAudit.command();
        assert_eq!(audit, vec!["cargo", "audit"]);
    }

    #[test]
    fn test_builtin_check_parse() {
        assert_eq!(
            "security-audit".parse::<BuiltinCheck>().unwrap(),
            BuiltinCheck::SecurityAudit
        );
        assert_eq!(" LINT ".parse::<BuiltinCheck>().unwrap(), BuiltinCheck::Lint);
        assert!("fmt".parse::<BuiltinCheck>().is_err());
    }

    #[test]
    fn test_builtin_default_phases() {
        assert_eq!(BuiltinCheck::Lint.default_phase(), Phase::Apply);
        assert_eq!(BuiltinCheck::Test.default_phase(), Phase::Test);
        assert_eq!(BuiltinCheck::SecurityAudit.default_phase(), Phase::Test);
    }

    #[test]
    fn test_command_spec_from_builtin() {
        let spec = CommandSpec::from_builtin(BuiltinCheck::Typecheck, 300);
        assert_eq!(spec.name, "typecheck");
        assert_eq!(spec.timeout_secs, 300);
        assert!(spec.enabled);
        assert!(!spec.clone().disabled().enabled);
    }

    #[test]
    fn test_empty_command_has_no_program() {
        let spec = CommandSpec::custom("nothing", vec![], 60);
        assert!(matches!(
            spec.program(),
            Err(CommandError::EmptyCommand { ref name }) if name == "nothing"
        ));

        let spec = CommandSpec::custom("echo", vec!["echo".into(), "hi".into()], 60);
        let (exe, args) = spec.program().unwrap();
        assert_eq!(exe, "echo");
        assert_eq!(args, ["hi".to_string()]);
    }
}
