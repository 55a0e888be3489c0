//! External command execution.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use baton_core::{ArtifactMap, ExecutionContext, Phase};
use tokio::process::Command;
use tracing::debug;

use crate::error::{CommandError, Result};
use crate::stage::CommandSpec;

/// Diagnostic lines kept from a failing command's output.
const DIAGNOSTIC_TAIL: usize = 20;

/// Result of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub name: String,

    /// Exit code; -1 when killed by a signal.
    pub exit_code: i32,

    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// Tail of stderr (or stdout when stderr is empty), prefixed by the
    /// exit status.
    pub fn diagnostics(&self) -> Vec<String> {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(DIAGNOSTIC_TAIL);

        let mut out = vec![format!("`{}` exited with code {}", self.name, self.exit_code)];
        out.extend(lines[skip..].iter().map(|l| l.to_string()));
        out
    }
}

/// Environment handed to every command run for a workflow.
///
/// `BATON_WORKFLOW_ID`, `BATON_PHASE` and one `BATON_ARTIFACT_<KIND>` per
/// committed or candidate artifact.
pub fn workflow_env(
    workflow_id: &str,
    phase: Phase,
    artifacts: &ArtifactMap,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("BATON_WORKFLOW_ID".to_string(), workflow_id.to_string());
    env.insert("BATON_PHASE".to_string(), phase.to_string());
    for (kind, reference) in artifacts {
        env.insert(
            format!("BATON_ARTIFACT_{}", screaming_snake(kind.as_str())),
            reference.clone(),
        );
    }
    env
}

/// `testReport` -> `TEST_REPORT`
fn screaming_snake(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for c in camel.chars() {
        if c.is_ascii_uppercase() && !out.is_empty() {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

/// Runs `CommandSpec`s as child processes.
pub struct CommandRunner;

impl CommandRunner {
    /// Execute `spec` in `exec.work_dir`.
    ///
    /// The child is killed if the timeout elapses or the returned future is
    /// dropped, so cancelling an advance never leaves an orphaned process.
    pub async fn run(
        spec: &CommandSpec,
        exec: &ExecutionContext,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput> {
        let start = Instant::now();
        let (exe, args) = spec.program()?;

        debug!(command = %spec.name, work_dir = %exec.work_dir.display(), "spawning");
        let child = Command::new(exe)
            .args(args)
            .current_dir(&exec.work_dir)
            .envs(&exec.env)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                name: spec.name.clone(),
                source,
            })?;

        let wait = child.wait_with_output();
        let waited = if spec.timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(spec.timeout_secs), wait)
                .await
                .map_err(|_| CommandError::Timeout {
                    name: spec.name.clone(),
                    secs: spec.timeout_secs,
                })?
        } else {
            wait.await
        };
        let output = waited.map_err(|source| CommandError::Io {
            name: spec.name.clone(),
            source,
        })?;

        let result = CommandOutput {
            name: spec.name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            command = %spec.name,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "command finished"
        );
        Ok(result)
    }
}
