//! Agent runners backed by external commands.
//!
//! A command agent is any executable. It runs in the work directory with the
//! workflow environment (see [`workflow_env`]) and reports the artifacts it
//! produced on stdout, one per line:
//!
//! ```text
//! artifact:diff=refs/baton/42/patch-1
//! artifact:testReport=target/nextest/junit.xml
//! ```
//!
//! A later line for the same kind overrides an earlier one. Any non-zero
//! exit is an agent failure.

use async_trait::async_trait;
use baton_core::{
    AgentInvocation, AgentKind, AgentReport, AgentRunner, ArtifactKind, ArtifactMap,
    ExecutionContext,
};
use tracing::info;

use crate::error::{CommandError, Result};
use crate::runner::{workflow_env, CommandRunner};
use crate::stage::CommandSpec;

const ARTIFACT_PREFIX: &str = "artifact:";

pub struct CommandAgent {
    kind: AgentKind,
    spec: CommandSpec,
}

impl CommandAgent {
    pub fn new(kind: AgentKind, spec: CommandSpec) -> Self {
        Self { kind, spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

/// Collect `artifact:<kind>=<ref>` lines from `stdout`.
pub fn parse_artifacts(name: &str, stdout: &str) -> Result<ArtifactMap> {
    let mut artifacts = ArtifactMap::new();
    for line in stdout.lines().map(str::trim) {
        let Some(rest) = line.strip_prefix(ARTIFACT_PREFIX) else {
            continue;
        };
        let malformed = || CommandError::MalformedArtifact {
            name: name.to_string(),
            line: line.to_string(),
        };
        let (kind, reference) = rest.split_once('=').ok_or_else(malformed)?;
        let kind: ArtifactKind = kind.trim().parse().map_err(|_| malformed())?;
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(malformed());
        }
        artifacts.insert(kind, reference.to_string());
    }
    Ok(artifacts)
}

#[async_trait]
impl AgentRunner for CommandAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn run(&self, invocation: &AgentInvocation) -> anyhow::Result<AgentReport> {
        let exec = ExecutionContext {
            work_dir: invocation.work_dir.clone(),
            env: invocation.env.clone(),
        };
        let env = workflow_env(&invocation.workflow_id, invocation.phase, &invocation.artifacts);
        let output = CommandRunner::run(&self.spec, &exec, &env).await?;

        if !output.passed() {
            return Ok(AgentReport::failure(output.diagnostics()));
        }
        let produced = parse_artifacts(&self.spec.name, &output.stdout)?;
        info!(
            agent = %self.kind,
            phase = %invocation.phase,
            artifacts = produced.len(),
            duration_ms = output.duration_ms,
            "agent command finished"
        );
        Ok(AgentReport::success(produced))
    }
}
