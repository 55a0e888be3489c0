//! Command-backed and artifact-presence quality gates.

use async_trait::async_trait;
use baton_core::{ArtifactKind, CheckOutcome, GateContext, QualityGate};

use crate::runner::{workflow_env, CommandRunner};
use crate::stage::CommandSpec;

/// Passes when its command exits 0.
///
/// A non-zero exit fails the gate with the tail of the command output.
/// Spawn failures and timeouts surface as errors, which the gate registry
/// records as a failed result carrying the error text.
pub struct CommandGate {
    spec: CommandSpec,
}

impl CommandGate {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

#[async_trait]
impl QualityGate for CommandGate {
    async fn check(&self, ctx: &GateContext) -> anyhow::Result<CheckOutcome> {
        let env = workflow_env(&ctx.workflow_id, ctx.phase, &ctx.artifacts);
        let output = CommandRunner::run(&self.spec, &ctx.exec, &env).await?;
        if output.passed() {
            Ok(CheckOutcome::pass())
        } else {
            Ok(CheckOutcome::fail(output.diagnostics()))
        }
    }

    fn describe(&self) -> String {
        let mut text = self.spec.display();
        if self.spec.timeout_secs > 0 {
            text.push_str(&format!(" (timeout {}s)", self.spec.timeout_secs));
        }
        text
    }
}

/// Requires artifacts to be present among committed and candidate
/// artifacts.
pub struct ArtifactGate {
    required: Vec<ArtifactKind>,
}

impl ArtifactGate {
    pub fn new(required: impl IntoIterator<Item = ArtifactKind>) -> Self {
        Self {
            required: required.into_iter().collect(),
        }
    }
}

#[async_trait]
impl QualityGate for ArtifactGate {
    async fn check(&self, ctx: &GateContext) -> anyhow::Result<CheckOutcome> {
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|k| !ctx.artifacts.contains_key(k))
            .map(|k| format!("artifact `{k}` not produced"))
            .collect();
        if missing.is_empty() {
            Ok(CheckOutcome::pass())
        } else {
            Ok(CheckOutcome::fail(missing))
        }
    }

    fn describe(&self) -> String {
        let kinds: Vec<&str> = self.required.iter().map(|k| k.as_str()).collect();
        format!("requires {}", kinds.join(", "))
    }
}
