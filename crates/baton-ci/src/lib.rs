//! Baton CI - external tools as gates and agents
//!
//! Provides the process plumbing behind the orchestrator:
//! - Runs commands with timeouts and the workflow environment
//! - Adapts commands into quality gates and agent runners
//! - Loads `pipeline.toml` into agent and gate registries

pub mod agent;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod runner;
pub mod stage;

// Re-export key types
pub use agent::{parse_artifacts, CommandAgent};
pub use error::{CommandError, Result};
pub use gate::{ArtifactGate, CommandGate};
pub use pipeline::{PipelineConfig, DEFAULT_PIPELINE};
pub use runner::{workflow_env, CommandOutput, CommandRunner};
pub use stage::{BuiltinCheck, CommandSpec, DEFAULT_TIMEOUT_SECS};
