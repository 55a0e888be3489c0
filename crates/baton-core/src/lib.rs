//! Baton Core Library
//!
//! Multi-agent workflow orchestration: a durable phase state machine driven
//! by operator tokens, with agent crews, handoff certificates, quality gates
//! and an in-process event bus.
//!
//! ## Layer 1 - Domain & Orchestration
//!
//! - `registry`: durable workflows with optimistic locking
//! - `bus`: typed publish/subscribe with isolated subscriber failures
//! - `gate`: per-phase quality gates, all run, AND-ed verdict
//! - `handoff`: required-artifact contracts and signed certificates
//! - `agent`: the agent runner seam and per-phase crews
//! - `controller`: `advance(workflow_id, token)`

pub mod agent;
pub mod bus;
pub mod controller;
pub mod domain;
pub mod gate;
pub mod handoff;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod telemetry;

pub use agent::{
    default_crew, AgentInvocation, AgentKind, AgentRegistry, AgentReport, AgentRunner,
    AgentStatus, StaticAgent,
};
pub use bus::{Event, EventBus, Handler, SubscriptionHandle, Topic, TracingSink};
pub use controller::{AdvanceOutcome, Orchestrator};
pub use domain::error::{EXIT_COMMITTED, EXIT_INTERNAL, EXIT_REJECTED, EXIT_USAGE};
pub use domain::{
    ArtifactKind, ArtifactMap, Blocker, BlockerSource, HistoryEntry, OrchestratorError, Outcome,
    Phase, PhaseToken, Result, Workflow,
};
pub use gate::{
    CheckOutcome, ExecutionContext, FnGate, GateContext, GateRegistry, GateReport, GateResult,
    QualityGate,
};
pub use handoff::{required_artifacts, HandoffCertificate, HandoffRejection, HandoffService};
pub use metrics::METRICS;
pub use registry::{Attempt, Transition, WorkflowRegistry};
pub use telemetry::init_tracing;

/// Crate version, reported by `orchestrator --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
