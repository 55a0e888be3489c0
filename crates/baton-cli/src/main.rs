//! Baton - multi-agent workflow orchestrator CLI
//!
//! The `orchestrator` command moves one unit of work (an issue) through
//! `PLAN -> APPLY -> TEST -> PR -> MERGE` one operator token at a time.
//!
//! ## Commands
//!
//! - `advance`: run the next phase's agents and gates, commit on success
//! - `status`: current phase, artifacts, blockers and the next token
//! - `history`: the audit log of one workflow
//! - `list`: every known workflow
//! - `gates`: configured agent crews and quality gates
//!
//! ## Exit codes
//!
//! `0` committed, `1` rejected (gate, handoff or agent failure), `2` usage or
//! stale state, `3` storage or internal failure.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use baton_ci::PipelineConfig;
use baton_core::{
    AdvanceOutcome, ArtifactKind, Blocker, ExecutionContext, GateRegistry, Orchestrator,
    OrchestratorError, Outcome, Phase, PhaseToken, TracingSink, Workflow, WorkflowRegistry,
    EXIT_COMMITTED, EXIT_INTERNAL, EXIT_REJECTED, EXIT_USAGE, METRICS,
};
use baton_state::fakes::MemoryWorkflowStore;
use baton_state::{FsWorkflowStore, StorageError, SurrealWorkflowStore, WorkflowStore};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, Level};

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(author = "Stevedores Org")]
#[command(version = baton_core::VERSION)]
#[command(about = "Multi-agent workflow orchestrator", long_about = None)]
struct Cli {
    /// State directory (workflow store, default pipeline config)
    #[arg(long, env = "BATON_HOME", default_value = ".baton", global = true)]
    home: PathBuf,

    /// Workflow store backend
    #[arg(long, env = "BATON_STORE", value_enum, default_value_t = StoreKind::Fs, global = true)]
    store: StoreKind,

    /// Pipeline config (default: <home>/pipeline.toml, built-in if absent)
    #[arg(long, env = "BATON_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory agents and gates run in
    #[arg(long, default_value = ".", global = true)]
    work_dir: PathBuf,

    /// SurrealDB endpoint for `--store surreal`
    #[arg(long, env = "SURREALDB_URL", hide_env_values = true, global = true)]
    surreal_url: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output and JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Advance a workflow by one phase
    Advance {
        /// Workflow (issue) id
        #[arg(long)]
        issue: String,

        /// Phase token: "APPROVE PLAN", APPLY, TEST, PR or MERGE
        #[arg(long)]
        token: String,
    },

    /// Show a workflow's current state
    Status {
        #[arg(long)]
        issue: String,
    },

    /// Show a workflow's history
    History {
        #[arg(long)]
        issue: String,
    },

    /// List all workflows
    List,

    /// Show configured agents and quality gates
    Gates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// JSON files under <home>/workflows
    Fs,
    /// SurrealDB (SURREALDB_URL, or SurrealKV under <home>/db)
    Surreal,
    /// Process-local; nothing survives the command
    Memory,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    baton_core::init_tracing(cli.json, level);

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(err) => {
            let code = exit_code_for(&err);
            if code == EXIT_INTERNAL {
                error!(error = %format!("{err:#}"), "orchestrator failed");
            }
            if cli.json {
                println!("{}", json!(ErrorReport::from_error(&err)));
            } else {
                eprintln!("error: {err:#}");
            }
            code
        }
    };

    METRICS.flush();
    ExitCode::from(code as u8)
}

async fn run(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Advance { issue, token } => cmd_advance(cli, issue, token).await,
        Commands::Status { issue } => cmd_status(cli, issue).await.map(|_| EXIT_COMMITTED),
        Commands::History { issue } => cmd_history(cli, issue).await.map(|_| EXIT_COMMITTED),
        Commands::List => cmd_list(cli).await.map(|_| EXIT_COMMITTED),
        Commands::Gates => cmd_gates(cli).map(|_| EXIT_COMMITTED),
    }
}

/// Map an error chain to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<OrchestratorError>() {
            return e.exit_code();
        }
        if let Some(StorageError::InvalidWorkflowId { .. }) = cause.downcast_ref::<StorageError>() {
            return EXIT_USAGE;
        }
    }
    EXIT_INTERNAL
}

/// Body printed for a failed command under `--json`.
#[derive(Debug, Default, Serialize)]
struct ErrorReport {
    error: String,
    exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<Phase>,
    /// Failing gates with their diagnostics.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blockers: Vec<Blocker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_agent: Option<String>,
    /// Output tail of a failed agent.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    diagnostics: Vec<String>,
    /// Artifacts a rejected handoff lacked.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    missing: Vec<ArtifactKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actual_phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Operator spelling, e.g. `APPROVE PLAN`.
    next_token: Option<&'static str>,
}

impl ErrorReport {
    fn from_error(err: &anyhow::Error) -> Self {
        let mut report = ErrorReport {
            error: format!("{err:#}"),
            exit_code: exit_code_for(err),
            ..Default::default()
        };
        let Some(cause) = err
            .chain()
            .find_map(|c| c.downcast_ref::<OrchestratorError>())
        else {
            return report;
        };
        match cause {
            OrchestratorError::GateFailure { phase, blockers } => {
                report.phase = Some(*phase);
                report.blockers = blockers.clone();
            }
            OrchestratorError::HandoffRejection {
                from_agent,
                to_phase,
                missing,
                ..
            } => {
                report.phase = Some(*to_phase);
                report.from_agent = Some(from_agent.clone());
                report.missing = missing.clone();
            }
            OrchestratorError::StaleState {
                expected, actual, ..
            } => {
                report.expected_phase = Some(*expected);
                report.actual_phase = Some(*actual);
            }
            OrchestratorError::UnexpectedToken { expected, .. } => {
                report.next_token = (*expected).map(PhaseToken::as_str);
            }
            OrchestratorError::HandoffSuperseded { to_phase, .. }
            | OrchestratorError::Cancelled {
                phase: to_phase, ..
            } => {
                report.phase = Some(*to_phase);
            }
            OrchestratorError::AgentRunnerFailure {
                phase,
                agent,
                diagnostics,
                ..
            } => {
                report.phase = Some(*phase);
                report.from_agent = Some(agent.clone());
                report.diagnostics = diagnostics.clone();
            }
            _ => {}
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn open_store(cli: &Cli) -> Result<Arc<dyn WorkflowStore>> {
    let store: Arc<dyn WorkflowStore> = match cli.store {
        StoreKind::Fs => Arc::new(
            FsWorkflowStore::open(&cli.home).with_context(|| {
                format!("Failed to open workflow store in {}", cli.home.display())
            })?,
        ),
        StoreKind::Surreal => {
            let store = match &cli.surreal_url {
                Some(url) => SurrealWorkflowStore::connect(url).await,
                None => SurrealWorkflowStore::from_env(&cli.home).await,
            };
            Arc::new(store.context("Failed to connect to workflow database")?)
        }
        StoreKind::Memory => Arc::new(MemoryWorkflowStore::new()),
    };
    debug!(store = ?cli.store, home = %cli.home.display(), "workflow store opened");
    Ok(store)
}

async fn open_registry(cli: &Cli) -> Result<Arc<WorkflowRegistry>> {
    let store = open_store(cli).await?;
    let registry = WorkflowRegistry::open(store)
        .await
        .context("Failed to load workflows")?;
    Ok(Arc::new(registry))
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| cli.home.join("pipeline.toml"))
}

fn load_pipeline(cli: &Cli) -> Result<PipelineConfig> {
    let path = config_path(cli);
    // An explicit path must exist.
    let loaded = match &cli.config {
        Some(_) => PipelineConfig::load(&path),
        None => PipelineConfig::load_or_default(&path),
    };
    loaded.with_context(|| format!("Failed to load pipeline config {}", path.display()))
}

async fn build_orchestrator(cli: &Cli) -> Result<Orchestrator> {
    let pipeline = load_pipeline(cli)?;
    let agents = pipeline.build_agents();
    agents.validate_complete()?;
    let gates = Arc::new(pipeline.build_gates()?);
    let registry = open_registry(cli).await?;

    let orchestrator = Orchestrator::new(registry, agents)
        .with_gates(gates)
        .with_exec(ExecutionContext::new(&cli.work_dir));
    TracingSink::attach(orchestrator.bus());
    Ok(orchestrator)
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// The token an operator issues next, if any.
fn next_token(workflow: &Workflow) -> Option<PhaseToken> {
    if workflow.phase == Phase::Merge {
        return Some(PhaseToken::Merge);
    }
    workflow.phase.successor().and_then(PhaseToken::for_target)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_advance(cli: &Cli, issue: &str, token: &str) -> Result<i32> {
    let orchestrator = build_orchestrator(cli).await?;
    let outcome = orchestrator
        .advance_until(issue, token, interrupted())
        .await?;

    let workflow = outcome.workflow();
    if cli.json {
        let body = match &outcome {
            AdvanceOutcome::Committed { workflow, gates } => json!({
                "status": "committed",
                "workflow": workflow,
                "revision": workflow.revision,
                "gates": gates,
            }),
            AdvanceOutcome::Failed {
                workflow,
                agent,
                reason,
                diagnostics,
            } => json!({
                "status": "failed",
                "workflow": workflow,
                "revision": workflow.revision,
                "agent": agent,
                "reason": reason,
                "diagnostics": diagnostics,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(outcome.exit_code());
    }

    match &outcome {
        AdvanceOutcome::Committed { gates, .. } => {
            println!("Workflow {} is now in {}", workflow.id, workflow.phase);
            for result in &gates.results {
                println!(
                    "  gate {:<16} passed ({} ms)",
                    result.name, result.duration_ms
                );
            }
            match next_token(workflow) {
                Some(next) => println!("Next token: {next}"),
                None => println!("Workflow complete."),
            }
        }
        AdvanceOutcome::Failed {
            agent,
            reason,
            diagnostics,
            ..
        } => {
            println!("Workflow {} FAILED: agent {agent}: {reason}", workflow.id);
            for line in diagnostics {
                println!("  {line}");
            }
            println!("Start a new workflow to retry.");
        }
    }
    Ok(outcome.exit_code())
}

async fn cmd_status(cli: &Cli, issue: &str) -> Result<()> {
    let registry = open_registry(cli).await?;
    let workflow = registry.get(issue).await?;
    let next = next_token(&workflow);

    if cli.json {
        let body = json!({
            "workflow": workflow,
            "revision": workflow.revision,
            "next_token": next.map(PhaseToken::as_str),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Workflow: {}", workflow.id);
    println!("Phase:    {}", workflow.phase);
    println!("Revision: {}", workflow.revision);
    println!(
        "Created:  {}",
        workflow.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(next) = next {
        println!("Next:     {next}");
    }
    if !workflow.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for (kind, reference) in &workflow.artifacts {
            println!("  {kind:<16} {reference}");
        }
    }
    if !workflow.blockers.is_empty() {
        println!();
        println!("Blockers:");
        for blocker in &workflow.blockers {
            println!("  {blocker}");
        }
    }
    Ok(())
}

fn describe_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Committed => "committed".to_string(),
        Outcome::Blocked { reasons } => format!("blocked: {}", reasons.join(" | ")),
        Outcome::Cancelled { reason } => format!("cancelled: {reason}"),
        Outcome::Failed { reason, .. } => format!("failed: {reason}"),
    }
}

async fn cmd_history(cli: &Cli, issue: &str) -> Result<()> {
    let registry = open_registry(cli).await?;
    let history = registry.history(issue).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No history for workflow {issue}");
        return Ok(());
    }
    for entry in &history {
        let exited = entry
            .exited_at
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3}  {:<6}  {}  {:>8}  {}",
            entry.seq,
            entry.phase.as_str(),
            entry.entered_at.format("%Y-%m-%d %H:%M:%S"),
            exited,
            describe_outcome(&entry.outcome)
        );
    }
    Ok(())
}

async fn cmd_list(cli: &Cli) -> Result<()> {
    let registry = open_registry(cli).await?;
    let workflows = registry.list().await?;

    if cli.json {
        let rows: Vec<_> = workflows
            .iter()
            .map(|w| {
                json!({
                    "id": w.id,
                    "phase": w.phase,
                    "revision": w.revision,
                    "blockers": w.blockers.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!("No workflows");
        return Ok(());
    }
    for w in &workflows {
        let blocked = if w.blockers.is_empty() {
            String::new()
        } else {
            format!("  ({} blocker(s))", w.blockers.len())
        };
        println!("{:<24} {:<6}{blocked}", w.id, w.phase.as_str());
    }
    Ok(())
}

fn cmd_gates(cli: &Cli) -> Result<()> {
    let pipeline = load_pipeline(cli)?;
    let agents = pipeline.build_agents();
    let gates = GateRegistry::new();
    pipeline.register_gates(&gates)?;

    if cli.json {
        let body = json!({
            "agents": agents
                .describe()
                .into_iter()
                .map(|(phase, names)| json!({ "phase": phase, "crew": names }))
                .collect::<Vec<_>>(),
            "gates": gates
                .registered()
                .into_iter()
                .map(|(phase, name, description)| {
                    json!({ "phase": phase, "name": name, "description": description })
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    print_source(&config_path(cli));
    for phase in Phase::WORKING {
        println!("{phase}");
        let crew: Vec<String> = agents
            .describe()
            .into_iter()
            .filter(|(p, _)| *p == phase)
            .flat_map(|(_, names)| names)
            .collect();
        println!(
            "  agents: {}",
            if crew.is_empty() {
                "(none)".to_string()
            } else {
                crew.join(" -> ")
            }
        );
        let registered = gates.registered();
        for (_, name, description) in registered.iter().filter(|(p, _, _)| *p == phase) {
            println!("  gate {name:<16} {description}");
        }
    }
    Ok(())
}

fn print_source(path: &Path) {
    if path.exists() {
        println!("Pipeline: {}", path.display());
    } else {
        println!("Pipeline: built-in defaults");
    }
    println!();
}
