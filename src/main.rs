//! Thin CLI surface for agent-exec-engine.
//!
//! Runs a single task through one agent's executor and prints normalized
//! entries once the run completes. This is a smoke-test harness, not a
//! front-end: the real integration surface is the library crate.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent_exec_engine::executor::{
    ClaudeExecutor, CodexExecutor, CopilotExecutor, CursorExecutor, GeminiExecutor,
};
use agent_exec_engine::{
    AgentExecutor, Config, EngineConfig, ExecutionEngine, ProcessManager, Result, ShutdownManager,
    Task,
};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AgentKind {
    Claude,
    Codex,
    Cursor,
    Copilot,
    Gemini,
}

#[derive(Parser)]
#[command(name = "agent-exec-engine")]
#[command(author, version, about = "Run one task through one agent executor")]
struct Cli {
    /// Which agent CLI to drive.
    #[arg(long, value_enum, default_value = "claude")]
    agent: AgentKind,

    /// Prompt text to submit.
    prompt: String,

    /// Working directory for the spawned process.
    #[arg(long, default_value = ".")]
    cwd: PathBuf,

    /// Configuration file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let manager = ProcessManager::new();

    let executor: Arc<dyn AgentExecutor> = match cli.agent {
        AgentKind::Claude => Arc::new(ClaudeExecutor::new(config.claude.clone(), manager.clone())),
        AgentKind::Codex => Arc::new(CodexExecutor::new(config.codex.clone(), manager.clone())),
        AgentKind::Cursor => Arc::new(CursorExecutor::new(config.cursor.clone(), manager.clone())),
        AgentKind::Copilot => {
            Arc::new(CopilotExecutor::new(config.copilot.clone(), manager.clone()))
        }
        AgentKind::Gemini => Arc::new(GeminiExecutor::new(config.gemini.clone(), manager.clone())),
    };

    if !executor.check_availability().await {
        eprintln!("warning: {} binary not found on PATH", executor.name());
    }

    let shutdown = Arc::new(ShutdownManager::new(config.shutdown.graceful_timeout));
    shutdown.clone().install_signal_handlers();

    let engine = ExecutionEngine::new(
        executor,
        manager,
        EngineConfig {
            max_concurrent: config.engine.max_concurrent,
        },
    );

    let task = Task::new(cli.prompt, cli.cwd);
    let task_id = engine.submit_task(task).await?;
    let result = engine.wait_for_task(&task_id).await?;

    for entry in &result.entries {
        println!("{}", serde_json::to_string(entry)?);
    }
    if let Some(session_id) = &result.session_id {
        eprintln!("session_id: {session_id}");
    }

    Ok(())
}
