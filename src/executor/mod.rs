//! Component F: Agent Executor.
//!
//! One façade per agent kind, uniform contract, differing availability
//! (§4.F). Each implementation owns only argument assembly and wire-format
//! knowledge; spawning is delegated to [`crate::process::ProcessManager`]
//! and event translation to a [`crate::normalize::Normalizer`].

mod claude;
mod codex;
mod copilot;
mod cursor;
mod gemini;

pub use claude::{ClaudeExecutor, ClaudeExecutorConfig};
pub use codex::{CodexExecutor, CodexExecutorConfig};
pub use copilot::{CopilotExecutor, CopilotExecutorConfig};
pub use cursor::{CursorExecutor, CursorExecutorConfig};
pub use gemini::{GeminiExecutor, GeminiExecutorConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalService;
use crate::control::ControlPeer;
use crate::error::{Error, Result};
use crate::normalize::{normalize_chunks, NormalizedEntry, Normalizer};
use crate::output::OutputChunk;
use crate::process::ProcessManager;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireProtocol {
    StreamJson,
    Jsonl,
    Acp,
    JsonRpc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_session_resume: bool,
    pub requires_setup: bool,
    pub supports_approvals: bool,
    pub supports_mcp: bool,
    pub wire_protocol: WireProtocol,
    pub supports_mid_execution_messaging: bool,
}

/// A live or completed execution returned by `execute_task`/`resume_task`.
pub struct ExecutionHandle {
    pub process_id: String,
    pub control: Option<Arc<ControlPeer>>,
    pub(crate) output: tokio_stream::wrappers::ReceiverStream<OutputChunk>,
}

impl ExecutionHandle {
    /// Drain the remaining output and normalize it in one shot. Streaming
    /// callers should instead read `output` directly and feed a
    /// [`Normalizer`] incrementally; this is the convenience path used by
    /// the smoke-test binary and most tests.
    pub async fn collect_normalized(self, mut normalizer: Box<dyn Normalizer>) -> Vec<NormalizedEntry> {
        use tokio_stream::StreamExt;
        let mut chunks = Vec::new();
        let mut stream = self.output;
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        normalize_chunks(normalizer.as_mut(), &chunks)
    }
}

/// Uniform façade over a single agent kind (§4.F).
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute_task(&self, task: &Task) -> Result<ExecutionHandle>;

    async fn resume_task(&self, task: &Task, session_id: &str) -> Result<ExecutionHandle> {
        let _ = (task, session_id);
        Err(Error::Unsupported(format!(
            "{} does not support session resume",
            self.name()
        )))
    }

    fn create_normalizer(&self, workdir: std::path::PathBuf) -> Box<dyn Normalizer>;

    fn capabilities(&self) -> Capabilities;

    async fn check_availability(&self) -> bool;

    fn set_approval_service(&mut self, _service: Arc<dyn ApprovalService>) {}

    async fn send_message(&self, _process_id: &str, _message: &str) -> Result<()> {
        Err(Error::Unsupported(format!(
            "{} does not support mid-execution messaging",
            self.name()
        )))
    }

    async fn interrupt(&self, _process_id: &str) -> Result<()> {
        Err(Error::Unsupported(format!(
            "{} does not support interrupt",
            self.name()
        )))
    }
}

/// Probe `PATH` for `binary`; never throws (§4.F `checkAvailability`).
pub(crate) async fn binary_on_path(binary: &str) -> bool {
    let binary = binary.to_string();
    tokio::task::spawn_blocking(move || which(&binary))
        .await
        .unwrap_or(false)
}

fn which(binary: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file()
    })
}

/// Spawn `program args` in pipe mode through the shared process manager,
/// returning the raw [`ExecutionHandle`] shell (no control peer attached).
pub(crate) async fn spawn_pipe(
    manager: &ProcessManager,
    program: &str,
    args: Vec<String>,
    task: &Task,
) -> Result<ExecutionHandle> {
    use crate::process::{AcquireConfig, ProcessMode};

    let config = AcquireConfig {
        program: program.to_string(),
        args,
        cwd: task.working_dir.clone(),
        env: std::collections::HashMap::new(),
        mode: ProcessMode::Pipe,
        timeout: None,
        retry: None,
    };
    let spawned = manager.acquire(config).await?;
    Ok(ExecutionHandle {
        process_id: spawned.id,
        control: None,
        output: spawned.output,
    })
}
