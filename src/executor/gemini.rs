//! Agent Executor for Gemini.
//!
//! Gemini's wire format was left undocumented upstream; its normalizer
//! reuses the Codex JSONL normalizer's unknown-type fallback path rather
//! than inventing protocol detail (see DESIGN.md).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::normalize::{CodexNormalizer, Normalizer};
use crate::process::ProcessManager;
use crate::task::Task;

use super::{binary_on_path, spawn_pipe, AgentExecutor, Capabilities, ExecutionHandle, WireProtocol};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiExecutorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_binary() -> String {
    "gemini".to_string()
}

impl Default for GeminiExecutorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            model: None,
        }
    }
}

impl GeminiExecutorConfig {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--output-format".to_string(), "jsonl".to_string()];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }
}

pub struct GeminiExecutor {
    config: GeminiExecutorConfig,
    manager: ProcessManager,
}

impl GeminiExecutor {
    pub fn new(config: GeminiExecutorConfig, manager: ProcessManager) -> Self {
        Self { config, manager }
    }
}

#[async_trait]
impl AgentExecutor for GeminiExecutor {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn execute_task(&self, task: &Task) -> Result<ExecutionHandle> {
        task.validate()?;
        let args = self.config.to_args();
        let handle = spawn_pipe(&self.manager, &self.config.binary, args, task).await?;
        self.manager
            .send_input(&handle.process_id, format!("{}\n", task.prompt).as_bytes())
            .await?;
        self.manager.close_input(&handle.process_id).await?;
        Ok(handle)
    }

    fn create_normalizer(&self, workdir: PathBuf) -> Box<dyn Normalizer> {
        Box::new(CodexNormalizer::new(workdir))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_session_resume: false,
            requires_setup: true,
            supports_approvals: false,
            supports_mcp: false,
            wire_protocol: WireProtocol::Jsonl,
            supports_mid_execution_messaging: false,
        }
    }

    async fn check_availability(&self) -> bool {
        binary_on_path(&self.config.binary).await
    }
}
