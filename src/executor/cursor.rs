//! Agent Executor for Cursor (JSONL, unidirectional — prompt on stdin).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::normalize::{CursorNormalizer, Normalizer};
use crate::process::ProcessManager;
use crate::task::Task;

use super::{binary_on_path, spawn_pipe, AgentExecutor, Capabilities, ExecutionHandle, WireProtocol};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorExecutorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub approve_mcps: bool,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
}

fn default_binary() -> String {
    "cursor-agent".to_string()
}

impl Default for CursorExecutorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            force: false,
            model: None,
            approve_mcps: false,
            browser: None,
            workspace: None,
        }
    }
}

impl CursorExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    pub fn to_args(&self, resume_session_id: Option<&str>) -> Vec<String> {
        let mut args = vec!["--output-format".to_string(), "jsonl".to_string()];
        if self.force {
            args.push("--force".to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if self.approve_mcps {
            args.push("--approve-mcps".to_string());
        }
        if let Some(browser) = &self.browser {
            args.push("--browser".to_string());
            args.push(browser.clone());
        }
        if let Some(workspace) = &self.workspace {
            args.push("--workspace".to_string());
            args.push(workspace.clone());
        }
        if let Some(sid) = resume_session_id {
            args.push("--resume".to_string());
            args.push(sid.to_string());
        }
        args
    }
}

pub struct CursorExecutor {
    config: CursorExecutorConfig,
    manager: ProcessManager,
}

impl CursorExecutor {
    pub fn new(config: CursorExecutorConfig, manager: ProcessManager) -> Self {
        Self { config, manager }
    }
}

#[async_trait]
impl AgentExecutor for CursorExecutor {
    fn name(&self) -> &'static str {
        "cursor"
    }

    async fn execute_task(&self, task: &Task) -> Result<ExecutionHandle> {
        task.validate()?;
        self.config.validate()?;
        let args = self.config.to_args(None);
        let handle = spawn_pipe(&self.manager, &self.config.binary, args, task).await?;
        self.manager
            .send_input(&handle.process_id, format!("{}\n", task.prompt).as_bytes())
            .await?;
        self.manager.close_input(&handle.process_id).await?;
        Ok(handle)
    }

    async fn resume_task(&self, task: &Task, session_id: &str) -> Result<ExecutionHandle> {
        task.validate()?;
        self.config.validate()?;
        let args = self.config.to_args(Some(session_id));
        let handle = spawn_pipe(&self.manager, &self.config.binary, args, task).await?;
        self.manager
            .send_input(&handle.process_id, format!("{}\n", task.prompt).as_bytes())
            .await?;
        self.manager.close_input(&handle.process_id).await?;
        Ok(handle)
    }

    fn create_normalizer(&self, workdir: PathBuf) -> Box<dyn Normalizer> {
        Box::new(CursorNormalizer::new(workdir))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_session_resume: true,
            requires_setup: true,
            supports_approvals: false,
            supports_mcp: true,
            wire_protocol: WireProtocol::Jsonl,
            supports_mid_execution_messaging: false,
        }
    }

    async fn check_availability(&self) -> bool {
        binary_on_path(&self.config.binary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_adds_resume_flag() {
        let config = CursorExecutorConfig::default();
        let args = config.to_args(Some("sess-1"));
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-1"]));
    }

    #[test]
    fn force_and_model_flags_present() {
        let config = CursorExecutorConfig {
            force: true,
            model: Some("gpt-5".to_string()),
            ..Default::default()
        };
        let args = config.to_args(None);
        assert!(args.contains(&"--force".to_string()));
        assert!(args.windows(2).any(|w| w == ["--model", "gpt-5"]));
    }
}
