//! Agent Executor for the Claude-family (stream-JSON, control protocol).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::approval::{ApprovalHandler, ApprovalService};
use crate::control::ControlPeer;
use crate::error::{Error, Result};
use crate::normalize::{ClaudeNormalizer, Normalizer};
use crate::process::{AcquireConfig, ProcessMode, ProcessManager};
use crate::task::Task;

use super::{binary_on_path, AgentExecutor, Capabilities, ExecutionHandle, WireProtocol};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeExecutorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dangerously_skip_permissions: bool,
    #[serde(default)]
    pub mcp_config: Vec<String>,
    #[serde(default)]
    pub plugin_dir: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
}

fn default_binary() -> String {
    "claude".to_string()
}

impl Default for ClaudeExecutorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            model: None,
            dangerously_skip_permissions: false,
            mcp_config: Vec::new(),
            plugin_dir: Vec::new(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
        }
    }
}

impl ClaudeExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// `print: true` and `outputFormat: "stream-json"` are always implied
    /// for this executor (§4.F argument table): one-shot invocation with a
    /// structured, parseable event stream.
    pub fn to_args(&self, prompt: &str, resume_session_id: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if self.dangerously_skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        for entry in &self.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(entry.clone());
        }
        for entry in &self.plugin_dir {
            args.push("--plugin-dir".to_string());
            args.push(entry.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(self.disallowed_tools.join(","));
        }
        if let Some(sid) = resume_session_id {
            args.push("--resume".to_string());
            args.push(sid.to_string());
        }
        args
    }
}

pub struct ClaudeExecutor {
    config: ClaudeExecutorConfig,
    manager: ProcessManager,
    approval: Arc<ApprovalHandler>,
}

impl ClaudeExecutor {
    pub fn new(config: ClaudeExecutorConfig, manager: ProcessManager) -> Self {
        Self {
            config,
            manager,
            approval: Arc::new(ApprovalHandler::new(None)),
        }
    }

}

#[async_trait]
impl AgentExecutor for ClaudeExecutor {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn execute_task(&self, task: &Task) -> Result<ExecutionHandle> {
        task.validate()?;
        self.config.validate()?;
        let args = self.config.to_args(&task.prompt, None);
        spawn_with_control(self, task, args).await
    }

    async fn resume_task(&self, task: &Task, session_id: &str) -> Result<ExecutionHandle> {
        if !self.capabilities().supports_session_resume {
            return Err(Error::Unsupported("claude resume disabled".into()));
        }
        task.validate()?;
        self.config.validate()?;
        let args = self.config.to_args(&task.prompt, Some(session_id));
        spawn_with_control(self, task, args).await
    }

    fn create_normalizer(&self, workdir: PathBuf) -> Box<dyn Normalizer> {
        Box::new(ClaudeNormalizer::new(workdir))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_session_resume: true,
            requires_setup: false,
            supports_approvals: true,
            supports_mcp: true,
            wire_protocol: WireProtocol::StreamJson,
            supports_mid_execution_messaging: true,
        }
    }

    async fn check_availability(&self) -> bool {
        binary_on_path(&self.config.binary).await
    }

    fn set_approval_service(&mut self, service: Arc<dyn ApprovalService>) {
        self.approval = Arc::new(ApprovalHandler::new(Some(service)));
    }

    async fn send_message(&self, process_id: &str, message: &str) -> Result<()> {
        self.manager
            .send_input(process_id, format!("{}\n", message).as_bytes())
            .await
    }

    async fn interrupt(&self, process_id: &str) -> Result<()> {
        let peer = ControlPeer::new(process_id.to_string(), self.manager.clone(), self.approval.clone());
        peer.send_interrupt().await
    }
}

/// Spawns the child and initializes a control peer bound to its stdio, per
/// the stream-JSON branch of §4.F `executeTask`.
async fn spawn_with_control(
    executor: &ClaudeExecutor,
    task: &Task,
    args: Vec<String>,
) -> Result<ExecutionHandle> {
    let acquire = AcquireConfig {
        program: executor.config.binary.clone(),
        args,
        cwd: task.working_dir.clone(),
        env: Default::default(),
        mode: ProcessMode::Pipe,
        timeout: None,
        retry: None,
    };
    let spawned = executor.manager.acquire(acquire).await?;
    let peer = Arc::new(ControlPeer::new(
        spawned.id.clone(),
        executor.manager.clone(),
        executor.approval.clone(),
    ));
    peer.initialize(json!([])).await?;

    Ok(ExecutionHandle {
        process_id: spawned.id,
        control: Some(peer),
        output: spawned.output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_args_assembles_required_flags() {
        let config = ClaudeExecutorConfig {
            binary: "claude".to_string(),
            model: Some("sonnet".to_string()),
            dangerously_skip_permissions: true,
            allowed_tools: vec!["Read".to_string(), "Bash".to_string()],
            ..Default::default()
        };
        let args = config.to_args("do the thing", None);
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "do the thing");
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.contains(&"--allowedTools".to_string()));
        assert!(args.contains(&"Read,Bash".to_string()));
    }

    #[test]
    fn resume_adds_resume_flag() {
        let config = ClaudeExecutorConfig::default();
        let args = config.to_args("hi", Some("sess-1"));
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-1"]));
    }
}
