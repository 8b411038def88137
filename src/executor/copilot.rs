//! Agent Executor for GitHub Copilot CLI (ACP-shaped, with a plain-text
//! fallback mode handled by the shared ACP normalizer).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::normalize::{AcpNormalizer, Normalizer};
use crate::process::ProcessManager;
use crate::task::Task;

use super::{binary_on_path, spawn_pipe, AgentExecutor, Capabilities, ExecutionHandle, WireProtocol};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotExecutorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub allow_all_tools: bool,
    #[serde(default)]
    pub allow_tool: Vec<String>,
    #[serde(default)]
    pub deny_tool: Vec<String>,
}

fn default_binary() -> String {
    "copilot".to_string()
}

impl Default for CopilotExecutorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            allow_all_tools: false,
            allow_tool: Vec::new(),
            deny_tool: Vec::new(),
        }
    }
}

impl CopilotExecutorConfig {
    /// `allowAllTools` / `allowTool` / `denyTool` are mutually exclusive
    /// (§4.F argument table).
    pub fn validate(&self) -> Result<()> {
        let exclusive = [
            self.allow_all_tools,
            !self.allow_tool.is_empty(),
            !self.deny_tool.is_empty(),
        ];
        if exclusive.iter().filter(|b| **b).count() > 1 {
            return Err(Error::Config(
                "copilot: allow_all_tools, allow_tool, deny_tool are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--prompt".to_string()];
        if self.allow_all_tools {
            args.push("--allow-all-tools".to_string());
        }
        for tool in &self.allow_tool {
            args.push("--allow-tool".to_string());
            args.push(tool.clone());
        }
        for tool in &self.deny_tool {
            args.push("--deny-tool".to_string());
            args.push(tool.clone());
        }
        args
    }
}

pub struct CopilotExecutor {
    config: CopilotExecutorConfig,
    manager: ProcessManager,
}

impl CopilotExecutor {
    pub fn new(config: CopilotExecutorConfig, manager: ProcessManager) -> Self {
        Self { config, manager }
    }
}

#[async_trait]
impl AgentExecutor for CopilotExecutor {
    fn name(&self) -> &'static str {
        "copilot"
    }

    async fn execute_task(&self, task: &Task) -> Result<ExecutionHandle> {
        task.validate()?;
        self.config.validate()?;
        let mut args = self.config.to_args();
        args.push(task.prompt.clone());
        let handle = spawn_pipe(&self.manager, &self.config.binary, args, task).await?;
        self.manager.close_input(&handle.process_id).await?;
        Ok(handle)
    }

    fn create_normalizer(&self, workdir: PathBuf) -> Box<dyn Normalizer> {
        Box::new(AcpNormalizer::new(workdir))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_session_resume: false,
            requires_setup: true,
            supports_approvals: true,
            supports_mcp: true,
            wire_protocol: WireProtocol::Acp,
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
    fn mutually_exclusive_tool_flags_reject_combination() {
        let config = CopilotExecutorConfig {
            allow_all_tools: true,
            allow_tool: vec!["Read".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn allow_tool_list_is_repeated_per_entry() {
        let config = CopilotExecutorConfig {
            allow_tool: vec!["Read".to_string(), "Write".to_string()],
            ..Default::default()
        };
        let args = config.to_args();
        assert_eq!(args.iter().filter(|a| a.as_str() == "--allow-tool").count(), 2);
    }
}
