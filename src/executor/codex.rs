//! Agent Executor for Codex (JSONL, unidirectional — prompt on stdin).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::normalize::{CodexNormalizer, Normalizer};
use crate::process::ProcessManager;
use crate::task::Task;

use super::{binary_on_path, spawn_pipe, AgentExecutor, Capabilities, ExecutionHandle, WireProtocol};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexExecutorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sandbox: Option<String>,
    #[serde(default)]
    pub ask_for_approval: bool,
    #[serde(default)]
    pub full_auto: bool,
    #[serde(default)]
    pub yolo: bool,
    #[serde(default)]
    pub auto_approve: bool,
}

fn default_binary() -> String {
    "codex".to_string()
}

impl Default for CodexExecutorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            model: None,
            sandbox: None,
            ask_for_approval: false,
            full_auto: false,
            yolo: false,
            auto_approve: false,
        }
    }
}

impl CodexExecutorConfig {
    /// `sandbox`, `askForApproval`, `fullAuto`, `yolo` are mutually
    /// exclusive (§4.F argument table).
    pub fn validate(&self) -> Result<()> {
        let exclusive = [
            self.sandbox.is_some(),
            self.ask_for_approval,
            self.full_auto,
            self.yolo,
        ];
        if exclusive.iter().filter(|b| **b).count() > 1 {
            return Err(Error::Config(
                "codex: sandbox, ask_for_approval, full_auto, yolo are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// Mirrors the documented Codex subsequence: `exec [resume <sid>] -
    /// --json [--model <m>] [--sandbox <s>|--ask-for-approval|--full-auto|
    /// --yolo] [--dangerously-bypass-approvals-and-sandbox]`. The trailing
    /// `-` is the positional marker telling Codex to read the prompt from
    /// stdin, where `execute_task`/`resume_task` write it.
    pub fn to_args(&self, resume_session_id: Option<&str>) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(sid) = resume_session_id {
            args.push("resume".to_string());
            args.push(sid.to_string());
        }
        args.push("-".to_string());
        args.push("--json".to_string());
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(sandbox) = &self.sandbox {
            args.push("--sandbox".to_string());
            args.push(sandbox.clone());
        }
        if self.ask_for_approval {
            args.push("--ask-for-approval".to_string());
        }
        if self.full_auto {
            args.push("--full-auto".to_string());
        }
        if self.yolo {
            args.push("--yolo".to_string());
        }
        if self.auto_approve && !self.yolo && !self.full_auto {
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
        }
        args
    }
}

pub struct CodexExecutor {
    config: CodexExecutorConfig,
    manager: ProcessManager,
}

impl CodexExecutor {
    pub fn new(config: CodexExecutorConfig, manager: ProcessManager) -> Self {
        Self { config, manager }
    }
}

#[async_trait]
impl AgentExecutor for CodexExecutor {
    fn name(&self) -> &'static str {
        "codex"
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
        Box::new(CodexNormalizer::new(workdir))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_session_resume: true,
            requires_setup: false,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutually_exclusive_flags_reject_more_than_one() {
        let config = CodexExecutorConfig {
            full_auto: true,
            yolo: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn auto_approve_prefers_full_auto_flag_when_full_auto_set() {
        let config = CodexExecutorConfig {
            full_auto: true,
            auto_approve: true,
            ..Default::default()
        };
        let args = config.to_args(None);
        assert!(args.iter().filter(|a| a.as_str() == "--full-auto").count() == 1);
    }

    #[test]
    fn auto_approve_alone_uses_bypass_flag() {
        let config = CodexExecutorConfig {
            auto_approve: true,
            ..Default::default()
        };
        let args = config.to_args(None);
        assert!(args.contains(&"--dangerously-bypass-approvals-and-sandbox".to_string()));
    }

    #[test]
    fn resume_arg_subsequence_matches_documented_shape() {
        let config = CodexExecutorConfig {
            model: Some("gpt-5-codex".to_string()),
            auto_approve: true,
            ..Default::default()
        };
        let args = config.to_args(Some("019a..."));
        assert_eq!(
            args,
            vec![
                "exec",
                "resume",
                "019a...",
                "-",
                "--json",
                "--model",
                "gpt-5-codex",
                "--dangerously-bypass-approvals-and-sandbox",
            ]
        );
    }
}
