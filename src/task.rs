//! §3 Task / Task-state record data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::normalize::NormalizedEntry;

/// An execution unit submitted to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Opaque per-agent config block (serialized executor config).
    #[serde(default)]
    pub agent_config: serde_json::Value,
    /// Preserved but unused by FIFO scheduling.
    #[serde(default)]
    pub priority: i64,
    /// Preserved but unused by FIFO scheduling.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
}

impl Task {
    pub fn new(prompt: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            working_dir,
            created_at: Utc::now(),
            agent_config: serde_json::Value::Null,
            priority: 0,
            dependencies: Vec::new(),
            entity_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_agent_config(mut self, config: serde_json::Value) -> Self {
        self.agent_config = config;
        self
    }

    /// Validate the parts of a task the core is responsible for: the
    /// working directory must be non-empty and must exist. Per-agent
    /// constraints are validated separately by the executor.
    pub fn validate(&self) -> crate::Result<()> {
        if self.working_dir.as_os_str().is_empty() {
            return Err(crate::Error::InvalidTask(
                "working_dir must not be empty".into(),
            ));
        }
        if !self.working_dir.exists() {
            return Err(crate::Error::InvalidTask(format!(
                "working_dir does not exist: {}",
                self.working_dir.display()
            )));
        }
        Ok(())
    }
}

/// Final outcome of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub entries: Vec<NormalizedEntry>,
    pub session_id: Option<String>,
}

/// Owned by the Execution Engine; one per submitted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Queued { position: usize },
    Running { managed_process_id: String, started_at: DateTime<Utc> },
    Completed { result: TaskResult },
    Failed { error: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed { .. } | TaskState::Failed { .. })
    }
}
