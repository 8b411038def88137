//! Crate-wide error taxonomy.
//!
//! Mirrors §7 of the design: availability / spawn / protocol / approval /
//! task / shutdown errors. Protocol and approval errors are recovered
//! locally by the components that produce them and rarely escape as this
//! type; the others are the ones callers actually see.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("shutdown already in progress")]
    ShutdownInProgress,

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
