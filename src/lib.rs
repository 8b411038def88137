//! agent-exec-engine: supervises external coding-agent CLIs as subprocesses
//! behind one normalized event model.
//!
//! # Architecture
//!
//! ```text
//! ExecutionEngine (G)  --submits to-->  AgentExecutor (F, one per agent kind)
//!        |                                      |
//!        | drains                               | spawns via
//!        v                                      v
//! NormalizedEntry stream  <--normalizes--  ProcessManager (A) + OutputChunk (B)
//!                                                |
//!                                     ControlPeer (D) / ApprovalHandler (E)
//!                                                |
//!                                       ShutdownManager (H) on SIGINT/SIGTERM
//! ```
//!
//! Each agent's wire format (stream-JSON, JSONL, ACP) is translated into a
//! single [`normalize::NormalizedEntry`] shape by a per-agent [`normalize::Normalizer`],
//! so callers never branch on which agent produced an entry.

pub mod approval;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod executor;
pub mod normalize;
pub mod output;
pub mod process;
pub mod shutdown;
pub mod task;

pub use config::Config;
pub use engine::{EngineConfig, EngineMetrics, ExecutionEngine};
pub use error::{Error, Result};
pub use executor::AgentExecutor;
pub use normalize::{NormalizedEntry, Normalizer};
pub use process::ProcessManager;
pub use shutdown::{ShutdownManager, ShutdownSignal};
pub use task::{Task, TaskResult, TaskState};
