//! Configuration loading and management.
//!
//! A `.toml`-file-with-sane-defaults layer: engine concurrency, PTY
//! defaults, shutdown timeouts, and per-agent executor configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::executor::{
    ClaudeExecutorConfig, CodexExecutorConfig, CopilotExecutorConfig, CursorExecutorConfig,
    GeminiExecutorConfig,
};
use crate::process::RetryPolicy;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub claude: ClaudeExecutorConfig,
    #[serde(default)]
    pub codex: CodexExecutorConfig,
    #[serde(default)]
    pub cursor: CursorExecutorConfig,
    #[serde(default)]
    pub copilot: CopilotExecutorConfig,
    #[serde(default)]
    pub gemini: GeminiExecutorConfig,

    #[serde(default)]
    pub pty: PtyConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            claude: ClaudeExecutorConfig::default(),
            codex: CodexExecutorConfig::default(),
            cursor: CursorExecutorConfig::default(),
            copilot: CopilotExecutorConfig::default(),
            gemini: GeminiExecutorConfig::default(),
            pty: PtyConfig::default(),
            shutdown: ShutdownConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load from an explicit path, `./.agent-exec/config.toml`, or
    /// `~/.agent-exec/config.toml`, falling back to defaults if none exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            let local = PathBuf::from(".agent-exec/config.toml");
            if local.exists() {
                return Some(local);
            }
            dirs::home_dir().map(|h| h.join(".agent-exec/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                let config: Config = toml::from_str(&content)?;
                Ok(config)
            }
            _ => Ok(Config::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyConfig {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_term")]
    pub term: String,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
            term: default_term(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_graceful_timeout_ms", with = "duration_millis")]
    pub graceful_timeout: Duration,
}

fn default_graceful_timeout_ms() -> Duration {
    Duration::from_millis(5000)
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: default_graceful_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(c: RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: c.max_attempts,
            backoff: c.backoff,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_engine_concurrency() {
        let config = Config::default();
        assert_eq!(config.engine.max_concurrent, 3);
        assert_eq!(config.pty.cols, 80);
        assert_eq!(config.pty.rows, 24);
        assert_eq!(config.pty.term, "xterm-256color");
    }

    #[test]
    fn load_falls_back_to_default_when_no_file_exists() {
        let config = Config::load(Some(Path::new("/nonexistent/path/config.toml"))).unwrap();
        assert_eq!(config.engine.max_concurrent, 3);
    }
}
