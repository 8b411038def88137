//! §3 Normalized entry model and §4.C per-agent normalizers.
//!
//! Each agent gets its own normalizer behind the [`Normalizer`] trait. A
//! fresh instance is created per execution (§9 design note: index counters
//! and the tool-use-id map are instance state, never process-global).

mod acp;
mod claude;
mod codex;
mod cursor;

pub use acp::AcpNormalizer;
pub use claude::ClaudeNormalizer;
pub use codex::CodexNormalizer;
pub use cursor::CursorNormalizer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::output::OutputChunk;

/// A single agent-independent event (§3 "Normalized entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEntry {
    /// Monotonically increasing per-execution index, starting at 0. Reused
    /// (not incremented) when a later event supersedes an earlier one at
    /// the same semantic position — see §3 coalescing.
    pub index: usize,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(flatten)]
    pub entry_type: EntryType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryType {
    SystemMessage,
    UserMessage,
    AssistantMessage,
    Thinking {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    ToolUse {
        tool: ToolUse,
    },
    Error {
        error: EntryError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Created,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub action: ToolAction,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(rename = "type")]
    pub change_type: String,
    pub unified_diff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolAction {
    FileRead { path: String },
    FileWrite { path: String },
    FileEdit { path: String, changes: Vec<FileChange> },
    CommandRun {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Search { query: String },
    Tool {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
}

/// Given an agent's finite output-chunk stream and its working directory,
/// produce a finite stream of normalized entries. Implementations must
/// never throw on malformed input — malformed lines become an entry
/// carrying the raw content instead (§4.C).
pub trait Normalizer: Send {
    /// Feed one already-reassembled line of output. Returns zero or more
    /// normalized entries (a single line can produce more than one, e.g. an
    /// assistant message with both a tool_use block and trailing text).
    fn process_line(&mut self, line: &str, source: ChunkSource) -> Vec<NormalizedEntry>;

    /// Called once, when the underlying stream ends, to flush any
    /// in-flight coalesced entry (e.g. an unterminated paragraph).
    fn finish(&mut self) -> Vec<NormalizedEntry> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    Stdout,
    Stderr,
}

/// Shared bookkeeping every normalizer needs: a dense index counter plus a
/// map from a protocol-level key (tool-use id, call id, "the active
/// streaming message") to the index it's currently occupying, so later
/// chunks can supersede rather than append (§3 coalescing invariant).
#[derive(Debug, Default)]
pub(crate) struct IndexTracker {
    next_index: usize,
    slots: HashMap<String, usize>,
}

impl IndexTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Get the index for `key`, allocating a fresh one if this is the first
    /// time we've seen it.
    pub(crate) fn index_for(&mut self, key: &str) -> usize {
        if let Some(idx) = self.slots.get(key) {
            return *idx;
        }
        let idx = self.next_index;
        self.next_index += 1;
        self.slots.insert(key.to_string(), idx);
        idx
    }

    /// Allocate a brand new index regardless of any existing key.
    pub(crate) fn fresh_index(&mut self) -> usize {
        let idx = self.next_index;
        self.next_index += 1;
        idx
    }

    pub(crate) fn clear(&mut self, key: &str) {
        self.slots.remove(key);
    }
}

/// Make an absolute path working-directory-relative when the relative form
/// is shorter and does not escape upward more than one component (§4.C).
pub(crate) fn relativize(path: &str, workdir: &Path) -> String {
    let p = Path::new(path);
    if !p.is_absolute() {
        return path.to_string();
    }
    let Ok(rel) = p.strip_prefix(workdir) else {
        // Not a direct descendant; try one level up.
        return match workdir.parent().and_then(|parent| p.strip_prefix(parent).ok()) {
            Some(rel) => {
                let candidate: PathBuf = Path::new("..").join(rel);
                let candidate_str = candidate.to_string_lossy().to_string();
                if candidate_str.len() < path.len() {
                    candidate_str
                } else {
                    path.to_string()
                }
            }
            None => path.to_string(),
        };
    };
    let rel_str = rel.to_string_lossy().to_string();
    if rel_str.len() < path.len() {
        rel_str
    } else {
        path.to_string()
    }
}

/// Drain a byte-chunk stream into whole newline-terminated lines, holding
/// any trailing unterminated bytes until the next chunk or end-of-stream
/// (§4.B line reassembly).
#[derive(Debug, Default)]
pub struct LineReassembler {
    carry: Vec<u8>,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning complete lines (without the
    /// trailing `\n`).
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(data);
        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.carry.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            lines.push(String::from_utf8_lossy(line).trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Flush any trailing bytes that never saw a terminator.
    pub fn flush(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.carry);
        Some(String::from_utf8_lossy(&rest).to_string())
    }
}

/// Convenience used by every normalizer to drive [`Normalizer::process_line`]
/// over a whole [`OutputChunk`] stream via line reassembly, yielding the
/// resulting entries in order.
pub fn normalize_chunks<N: Normalizer>(
    normalizer: &mut N,
    chunks: &[OutputChunk],
) -> Vec<NormalizedEntry> {
    let mut reassembler = LineReassembler::new();
    let mut out = Vec::new();
    for chunk in chunks {
        let source = match chunk.kind {
            crate::output::ChunkKind::Stdout => ChunkSource::Stdout,
            crate::output::ChunkKind::Stderr => ChunkSource::Stderr,
        };
        for line in reassembler.feed(&chunk.data) {
            out.extend(normalizer.process_line(&line, source));
        }
    }
    if let Some(rest) = reassembler.flush() {
        out.extend(normalizer.process_line(&rest, ChunkSource::Stdout));
    }
    out.extend(normalizer.finish());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_reassembler_holds_partial_trailing_bytes() {
        let mut r = LineReassembler::new();
        assert!(r.feed(b"hello wor").is_empty());
        let lines = r.feed(b"ld\nsecond\nthird-partial");
        assert_eq!(lines, vec!["hello world".to_string(), "second".to_string()]);
        assert_eq!(r.flush(), Some("third-partial".to_string()));
        assert_eq!(r.flush(), None);
    }

    #[test]
    fn index_tracker_reuses_slot_for_same_key() {
        let mut t = IndexTracker::new();
        let a = t.index_for("msg");
        let b = t.index_for("msg");
        assert_eq!(a, b);
        let c = t.fresh_index();
        assert_ne!(a, c);
    }

    #[test]
    fn relativize_prefers_shorter_relative_form() {
        let wd = Path::new("/home/user/project");
        assert_eq!(
            relativize("/home/user/project/src/main.rs", wd),
            "src/main.rs"
        );
        assert_eq!(relativize("relative/path.rs", wd), "relative/path.rs");
    }
}
