//! §4.C.3 JSONL normalizer for the Cursor agent.

use std::path::PathBuf;

use super::{
    relativize, ChunkSource, EntryError, EntryMetadata, EntryType, IndexTracker, Normalizer,
    NormalizedEntry, ToolAction, ToolResult, ToolStatus, ToolUse,
};

/// Auth-required stderr patterns the SETUP_REQUIRED error short-circuits on.
const AUTH_PATTERNS: [&str; 2] = ["not authenticated", "please log in"];

const ACTIVE_STREAM_KEY: &str = "__active_stream__";

pub struct CursorNormalizer {
    workdir: PathBuf,
    index: IndexTracker,
    session_id: Option<String>,
    active_kind: Option<&'static str>,
    active_text: Option<String>,
    call_indices: std::collections::HashMap<String, (usize, String)>,
}

impl CursorNormalizer {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            index: IndexTracker::new(),
            session_id: None,
            active_kind: None,
            active_text: None,
            call_indices: std::collections::HashMap::new(),
        }
    }

    fn metadata(&self) -> Option<EntryMetadata> {
        self.session_id.as_ref().map(|sid| EntryMetadata {
            session_id: Some(sid.clone()),
            model: None,
            extra: Default::default(),
        })
    }

    fn close_stream(&mut self) {
        self.active_kind = None;
        self.active_text = None;
        self.index.clear(ACTIVE_STREAM_KEY);
    }

    /// Derive a tool name from the first key of the `tool_call` payload,
    /// e.g. `shellToolCall → shell`, `editToolCall → edit` (§4.C.3).
    fn tool_name(tool_call: &serde_json::Value) -> String {
        let Some(key) = tool_call.as_object().and_then(|m| m.keys().next()) else {
            return "tool".to_string();
        };
        key.strip_suffix("ToolCall").unwrap_or(key).to_lowercase()
    }

    fn map_action(&self, name: &str, input: &serde_json::Value) -> ToolAction {
        match name {
            "shell" => ToolAction::CommandRun {
                command: input
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                result: None,
            },
            "read" => ToolAction::FileRead {
                path: input
                    .get("path")
                    .and_then(|v| v.as_str())
                    .map(|p| relativize(p, &self.workdir))
                    .unwrap_or_default(),
            },
            "write" | "edit" => ToolAction::FileWrite {
                path: input
                    .get("path")
                    .and_then(|v| v.as_str())
                    .map(|p| relativize(p, &self.workdir))
                    .unwrap_or_default(),
            },
            other => ToolAction::Tool {
                name: other.to_string(),
                args: Some(input.clone()),
                result: None,
            },
        }
    }

    fn stream_entry(&mut self, kind: &'static str, entry_type_text: &str, text: &str) -> NormalizedEntry {
        if self.active_kind != Some(kind) {
            self.close_stream();
            self.active_kind = Some(kind);
        }
        let accumulated = match &mut self.active_text {
            Some(existing) => {
                existing.push_str(text);
                existing.clone()
            }
            None => {
                self.active_text = Some(text.to_string());
                text.to_string()
            }
        };
        let idx = self.index.index_for(ACTIVE_STREAM_KEY);
        let entry_type = match entry_type_text {
            "thinking" => EntryType::Thinking { reasoning: Some(accumulated.clone()) },
            "user" => EntryType::UserMessage,
            "system" => EntryType::SystemMessage,
            _ => EntryType::AssistantMessage,
        };
        NormalizedEntry {
            index: idx,
            timestamp: Some(chrono::Utc::now()),
            entry_type,
            content: accumulated,
            metadata: self.metadata(),
        }
    }
}

impl Normalizer for CursorNormalizer {
    fn process_line(&mut self, line: &str, source: ChunkSource) -> Vec<NormalizedEntry> {
        if line.trim().is_empty() {
            return Vec::new();
        }
        if source == ChunkSource::Stderr {
            let lower = line.to_lowercase();
            if AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
                return vec![NormalizedEntry {
                    index: self.index.fresh_index(),
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::Error {
                        error: EntryError {
                            message: line.to_string(),
                            code: Some("SETUP_REQUIRED".to_string()),
                            stack: None,
                        },
                    },
                    content: String::new(),
                    metadata: self.metadata(),
                }];
            }
            return Vec::new();
        }

        let json: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                return vec![NormalizedEntry {
                    index: self.index.fresh_index(),
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::AssistantMessage,
                    content: line.to_string(),
                    metadata: self.metadata(),
                }]
            }
        };

        let Some(msg_type) = json.get("type").and_then(|t| t.as_str()) else {
            return Vec::new();
        };

        match msg_type {
            "system" | "user" | "assistant" | "thinking" => {
                if let Some(sid) = json.get("session_id").and_then(|v| v.as_str()) {
                    self.session_id = Some(sid.to_string());
                }
                let text = json
                    .get("text")
                    .or_else(|| json.get("content"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if text.is_empty() {
                    return Vec::new();
                }
                let kind: &'static str = match msg_type {
                    "system" => "system",
                    "user" => "user",
                    "thinking" => "thinking",
                    _ => "assistant",
                };
                vec![self.stream_entry(kind, msg_type, text)]
            }
            "tool_call" => {
                self.close_stream();
                let subtype = json.get("subtype").and_then(|v| v.as_str()).unwrap_or("started");
                let call_id = json
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let empty_obj = serde_json::Value::Object(Default::default());
                let tool_call = json.get("tool_call").unwrap_or(&empty_obj);
                let name = Self::tool_name(tool_call);
                let input = tool_call
                    .as_object()
                    .and_then(|m| m.values().next())
                    .unwrap_or(&empty_obj);

                if subtype == "completed" {
                    if let Some((idx, name)) = self.call_indices.remove(&call_id) {
                        let failure = tool_call.get("failure").cloned();
                        let is_error = failure.is_some();
                        let result_val = input.get("result").cloned();
                        return vec![NormalizedEntry {
                            index: idx,
                            timestamp: Some(chrono::Utc::now()),
                            entry_type: EntryType::ToolUse {
                                tool: ToolUse {
                                    name: name.clone(),
                                    action: self.map_action(&name, input),
                                    status: if is_error { ToolStatus::Failed } else { ToolStatus::Success },
                                    result: Some(ToolResult {
                                        success: !is_error,
                                        data: result_val,
                                        error: None,
                                    }),
                                },
                            },
                            content: String::new(),
                            metadata: self.metadata(),
                        }];
                    }
                }

                let idx = self.index.fresh_index();
                if !call_id.is_empty() {
                    self.call_indices.insert(call_id, (idx, name.clone()));
                }
                vec![NormalizedEntry {
                    index: idx,
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::ToolUse {
                        tool: ToolUse {
                            name: name.clone(),
                            action: self.map_action(&name, input),
                            status: ToolStatus::Running,
                            result: None,
                        },
                    },
                    content: String::new(),
                    metadata: self.metadata(),
                }]
            }
            "result" => {
                self.close_stream();
                let is_error = json.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
                if !is_error {
                    return Vec::new();
                }
                let message = json
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("cursor task failed")
                    .to_string();
                vec![NormalizedEntry {
                    index: self.index.fresh_index(),
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::Error {
                        error: EntryError {
                            message,
                            code: Some("TASK_ERROR".to_string()),
                            stack: None,
                        },
                    },
                    content: String::new(),
                    metadata: self.metadata(),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<NormalizedEntry> {
        self.close_stream();
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries_for(lines: &[(&str, ChunkSource)]) -> Vec<NormalizedEntry> {
        let mut n = CursorNormalizer::new(PathBuf::from("/work"));
        let mut out = Vec::new();
        for (line, source) in lines {
            out.extend(n.process_line(line, *source));
        }
        out
    }

    #[test]
    fn assistant_text_coalesces_into_one_index() {
        let entries = entries_for(&[
            (r#"{"type":"assistant","text":"Hello "}"#, ChunkSource::Stdout),
            (r#"{"type":"assistant","text":"world"}"#, ChunkSource::Stdout),
        ]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, entries[1].index);
        assert_eq!(entries[1].content, "Hello world");
    }

    #[test]
    fn tool_call_lifecycle_reuses_index_by_call_id() {
        let entries = entries_for(&[
            (
                r#"{"type":"tool_call","subtype":"started","call_id":"c1","tool_call":{"shellToolCall":{"command":"ls"}}}"#,
                ChunkSource::Stdout,
            ),
            (
                r#"{"type":"tool_call","subtype":"completed","call_id":"c1","tool_call":{"shellToolCall":{"command":"ls"}}}"#,
                ChunkSource::Stdout,
            ),
        ]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, entries[1].index);
        let EntryType::ToolUse { tool } = &entries[0].entry_type else {
            panic!()
        };
        assert_eq!(tool.name, "shell");
        let EntryType::ToolUse { tool } = &entries[1].entry_type else {
            panic!()
        };
        assert_eq!(tool.status, ToolStatus::Success);
    }

    #[test]
    fn tool_call_with_failure_key_maps_to_failed_status() {
        let entries = entries_for(&[
            (
                r#"{"type":"tool_call","subtype":"started","call_id":"c2","tool_call":{"editToolCall":{"path":"a.rs"}}}"#,
                ChunkSource::Stdout,
            ),
            (
                r#"{"type":"tool_call","subtype":"completed","call_id":"c2","tool_call":{"editToolCall":{"path":"a.rs"},"failure":{"message":"no such file"}}}"#,
                ChunkSource::Stdout,
            ),
        ]);
        let EntryType::ToolUse { tool } = &entries[1].entry_type else {
            panic!()
        };
        assert_eq!(tool.name, "edit");
        assert_eq!(tool.status, ToolStatus::Failed);
    }

    #[test]
    fn stderr_auth_pattern_emits_setup_required() {
        let entries = entries_for(&[("Error: not authenticated, please log in", ChunkSource::Stderr)]);
        assert_eq!(entries.len(), 1);
        let EntryType::Error { error } = &entries[0].entry_type else {
            panic!()
        };
        assert_eq!(error.code.as_deref(), Some("SETUP_REQUIRED"));
    }

    #[test]
    fn other_stderr_is_dropped() {
        let entries = entries_for(&[("just some diagnostic noise", ChunkSource::Stderr)]);
        assert!(entries.is_empty());
    }
}
