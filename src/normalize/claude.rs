//! §4.C.1 stream-JSON normalizer for the Claude-family agent.

use std::path::PathBuf;

use super::{
    relativize, ChunkSource, EntryError, EntryMetadata, EntryType, FileChange, IndexTracker,
    Normalizer, NormalizedEntry, ToolAction, ToolResult, ToolStatus, ToolUse,
};

/// Key used for the currently-active streaming assistant/thinking message.
const ACTIVE_STREAM_KEY: &str = "__active_stream__";

pub struct ClaudeNormalizer {
    workdir: PathBuf,
    index: IndexTracker,
    session_id: Option<String>,
    model: Option<String>,
    /// Accumulated text for the currently-open streaming assistant message.
    active_text: Option<String>,
    /// tool_use id -> index, so a later tool_result block can upgrade it.
    tool_indices: std::collections::HashMap<String, (usize, String)>,
}

impl ClaudeNormalizer {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            index: IndexTracker::new(),
            session_id: None,
            model: None,
            active_text: None,
            tool_indices: std::collections::HashMap::new(),
        }
    }

    fn metadata(&self) -> Option<EntryMetadata> {
        if self.session_id.is_none() && self.model.is_none() {
            return None;
        }
        Some(EntryMetadata {
            session_id: self.session_id.clone(),
            model: self.model.clone(),
            extra: Default::default(),
        })
    }

    fn close_stream(&mut self) {
        self.active_text = None;
        self.index.clear(ACTIVE_STREAM_KEY);
    }

    fn raw_line_entry(&mut self, line: &str) -> NormalizedEntry {
        NormalizedEntry {
            index: self.index.fresh_index(),
            timestamp: Some(chrono::Utc::now()),
            entry_type: EntryType::AssistantMessage,
            content: line.to_string(),
            metadata: self.metadata(),
        }
    }

    fn map_tool_action(name: &str, input: &serde_json::Value, workdir: &std::path::Path) -> ToolAction {
        match name {
            "Bash" => ToolAction::CommandRun {
                command: input
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                result: None,
            },
            "Read" => ToolAction::FileRead {
                path: input
                    .get("file_path")
                    .or_else(|| input.get("path"))
                    .and_then(|v| v.as_str())
                    .map(|p| relativize(p, workdir))
                    .unwrap_or_default(),
            },
            "Write" => ToolAction::FileWrite {
                path: input
                    .get("file_path")
                    .or_else(|| input.get("path"))
                    .and_then(|v| v.as_str())
                    .map(|p| relativize(p, workdir))
                    .unwrap_or_default(),
            },
            "Edit" => {
                let path = input
                    .get("file_path")
                    .or_else(|| input.get("path"))
                    .and_then(|v| v.as_str())
                    .map(|p| relativize(p, workdir))
                    .unwrap_or_default();
                let old = input
                    .get("old_string")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let new = input
                    .get("new_string")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                ToolAction::FileEdit {
                    path,
                    changes: vec![FileChange {
                        change_type: "edit".to_string(),
                        unified_diff: format!("- {}\n+ {}", old, new),
                    }],
                }
            }
            other => ToolAction::Tool {
                name: other.to_string(),
                args: Some(input.clone()),
                result: None,
            },
        }
    }

    fn handle_assistant(&mut self, message: &serde_json::Value) -> Vec<NormalizedEntry> {
        let Some(blocks) = message.get("content").and_then(|c| c.as_array()) else {
            return Vec::new();
        };

        let has_tool_use = blocks
            .iter()
            .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"));

        let mut out = Vec::new();

        // tool_result blocks upgrade a previously registered tool_use entry.
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                let Some(tool_use_id) = block
                    .get("tool_use_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                else {
                    continue;
                };
                if let Some((idx, name)) = self.tool_indices.remove(&tool_use_id) {
                    let is_error = block
                        .get("is_error")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let content = block.get("content").cloned();
                    out.push(NormalizedEntry {
                        index: idx,
                        timestamp: Some(chrono::Utc::now()),
                        entry_type: EntryType::ToolUse {
                            tool: ToolUse {
                                name,
                                action: ToolAction::Tool {
                                    name: "tool_result".to_string(),
                                    args: None,
                                    result: content.clone(),
                                },
                                status: if is_error { ToolStatus::Failed } else { ToolStatus::Success },
                                result: Some(ToolResult {
                                    success: !is_error,
                                    data: content,
                                    error: None,
                                }),
                            },
                        },
                        content: String::new(),
                        metadata: self.metadata(),
                    });
                }
            }
        }

        if has_tool_use {
            self.close_stream();
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                    continue;
                }
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let empty = serde_json::Value::Object(Default::default());
                let input = block.get("input").unwrap_or(&empty);
                let action = Self::map_tool_action(&name, input, &self.workdir);
                let idx = self.index.fresh_index();
                if !id.is_empty() {
                    self.tool_indices.insert(id, (idx, name.clone()));
                }
                out.push(NormalizedEntry {
                    index: idx,
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::ToolUse {
                        tool: ToolUse {
                            name,
                            action,
                            status: ToolStatus::Running,
                            result: None,
                        },
                    },
                    content: String::new(),
                    metadata: self.metadata(),
                });
            }
            return out;
        }

        let text: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return out;
        }

        let accumulated = match &mut self.active_text {
            Some(existing) => {
                existing.push_str(&text);
                existing.clone()
            }
            None => {
                self.active_text = Some(text.clone());
                text
            }
        };
        let idx = self.index.index_for(ACTIVE_STREAM_KEY);
        out.push(NormalizedEntry {
            index: idx,
            timestamp: Some(chrono::Utc::now()),
            entry_type: EntryType::AssistantMessage,
            content: accumulated,
            metadata: self.metadata(),
        });
        out
    }
}

impl Normalizer for ClaudeNormalizer {
    fn process_line(&mut self, line: &str, _source: ChunkSource) -> Vec<NormalizedEntry> {
        if line.trim().is_empty() {
            return Vec::new();
        }
        let json: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return vec![self.raw_line_entry(line)],
        };

        let Some(msg_type) = json.get("type").and_then(|t| t.as_str()) else {
            return vec![self.raw_line_entry(line)];
        };

        match msg_type {
            "system" => {
                if let Some(sid) = json.get("sessionId").and_then(|v| v.as_str()) {
                    self.session_id = Some(sid.to_string());
                }
                if let Some(model) = json.get("model").and_then(|v| v.as_str()) {
                    self.model = Some(model.to_string());
                }
                vec![NormalizedEntry {
                    index: self.index.fresh_index(),
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::SystemMessage,
                    content: format!(
                        "Session: {}, Model: {}",
                        self.session_id.clone().unwrap_or_default(),
                        self.model.clone().unwrap_or_default()
                    ),
                    metadata: self.metadata(),
                }]
            }
            "user" => {
                self.close_stream();
                let content = json
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .map(render_user_content)
                    .unwrap_or_default();
                if content.is_empty() {
                    return Vec::new();
                }
                vec![NormalizedEntry {
                    index: self.index.fresh_index(),
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::UserMessage,
                    content,
                    metadata: self.metadata(),
                }]
            }
            "assistant" => {
                let Some(message) = json.get("message") else {
                    return Vec::new();
                };
                self.handle_assistant(message)
            }
            "tool_use" => Vec::new(),
            "result" => {
                self.close_stream();
                let is_error = json.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);
                if !is_error {
                    return Vec::new();
                }
                let result = json
                    .get("result")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                vec![NormalizedEntry {
                    index: self.index.fresh_index(),
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::Error {
                        error: EntryError {
                            message: result.to_string(),
                            code: Some("TASK_ERROR".to_string()),
                            stack: None,
                        },
                    },
                    content: String::new(),
                    metadata: self.metadata(),
                }]
            }
            "control_request" | "control_response" => Vec::new(),
            _ => vec![self.raw_line_entry(line)],
        }
    }
}

fn render_user_content(content: &serde_json::Value) -> String {
    if let Some(s) = content.as_str() {
        return s.to_string();
    }
    if let Some(blocks) = content.as_array() {
        return blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("");
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries_for(lines: &[&str]) -> Vec<NormalizedEntry> {
        let mut n = ClaudeNormalizer::new(PathBuf::from("/work"));
        let mut out = Vec::new();
        for line in lines {
            out.extend(n.process_line(line, ChunkSource::Stdout));
        }
        out
    }

    #[test]
    fn s1_single_successful_task() {
        let lines = [
            r#"{"type":"system","sessionId":"s1","model":"m1"}"#,
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hello "}]}}"#,
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"world"}]}}"#,
            r#"{"type":"result","isError":false}"#,
        ];
        let entries = entries_for(&lines);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].index, 0);
        assert!(matches!(entries[0].entry_type, EntryType::SystemMessage));
        assert_eq!(entries[1].index, 1);
        assert_eq!(entries[1].content, "Hello ");
        assert_eq!(entries[2].index, 1);
        assert_eq!(entries[2].content, "Hello world");
    }

    #[test]
    fn tool_use_then_result_upgrades_status() {
        let lines = [
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"file.txt","is_error":false}]}}"#,
        ];
        let entries = entries_for(&lines);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, entries[1].index);
        let EntryType::ToolUse { tool } = &entries[0].entry_type else {
            panic!("expected tool use")
        };
        assert_eq!(tool.status, ToolStatus::Running);
        let EntryType::ToolUse { tool } = &entries[1].entry_type else {
            panic!("expected tool use")
        };
        assert_eq!(tool.status, ToolStatus::Success);
    }

    #[test]
    fn malformed_json_becomes_raw_assistant_message() {
        let entries = entries_for(&["not json at all"]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "not json at all");
    }

    #[test]
    fn error_result_emits_error_entry() {
        let entries = entries_for(&[r#"{"type":"result","isError":true,"result":"boom"}"#]);
        assert_eq!(entries.len(), 1);
        let EntryType::Error { error } = &entries[0].entry_type else {
            panic!("expected error entry")
        };
        assert_eq!(error.code.as_deref(), Some("TASK_ERROR"));
    }
}
