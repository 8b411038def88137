//! §4.C.2 JSONL normalizer for the Codex-family agent.

use std::path::PathBuf;

use super::{
    relativize, ChunkSource, EntryMetadata, EntryType, FileChange, IndexTracker, Normalizer,
    NormalizedEntry, ToolAction, ToolResult, ToolStatus, ToolUse,
};

pub struct CodexNormalizer {
    workdir: PathBuf,
    index: IndexTracker,
    thread_id: Option<String>,
    /// item id -> (index, tool name), so item.completed can upgrade a
    /// matching item.started entry in place.
    item_indices: std::collections::HashMap<String, (usize, String)>,
}

impl CodexNormalizer {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            index: IndexTracker::new(),
            thread_id: None,
            item_indices: std::collections::HashMap::new(),
        }
    }

    fn metadata(&self) -> Option<EntryMetadata> {
        self.thread_id.as_ref().map(|sid| EntryMetadata {
            session_id: Some(sid.clone()),
            model: None,
            extra: Default::default(),
        })
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

    fn map_item_action(&self, item: &serde_json::Value, item_type: &str) -> Option<ToolAction> {
        match item_type {
            "command_execution" => Some(ToolAction::CommandRun {
                command: item
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                result: item
                    .get("aggregated_output")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            }),
            "file_change" => {
                let changes = item
                    .get("changes")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .map(|c| FileChange {
                                change_type: c
                                    .get("kind")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("edit")
                                    .to_string(),
                                unified_diff: c
                                    .get("diff")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let path = item
                    .get("path")
                    .and_then(|v| v.as_str())
                    .map(|p| relativize(p, &self.workdir))
                    .unwrap_or_default();
                Some(ToolAction::FileEdit { path, changes })
            }
            "mcp_tool_call" | "tool_call" => Some(ToolAction::Tool {
                name: item
                    .get("tool")
                    .or_else(|| item.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("tool")
                    .to_string(),
                args: item.get("arguments").cloned(),
                result: item.get("result").cloned(),
            }),
            _ => None,
        }
    }

    fn tool_name_for(&self, item: &serde_json::Value, item_type: &str) -> String {
        item.get("tool")
            .or_else(|| item.get("name"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| item_type.to_string())
    }
}

impl Normalizer for CodexNormalizer {
    fn process_line(&mut self, line: &str, _source: ChunkSource) -> Vec<NormalizedEntry> {
        if line.trim().is_empty() {
            return Vec::new();
        }
        let json: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return vec![self.raw_line_entry(line)],
        };

        let Some(event_type) = json.get("type").and_then(|t| t.as_str()) else {
            return vec![self.raw_line_entry(line)];
        };

        match event_type {
            "thread.started" => {
                if let Some(tid) = json.get("thread_id").and_then(|v| v.as_str()) {
                    self.thread_id = Some(tid.to_string());
                }
                vec![NormalizedEntry {
                    index: self.index.fresh_index(),
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::SystemMessage,
                    content: format!("Thread: {}", self.thread_id.clone().unwrap_or_default()),
                    metadata: self.metadata(),
                }]
            }
            "turn.started" | "turn.completed" => Vec::new(),
            "item.started" => {
                let Some(item) = json.get("item") else {
                    return Vec::new();
                };
                let item_type = item
                    .get("item_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let Some(action) = self.map_item_action(item, item_type) else {
                    return Vec::new();
                };
                let id = item
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = self.tool_name_for(item, item_type);
                let idx = self.index.fresh_index();
                if !id.is_empty() {
                    self.item_indices.insert(id, (idx, name.clone()));
                }
                vec![NormalizedEntry {
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
                }]
            }
            "item.completed" => {
                let Some(item) = json.get("item") else {
                    return Vec::new();
                };
                let item_type = item
                    .get("item_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();

                match item_type {
                    "agent_message" => {
                        let text = item.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                        if text.is_empty() {
                            return Vec::new();
                        }
                        vec![NormalizedEntry {
                            index: self.index.fresh_index(),
                            timestamp: Some(chrono::Utc::now()),
                            entry_type: EntryType::AssistantMessage,
                            content: text.to_string(),
                            metadata: self.metadata(),
                        }]
                    }
                    "reasoning" => {
                        let text = item.get("text").and_then(|v| v.as_str());
                        vec![NormalizedEntry {
                            index: self.index.fresh_index(),
                            timestamp: Some(chrono::Utc::now()),
                            entry_type: EntryType::Thinking {
                                reasoning: text.map(String::from),
                            },
                            content: text.unwrap_or_default().to_string(),
                            metadata: self.metadata(),
                        }]
                    }
                    _ => {
                        let id = item.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                        let Some((idx, name)) = self.item_indices.remove(id) else {
                            let Some(action) = self.map_item_action(item, item_type) else {
                                return vec![NormalizedEntry {
                                    index: self.index.fresh_index(),
                                    timestamp: Some(chrono::Utc::now()),
                                    entry_type: EntryType::AssistantMessage,
                                    content: serde_json::to_string_pretty(item)
                                        .unwrap_or_else(|_| line.to_string()),
                                    metadata: self.metadata(),
                                }];
                            };
                            let name = self.tool_name_for(item, item_type);
                            return vec![NormalizedEntry {
                                index: self.index.fresh_index(),
                                timestamp: Some(chrono::Utc::now()),
                                entry_type: EntryType::ToolUse {
                                    tool: ToolUse {
                                        name,
                                        action,
                                        status: ToolStatus::Success,
                                        result: None,
                                    },
                                },
                                content: String::new(),
                                metadata: self.metadata(),
                            }];
                        };
                        let exit_code = item.get("exit_code").and_then(|v| v.as_i64());
                        let failed = exit_code.map(|c| c != 0).unwrap_or(false);
                        let action = self
                            .map_item_action(item, item_type)
                            .unwrap_or(ToolAction::Tool {
                                name: name.clone(),
                                args: None,
                                result: None,
                            });
                        vec![NormalizedEntry {
                            index: idx,
                            timestamp: Some(chrono::Utc::now()),
                            entry_type: EntryType::ToolUse {
                                tool: ToolUse {
                                    name,
                                    action,
                                    status: if failed { ToolStatus::Failed } else { ToolStatus::Success },
                                    result: Some(ToolResult {
                                        success: !failed,
                                        data: item.get("aggregated_output").cloned(),
                                        error: None,
                                    }),
                                },
                            },
                            content: String::new(),
                            metadata: self.metadata(),
                        }]
                    }
                }
            }
            "error" => {
                let message = json
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("codex error")
                    .to_string();
                vec![NormalizedEntry {
                    index: self.index.fresh_index(),
                    timestamp: Some(chrono::Utc::now()),
                    entry_type: EntryType::Error {
                        error: super::EntryError {
                            message,
                            code: Some("AGENT_ERROR".to_string()),
                            stack: None,
                        },
                    },
                    content: String::new(),
                    metadata: self.metadata(),
                }]
            }
            _ => vec![NormalizedEntry {
                index: self.index.fresh_index(),
                timestamp: Some(chrono::Utc::now()),
                entry_type: EntryType::AssistantMessage,
                content: serde_json::to_string_pretty(&json).unwrap_or_else(|_| line.to_string()),
                metadata: self.metadata(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries_for(lines: &[&str]) -> Vec<NormalizedEntry> {
        let mut n = CodexNormalizer::new(PathBuf::from("/work"));
        let mut out = Vec::new();
        for line in lines {
            out.extend(n.process_line(line, ChunkSource::Stdout));
        }
        out
    }

    #[test]
    fn thread_started_sets_session_metadata() {
        let entries = entries_for(&[r#"{"type":"thread.started","thread_id":"abc"}"#]);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].metadata.as_ref().unwrap().session_id.as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn turn_markers_produce_no_entries() {
        let entries = entries_for(&[r#"{"type":"turn.started"}"#, r#"{"type":"turn.completed"}"#]);
        assert!(entries.is_empty());
    }

    #[test]
    fn agent_message_and_reasoning_map_correctly() {
        let entries = entries_for(&[
            r#"{"type":"item.completed","item":{"item_type":"agent_message","text":"hi"}}"#,
            r#"{"type":"item.completed","item":{"item_type":"reasoning","text":"thinking..."}}"#,
        ]);
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].entry_type, EntryType::AssistantMessage));
        assert!(matches!(entries[1].entry_type, EntryType::Thinking { .. }));
    }

    #[test]
    fn command_execution_lifecycle_reuses_index() {
        let entries = entries_for(&[
            r#"{"type":"item.started","item":{"id":"c1","item_type":"command_execution","command":"ls"}}"#,
            r#"{"type":"item.completed","item":{"id":"c1","item_type":"command_execution","command":"ls","exit_code":0,"aggregated_output":"a.txt"}}"#,
        ]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, entries[1].index);
    }

    #[test]
    fn unknown_type_falls_back_to_pretty_json() {
        let entries = entries_for(&[r#"{"type":"mystery","foo":"bar"}"#]);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].content.contains("mystery"));
    }

    #[test]
    fn non_json_line_is_verbatim() {
        let entries = entries_for(&["plain text output"]);
        assert_eq!(entries[0].content, "plain text output");
    }
}
