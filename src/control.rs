//! Component D: Control Protocol Peer.
//!
//! Owns a stream-JSON agent's stdin writer and a background read loop over
//! its stdout. Inbound `control_request`s are routed to the approval
//! handler (§4.E); everything else is forwarded to the normalizer via an
//! mpsc channel. Framing: one UTF-8 JSON object per line, both directions.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::approval::ApprovalHandler;
use crate::error::{Error, Result};
use crate::process::ProcessManager;

/// Lines that were not a `control_request` — forwarded for normalization.
pub type MessageSender = mpsc::Sender<String>;

pub struct ControlPeer {
    process_id: String,
    manager: ProcessManager,
    approval: Arc<ApprovalHandler>,
    /// requestId -> toolUseId, shared with the approval handler (§4.D/§4.E).
    pending_tool_use: Arc<Mutex<HashMap<String, String>>>,
}

impl ControlPeer {
    pub fn new(process_id: String, manager: ProcessManager, approval: Arc<ApprovalHandler>) -> Self {
        Self {
            process_id,
            manager,
            approval,
            pending_tool_use: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn write_line(&self, value: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.manager.send_input(&self.process_id, &line).await
    }

    /// Must be called before any user message is written.
    pub async fn initialize(&self, hooks: Value) -> Result<()> {
        self.write_line(&json!({
            "type": "sdk_control_request",
            "request": { "type": "initialize", "hooks": hooks },
        }))
        .await
    }

    pub async fn set_permission_mode(&self, mode: &str, destination: Option<&str>) -> Result<()> {
        self.write_line(&json!({
            "type": "sdk_control_request",
            "request": { "type": "set_permission_mode", "mode": mode, "destination": destination },
        }))
        .await
    }

    pub async fn send_user_message(&self, content: &str, session_id: Option<&str>) -> Result<()> {
        self.write_line(&json!({
            "type": "user",
            "message": { "role": "user", "content": content },
            "sessionId": session_id,
        }))
        .await
    }

    pub async fn send_interrupt(&self) -> Result<()> {
        self.write_line(&json!({
            "type": "control",
            "control": { "type": "interrupt" },
        }))
        .await
    }

    /// Handle one already-parsed stdout line. Returns `Some(line)` to be
    /// forwarded to the normalizer when the line was not a control message.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let Ok(json) = serde_json::from_str::<Value>(line) else {
            tracing::debug!(process_id = %self.process_id, "malformed control-protocol line");
            return Some(line.to_string());
        };

        if json.get("type").and_then(|t| t.as_str()) != Some("control_request") {
            return Some(line.to_string());
        }

        let request_id = json
            .get("requestId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let request = json.get("request").cloned().unwrap_or(Value::Null);

        let response = self.dispatch(&request_id, &request).await;
        let inner = match response {
            Ok(resp) => json!({ "type": "success", "requestId": request_id, "response": resp }),
            Err(e) => json!({ "type": "error", "requestId": request_id, "error": e.to_string() }),
        };
        let envelope = json!({ "type": "control_response", "response": inner });
        if let Err(e) = self.write_line(&envelope).await {
            tracing::warn!(process_id = %self.process_id, error = %e, "failed to write control response");
        }
        None
    }

    async fn dispatch(&self, request_id: &str, request: &Value) -> Result<Value> {
        let request_type = request.get("type").and_then(|t| t.as_str()).unwrap_or_default();
        match request_type {
            "can_use_tool" => {
                let tool_use_id = {
                    let mut pending = self.pending_tool_use.lock().await;
                    pending.remove(request_id)
                };
                self.approval
                    .handle_can_use_tool(request_id, tool_use_id.as_deref(), request)
                    .await
            }
            "hook_callback" => {
                if let Some(tool_use_id) = request.get("toolUseId").and_then(|v| v.as_str()) {
                    self.pending_tool_use
                        .lock()
                        .await
                        .insert(request_id.to_string(), tool_use_id.to_string());
                }
                Ok(json!({ "permissionDecision": "ask" }))
            }
            other => Err(Error::Protocol(format!("unknown control request type: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_control_lines_pass_through() {
        // handle_line requires an async runtime only because it may write a
        // response; a plain assistant_message line never reaches dispatch.
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let manager = ProcessManager::new();
        let approval = Arc::new(ApprovalHandler::new(None));
        let peer = ControlPeer::new("p1".to_string(), manager, approval);
        rt.block_on(async {
            let forwarded = peer.handle_line(r#"{"type":"assistant"}"#).await;
            assert_eq!(forwarded, Some(r#"{"type":"assistant"}"#.to_string()));
        });
    }

    #[test]
    fn malformed_json_is_forwarded_not_dropped() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let manager = ProcessManager::new();
        let approval = Arc::new(ApprovalHandler::new(None));
        let peer = ControlPeer::new("p1".to_string(), manager, approval);
        rt.block_on(async {
            let forwarded = peer.handle_line("not json").await;
            assert_eq!(forwarded, Some("not json".to_string()));
        });
    }

    /// S2: a denied `can_use_tool` request gets exactly one
    /// `control_response` line written back, in the documented shape.
    #[tokio::test]
    async fn s2_denied_tool_use_writes_exact_control_response() {
        use crate::approval::{ApprovalDecision, ApprovalRequest, ApprovalService};
        use crate::process::{AcquireConfig, ProcessMode};
        use async_trait::async_trait;
        use std::time::Duration;
        use tokio_stream::StreamExt;

        struct AlwaysDenyDangerous;
        #[async_trait]
        impl ApprovalService for AlwaysDenyDangerous {
            async fn decide(&self, _request: ApprovalRequest) -> ApprovalDecision {
                ApprovalDecision::Denied { reason: Some("dangerous".to_string()) }
            }
        }

        let manager = ProcessManager::new();
        // `cat` echoes stdin to stdout, letting the test observe exactly
        // what the peer wrote without a real agent binary.
        let spawned = manager
            .acquire(AcquireConfig {
                program: "cat".to_string(),
                args: vec![],
                cwd: std::env::temp_dir(),
                env: HashMap::new(),
                mode: ProcessMode::Pipe,
                timeout: None,
                retry: None,
            })
            .await
            .expect("spawn cat");

        let approval = Arc::new(ApprovalHandler::new(Some(Arc::new(AlwaysDenyDangerous))));
        let peer = ControlPeer::new(spawned.id.clone(), manager.clone(), approval);

        let request = r#"{"type":"control_request","requestId":"r1","request":{"type":"can_use_tool","toolName":"Bash","input":{"command":"rm -rf /"}}}"#;
        let forwarded = peer.handle_line(request).await;
        assert_eq!(forwarded, None);

        let mut output = spawned.output;
        let mut echoed = Vec::new();
        while echoed.is_empty() || !echoed.ends_with(b"\n") {
            let Some(chunk) = tokio::time::timeout(Duration::from_secs(2), output.next())
                .await
                .expect("timed out waiting for cat to echo")
            else {
                break;
            };
            echoed.extend_from_slice(&chunk.data);
        }
        let line = String::from_utf8(echoed).unwrap();
        let expected = r#"{"type":"control_response","response":{"type":"success","requestId":"r1","response":{"interrupt":false,"message":"dangerous","result":"deny"}}}"#;
        // Compare as parsed JSON so key order doesn't matter.
        let actual: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        let expected: serde_json::Value = serde_json::from_str(expected).unwrap();
        assert_eq!(actual, expected);
    }
}
