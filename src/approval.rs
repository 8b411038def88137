//! Component E: Approval Handler.
//!
//! Stateless aside from the `requestId → toolUseId` map, which control.rs
//! owns jointly and passes in per call. Applies the `ExitPlanMode`
//! short-circuit, then defers to an optional [`ApprovalService`].

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;

/// The reserved tool name that always auto-approves and flips the session
/// into bypass-permissions mode (§4.E rule 1).
const EXIT_PLAN_MODE_TOOL: &str = "ExitPlanMode";

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
}

#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: Option<String> },
    Timeout,
}

/// Pluggable policy consulted for every non-shortcut tool use.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn decide(&self, request: ApprovalRequest) -> ApprovalDecision;
}

pub struct ApprovalHandler {
    service: Option<std::sync::Arc<dyn ApprovalService>>,
}

impl ApprovalHandler {
    pub fn new(service: Option<std::sync::Arc<dyn ApprovalService>>) -> Self {
        Self { service }
    }

    pub async fn handle_can_use_tool(
        &self,
        request_id: &str,
        tool_use_id: Option<&str>,
        request: &Value,
    ) -> Result<Value> {
        let tool_name = request
            .get("toolName")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if tool_name == EXIT_PLAN_MODE_TOOL {
            return Ok(json!({
                "result": "allow",
                "updatedPermissions": [{
                    "updateType": "set_mode",
                    "mode": "bypass_permissions",
                    "destination": "session",
                }],
            }));
        }

        let Some(service) = &self.service else {
            return Ok(json!({ "result": "allow" }));
        };

        let tool_input = request.get("input").cloned().unwrap_or(Value::Null);
        let approval_request = ApprovalRequest {
            request_id: tool_use_id.unwrap_or(request_id).to_string(),
            tool_name: tool_name.to_string(),
            tool_input,
        };

        let decision = service.decide(approval_request).await;
        Ok(match decision {
            ApprovalDecision::Approved => json!({ "result": "allow" }),
            ApprovalDecision::Denied { reason } => json!({
                "result": "deny",
                "message": reason.unwrap_or_else(|| "Tool use denied".to_string()),
                "interrupt": false,
            }),
            ApprovalDecision::Timeout => json!({
                "result": "deny",
                "message": "Approval request timed out",
                "interrupt": false,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDeny;
    #[async_trait]
    impl ApprovalService for AlwaysDeny {
        async fn decide(&self, _request: ApprovalRequest) -> ApprovalDecision {
            ApprovalDecision::Denied { reason: Some("no".to_string()) }
        }
    }

    #[tokio::test]
    async fn exit_plan_mode_short_circuits_even_with_a_denying_service() {
        let handler = ApprovalHandler::new(Some(std::sync::Arc::new(AlwaysDeny)));
        let resp = handler
            .handle_can_use_tool("r1", None, &json!({ "toolName": "ExitPlanMode", "input": {} }))
            .await
            .unwrap();
        assert_eq!(resp["result"], "allow");
    }

    #[tokio::test]
    async fn no_service_configured_allows_everything() {
        let handler = ApprovalHandler::new(None);
        let resp = handler
            .handle_can_use_tool("r1", None, &json!({ "toolName": "Bash", "input": {} }))
            .await
            .unwrap();
        assert_eq!(resp["result"], "allow");
    }

    #[tokio::test]
    async fn denied_decision_maps_to_deny_with_reason() {
        let handler = ApprovalHandler::new(Some(std::sync::Arc::new(AlwaysDeny)));
        let resp = handler
            .handle_can_use_tool("r1", Some("tool-use-1"), &json!({ "toolName": "Bash", "input": {} }))
            .await
            .unwrap();
        assert_eq!(resp["result"], "deny");
        assert_eq!(resp["message"], "no");
    }

    #[tokio::test]
    async fn timeout_decision_maps_to_deny_with_fixed_message() {
        struct AlwaysTimeout;
        #[async_trait]
        impl ApprovalService for AlwaysTimeout {
            async fn decide(&self, _request: ApprovalRequest) -> ApprovalDecision {
                ApprovalDecision::Timeout
            }
        }
        let handler = ApprovalHandler::new(Some(std::sync::Arc::new(AlwaysTimeout)));
        let resp = handler
            .handle_can_use_tool("r1", None, &json!({ "toolName": "Bash", "input": {} }))
            .await
            .unwrap();
        assert_eq!(resp["message"], "Approval request timed out");
    }
}
