use std::sync::Arc;

use utils::approvals::PermissionStatus;
use uuid::Uuid;

use super::types::PermissionResult;
use crate::approvals::ExecutorApprovalService;

/// Answers `can_use_tool` requests by routing them through the session's
/// approval service.
pub struct ClaudeAgentClient {
    approvals: Arc<dyn ExecutorApprovalService>,
}

impl ClaudeAgentClient {
    pub fn new(approvals: Arc<dyn ExecutorApprovalService>) -> Arc<Self> {
        Arc::new(Self { approvals })
    }

    pub async fn on_can_use_tool(
        &self,
        tool_name: String,
        input: serde_json::Value,
        tool_use_id: Option<String>,
    ) -> PermissionResult {
        // Every call is gated, even when the CLI omits the tool_use_id.
        let call_id = tool_use_id.unwrap_or_else(|| {
            tracing::warn!(tool_name = %tool_name, "can_use_tool without tool_use_id");
            format!("synthetic-{}", Uuid::new_v4())
        });

        let status = self
            .approvals
            .request_tool_approval(&tool_name, input.clone(), &call_id)
            .await;

        match status {
            Ok(status) => permission_result(status, input),
            Err(e) => {
                tracing::error!("Tool approval request failed: {e}");
                PermissionResult::Deny {
                    message: "Tool approval request failed".to_string(),
                    interrupt: Some(false),
                }
            }
        }
    }
}

fn permission_result(status: PermissionStatus, input: serde_json::Value) -> PermissionResult {
    match status {
        PermissionStatus::Approved => PermissionResult::Allow {
            updated_input: input,
        },
        PermissionStatus::Denied { reason } => PermissionResult::Deny {
            message: reason.unwrap_or_else(|| "Denied by operator".to_string()),
            interrupt: Some(false),
        },
        PermissionStatus::TimedOut => PermissionResult::Deny {
            message: "Approval request timed out".to_string(),
            interrupt: Some(false),
        },
        PermissionStatus::Pending => PermissionResult::Deny {
            message: "Approval still pending (unexpected)".to_string(),
            interrupt: Some(false),
        },
    }
}
