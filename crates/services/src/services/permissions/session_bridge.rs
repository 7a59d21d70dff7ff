use std::sync::Arc;

use async_trait::async_trait;
use executors::approvals::{ExecutorApprovalError, ExecutorApprovalService};
use serde_json::Value;
use utils::approvals::{CreatePermissionRequest, PermissionStatus};

use super::{PermissionGate, SessionScope};

/// Binds one running agent session to the gate. Handed to the executor at
/// spawn so each tool call blocks on [`PermissionGate::evaluate`].
pub struct SessionApprovalBridge {
    gate: PermissionGate,
    scope: SessionScope,
}

impl SessionApprovalBridge {
    pub fn new(gate: PermissionGate, scope: SessionScope) -> Arc<Self> {
        Arc::new(Self { gate, scope })
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }
}

#[async_trait]
impl ExecutorApprovalService for SessionApprovalBridge {
    async fn request_tool_approval(
        &self,
        tool_name: &str,
        tool_input: Value,
        tool_call_id: &str,
    ) -> Result<PermissionStatus, ExecutorApprovalError> {
        let status = self
            .gate
            .evaluate(
                &self.scope,
                CreatePermissionRequest {
                    tool_name: tool_name.to_string(),
                    tool_input,
                    tool_call_id: tool_call_id.to_string(),
                },
            )
            .await
            .map_err(ExecutorApprovalError::request_failed)?;

        if matches!(status, PermissionStatus::Pending) {
            return Err(ExecutorApprovalError::request_failed(
                "permission finished in pending state",
            ));
        }
        Ok(status)
    }
}
