use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use utils::approvals::PermissionStatus;

/// Errors emitted by executor approval services.
#[derive(Debug, Error)]
pub enum ExecutorApprovalError {
    #[error("executor approval session not registered")]
    SessionNotRegistered,
    #[error("executor approval request failed: {0}")]
    RequestFailed(String),
    #[error("executor approval service unavailable")]
    ServiceUnavailable,
}

impl ExecutorApprovalError {
    pub fn request_failed<E: fmt::Display>(err: E) -> Self {
        Self::RequestFailed(err.to_string())
    }
}

/// The gate an agent session must pass through before executing a tool call.
///
/// Implementations resolve only once a final decision exists; the calling
/// agent stays suspended on the returned future until then.
#[async_trait]
pub trait ExecutorApprovalService: Send + Sync {
    async fn request_tool_approval(
        &self,
        tool_name: &str,
        tool_input: Value,
        tool_call_id: &str,
    ) -> Result<PermissionStatus, ExecutorApprovalError>;
}

/// Approves everything. Only useful for agents that never call tools.
#[derive(Debug, Default)]
pub struct NoopExecutorApprovalService;

#[async_trait]
impl ExecutorApprovalService for NoopExecutorApprovalService {
    async fn request_tool_approval(
        &self,
        _tool_name: &str,
        _tool_input: Value,
        _tool_call_id: &str,
    ) -> Result<PermissionStatus, ExecutorApprovalError> {
        Ok(PermissionStatus::Approved)
    }
}
