use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool_signature::ActionSignature;

pub const PERMISSION_TIMEOUT_SECONDS: i64 = 3600; // 1 hour

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePermissionRequest {
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub tool_call_id: String,
}

/// A tool call suspended at the permission gate, scoped to the session and
/// task that emitted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub task_id: Uuid,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub tool_call_id: String,
    pub signature: ActionSignature,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
}

impl PermissionRequest {
    pub fn from_create(
        request: CreatePermissionRequest,
        session_id: &str,
        task_id: Uuid,
        timeout_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        let signature = ActionSignature::from_tool_call(&request.tool_name, &request.tool_input);
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            task_id,
            tool_name: request.tool_name,
            tool_input: request.tool_input,
            tool_call_id: request.tool_call_id,
            signature,
            created_at: now,
            timeout_at: now + Duration::seconds(timeout_seconds),
        }
    }
}

/// The four answers an operator can give to a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionDecision {
    AllowOnce,
    DenyOnce {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Approves and persists an allow rule for the request's signature.
    AlwaysAllow,
    /// Denies and persists a deny rule for the request's signature.
    AlwaysDeny {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl PermissionDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::AllowOnce | Self::AlwaysAllow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::DenyOnce { reason } | Self::AlwaysDeny { reason } => reason.as_deref(),
            Self::AllowOnce | Self::AlwaysAllow => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied {
        #[serde(default)]
        reason: Option<String>,
    },
    TimedOut,
}

impl PermissionStatus {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl From<&PermissionDecision> for PermissionStatus {
    fn from(decision: &PermissionDecision) -> Self {
        if decision.is_allow() {
            PermissionStatus::Approved
        } else {
            PermissionStatus::Denied {
                reason: decision.reason().map(str::to_string),
            }
        }
    }
}

/// Where a final status came from. Persisted in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DecisionSource {
    DenyRule { pattern: String },
    AllowRule { pattern: String },
    Operator { decision: PermissionDecision },
    Timeout,
}
