use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{approvals::ExecutorApprovalService, events::AgentEvent};

pub mod claude;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;

/// Buffered events per session before the agent side applies back-pressure.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("failed to spawn agent: {0}")]
    SpawnError(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("agent protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Approval(#[from] crate::approvals::ExecutorApprovalError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub working_dir: PathBuf,
    pub prompt: String,
    /// Identifier of the logical conversation. Reused verbatim when resuming.
    pub session_id: String,
    pub resume: bool,
}

/// A running agent session. Dropping `events` does not stop the agent;
/// cancel `cancel` for that.
pub struct SpawnedAgent {
    pub session_id: String,
    pub events: mpsc::Receiver<AgentEvent>,
    pub cancel: CancellationToken,
}

/// Spawn-and-stream interface to an external coding agent.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn spawn(
        &self,
        request: SpawnRequest,
        approvals: Arc<dyn ExecutorApprovalService>,
    ) -> Result<SpawnedAgent, ExecutorError>;
}
