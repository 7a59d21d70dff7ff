//! In-process agent that replays a fixed script. Used by tests in place of a
//! real agent binary.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    approvals::ExecutorApprovalService,
    events::AgentEvent,
    executors::{CodingAgent, EVENT_CHANNEL_CAPACITY, ExecutorError, SpawnRequest, SpawnedAgent},
};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(AgentEvent),
    /// Emit a `ToolUse`, block on the approval service, then emit the result.
    ToolCall { tool_name: String, input: Value },
    Sleep(Duration),
    /// Park until cancelled.
    Hang,
    /// End the stream without completing, as a crashed process would.
    Crash,
}

impl ScriptStep {
    pub fn tool(tool_name: &str, input: Value) -> Self {
        Self::ToolCall {
            tool_name: tool_name.to_string(),
            input,
        }
    }

    pub fn complete(result: &str) -> Self {
        Self::Emit(AgentEvent::Completed {
            result: Some(result.to_string()),
            is_error: false,
            cost_usd: None,
            num_turns: None,
        })
    }
}

pub struct ScriptedAgent {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    fallback: Vec<ScriptStep>,
    spawned: Mutex<Vec<SpawnRequest>>,
    fail_next_spawn: AtomicBool,
}

impl ScriptedAgent {
    /// Every spawn without a queued script runs `fallback`.
    pub fn new(fallback: Vec<ScriptStep>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            spawned: Mutex::new(Vec::new()),
            fail_next_spawn: AtomicBool::new(false),
        })
    }

    /// Completes immediately on every spawn.
    pub fn completing() -> Arc<Self> {
        Self::new(vec![ScriptStep::complete("done")])
    }

    /// Never completes until cancelled.
    pub fn hanging() -> Arc<Self> {
        Self::new(vec![ScriptStep::Hang])
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts.lock().push_back(steps);
    }

    pub fn fail_next_spawn(&self) {
        self.fail_next_spawn.store(true, Ordering::SeqCst);
    }

    pub fn spawn_requests(&self) -> Vec<SpawnRequest> {
        self.spawned.lock().clone()
    }
}

#[async_trait]
impl CodingAgent for ScriptedAgent {
    async fn spawn(
        &self,
        request: SpawnRequest,
        approvals: Arc<dyn ExecutorApprovalService>,
    ) -> Result<SpawnedAgent, ExecutorError> {
        if self.fail_next_spawn.swap(false, Ordering::SeqCst) {
            return Err(ExecutorError::SpawnError(std::io::Error::other(
                "scripted spawn failure",
            )));
        }
        self.spawned.lock().push(request.clone());
        let steps = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let session_id = request.session_id.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(AgentEvent::SessionStarted {
                    session_id: session_id.clone(),
                })
                .await;
            for step in steps {
                if task_cancel.is_cancelled() {
                    return;
                }
                match step {
                    ScriptStep::Emit(event) => {
                        let _ = tx.send(event).await;
                    }
                    ScriptStep::ToolCall { tool_name, input } => {
                        let call_id = format!("toolu_{}", Uuid::new_v4().simple());
                        let _ = tx
                            .send(AgentEvent::ToolUse {
                                call_id: call_id.clone(),
                                tool_name: tool_name.clone(),
                                input: input.clone(),
                            })
                            .await;
                        let status = tokio::select! {
                            _ = task_cancel.cancelled() => return,
                            status = approvals.request_tool_approval(&tool_name, input, &call_id) => status,
                        };
                        let (is_error, content) = match status {
                            Ok(status) => (!status.is_approved(), json!(status)),
                            Err(e) => (true, json!({ "error": e.to_string() })),
                        };
                        let _ = tx
                            .send(AgentEvent::ToolResult {
                                call_id,
                                is_error,
                                content,
                            })
                            .await;
                    }
                    ScriptStep::Sleep(duration) => {
                        tokio::select! {
                            _ = task_cancel.cancelled() => return,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    ScriptStep::Hang => {
                        task_cancel.cancelled().await;
                        return;
                    }
                    ScriptStep::Crash => return,
                }
            }
        });

        Ok(SpawnedAgent {
            session_id: request.session_id,
            events: rx,
            cancel,
        })
    }
}
