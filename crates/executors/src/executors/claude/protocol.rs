use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, ChildStdout},
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;

use super::{
    client::ClaudeAgentClient,
    types::{
        CLIMessage, ControlRequestType, ControlResponseMessage, ControlResponseType, Message,
        completion_event, normalize_message,
    },
};
use crate::{events::AgentEvent, executors::ExecutorError};

/// Outcome of draining the CLI's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolExit {
    /// A `result` message was seen.
    Completed,
    /// Stdout closed without a result.
    Eof,
    Cancelled,
}

/// Bidirectional handle over the CLI's stdio.
#[derive(Clone)]
pub struct ProtocolPeer {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl ProtocolPeer {
    pub fn new(stdin: ChildStdin) -> Self {
        Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
        }
    }

    pub async fn send_user_message(&self, content: String) -> Result<(), ExecutorError> {
        self.send_json(&Message::new_user(content)).await
    }

    /// Close stdin so the CLI exits once it has nothing left to do.
    pub async fn close(&self) {
        self.stdin.lock().await.take();
    }

    async fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<(), ExecutorError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ExecutorError::Protocol("stdin already closed".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read stdout until it closes, forwarding normalized events and
    /// answering control requests. A `can_use_tool` request is answered only
    /// after the gate decides, and no further line is read meanwhile, so the
    /// agent cannot run a second tool before the first is resolved.
    pub async fn run(
        &self,
        stdout: ChildStdout,
        client: Arc<ClaudeAgentClient>,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<ProtocolExit, ExecutorError> {
        let mut lines = BufReader::new(stdout).lines();
        let mut completed = false;
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return Ok(ProtocolExit::Cancelled),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let message = match serde_json::from_str::<CLIMessage>(line) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("Skipping non-JSON agent output ({e}): {line}");
                    continue;
                }
            };
            match message {
                CLIMessage::ControlRequest {
                    request_id,
                    request:
                        ControlRequestType::CanUseTool {
                            tool_name,
                            input,
                            tool_use_id,
                        },
                } => {
                    let decision = tokio::select! {
                        _ = cancel.cancelled() => return Ok(ProtocolExit::Cancelled),
                        decision = client.on_can_use_tool(tool_name, input, tool_use_id) => decision,
                    };
                    let response = ControlResponseMessage::new(ControlResponseType::Success {
                        request_id,
                        response: Some(serde_json::to_value(decision)?),
                    });
                    self.send_json(&response).await?;
                }
                CLIMessage::ControlRequest {
                    request_id,
                    request: ControlRequestType::Unsupported,
                } => {
                    let response = ControlResponseMessage::new(ControlResponseType::Error {
                        request_id,
                        error: Some("unsupported control request".to_string()),
                    });
                    self.send_json(&response).await?;
                }
                CLIMessage::ControlResponse { .. } => {}
                CLIMessage::Result(value) => {
                    completed = true;
                    if events.send(completion_event(&value)).await.is_err() {
                        tracing::debug!("event receiver dropped");
                    }
                    // One prompt per process; follow-ups resume in a new one.
                    self.close().await;
                }
                CLIMessage::Other(value) => {
                    for event in normalize_message(&value) {
                        if events.send(event).await.is_err() {
                            tracing::debug!("event receiver dropped");
                        }
                    }
                }
            }
        }
        Ok(if completed {
            ProtocolExit::Completed
        } else {
            ProtocolExit::Eof
        })
    }
}
