use std::{process::Stdio, sync::Arc};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use serde::{Deserialize, Serialize};
use tokio::{process::Command, sync::mpsc};
use tokio_util::sync::CancellationToken;
use utils::shell::resolve_executable_path_blocking;

use crate::{
    approvals::ExecutorApprovalService,
    command::kill_process_group,
    events::AgentEvent,
    executors::{CodingAgent, EVENT_CHANNEL_CAPACITY, ExecutorError, SpawnRequest, SpawnedAgent},
};

pub mod client;
pub mod protocol;
pub mod types;

use client::ClaudeAgentClient;
use protocol::{ProtocolExit, ProtocolPeer};

/// Claude Code driven over its stream-json stdio protocol, with every tool
/// call routed through `--permission-prompt-tool stdio`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeCode {
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_executable() -> String {
    "claude".to_string()
}

impl Default for ClaudeCode {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            extra_args: Vec::new(),
            model: None,
        }
    }
}

impl ClaudeCode {
    pub fn build_args(&self, request: &SpawnRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--permission-prompt-tool",
            "stdio",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if request.resume {
            args.push("--resume".to_string());
        } else {
            args.push("--session-id".to_string());
        }
        args.push(request.session_id.clone());
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl CodingAgent for ClaudeCode {
    async fn spawn(
        &self,
        request: SpawnRequest,
        approvals: Arc<dyn ExecutorApprovalService>,
    ) -> Result<SpawnedAgent, ExecutorError> {
        let executable = self.executable.clone();
        let program = tokio::task::spawn_blocking(move || resolve_executable_path_blocking(&executable))
            .await
            .map_err(|e| ExecutorError::Protocol(e.to_string()))?
            .ok_or_else(|| ExecutorError::ExecutableNotFound(self.executable.clone()))?;

        let mut command = Command::new(program);
        command
            .args(self.build_args(&request))
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.group_spawn().map_err(ExecutorError::SpawnError)?;
        let stdin = child
            .inner()
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::Protocol("agent stdin unavailable".to_string()))?;
        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Protocol("agent stdout unavailable".to_string()))?;
        let stderr = child.inner().stderr.take();

        let peer = ProtocolPeer::new(stdin);
        peer.send_user_message(request.prompt.clone()).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let client = ClaudeAgentClient::new(approvals);
        let session_id = request.session_id.clone();

        if let Some(stderr) = stderr {
            let session_id = session_id.clone();
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %session_id, "agent stderr: {line}");
                }
            });
        }

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let exit = peer.run(stdout, client, tx.clone(), task_cancel).await;
            match exit {
                Ok(ProtocolExit::Completed) => {
                    if let Err(e) = child.wait().await {
                        tracing::warn!(session_id = %session_id, "waiting for agent exit failed: {e}");
                    }
                }
                Ok(ProtocolExit::Cancelled) => {
                    if let Err(e) = kill_process_group(&mut child).await {
                        tracing::error!(session_id = %session_id, "failed to kill agent process group: {e}");
                    }
                }
                Ok(ProtocolExit::Eof) => {
                    let message = match child.wait().await {
                        Ok(status) => format!("agent exited before completing ({status})"),
                        Err(e) => format!("agent exited before completing: {e}"),
                    };
                    let _ = tx.send(AgentEvent::Error { message }).await;
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, "agent protocol failure: {e}");
                    let _ = tx
                        .send(AgentEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    if let Err(e) = kill_process_group(&mut child).await {
                        tracing::error!(session_id = %session_id, "failed to kill agent process group: {e}");
                    }
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
