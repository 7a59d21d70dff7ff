//! Wire types for the Claude Code stream-json control protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::AgentEvent;

/// Top-level message types from CLI stdout
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CLIMessage {
    ControlRequest {
        request_id: String,
        request: ControlRequestType,
    },
    ControlResponse {
        response: ControlResponseType,
    },
    Result(Value),
    #[serde(untagged)]
    Other(Value),
}

/// Control requests the CLI sends to us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestType {
    CanUseTool {
        tool_name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

/// Control response from us to the CLI (outgoing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponseMessage {
    #[serde(rename = "type")]
    message_type: String, // Always "control_response"
    pub response: ControlResponseType,
}

impl ControlResponseMessage {
    pub fn new(response: ControlResponseType) -> Self {
        Self {
            message_type: "control_response".to_string(),
            response,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponseType {
    Success {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    Error {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Result of permission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "camelCase")]
pub enum PermissionResult {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    Deny {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupt: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User { message: ClaudeUserMessage },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeUserMessage {
    role: String,
    content: String,
}

impl Message {
    pub fn new_user(content: String) -> Self {
        Self::User {
            message: ClaudeUserMessage {
                role: "user".to_string(),
                content,
            },
        }
    }
}

/// Map one non-control stdout message onto zero or more agent events.
pub fn normalize_message(value: &Value) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    match value.get("type").and_then(Value::as_str) {
        Some("system") => match value.get("subtype").and_then(Value::as_str) {
            Some("init") => {
                if let Some(session_id) = value.get("session_id").and_then(Value::as_str) {
                    events.push(AgentEvent::SessionStarted {
                        session_id: session_id.to_string(),
                    });
                }
            }
            Some("compact_boundary") => events.push(AgentEvent::Compaction {
                trigger: value
                    .pointer("/compact_metadata/trigger")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            _ => {}
        },
        Some("assistant") => {
            for item in content_items(value) {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            events.push(AgentEvent::AssistantText {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("thinking") => {
                        if let Some(text) = item.get("thinking").and_then(Value::as_str) {
                            events.push(AgentEvent::Thinking {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("tool_use") => events.push(AgentEvent::ToolUse {
                        call_id: str_field(item, "id"),
                        tool_name: str_field(item, "name"),
                        input: item.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    _ => {}
                }
            }
        }
        Some("user") => {
            for item in content_items(value) {
                if item.get("type").and_then(Value::as_str) == Some("tool_result") {
                    events.push(AgentEvent::ToolResult {
                        call_id: str_field(item, "tool_use_id"),
                        is_error: item.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                        content: item.get("content").cloned().unwrap_or(Value::Null),
                    });
                }
            }
        }
        _ => {}
    }
    events
}

/// Map the terminal `result` message.
pub fn completion_event(value: &Value) -> AgentEvent {
    AgentEvent::Completed {
        result: value.get("result").and_then(Value::as_str).map(str::to_string),
        is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
        num_turns: value
            .get("num_turns")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
    }
}

fn content_items(value: &Value) -> impl Iterator<Item = &Value> {
    value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
