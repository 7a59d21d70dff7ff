use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized event emitted by a running agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    SessionStarted {
        session_id: String,
    },
    /// The agent asked to run a tool. Emitted before the call is gated.
    ToolUse {
        call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        is_error: bool,
        #[serde(default)]
        content: Value,
    },
    Thinking {
        text: String,
    },
    AssistantText {
        text: String,
    },
    /// The agent compacted its context window.
    Compaction {
        #[serde(default)]
        trigger: Option<String>,
    },
    Completed {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        num_turns: Option<u32>,
    },
    Error {
        message: String,
    },
}
