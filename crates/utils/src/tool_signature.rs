use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys that carry the "primary" argument of common agent tools, in priority order.
const PRIMARY_ARGUMENT_KEYS: [&str; 8] = [
    "command",
    "file_path",
    "notebook_path",
    "path",
    "pattern",
    "url",
    "query",
    "description",
];

/// Normalized identity of one tool call: the tool name plus a canonical
/// rendering of its arguments. Rendered as `Tool(argument)` or just `Tool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSignature {
    pub tool_name: String,
    pub argument: String,
}

impl ActionSignature {
    pub fn new(tool_name: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into().trim().to_string(),
            argument: collapse_whitespace(&argument.into()),
        }
    }

    pub fn from_tool_call(tool_name: &str, input: &Value) -> Self {
        Self::new(tool_name, primary_argument(input))
    }

    /// Parse the rendered `Tool(argument)` form back into a signature.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(open) = raw.find('(')
            && raw.ends_with(')')
        {
            let tool = &raw[..open];
            let arg = &raw[open + 1..raw.len() - 1];
            return Self::new(tool, arg);
        }
        Self::new(raw, "")
    }
}

impl fmt::Display for ActionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.argument.is_empty() {
            write!(f, "{}", self.tool_name)
        } else {
            write!(f, "{}({})", self.tool_name, self.argument)
        }
    }
}

fn primary_argument(input: &Value) -> String {
    match input {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            for key in PRIMARY_ARGUMENT_KEYS {
                if let Some(Value::String(s)) = map.get(key) {
                    return s.clone();
                }
            }
            canonical_json(input)
        }
        other => canonical_json(other),
    }
}

/// Compact JSON with object keys sorted, so that argument order does not
/// change the signature.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sort(v))).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
