use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }
}

/// A model-issued request to invoke a named local capability.
/// Immutable once created; `arguments` is the raw JSON payload exactly as
/// the model sent it, parsed only at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One entry in the conversation history. The full ordered sequence is the
/// context sent to the model on every round; append-only during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_call: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_call: None,
        }
    }

    /// Placeholder assistant message describing a tool request. The textual
    /// form is the same one `session::parse_inline_tool_call` recognizes.
    pub fn assistant_tool_call(call: &ToolCall) -> Self {
        Self {
            role: Role::Assistant,
            content: format!(
                "Request to use tool: `{}` with args: {}",
                call.name, call.arguments
            ),
            tool_call_id: None,
            tool_call: Some(call.clone()),
        }
    }

    /// A tool-result message; `tool_call_id` must match a preceding
    /// assistant tool-call message.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_call: None,
        }
    }
}

/// One incremental unit of a streaming model response. Transient; never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Text(String),
    Reasoning(String),
    ToolCall(ToolCall),
}
