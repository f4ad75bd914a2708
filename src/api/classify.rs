use super::sse::SseEvent;
use crate::logging;
use crate::types::{StreamChunk, ToolCall};
use serde::Deserialize;
use serde_json::Value;

/// One provider-normalized streaming delta, ready for classification.
#[derive(Debug, Clone, Default)]
pub struct ProviderDelta {
    pub text: Option<String>,
    pub reasoning: Option<String>,
    pub tool_call: Option<ToolCall>,
}

/// Map one normalized delta to at most one chunk. A tool-call fragment wins
/// over any accompanying text; empty deltas drop silently. Pure mapping, no
/// side effects.
pub fn classify(delta: ProviderDelta) -> Option<StreamChunk> {
    if let Some(call) = delta.tool_call {
        return Some(StreamChunk::ToolCall(call));
    }
    if let Some(text) = delta.reasoning.filter(|t| !t.is_empty()) {
        return Some(StreamChunk::Reasoning(text));
    }
    if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
        return Some(StreamChunk::Text(text));
    }
    None
}

struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn into_delta(self) -> ProviderDelta {
        let arguments = if self.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            self.arguments
        };
        ProviderDelta {
            tool_call: Some(ToolCall {
                id: self.id,
                name: self.name,
                arguments,
            }),
            ..ProviderDelta::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Anthropic messages protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {},
    ContentBlockStart {
        content_block: AnthropicBlock,
    },
    ContentBlockDelta {
        delta: AnthropicDelta,
    },
    ContentBlockStop {},
    MessageDelta {},
    MessageStop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
}

/// Stateful adapter from Anthropic SSE events to normalized deltas. A
/// tool_use block's arguments stream via input_json_delta and are released
/// as one complete call at content_block_stop; only one tool call can be in
/// flight at a time.
#[derive(Default)]
pub struct AnthropicDecoder {
    pending_tool: Option<PendingToolCall>,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, event: &SseEvent) -> Vec<ProviderDelta> {
        let parsed: AnthropicEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(error) => {
                logging::emit_sse_decode_error(
                    event.event.as_deref(),
                    &event.data,
                    &error.to_string(),
                );
                return Vec::new();
            }
        };

        match parsed {
            AnthropicEvent::ContentBlockStart { content_block, .. } => match content_block {
                AnthropicBlock::Text { text } => vec![ProviderDelta {
                    text: Some(text),
                    ..ProviderDelta::default()
                }],
                AnthropicBlock::Thinking { thinking } => vec![ProviderDelta {
                    reasoning: Some(thinking),
                    ..ProviderDelta::default()
                }],
                AnthropicBlock::ToolUse { id, name, input } => {
                    let arguments = match &input {
                        Value::Object(map) if !map.is_empty() => input.to_string(),
                        _ => String::new(),
                    };
                    self.pending_tool = Some(PendingToolCall {
                        id,
                        name,
                        arguments,
                    });
                    Vec::new()
                }
                AnthropicBlock::Unknown => Vec::new(),
            },
            AnthropicEvent::ContentBlockDelta { delta, .. } => {
                if let Some(partial) = delta.partial_json {
                    if let Some(pending) = self.pending_tool.as_mut() {
                        pending.arguments.push_str(&partial);
                    }
                    return Vec::new();
                }
                vec![ProviderDelta {
                    text: delta.text,
                    reasoning: delta.thinking,
                    ..ProviderDelta::default()
                }]
            }
            AnthropicEvent::ContentBlockStop { .. } => self
                .pending_tool
                .take()
                .map(|pending| vec![pending.into_delta()])
                .unwrap_or_default(),
            AnthropicEvent::MessageStart {}
            | AnthropicEvent::MessageDelta {}
            | AnthropicEvent::MessageStop
            | AnthropicEvent::Unknown => Vec::new(),
        }
    }

    /// Flush a tool call whose stop event never arrived.
    pub fn finish(&mut self) -> Option<ProviderDelta> {
        self.pending_tool.take().map(PendingToolCall::into_delta)
    }
}

// ---------------------------------------------------------------------------
// OpenAI chat-completions protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: OpenAiFunctionDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Stateful adapter from OpenAI chat-completion chunks to normalized deltas.
/// Tool-call fragments accumulate until finish_reason announces the call is
/// complete; text and reasoning pass straight through.
#[derive(Default)]
pub struct OpenAiDecoder {
    pending_tool: Option<PendingToolCall>,
    call_counter: usize,
}

impl OpenAiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, event: &SseEvent) -> Vec<ProviderDelta> {
        let parsed: OpenAiChunk = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(error) => {
                logging::emit_sse_decode_error(
                    event.event.as_deref(),
                    &event.data,
                    &error.to_string(),
                );
                return Vec::new();
            }
        };

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Vec::new();
        };

        let mut deltas = Vec::new();

        for fragment in choice.delta.tool_calls {
            let pending = self.pending_tool.get_or_insert_with(|| {
                self.call_counter += 1;
                PendingToolCall {
                    id: format!("call_{}", self.call_counter),
                    name: String::new(),
                    arguments: String::new(),
                }
            });
            if let Some(id) = fragment.id {
                pending.id = id;
            }
            if let Some(name) = fragment.function.name {
                pending.name = name;
            }
            if let Some(arguments) = fragment.function.arguments {
                pending.arguments.push_str(&arguments);
            }
        }

        if let Some(text) = choice.delta.content {
            deltas.push(ProviderDelta {
                text: Some(text),
                ..ProviderDelta::default()
            });
        }
        if let Some(reasoning) = choice.delta.reasoning {
            deltas.push(ProviderDelta {
                reasoning: Some(reasoning),
                ..ProviderDelta::default()
            });
        }

        if choice.finish_reason.as_deref() == Some("tool_calls") {
            if let Some(delta) = self.finish() {
                deltas.push(delta);
            }
        }

        deltas
    }

    /// Flush an accumulated tool call at end of stream.
    pub fn finish(&mut self) -> Option<ProviderDelta> {
        let pending = self.pending_tool.take()?;
        if pending.name.is_empty() {
            return None;
        }
        Some(pending.into_delta())
    }
}
