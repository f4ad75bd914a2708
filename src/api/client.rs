use super::classify::{classify, AnthropicDecoder, OpenAiDecoder, ProviderDelta};
use super::sse::{SseEvent, SseParser};
use crate::config::Config;
use crate::logging::{self, debug_payload_enabled, emit_debug_payload};
use crate::tools::ToolSpec;
use crate::types::{Message, Role, StreamChunk};
use crate::util::is_local_endpoint_url;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::pin::Pin;
#[cfg(test)]
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to local tools.\n\
Use tools for all filesystem facts and changes instead of guessing.\n\
After each tool result, reassess the task and either call the next needed tool or give the final answer.\n\
Issue at most one tool call per response.\n\
Always send non-empty string paths for file tools.";

const CHUNK_CHANNEL_CAPACITY: usize = 32;

#[cfg(test)]
pub trait MockStreamProducer: Send + Sync {
    fn create_mock_stream(&self, messages: &[Message]) -> Result<ByteStream>;
}

/// Streaming model client. One client serves the whole session; each call to
/// `stream_message` opens one response stream and owns its decode task.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    api_url: String,
    anthropic_version: String,
    api_protocol: ApiProtocol,
    system_prompt: String,
    tools: Vec<ToolSpec>,
    #[cfg(test)]
    mock_stream_producer: Option<Arc<dyn MockStreamProducer>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiProtocol {
    AnthropicMessages,
    OpenAiChatCompletions,
}

impl ApiClient {
    pub fn new(config: &Config, tools: Vec<ToolSpec>) -> Result<Self> {
        let api_protocol = std::env::var("QUILL_API_PROTOCOL")
            .ok()
            .and_then(parse_protocol)
            .unwrap_or_else(|| infer_api_protocol(&config.api_url));

        Ok(Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            api_url: config.api_url.clone(),
            anthropic_version: config.anthropic_version.clone(),
            api_protocol,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            tools,
            #[cfg(test)]
            mock_stream_producer: None,
        })
    }

    #[cfg(test)]
    pub fn new_mock(mock_producer: Arc<dyn MockStreamProducer>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: None,
            model: "mock-model".to_string(),
            api_url: "http://localhost:8000/v1/messages".to_string(),
            anthropic_version: "2023-06-01".to_string(),
            api_protocol: ApiProtocol::AnthropicMessages,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            tools: crate::tools::builtin_tools(),
            mock_stream_producer: Some(mock_producer),
        }
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }

    /// Open one streaming completion for `messages` and return the classified
    /// chunk channel. The channel closes when the provider stream ends, the
    /// token is cancelled, or a transport error interrupts the stream.
    pub async fn stream_message(
        &self,
        messages: &[Message],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let byte_stream = self.create_byte_stream(messages).await?;
        let (chunks_tx, chunks_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let mut decoder = Decoder::new(self.api_protocol);

        tokio::spawn(async move {
            let mut byte_stream = byte_stream;
            let mut parser = SseParser::new();

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = byte_stream.next() => item,
                };

                let bytes = match item {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(error)) => {
                        logging::emit_message(&format!("ERROR stream_transport {error}"));
                        break;
                    }
                    None => break,
                };

                for event in parser.process(&bytes) {
                    for delta in decoder.decode(&event) {
                        if let Some(chunk) = classify(delta) {
                            if chunks_tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            // A provider may end the stream without closing a pending tool
            // call; release it before the channel drops.
            if !cancel.is_cancelled() {
                if let Some(chunk) = decoder.finish().and_then(classify) {
                    let _ = chunks_tx.send(chunk).await;
                }
            }
        });

        Ok(chunks_rx)
    }

    async fn create_byte_stream(&self, messages: &[Message]) -> Result<ByteStream> {
        #[cfg(test)]
        {
            if let Some(producer) = &self.mock_stream_producer {
                return producer.create_mock_stream(messages);
            }
        }

        let request_url = self.request_url();
        let max_tokens = resolve_max_tokens(&self.api_url);
        let payload = match self.api_protocol {
            ApiProtocol::AnthropicMessages => json!({
                "model": self.model,
                "max_tokens": max_tokens,
                "stream": true,
                "system": self.system_prompt,
                "messages": anthropic_messages(messages),
                "tool_choice": { "type": "auto" },
                "tools": anthropic_tool_definitions(&self.tools),
            }),
            ApiProtocol::OpenAiChatCompletions => json!({
                "model": self.model,
                "max_tokens": max_tokens,
                "stream": true,
                "messages": openai_messages(messages, &self.system_prompt),
                "tool_choice": "auto",
                "tools": openai_tool_definitions(&self.tools),
            }),
        };

        let mut request = self
            .http
            .post(&request_url)
            .header("content-type", "application/json")
            .json(&payload);

        if debug_payload_enabled() {
            emit_debug_payload(&request_url, &payload);
        }

        match self.api_protocol {
            ApiProtocol::AnthropicMessages => {
                if let Some(api_key) = &self.api_key {
                    request = request.header("x-api-key", api_key);
                }
                if !self.anthropic_version.trim().is_empty() {
                    request = request.header("anthropic-version", &self.anthropic_version);
                }
            }
            ApiProtocol::OpenAiChatCompletions => {
                if let Some(api_key) = &self.api_key {
                    request = request.header("authorization", format!("Bearer {api_key}"));
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|error| map_api_request_error(error, &request_url))?
            .error_for_status()
            .map_err(|error| map_api_request_error(error, &request_url))?;

        let request_url_for_stream = request_url.clone();
        let stream = response.bytes_stream().map(move |item| {
            item.map_err(|error| map_api_request_error(error, &request_url_for_stream))
        });
        Ok(Box::pin(stream))
    }

    fn request_url(&self) -> String {
        match self.api_protocol {
            ApiProtocol::AnthropicMessages => self.api_url.clone(),
            ApiProtocol::OpenAiChatCompletions => {
                adapt_to_openai_chat_completions_url(&self.api_url)
            }
        }
    }
}

enum Decoder {
    Anthropic(AnthropicDecoder),
    OpenAi(OpenAiDecoder),
}

impl Decoder {
    fn new(protocol: ApiProtocol) -> Self {
        match protocol {
            ApiProtocol::AnthropicMessages => Decoder::Anthropic(AnthropicDecoder::new()),
            ApiProtocol::OpenAiChatCompletions => Decoder::OpenAi(OpenAiDecoder::new()),
        }
    }

    fn decode(&mut self, event: &SseEvent) -> Vec<ProviderDelta> {
        match self {
            Decoder::Anthropic(decoder) => decoder.decode(event),
            Decoder::OpenAi(decoder) => decoder.decode(event),
        }
    }

    fn finish(&mut self) -> Option<ProviderDelta> {
        match self {
            Decoder::Anthropic(decoder) => decoder.finish(),
            Decoder::OpenAi(decoder) => decoder.finish(),
        }
    }
}

fn map_api_request_error(error: reqwest::Error, request_url: &str) -> anyhow::Error {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return anyhow!(
            "cannot reach local API endpoint '{}': {}. Start your local server or update QUILL_API_URL.",
            request_url,
            error
        );
    }
    if error.is_connect() {
        return anyhow!("cannot reach API endpoint '{}': {}", request_url, error);
    }
    if error.is_timeout() {
        return anyhow!("API request to '{}' timed out: {}", request_url, error);
    }
    if let Some(status) = error.status() {
        return anyhow!(
            "API endpoint '{}' returned HTTP {}: {}",
            request_url,
            status,
            error
        );
    }
    anyhow!("API request to '{}' failed: {}", request_url, error)
}

fn resolve_max_tokens(api_url: &str) -> u32 {
    if let Some(value) = std::env::var("QUILL_MAX_TOKENS")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
    {
        return value.clamp(128, 8192);
    }

    if is_local_endpoint_url(api_url) {
        1024
    } else {
        4096
    }
}

fn parse_protocol(value: String) -> Option<ApiProtocol> {
    match value.trim().to_ascii_lowercase().as_str() {
        "anthropic" | "anthropic_messages" | "messages" | "v1/messages" => {
            Some(ApiProtocol::AnthropicMessages)
        }
        "openai" | "chat" | "chat_completions" | "openai_chat_completions" => {
            Some(ApiProtocol::OpenAiChatCompletions)
        }
        _ => None,
    }
}

fn infer_api_protocol(api_url: &str) -> ApiProtocol {
    let normalized = api_url.trim().to_ascii_lowercase();
    if normalized.contains("/chat/completions") || normalized.ends_with("/v1") {
        ApiProtocol::OpenAiChatCompletions
    } else {
        ApiProtocol::AnthropicMessages
    }
}

fn adapt_to_openai_chat_completions_url(api_url: &str) -> String {
    let normalized = api_url.trim_end_matches('/');
    if normalized.ends_with("/chat/completions") {
        return normalized.to_string();
    }
    if let Some(prefix) = normalized.strip_suffix("/messages") {
        return format!("{prefix}/chat/completions");
    }
    if normalized.ends_with("/v1") {
        return format!("{normalized}/chat/completions");
    }
    normalized.to_string()
}

fn anthropic_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::Assistant => {
                if let Some(call) = &message.tool_call {
                    let input: Value = serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| Value::Object(Map::new()));
                    out.push(json!({
                        "role": "assistant",
                        "content": [{
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": input,
                        }],
                    }));
                } else {
                    out.push(json!({
                        "role": "assistant",
                        "content": message.content,
                    }));
                }
            }
            Role::Tool => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": message.content,
                    }],
                }));
            }
            Role::User | Role::System => {
                out.push(json!({
                    "role": "user",
                    "content": message.content,
                }));
            }
        }
    }

    out
}

fn openai_messages(messages: &[Message], system_prompt: &str) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(json!({
        "role": "system",
        "content": system_prompt,
    }));

    for message in messages {
        match message.role {
            Role::Assistant => {
                if let Some(call) = &message.tool_call {
                    out.push(json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": [{
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments,
                            },
                        }],
                    }));
                } else {
                    out.push(json!({
                        "role": "assistant",
                        "content": message.content,
                    }));
                }
            }
            Role::Tool => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content,
                }));
            }
            Role::User | Role::System => {
                out.push(json!({
                    "role": message.role.as_str(),
                    "content": message.content,
                }));
            }
        }
    }

    out
}

fn anthropic_tool_definitions(tools: &[ToolSpec]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect(),
    )
}

fn openai_tool_definitions(tools: &[ToolSpec]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[test]
    fn test_protocol_inference_defaults_to_anthropic_messages() {
        let protocol = infer_api_protocol("http://localhost:8000/v1/messages");
        assert_eq!(protocol, ApiProtocol::AnthropicMessages);
    }

    #[test]
    fn test_protocol_inference_detects_openai_chat() {
        let protocol = infer_api_protocol("http://localhost:8000/v1/chat/completions");
        assert_eq!(protocol, ApiProtocol::OpenAiChatCompletions);
    }

    #[test]
    fn test_openai_url_adapter_from_messages_endpoint() {
        let adapted = adapt_to_openai_chat_completions_url("http://localhost:8000/v1/messages");
        assert_eq!(adapted, "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn test_resolve_max_tokens_defaults_for_local() {
        let _env_lock = crate::test_support::ENV_LOCK.blocking_lock();
        std::env::remove_var("QUILL_MAX_TOKENS");
        assert_eq!(resolve_max_tokens("http://localhost:8000/v1/messages"), 1024);
        assert_eq!(
            resolve_max_tokens("https://api.anthropic.com/v1/messages"),
            4096
        );
    }

    #[test]
    fn test_anthropic_messages_map_tool_turns_to_blocks() {
        let call = ToolCall {
            id: "toolu_1".to_string(),
            name: "read_file".to_string(),
            arguments: "{\"path\":\"a.txt\"}".to_string(),
        };
        let messages = vec![
            Message::user("show me a.txt"),
            Message::assistant_tool_call(&call),
            Message::tool("toolu_1", "contents"),
        ];

        let mapped = anthropic_messages(&messages);
        assert_eq!(mapped.len(), 3);
        assert_eq!(
            mapped[1]["content"][0]["type"].as_str(),
            Some("tool_use")
        );
        assert_eq!(mapped[1]["content"][0]["input"]["path"].as_str(), Some("a.txt"));
        assert_eq!(mapped[2]["role"].as_str(), Some("user"));
        assert_eq!(
            mapped[2]["content"][0]["tool_use_id"].as_str(),
            Some("toolu_1")
        );
    }

    #[test]
    fn test_openai_messages_prepend_system_and_map_tool_role() {
        let messages = vec![Message::user("hi"), Message::tool("call_1", "result")];
        let mapped = openai_messages(&messages, "system text");
        assert_eq!(mapped.len(), 3);
        assert_eq!(mapped[0]["role"].as_str(), Some("system"));
        assert_eq!(mapped[2]["role"].as_str(), Some("tool"));
        assert_eq!(mapped[2]["tool_call_id"].as_str(), Some("call_1"));
    }

    #[test]
    fn test_tool_definition_shapes_for_both_protocols() {
        let tools = crate::tools::builtin_tools();
        let anthropic = anthropic_tool_definitions(&tools);
        let openai = openai_tool_definitions(&tools);
        let first = &anthropic.as_array().expect("array")[0];
        assert!(first.get("input_schema").is_some());
        let first_openai = &openai.as_array().expect("array")[0];
        assert_eq!(first_openai["type"].as_str(), Some("function"));
        assert_eq!(
            first_openai["function"]["name"].as_str(),
            first["name"].as_str()
        );
    }
}
