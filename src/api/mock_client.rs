use crate::api::client::{ByteStream, MockStreamProducer};
use crate::types::Message;
use anyhow::Result;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::sync::{Arc, Mutex};

/// Scripted stream producer for session tests. Each turn pops the next
/// response, a list of SSE frames delivered as separate byte chunks.
#[derive(Clone)]
pub struct MockApiClient {
    responses: Arc<Mutex<Vec<MockResponse>>>,
}

#[derive(Clone)]
pub enum MockResponse {
    /// Frames streamed to completion.
    Frames(Vec<String>),
    /// Frames streamed, then the stream stays open forever. Used to test
    /// mid-stream cancellation.
    FramesThenHang(Vec<String>),
}

impl MockApiClient {
    pub fn new(responses: Vec<Vec<String>>) -> Self {
        Self::with_responses(responses.into_iter().map(MockResponse::Frames).collect())
    }

    pub fn with_responses(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
        }
    }
}

impl MockStreamProducer for MockApiClient {
    fn create_mock_stream(&self, _messages: &[Message]) -> Result<ByteStream> {
        let mut responses_guard = self.responses.lock().unwrap();
        if responses_guard.is_empty() {
            return Err(anyhow::anyhow!(
                "MockApiClient: No more responses configured"
            ));
        }
        let response = responses_guard.remove(0);

        let (frames, hang) = match response {
            MockResponse::Frames(frames) => (frames, false),
            MockResponse::FramesThenHang(frames) => (frames, true),
        };

        let sse_byte_chunks: Vec<Result<Bytes>> = frames
            .into_iter()
            .map(|s| {
                let framed = if s.ends_with("\n\n") {
                    s
                } else {
                    format!("{s}\n\n")
                };
                Ok(Bytes::from(framed))
            })
            .collect();

        if hang {
            Ok(Box::pin(
                stream::iter(sse_byte_chunks).chain(stream::pending()),
            ))
        } else {
            Ok(Box::pin(stream::iter(sse_byte_chunks)))
        }
    }
}

/// Anthropic-shaped frames for a plain text reply split into `parts`.
pub fn text_frames(parts: &[&str]) -> Vec<String> {
    parts
        .iter()
        .map(|part| {
            format!(
                "event: content_block_delta\ndata: {}",
                serde_json::json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "text_delta", "text": part },
                })
            )
        })
        .collect()
}

/// Anthropic-shaped frames for one complete tool call.
pub fn tool_call_frames(id: &str, name: &str, arguments: &str) -> Vec<String> {
    vec![
        format!(
            "event: content_block_start\ndata: {}",
            serde_json::json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "tool_use", "id": id, "name": name },
            })
        ),
        format!(
            "event: content_block_delta\ndata: {}",
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "input_json_delta", "partial_json": arguments },
            })
        ),
        format!(
            "event: content_block_stop\ndata: {}",
            serde_json::json!({ "type": "content_block_stop", "index": 0 })
        ),
    ]
}

/// Anthropic-shaped frames for a reasoning burst followed by text.
pub fn reasoning_then_text_frames(reasoning: &str, text: &str) -> Vec<String> {
    vec![
        format!(
            "event: content_block_delta\ndata: {}",
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "thinking_delta", "thinking": reasoning },
            })
        ),
        format!(
            "event: content_block_delta\ndata: {}",
            serde_json::json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": { "type": "text_delta", "text": text },
            })
        ),
    ]
}
