use super::events::SessionEvent;
use crate::api::ApiClient;
use crate::types::{Message, StreamChunk, ToolCall};
use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct StreamArtifacts {
    content: String,
    reasoning: String,
    tool_call: Option<ToolCall>,
}

/// Owns one outstanding model call. `start` opens the stream and spawns the
/// receive loop; `close` requests cancellation; `wait` blocks until the loop
/// has fully exited. The accumulators are valid only after `wait` returns.
pub struct StreamDriver {
    cancel: CancellationToken,
    done_rx: Option<oneshot::Receiver<()>>,
    artifacts: Arc<Mutex<StreamArtifacts>>,
    events: mpsc::Sender<SessionEvent>,
}

impl StreamDriver {
    pub fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            done_rx: None,
            artifacts: Arc::new(Mutex::new(StreamArtifacts::default())),
            events,
        }
    }

    /// Open the model stream for the given conversation and start the receive
    /// loop. A transport error on open is returned immediately and no loop is
    /// started.
    pub async fn start(&mut self, client: &ApiClient, messages: &[Message]) -> Result<()> {
        let mut chunks = client.stream_message(messages, self.cancel.clone()).await?;

        let _ = self.events.send(SessionEvent::StreamStarted).await;

        let (done_tx, done_rx) = oneshot::channel();
        self.done_rx = Some(done_rx);

        let cancel = self.cancel.clone();
        let artifacts = self.artifacts.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = chunks.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };

                // Forward to the observer before folding into accumulators.
                match chunk {
                    StreamChunk::Text(text) => {
                        let _ = events.send(SessionEvent::StreamChunk(text.clone())).await;
                        lock_artifacts(&artifacts).content.push_str(&text);
                    }
                    StreamChunk::Reasoning(text) => {
                        let _ = events.send(SessionEvent::StreamThink(text.clone())).await;
                        lock_artifacts(&artifacts).reasoning.push_str(&text);
                    }
                    StreamChunk::ToolCall(call) => {
                        // One tool call always ends the turn. The observer
                        // hears about it through the coordinator's
                        // ToolCallRequested/ToolRunning events, which carry
                        // the full call rather than a raw chunk.
                        lock_artifacts(&artifacts).tool_call = Some(call);
                        cancel.cancel();
                        break;
                    }
                }
            }

            let _ = done_tx.send(());
        });

        Ok(())
    }

    /// Request cancellation. The receive loop observes it within one
    /// scheduling step; call `wait` before reading the accumulators.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Block until the receive loop has fully exited. Cancel-safe: losing a
    /// `select!` race against this call leaves the driver waitable.
    pub async fn wait(&mut self) {
        if let Some(done_rx) = self.done_rx.as_mut() {
            let _ = done_rx.await;
            self.done_rx = None;
        }
    }

    pub fn content(&self) -> String {
        lock_artifacts(&self.artifacts).content.clone()
    }

    pub fn reasoning(&self) -> String {
        lock_artifacts(&self.artifacts).reasoning.clone()
    }

    pub fn tool_call(&self) -> Option<ToolCall> {
        lock_artifacts(&self.artifacts).tool_call.clone()
    }
}

fn lock_artifacts(artifacts: &Mutex<StreamArtifacts>) -> std::sync::MutexGuard<'_, StreamArtifacts> {
    artifacts.lock().unwrap_or_else(PoisonError::into_inner)
}
