use super::events::{SessionCommand, SessionEvent};
use super::stream::StreamDriver;
use crate::api::ApiClient;
use crate::history::HistoryStore;
use crate::logging;
use crate::permissions::PermissionState;
use crate::tools::ToolGateway;
use crate::types::{Message, ToolCall};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// The observer's ends of the session channels.
pub struct SessionChannels {
    pub events_rx: mpsc::Receiver<SessionEvent>,
    pub commands_tx: mpsc::Sender<SessionCommand>,
}

/// The conversation state owner. Exactly one task runs the session; it is the
/// only mutator of history, so history needs no lock. Turns are serialized:
/// prompts arriving while a turn is in flight queue until it settles.
pub struct Session {
    client: Arc<ApiClient>,
    gateway: ToolGateway,
    permissions: PermissionState,
    messages: Vec<Message>,
    store: Option<HistoryStore>,
    events_tx: mpsc::Sender<SessionEvent>,
    commands_rx: mpsc::Receiver<SessionCommand>,
    max_tool_rounds: usize,
    pending_prompts: VecDeque<String>,
    /// Permission decisions that arrived before their prompt; an observer may
    /// answer a beat ahead of the stream settling.
    pending_decisions: VecDeque<SessionCommand>,
    shutdown: bool,
}

/// How one model stream settled, as seen by the coordinator.
enum StreamOutcome {
    Completed,
    Cancelled,
    Aborted,
}

/// The observer's answer to a permission round-trip.
enum PermissionDecision {
    Approved,
    Denied,
    Abandoned,
}

impl Session {
    pub fn new(
        client: Arc<ApiClient>,
        gateway: ToolGateway,
        permissions: PermissionState,
        store: Option<HistoryStore>,
        max_tool_rounds: usize,
    ) -> (Self, SessionChannels) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let session = Self {
            client,
            gateway,
            permissions,
            messages: Vec::new(),
            store,
            events_tx,
            commands_rx,
            max_tool_rounds: max_tool_rounds.max(1),
            pending_prompts: VecDeque::new(),
            pending_decisions: VecDeque::new(),
            shutdown: false,
        };

        (
            session,
            SessionChannels {
                events_rx,
                commands_tx,
            },
        )
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// Drive the session until the observer shuts it down or drops its
    /// command sender.
    pub async fn run(mut self) {
        loop {
            if let Some(prompt) = self.pending_prompts.pop_front() {
                self.run_turn(prompt).await;
                continue;
            }
            if self.shutdown {
                break;
            }

            match self.commands_rx.recv().await {
                Some(SessionCommand::UserPrompt(prompt)) => self.run_turn(prompt).await,
                Some(SessionCommand::Reset) => {
                    self.reset();
                    self.emit(SessionEvent::SystemMessage(
                        "Conversation history cleared.".to_string(),
                    ))
                    .await;
                }
                Some(SessionCommand::Shutdown) | None => break,
                // Cancellation and permission decisions are meaningless while
                // idle; drop them.
                Some(_) => {}
            }
        }
    }

    /// Run one full turn: user message in, stream/tool rounds until the model
    /// settles with prose, the observer cancels, or the round guard trips.
    pub async fn run_turn(&mut self, prompt: String) {
        // Decisions left over from a previous turn answer nothing.
        self.pending_decisions.clear();
        self.push_message(Message::user(prompt));

        for _round in 0..self.max_tool_rounds {
            let mut driver = StreamDriver::new(self.events_tx.clone());
            if let Err(error) = driver.start(self.client.as_ref(), &self.messages).await {
                self.emit(SessionEvent::StreamError(error.to_string())).await;
                return;
            }

            match self.stream_to_completion(&mut driver).await {
                StreamOutcome::Completed => {}
                StreamOutcome::Cancelled => {
                    self.emit(SessionEvent::StreamCancelled).await;
                    return;
                }
                StreamOutcome::Aborted => return,
            }

            let content = driver.content();
            let tool_call = driver
                .tool_call()
                .or_else(|| parse_inline_tool_call(&content));

            let Some(call) = tool_call else {
                if !content.is_empty() {
                    self.push_message(Message::assistant(content.clone()));
                }
                self.emit(SessionEvent::StreamEnded(content)).await;
                return;
            };

            self.push_message(Message::assistant_tool_call(&call));

            // Unknown names skip the permission round-trip; the gateway
            // answers with a corrective message the model can act on.
            if self.gateway.known(&call.name) {
                match self.resolve_permission(&call).await {
                    PermissionDecision::Approved => {}
                    PermissionDecision::Denied => {
                        self.emit(SessionEvent::SystemMessage(format!(
                            "Declined tool '{}'",
                            call.name
                        )))
                        .await;
                        self.push_message(Message::tool(
                            call.id.clone(),
                            "The user declined this tool call.",
                        ));
                        continue;
                    }
                    PermissionDecision::Abandoned => return,
                }
            }

            self.emit(SessionEvent::ToolRunning {
                name: call.name.clone(),
            })
            .await;

            let outcome = self.gateway.execute(&call).await;
            self.emit(SessionEvent::ToolOutput(outcome.content.clone()))
                .await;

            let result_text = if outcome.is_error {
                format!("Error: {}", outcome.content)
            } else {
                outcome.content
            };
            self.push_message(Message::tool(call.id.clone(), result_text));
        }

        self.emit(SessionEvent::SystemMessage(format!(
            "Stopped after {} consecutive tool rounds without a final answer.",
            self.max_tool_rounds
        )))
        .await;
    }

    /// Pump commands while the stream runs. Returns once the driver's loop
    /// has exited, one way or another.
    async fn stream_to_completion(&mut self, driver: &mut StreamDriver) -> StreamOutcome {
        loop {
            tokio::select! {
                _ = driver.wait() => return StreamOutcome::Completed,
                command = self.commands_rx.recv() => match command {
                    Some(SessionCommand::CancelStream) => {
                        driver.close();
                        driver.wait().await;
                        return StreamOutcome::Cancelled;
                    }
                    Some(SessionCommand::UserPrompt(prompt)) => {
                        self.pending_prompts.push_back(prompt);
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        driver.close();
                        driver.wait().await;
                        self.shutdown = true;
                        return StreamOutcome::Aborted;
                    }
                    // A decision may race the stream's end; hold it for the
                    // permission round-trip instead of dropping it.
                    Some(decision) => self.pending_decisions.push_back(decision),
                },
            }
        }
    }

    /// Ask the observer whether a non-allow-listed tool may run.
    async fn resolve_permission(&mut self, call: &ToolCall) -> PermissionDecision {
        if self.permissions.allows(&call.name) {
            return PermissionDecision::Approved;
        }

        self.emit(SessionEvent::ToolCallRequested {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        })
        .await;

        loop {
            let command = match self.pending_decisions.pop_front() {
                Some(buffered) => Some(buffered),
                None => self.commands_rx.recv().await,
            };
            match command {
                Some(SessionCommand::PermitToolOnce) => return PermissionDecision::Approved,
                Some(SessionCommand::PermitToolForSession) => {
                    self.permissions.grant_for_session(call.name.clone());
                    return PermissionDecision::Approved;
                }
                Some(SessionCommand::DenyTool) | Some(SessionCommand::CancelStream) => {
                    return PermissionDecision::Denied;
                }
                Some(SessionCommand::UserPrompt(prompt)) => {
                    self.pending_prompts.push_back(prompt);
                }
                Some(SessionCommand::Reset) => {}
                Some(SessionCommand::Shutdown) | None => {
                    self.shutdown = true;
                    return PermissionDecision::Abandoned;
                }
            }
        }
    }

    fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        if let Some(store) = &self.store {
            if let Err(error) = store.save(&self.messages) {
                logging::emit_message(&format!("WARN history_save_failed {error}"));
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

const INLINE_TOOL_MARKER: &str = "Request to use tool: `";
const INLINE_ARGS_MARKER: &str = "with args:";

/// Best-effort recovery for models that answer with a textual tool request
/// instead of the structured protocol. Returns None unless the prose contains
/// a well-formed ``Request to use tool: `name` with args: {...}`` fragment.
pub(super) fn parse_inline_tool_call(content: &str) -> Option<ToolCall> {
    let start = content.find(INLINE_TOOL_MARKER)? + INLINE_TOOL_MARKER.len();
    let rest = &content[start..];
    let name_end = rest.find('`')?;
    let name = rest[..name_end].trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }

    let after_name = &rest[name_end + 1..];
    let args_at = after_name.find(INLINE_ARGS_MARKER)? + INLINE_ARGS_MARKER.len();
    let args_text = &after_name[args_at..];
    let brace = args_text.find('{')?;
    let close = args_text.rfind('}')?;
    if close < brace {
        return None;
    }
    let arguments = &args_text[brace..=close];
    if serde_json::from_str::<serde_json::Value>(arguments).is_err() {
        return None;
    }

    Some(ToolCall {
        id: format!("inline-{name}"),
        name: name.to_string(),
        arguments: arguments.to_string(),
    })
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_inline_tool_call_parses_well_formed_request() {
        let content = "Request to use tool: `list_files` with args: {\"path\": \".\"}";
        let call = parse_inline_tool_call(content).expect("should parse");
        assert_eq!(call.name, "list_files");
        assert_eq!(call.arguments, "{\"path\": \".\"}");
        assert_eq!(call.id, "inline-list_files");
    }

    #[test]
    fn test_inline_tool_call_found_inside_surrounding_prose() {
        let content =
            "I need more info.\nRequest to use tool: `read_file` with args: {\"path\": \"a.rs\"}\nThanks.";
        let call = parse_inline_tool_call(content).expect("should parse");
        assert_eq!(call.name, "read_file");
    }

    #[test]
    fn test_inline_tool_call_rejects_malformed_fragments() {
        assert!(parse_inline_tool_call("plain prose").is_none());
        assert!(parse_inline_tool_call("Request to use tool: `x y` with args: {}").is_none());
        assert!(
            parse_inline_tool_call("Request to use tool: `read_file` with args: {broken").is_none()
        );
        assert!(parse_inline_tool_call("Request to use tool: `read_file`").is_none());
    }
}
