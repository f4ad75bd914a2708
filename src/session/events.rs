/// Outbound events from the session to its observer. Delivery is lossless:
/// the channel is a small bounded buffer and a slow observer blocks the
/// coordinator rather than dropping events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StreamStarted,
    /// One prose fragment, in arrival order.
    StreamChunk(String),
    /// One reasoning fragment, in arrival order.
    StreamThink(String),
    /// The turn settled with final assistant text.
    StreamEnded(String),
    StreamCancelled,
    StreamError(String),
    /// A tool call needs an interactive decision before it may run.
    ToolCallRequested { name: String, arguments: String },
    ToolRunning { name: String },
    ToolOutput(String),
    SystemMessage(String),
}

/// Inbound commands from the observer to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    UserPrompt(String),
    PermitToolOnce,
    PermitToolForSession,
    DenyTool,
    CancelStream,
    /// Clear the conversation history. Honored only between turns.
    Reset,
    Shutdown,
}
