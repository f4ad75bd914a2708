use super::*;
use crate::api::mock_client::{
    reasoning_then_text_frames, text_frames, tool_call_frames, MockApiClient, MockResponse,
};
use crate::api::ApiClient;
use crate::history::HistoryStore;
use crate::permissions::PermissionState;
use crate::tools::{ToolGateway, ToolRegistry, ToolSandbox};
use crate::types::Role;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn build_session(
    responses: Vec<MockResponse>,
    permitted: &[&str],
    max_tool_rounds: usize,
) -> (Session, SessionChannels, TempDir) {
    let workspace = TempDir::new().expect("temp workspace");
    std::fs::write(workspace.path().join("hello.txt"), "hi").expect("seed file");

    let client = Arc::new(ApiClient::new_mock(Arc::new(MockApiClient::with_responses(
        responses,
    ))));
    let sandbox = ToolSandbox::new(workspace.path().to_path_buf(), vec![]);
    let gateway = ToolGateway::new(ToolRegistry::new(), sandbox, Duration::from_secs(5));
    let permissions = PermissionState::new(permitted.iter().map(|s| s.to_string()));

    let (session, channels) = Session::new(client, gateway, permissions, None, max_tool_rounds);
    (session, channels, workspace)
}

fn frames(parts: Vec<Vec<String>>) -> Vec<MockResponse> {
    parts.into_iter().map(MockResponse::Frames).collect()
}

async fn drain_events(channels: &mut SessionChannels) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = channels.events_rx.try_recv() {
        events.push(event);
    }
    events
}

fn chunk_texts(events: &[SessionEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StreamChunk(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_plain_text_turn_appends_assistant_message() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![text_frames(&["Hello", " world"])]),
        &[],
        8,
    );

    session.run_turn("greet me".to_string()).await;

    let events = drain_events(&mut channels).await;
    assert!(matches!(events.first(), Some(SessionEvent::StreamStarted)));
    assert_eq!(chunk_texts(&events), "Hello world");
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::StreamEnded(text) if text == "Hello world")));

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello world");
}

#[tokio::test]
async fn test_reasoning_is_forwarded_but_not_committed() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![reasoning_then_text_frames(
            "let me think",
            "The answer is 4.",
        )]),
        &[],
        8,
    );

    session.run_turn("what is 2+2".to_string()).await;

    let events = drain_events(&mut channels).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::StreamThink(text) if text == "let me think")));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::StreamEnded(text) if text == "The answer is 4.")));

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "The answer is 4.");
}

#[tokio::test]
async fn test_tool_round_trip_with_permit_once() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![
            tool_call_frames("toolu_1", "list_files", r#"{"path": "."}"#),
            text_frames(&["There is one file."]),
        ]),
        &[],
        8,
    );

    channels
        .commands_tx
        .send(SessionCommand::PermitToolOnce)
        .await
        .expect("send permit");

    session.run_turn("list files in .".to_string()).await;

    let events = drain_events(&mut channels).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::ToolCallRequested { name, .. } if name == "list_files"
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolRunning { name } if name == "list_files")));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolOutput(out) if out.contains("hello.txt"))));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::StreamEnded(text) if text == "There is one file.")));

    let messages = session.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(
        messages[1].tool_call.as_ref().map(|c| c.id.as_str()),
        Some("toolu_1")
    );
    assert_eq!(messages[2].role, Role::Tool);
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("toolu_1"));
    assert_eq!(messages[3].role, Role::Assistant);
}

#[tokio::test]
async fn test_permit_sent_after_request_event_completes_turn() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![
            tool_call_frames("toolu_1", "read_file", r#"{"path": "hello.txt"}"#),
            text_frames(&["All read."]),
        ]),
        &[],
        8,
    );

    let handle = tokio::spawn(async move {
        session.run_turn("read hello".to_string()).await;
        session
    });

    let mut ended = false;
    while let Some(event) = channels.events_rx.recv().await {
        match event {
            SessionEvent::ToolCallRequested { name, .. } => {
                assert_eq!(name, "read_file");
                channels
                    .commands_tx
                    .send(SessionCommand::PermitToolOnce)
                    .await
                    .expect("send permit");
            }
            SessionEvent::StreamEnded(text) => {
                assert_eq!(text, "All read.");
                ended = true;
                break;
            }
            _ => {}
        }
    }
    assert!(ended);

    let session = handle.await.expect("turn task");
    assert_eq!(session.messages().len(), 4);
}

#[tokio::test]
async fn test_session_grant_skips_second_prompt() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![
            tool_call_frames("toolu_1", "read_file", r#"{"path": "hello.txt"}"#),
            tool_call_frames("toolu_2", "read_file", r#"{"path": "hello.txt"}"#),
            text_frames(&["Both reads done."]),
        ]),
        &[],
        8,
    );

    channels
        .commands_tx
        .send(SessionCommand::PermitToolForSession)
        .await
        .expect("send grant");

    session.run_turn("read hello twice".to_string()).await;

    let events = drain_events(&mut channels).await;
    let prompts = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ToolCallRequested { .. }))
        .count();
    assert_eq!(prompts, 1, "the session grant must suppress the second prompt");

    let runs = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ToolRunning { .. }))
        .count();
    assert_eq!(runs, 2);
}

#[tokio::test]
async fn test_cancel_mid_stream_commits_no_assistant_message() {
    let (mut session, mut channels, _ws) = build_session(
        vec![MockResponse::FramesThenHang(text_frames(&[
            "one", "two", "three",
        ]))],
        &[],
        8,
    );

    let handle = tokio::spawn(async move {
        session.run_turn("count slowly".to_string()).await;
        session
    });

    let mut seen_chunks = 0;
    let mut cancelled_event = false;
    while let Some(event) = channels.events_rx.recv().await {
        match event {
            SessionEvent::StreamChunk(_) => {
                seen_chunks += 1;
                if seen_chunks == 3 {
                    channels
                        .commands_tx
                        .send(SessionCommand::CancelStream)
                        .await
                        .expect("send cancel");
                }
            }
            SessionEvent::StreamCancelled => {
                cancelled_event = true;
                break;
            }
            _ => {}
        }
    }

    assert!(cancelled_event);
    assert_eq!(seen_chunks, 3);

    let session = handle.await.expect("turn task");
    let messages = session.messages();
    assert_eq!(messages.len(), 1, "only the user message may be committed");
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn test_driver_tool_call_ends_loop_before_trailing_text() {
    let mut response = text_frames(&["before"]);
    response.extend(tool_call_frames("toolu_9", "list_files", "{}"));
    response.extend(text_frames(&["after"]));

    let client = ApiClient::new_mock(Arc::new(MockApiClient::new(vec![response])));
    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(32);
    let mut driver = StreamDriver::new(events_tx);

    driver
        .start(&client, &[crate::types::Message::user("go")])
        .await
        .expect("start");
    driver.wait().await;

    assert_eq!(driver.content(), "before");
    assert_eq!(
        driver.tool_call().map(|c| c.name),
        Some("list_files".to_string())
    );

    let mut forwarded = String::new();
    while let Ok(event) = events_rx.try_recv() {
        if let SessionEvent::StreamChunk(text) = event {
            forwarded.push_str(&text);
        }
    }
    assert_eq!(forwarded, driver.content());
}

#[tokio::test]
async fn test_unknown_tool_becomes_corrective_result_without_prompt() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![
            tool_call_frames("toolu_1", "telepathy", "{}"),
            text_frames(&["Let me use a real tool instead."]),
        ]),
        &[],
        8,
    );

    session.run_turn("read my mind".to_string()).await;

    let events = drain_events(&mut channels).await;
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, SessionEvent::ToolCallRequested { .. })),
        "unknown tools must not trigger a permission prompt"
    );

    let messages = session.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role, Role::Tool);
    assert!(messages[2].content.contains("Unknown tool 'telepathy'"));
    assert!(messages[2].content.contains("list_files"));
}

#[tokio::test]
async fn test_denied_tool_informs_model_and_continues() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![
            tool_call_frames("toolu_1", "write_file", r#"{"path": "x", "content": "y"}"#),
            text_frames(&["Understood, I will not write."]),
        ]),
        &[],
        8,
    );

    channels
        .commands_tx
        .send(SessionCommand::DenyTool)
        .await
        .expect("send deny");

    session.run_turn("write something".to_string()).await;

    let events = drain_events(&mut channels).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolCallRequested { .. })));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, SessionEvent::ToolRunning { .. })),
        "a denied tool must not run"
    );

    let messages = session.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role, Role::Tool);
    assert!(messages[2].content.contains("declined"));
    assert_eq!(messages[3].role, Role::Assistant);
}

#[tokio::test]
async fn test_transport_error_aborts_turn_with_stream_error() {
    // An empty mock script makes the stream open itself fail.
    let (mut session, mut channels, _ws) = build_session(vec![], &[], 8);

    session.run_turn("hello?".to_string()).await;

    let events = drain_events(&mut channels).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::StreamError(_))));

    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].role, Role::User);
}

#[tokio::test]
async fn test_round_guard_stops_endless_tool_chains() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![
            tool_call_frames("toolu_1", "list_files", "{}"),
            tool_call_frames("toolu_2", "list_files", "{}"),
        ]),
        &["list_files"],
        2,
    );

    session.run_turn("loop forever".to_string()).await;

    let events = drain_events(&mut channels).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::SystemMessage(text) if text.contains("tool rounds"))));

    // user + two (assistant tool-call, tool-result) pairs.
    assert_eq!(session.messages().len(), 5);
}

#[tokio::test]
async fn test_role_sequence_and_tool_call_id_invariants() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![
            tool_call_frames("toolu_1", "list_files", r#"{"path": "."}"#),
            text_frames(&["done"]),
        ]),
        &["list_files"],
        8,
    );

    session.run_turn("list".to_string()).await;
    drain_events(&mut channels).await;

    let messages = session.messages();
    let mut known_call_ids = Vec::new();
    for message in messages {
        if let Some(call) = &message.tool_call {
            assert_eq!(message.role, Role::Assistant);
            known_call_ids.push(call.id.clone());
        }
        if message.role == Role::Tool {
            let id = message.tool_call_id.as_deref().expect("tool message id");
            assert!(
                known_call_ids.iter().any(|known| known == id),
                "tool result must reference a prior assistant tool call"
            );
        }
    }
    assert_eq!(messages.first().map(|m| m.role), Some(Role::User));
    assert_eq!(messages.last().map(|m| m.role), Some(Role::Assistant));
}

#[tokio::test]
async fn test_inline_textual_tool_request_is_recovered() {
    let (mut session, mut channels, _ws) = build_session(
        frames(vec![
            text_frames(&[r#"Request to use tool: `list_files` with args: {"path": "."}"#]),
            text_frames(&["Recovered and listed."]),
        ]),
        &["list_files"],
        8,
    );

    session.run_turn("list files".to_string()).await;

    let events = drain_events(&mut channels).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolRunning { name } if name == "list_files")));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::StreamEnded(text) if text == "Recovered and listed.")));

    let messages = session.messages();
    assert_eq!(messages.len(), 4);
    assert!(messages[1].tool_call.is_some());
}

#[tokio::test]
async fn test_history_save_hook_persists_each_mutation() {
    let history_dir = TempDir::new().expect("history dir");
    let store = HistoryStore::with_session_id(history_dir.path().to_path_buf(), "t");

    let workspace = TempDir::new().expect("workspace");
    let client = Arc::new(ApiClient::new_mock(Arc::new(MockApiClient::new(vec![
        text_frames(&["saved"]),
    ]))));
    let sandbox = ToolSandbox::new(workspace.path().to_path_buf(), vec![]);
    let gateway = ToolGateway::new(ToolRegistry::new(), sandbox, Duration::from_secs(5));

    let (mut session, mut channels) = Session::new(
        client,
        gateway,
        PermissionState::default(),
        Some(store),
        8,
    );

    session.run_turn("persist me".to_string()).await;
    drain_events(&mut channels).await;

    let reloaded = HistoryStore::with_session_id(history_dir.path().to_path_buf(), "t")
        .load()
        .expect("history file should exist");
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded[0].content, "persist me");
    assert_eq!(reloaded[1].content, "saved");
}

#[tokio::test]
async fn test_run_loop_processes_prompt_then_shutdown() {
    let (session, mut channels, _ws) = build_session(
        frames(vec![text_frames(&["looped"])]),
        &[],
        8,
    );

    let handle = tokio::spawn(session.run());

    channels
        .commands_tx
        .send(SessionCommand::UserPrompt("via run".to_string()))
        .await
        .expect("send prompt");

    let mut ended = false;
    while let Some(event) = channels.events_rx.recv().await {
        if matches!(event, SessionEvent::StreamEnded(ref text) if text == "looped") {
            ended = true;
            break;
        }
    }
    assert!(ended);

    channels
        .commands_tx
        .send(SessionCommand::Shutdown)
        .await
        .expect("send shutdown");
    handle.await.expect("session task");
}
