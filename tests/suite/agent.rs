//! Agent loop end to end: mock provider endpoint, real tools, real gate

use std::fs;
use std::path::Path;
use std::sync::Arc;

use kiln_engine::{
    Agent, AgentConfig, AgentEvent, Mode, PermissionGate, PermissionRequest, PermissionResponse,
};
use kiln_tools::{ToolRegistry, detect_shell, register_builtins};
use kiln_types::{Message, Role, SessionId, ToolResult};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

use crate::common::{completed, function_call, mount_turn, openai_provider, text_delta};

const PROMPT: &str = "please inspect the project";
const TOOL_OUTPUT_MARKER: &str = "function_call_output";

fn agent(server: &MockServer, work_dir: &Path, mode: Mode) -> (Agent, mpsc::Receiver<PermissionRequest>) {
    let mut registry = ToolRegistry::default();
    register_builtins(&mut registry, detect_shell(Some("/bin/sh"))).unwrap();
    let (gate, requests) = PermissionGate::new();
    let agent = Agent::new(
        openai_provider(server),
        Arc::new(registry),
        Arc::new(gate),
        AgentConfig {
            max_iterations: 5,
            max_tokens: 0,
            mode,
            work_dir: work_dir.to_path_buf(),
        },
    );
    (agent, requests)
}

/// Mount a tool-call turn followed by a text turn that answers the tool output.
async fn mount_two_turns(server: &MockServer, name: &str, arguments: &str, reply: &str) {
    let mut first = function_call("fc_1", "call_1", name, arguments);
    first.push(completed(20, 10));
    mount_turn(server, PROMPT, &first).await;
    mount_turn(server, TOOL_OUTPUT_MARKER, &[text_delta(reply), completed(40, 5)]).await;
}

async fn run(agent: &Agent) -> Vec<AgentEvent> {
    let session = SessionId::generate();
    let history = vec![Message::user(session.clone(), PROMPT)];
    let mut rx = agent.run(history, session, CancellationToken::new());
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn tool_results(events: &[AgentEvent]) -> Vec<&ToolResult> {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::ToolResult(result) => Some(result),
            _ => None,
        })
        .collect()
}

fn final_message(events: &[AgentEvent]) -> &Message {
    match events.last() {
        Some(AgentEvent::Done(message)) => message,
        other => panic!("expected Done last, got {other:?}"),
    }
}

fn answer_permissions(mut requests: mpsc::Receiver<PermissionRequest>, response: PermissionResponse) {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            request.respond(response);
        }
    });
}

async fn declared_tool_names(server: &MockServer) -> Vec<String> {
    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tool| tool["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn plan_mode_runs_read_only_tool_and_finishes() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("notes.txt"), "hi").unwrap();
    fs::create_dir(dir.path().join("src")).unwrap();

    let server = MockServer::start().await;
    mount_two_turns(&server, "ls", "{}", "Two entries.").await;

    let (agent, _requests) = agent(&server, dir.path(), Mode::Plan);
    let events = run(&agent).await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_error);
    assert_eq!(results[0].output, "notes.txt\nsrc/");

    let message = final_message(&events);
    assert_eq!(message.role(), Role::Assistant);
    assert_eq!(message.content(), "Two entries.");
    assert_eq!(message.usage().total_tokens, 45);

    assert_eq!(
        declared_tool_names(&server).await,
        vec!["glob", "grep", "ls", "view", "fetch"]
    );

    // Second request replays the call and its output.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let body: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let input = body["input"].as_array().unwrap();
    assert_eq!(input[1]["type"], "function_call");
    assert_eq!(input[1]["call_id"], "call_1");
    assert_eq!(input[2]["type"], "function_call_output");
    assert_eq!(input[2]["output"], "notes.txt\nsrc/");
}

#[tokio::test]
async fn plan_mode_rejects_write_without_asking() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    mount_two_turns(
        &server,
        "write",
        r#"{"file_path":"out.txt","content":"hi"}"#,
        "Switch modes first.",
    )
    .await;

    let (agent, mut requests) = agent(&server, dir.path(), Mode::Plan);
    let events = run(&agent).await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].is_error);
    assert_eq!(
        results[0].output,
        "Error: tool 'write' is not available in PLAN mode. Switch to BUILD mode to use this tool."
    );
    assert!(!dir.path().join("out.txt").exists());
    assert!(requests.try_recv().is_err());
    assert_eq!(final_message(&events).content(), "Switch modes first.");
}

#[tokio::test]
async fn build_mode_write_runs_after_approval() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    mount_two_turns(
        &server,
        "write",
        r#"{"file_path":"out/hello.txt","content":"hello"}"#,
        "Written.",
    )
    .await;

    let (agent, requests) = agent(&server, dir.path(), Mode::Build);
    answer_permissions(requests, PermissionResponse::Allow);
    let events = run(&agent).await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_error, "{}", results[0].output);
    assert_eq!(
        results[0].output,
        "Successfully wrote 5 bytes to out/hello.txt"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("out/hello.txt")).unwrap(),
        "hello"
    );
    assert!(declared_tool_names(&server).await.contains(&"write".to_string()));
    assert_eq!(final_message(&events).content(), "Written.");
}

#[tokio::test]
async fn build_mode_denial_becomes_error_result() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    mount_two_turns(
        &server,
        "write",
        r#"{"file_path":"out.txt","content":"hi"}"#,
        "Understood.",
    )
    .await;

    let (agent, requests) = agent(&server, dir.path(), Mode::Build);
    answer_permissions(requests, PermissionResponse::Deny);
    let events = run(&agent).await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].is_error);
    assert_eq!(results[0].output, "Permission denied by user.");
    assert!(!dir.path().join("out.txt").exists());
    assert!(!agent.gate().is_allowed("write"));
}

#[tokio::test]
async fn persisted_messages_precede_done() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    mount_two_turns(&server, "ls", "{}", "Empty.").await;

    let (agent, _requests) = agent(&server, dir.path(), Mode::Plan);
    let events = run(&agent).await;

    let persisted: Vec<&Message> = events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::PersistMessage(message) => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[0].role(), Role::Assistant);
    assert_eq!(persisted[0].tool_calls()[0].name, "ls");
    assert_eq!(persisted[1].role(), Role::Tool);
    assert_eq!(persisted[1].tool_results()[0].output, "(empty directory)");
    assert_eq!(final_message(&events).content(), "Empty.");
}
