//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests: a mock OpenAI endpoint that
//! serves Responses API event streams.

#![allow(dead_code)]

use std::sync::Arc;

use kiln_providers::OpenAIProvider;
use kiln_types::StreamEvent;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_API_KEY: &str = "sk-test";

/// Provider pointed at the mock server.
pub fn openai_provider(server: &MockServer) -> Arc<OpenAIProvider> {
    Arc::new(OpenAIProvider::new(TEST_API_KEY, "gpt-4o").with_base_url(server.uri()))
}

/// Encode events as an SSE body, one `data:` record each.
pub fn sse_body(events: &[Value]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    body
}

pub fn sse_response(events: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(sse_body(events))
        .insert_header("content-type", "text/event-stream")
}

/// Serve `events` for every `POST /responses`.
pub async fn mount_stream(server: &MockServer, events: &[Value]) {
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(sse_response(events))
        .mount(server)
        .await;
}

/// Serve `events` once for a `POST /responses` whose body contains `marker`.
pub async fn mount_turn(server: &MockServer, marker: &str, events: &[Value]) {
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_string_contains(marker))
        .respond_with(sse_response(events))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

pub fn text_delta(text: &str) -> Value {
    json!({"type": "response.output_text.delta", "item_id": "msg_1", "delta": text})
}

pub fn completed(input_tokens: u64, output_tokens: u64) -> Value {
    json!({
        "type": "response.completed",
        "response": {
            "usage": {
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens
            }
        }
    })
}

/// The added/arguments/done sequence for one function call.
pub fn function_call(item_id: &str, call_id: &str, name: &str, arguments: &str) -> Vec<Value> {
    vec![
        json!({
            "type": "response.output_item.added",
            "item": {"type": "function_call", "id": item_id, "call_id": call_id, "name": name, "arguments": ""}
        }),
        json!({"type": "response.function_call_arguments.delta", "item_id": item_id, "delta": arguments}),
        json!({"type": "response.function_call_arguments.done", "item_id": item_id, "arguments": arguments}),
        json!({
            "type": "response.output_item.done",
            "item": {"type": "function_call", "id": item_id, "call_id": call_id, "name": name, "arguments": arguments}
        }),
    ]
}

pub async fn collect_stream(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
