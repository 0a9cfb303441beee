//! OpenAI Responses adapter against a mock HTTP server

use std::time::Duration;

use kiln_providers::{OpenAIProvider, Provider, ProviderError, Request};
use kiln_types::{Message, SessionId, StreamEvent, TokenUsage};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{
    TEST_API_KEY, collect_stream, completed, function_call, mount_stream, openai_provider,
    sse_body, sse_response, text_delta,
};

fn request(prompt: &str) -> Request {
    Request {
        system_prompt: "You are a test assistant.".to_string(),
        messages: vec![Message::user(SessionId::generate(), prompt)],
        tools: Vec::new(),
        max_tokens: 0,
    }
}

#[tokio::test]
async fn streams_text_then_usage() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        &[text_delta("Hello"), text_delta(", world"), completed(12, 3)],
    )
    .await;

    let provider = openai_provider(&server);
    let rx = provider
        .send_message(request("hi"), CancellationToken::new())
        .await
        .unwrap();
    let events = collect_stream(rx).await;

    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta("Hello".into()),
            StreamEvent::TextDelta(", world".into()),
            StreamEvent::Done(TokenUsage::new(12, 3)),
        ]
    );
}

#[tokio::test]
async fn request_carries_auth_and_fixed_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(header("authorization", format!("Bearer {TEST_API_KEY}").as_str()))
        .and(body_partial_json(json!({
            "model": "gpt-4o",
            "instructions": "You are a test assistant.",
            "stream": true,
            "store": false,
            "max_output_tokens": 4096,
            "input": [{"role": "user", "content": "hi"}]
        })))
        .respond_with(sse_response(&[completed(1, 1)]))
        .expect(1)
        .mount(&server)
        .await;

    let provider = openai_provider(&server);
    let rx = provider
        .send_message(request("hi"), CancellationToken::new())
        .await
        .unwrap();
    let events = collect_stream(rx).await;
    assert_eq!(events, vec![StreamEvent::Done(TokenUsage::new(1, 1))]);
}

#[tokio::test]
async fn function_call_is_reassembled() {
    let server = MockServer::start().await;
    let mut events = function_call("fc_1", "call_1", "view", r#"{"file_path":"a.rs"}"#);
    events.push(completed(5, 7));
    mount_stream(&server, &events).await;

    let provider = openai_provider(&server);
    let rx = provider
        .send_message(request("read a.rs"), CancellationToken::new())
        .await
        .unwrap();
    let events = collect_stream(rx).await;

    assert_eq!(
        events,
        vec![
            StreamEvent::ToolCallStart {
                id: "call_1".into(),
                name: "view".into()
            },
            StreamEvent::ToolCallDelta {
                id: "call_1".into(),
                arguments: r#"{"file_path":"a.rs"}"#.into()
            },
            StreamEvent::ToolCallEnd {
                id: "call_1".into(),
                name: "view".into(),
                arguments: r#"{"file_path":"a.rs"}"#.into()
            },
            StreamEvent::Done(TokenUsage::new(5, 7)),
        ]
    );
}

#[tokio::test]
async fn malformed_lines_are_skipped_and_done_sentinel_finishes() {
    let server = MockServer::start().await;
    let body = format!(
        "event: message\ndata: {{not json\n\ndata: {}\n\ndata: [DONE]\n\n",
        text_delta("ok")
    );
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let provider = openai_provider(&server);
    let rx = provider
        .send_message(request("hi"), CancellationToken::new())
        .await
        .unwrap();
    let events = collect_stream(rx).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta("ok".into()),
            StreamEvent::Done(TokenUsage::default()),
        ]
    );
}

#[tokio::test]
async fn early_close_flushes_open_call_and_finishes_once() {
    let server = MockServer::start().await;
    let call = function_call("fc_1", "c1", "ls", "{}");
    // No completion event, no sentinel, and no newline after the last record.
    let body = format!("{}data: {}", sse_body(&call[..1]), call[1]);
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let provider = openai_provider(&server);
    let rx = provider
        .send_message(request("list"), CancellationToken::new())
        .await
        .unwrap();
    let events = collect_stream(rx).await;

    assert_eq!(
        events,
        vec![
            StreamEvent::ToolCallStart {
                id: "c1".into(),
                name: "ls".into()
            },
            StreamEvent::ToolCallDelta {
                id: "c1".into(),
                arguments: "{}".into()
            },
            StreamEvent::ToolCallEnd {
                id: "c1".into(),
                name: "ls".into(),
                arguments: "{}".into()
            },
            StreamEvent::Done(TokenUsage::default()),
        ]
    );
}

#[tokio::test]
async fn failed_response_surfaces_error_event() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        &[json!({
            "type": "response.failed",
            "response": {"error": {"code": "server_error", "message": "boom"}}
        })],
    )
    .await;

    let provider = openai_provider(&server);
    let rx = provider
        .send_message(request("hi"), CancellationToken::new())
        .await
        .unwrap();
    let events = collect_stream(rx).await;
    assert_eq!(
        events,
        vec![StreamEvent::Error(
            "OpenAI API error (server_error): boom".into()
        )]
    );
}

#[tokio::test]
async fn http_error_is_returned_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let provider = openai_provider(&server);
    let err = provider
        .send_message(request("hi"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Http { status: 401, .. }));
    assert_eq!(
        err.to_string(),
        "OpenAI API error (HTTP 401): invalid api key"
    );
}

#[tokio::test]
async fn cancelled_token_aborts_request() {
    let server = MockServer::start().await;
    mount_stream(&server, &[completed(1, 1)]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let provider = openai_provider(&server);
    let err = provider.send_message(request("hi"), cancel).await.unwrap_err();
    assert!(matches!(err, ProviderError::Cancelled));
}

#[tokio::test]
async fn cancel_after_stream_opens_ends_with_single_error() {
    let server = MockServer::start().await;
    mount_stream(&server, &[text_delta("never seen"), completed(1, 1)]).await;

    let cancel = CancellationToken::new();
    let provider = openai_provider(&server);
    let rx = provider
        .send_message(request("hi"), cancel.clone())
        .await
        .unwrap();
    cancel.cancel();

    assert_eq!(
        collect_stream(rx).await,
        vec![StreamEvent::Error("request cancelled".into())]
    );
}

/// Serve one SSE record over chunked HTTP, then keep the connection open
/// without sending anything else.
async fn stalled_stream_server(record: Value) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let chunk = format!("data: {record}\n\n");
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{chunk}\r\n",
            chunk.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        time::sleep(Duration::from_secs(30)).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn silent_stream_hits_configured_idle_timeout() {
    let base_url = stalled_stream_server(text_delta("thinking")).await;
    let provider = OpenAIProvider::new(TEST_API_KEY, "o3")
        .with_base_url(base_url)
        .with_stream_idle_timeout(Duration::from_millis(200));

    let rx = provider
        .send_message(request("hi"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        collect_stream(rx).await,
        vec![
            StreamEvent::TextDelta("thinking".into()),
            StreamEvent::Error("stream idle timeout".into()),
        ]
    );
}

#[tokio::test]
async fn list_models_filters_and_sorts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [
                {"id": "o3-mini"},
                {"id": "whisper-1"},
                {"id": "gpt-4o"},
                {"id": "text-embedding-3-small"},
                {"id": "chatgpt-4o-latest"}
            ]
        })))
        .mount(&server)
        .await;

    let provider = openai_provider(&server);
    let models = provider.list_models().await.unwrap();
    assert_eq!(models, vec!["chatgpt-4o-latest", "gpt-4o", "o3-mini"]);
}

#[tokio::test]
async fn model_change_applies_to_next_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_partial_json(json!({"model": "o3"})))
        .respond_with(sse_response(&[completed(2, 2)]))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAIProvider::new(TEST_API_KEY, "gpt-4o").with_base_url(server.uri());
    provider.set_model("o3".to_string());
    assert_eq!(provider.model(), "o3");

    let rx = provider
        .send_message(request("hi"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        collect_stream(rx).await,
        vec![StreamEvent::Done(TokenUsage::new(2, 2))]
    );
}
