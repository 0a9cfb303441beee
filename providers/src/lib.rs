//! LLM provider clients with normalized streaming.
//!
//! # Architecture
//!
//! - [`Provider`] - capability trait the agent loop talks to
//! - [`openai`] - OpenAI Responses API adapter
//!
//! A successful [`Provider::send_message`] hands back a
//! [`tokio::sync::mpsc::Receiver<StreamEvent>`] fed by a background task that
//! decodes the provider's SSE body.
//!
//! # Streaming Events
//!
//! | Event | Description |
//! |-------|-------------|
//! | `TextDelta` | Incremental text content from the model |
//! | `ToolCallStart` | Tool call with both call id and name known |
//! | `ToolCallDelta` | Incremental tool call arguments (JSON) |
//! | `ToolCallEnd` | Tool call finalized with its full argument text |
//! | `Done` | Stream completed, carrying token usage |
//! | `Error` | Stream terminated with an error |
//!
//! # Error Handling
//!
//! Failures before the body starts streaming (transport, non-2xx status) are
//! returned as [`ProviderError`]. Once the receiver is handed out, every failure
//! arrives as a single `StreamEvent::Error`. Exactly one terminal event is sent
//! per stream, after which the channel closes.

pub mod openai;
pub mod sse_types;

pub use kiln_types;
pub use openai::OpenAIProvider;

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::str;
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use kiln_types::{Message, StreamEvent, TokenUsage, ToolDefinition};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT_SECS: u64 = 30;
/// Default for [`OpenAIProvider::with_stream_idle_timeout`].
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// A single SSE line may not exceed this.
const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Capacity of the event channel handed to the consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Boxed future returned by [`Provider`] methods.
pub type ProviderFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API error (HTTP {status}): {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request cancelled")]
    Cancelled,
}

/// Provider-agnostic request for one model turn.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// Maximum output tokens; `0` selects the provider default.
    pub max_tokens: u32,
}

/// One LLM vendor behind a uniform capability set.
///
/// Configuration setters take `&self` so a shared provider can be retargeted
/// between runs; each request snapshots the configuration when it starts.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn model(&self) -> String;

    fn send_message(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> ProviderFut<'_, mpsc::Receiver<StreamEvent>>;

    /// Sorted identifiers of text-generation models.
    fn list_models(&self) -> ProviderFut<'_, Vec<String>>;

    fn set_api_key(&self, api_key: String);

    fn set_model(&self, model: String);
}

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!("Failed to build HTTP client: {e}. Falling back to defaults.");
            reqwest::Client::new()
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
}

/// Remove the next complete line (without its `\n` / `\r\n`) from `buffer`.
fn drain_next_sse_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

/// Payload of a `data:` line. Blank lines, `:` comments, and `event:`/`id:`/
/// `retry:` fields carry nothing the parsers need.
fn extract_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Continue processing, no event to emit
    Continue,
    /// Emit these events; a terminal event ends the stream
    Emit(Vec<StreamEvent>),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;

    /// Finalize whatever is still open. Called when the stream ends without
    /// the provider's own completion event.
    fn finish(&mut self) -> Vec<StreamEvent>;

    fn provider_name(&self) -> &'static str;
}

pub(crate) async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

pub(crate) fn parse_sse_payload<T>(
    json: &serde_json::Value,
    provider_name: &'static str,
) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    match serde_json::from_value(json.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(%e, provider = provider_name, "Failed to parse SSE event");
            None
        }
    }
}

pub(crate) fn emit_or_continue(events: Vec<StreamEvent>) -> SseParseAction {
    if events.is_empty() {
        SseParseAction::Continue
    } else {
        SseParseAction::Emit(events)
    }
}

enum LineFlow {
    Continue,
    /// A terminal event went out, or the consumer hung up.
    Stop,
}

async fn dispatch_line<P: SseParser>(
    line: &[u8],
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
) -> LineFlow {
    let Ok(line) = str::from_utf8(line) else {
        tracing::warn!(
            provider = parser.provider_name(),
            "Skipping non UTF-8 SSE line"
        );
        return LineFlow::Continue;
    };

    let Some(data) = extract_sse_data(line) else {
        return LineFlow::Continue;
    };

    if data == "[DONE]" {
        finish_stream(parser, tx, StreamEvent::Done(TokenUsage::default())).await;
        return LineFlow::Stop;
    }

    let json = match serde_json::from_str::<serde_json::Value>(data) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(
                %e,
                payload_bytes = data.len(),
                provider = parser.provider_name(),
                "Invalid SSE JSON payload"
            );
            return LineFlow::Continue;
        }
    };

    match parser.parse(&json) {
        SseParseAction::Continue => LineFlow::Continue,
        SseParseAction::Emit(events) => {
            for event in events {
                let is_terminal = event.is_terminal();
                if !send_event(tx, event).await || is_terminal {
                    return LineFlow::Stop;
                }
            }
            LineFlow::Continue
        }
    }
}

/// Flush the parser's open state, then send `terminal`.
async fn finish_stream<P: SseParser>(
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    terminal: StreamEvent,
) {
    for event in parser.finish() {
        if !send_event(tx, event).await {
            return;
        }
    }
    let _ = send_event(tx, terminal).await;
}

/// Drive an SSE body through a provider-specific parser.
///
/// Handles cancellation (checked per line), idle timeouts, the line buffer
/// cap, and premature EOF. Every exit path sends exactly one terminal event;
/// the caller drops `tx` afterwards, which closes the channel.
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    idle_timeout: Duration,
) {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    let terminal = 'read: loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            next = time::timeout(idle_timeout, stream.next()) => Some(next),
        };

        let Some(next) = next else {
            break 'read StreamEvent::Error(ProviderError::Cancelled.to_string());
        };

        let Ok(next) = next else {
            break 'read StreamEvent::Error("stream idle timeout".to_string());
        };

        let Some(chunk) = next else {
            // Connection closed without a completion event. A trailing line
            // with no newline is still a line.
            if !buffer.is_empty() {
                let line = mem::take(&mut buffer);
                if let LineFlow::Stop = dispatch_line(&line, parser, tx).await {
                    return;
                }
            }
            tracing::debug!(
                provider = parser.provider_name(),
                "SSE stream ended without completion event"
            );
            break 'read StreamEvent::Done(TokenUsage::default());
        };

        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => break 'read StreamEvent::Error(format!("stream read failed: {e}")),
        };
        buffer.extend_from_slice(&chunk);

        while let Some(line) = drain_next_sse_line(&mut buffer) {
            if cancel.is_cancelled() {
                break 'read StreamEvent::Error(ProviderError::Cancelled.to_string());
            }
            if let LineFlow::Stop = dispatch_line(&line, parser, tx).await {
                return;
            }
        }

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            break 'read StreamEvent::Error(
                "SSE line exceeded maximum size (4 MiB)".to_string(),
            );
        }
    };

    finish_stream(parser, tx, terminal).await;
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
