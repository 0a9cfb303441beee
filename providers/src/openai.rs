//! OpenAI Responses API adapter.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sse_types::openai as typed;
use crate::{
    DEFAULT_STREAM_IDLE_TIMEOUT, Provider, ProviderError, ProviderFut, Request,
    STREAM_CHANNEL_CAPACITY, SseParseAction, SseParser, emit_or_continue, http_client,
    parse_sse_payload, process_sse_stream, read_capped_error_body,
};
use kiln_types::{Message, Role, StreamEvent, TokenUsage};

/// Canonical OpenAI API base URL.
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com/v1";

const PROVIDER_NAME: &str = "OpenAI";
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

/// Model id prefixes that denote text-generation models.
const CHAT_MODEL_PREFIXES: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt-"];

// ========================================================================
// OpenAI SSE Parser
// ========================================================================

/// Accumulator for one function call, keyed by the provider's item id.
#[derive(Debug, Default)]
struct PendingCall {
    call_id: Option<String>,
    name: Option<String>,
    arguments: String,
    started: bool,
}

impl PendingCall {
    /// `ToolCallStart` once both call id and name are known, at most once.
    fn try_start(&mut self) -> Option<StreamEvent> {
        if self.started {
            return None;
        }
        let (Some(id), Some(name)) = (&self.call_id, &self.name) else {
            return None;
        };
        self.started = true;
        Some(StreamEvent::ToolCallStart {
            id: id.clone(),
            name: name.clone(),
        })
    }

    fn merge_identity(&mut self, call_id: Option<String>, name: Option<String>) {
        if self.call_id.is_none() {
            self.call_id = call_id.filter(|s| !s.is_empty());
        }
        if self.name.is_none() {
            self.name = name.filter(|s| !s.is_empty());
        }
    }
}

#[derive(Default)]
pub(crate) struct OpenAIParser {
    /// item_id -> in-flight function call
    calls: HashMap<String, PendingCall>,
    /// item ids in first-seen order, so flushes are deterministic
    order: Vec<String>,
    /// item ids already finalized; late events for them are ignored
    finished: HashSet<String>,
    /// item ids that produced text deltas (for the `.done` fallback)
    text_delta_seen: HashSet<String>,
}

impl OpenAIParser {
    /// Accumulator for `item_id`, created on first sight. `None` once the
    /// call has been finalized.
    fn pending(&mut self, item_id: &str) -> Option<&mut PendingCall> {
        if self.finished.contains(item_id) {
            return None;
        }
        if !self.calls.contains_key(item_id) {
            self.order.push(item_id.to_string());
        }
        Some(self.calls.entry(item_id.to_string()).or_default())
    }

    /// Emit the single `ToolCallEnd` for `item_id`. A non-empty
    /// `full_arguments` supersedes whatever was accumulated from deltas.
    fn finalize(&mut self, item_id: &str, full_arguments: Option<String>) -> Vec<StreamEvent> {
        let Some(mut call) = self.calls.remove(item_id) else {
            return Vec::new();
        };
        self.order.retain(|id| id != item_id);
        self.finished.insert(item_id.to_string());

        if let Some(arguments) = full_arguments.filter(|s| !s.is_empty()) {
            call.arguments = arguments;
        }

        let id = call.call_id.clone().unwrap_or_else(|| item_id.to_string());
        let name = call.name.clone().unwrap_or_default();

        let mut events = Vec::with_capacity(2);
        if !call.started {
            events.push(StreamEvent::ToolCallStart {
                id: id.clone(),
                name: name.clone(),
            });
        }
        events.push(StreamEvent::ToolCallEnd {
            id,
            name,
            arguments: call.arguments,
        });
        events
    }

    fn flush_open_calls(&mut self) -> Vec<StreamEvent> {
        let open: Vec<String> = self.order.clone();
        open.iter()
            .flat_map(|item_id| self.finalize(item_id, None))
            .collect()
    }

    fn handle_function_item(
        &mut self,
        key: &str,
        call_id: Option<String>,
        name: Option<String>,
    ) -> Vec<StreamEvent> {
        let Some(call) = self.pending(key) else {
            return Vec::new();
        };
        call.merge_identity(call_id, name);
        call.try_start().into_iter().collect()
    }
}

fn failure_message(error: Option<typed::ErrorInfo>) -> String {
    match error {
        Some(typed::ErrorInfo {
            code: Some(code),
            message: Some(message),
        }) => format!("OpenAI API error ({code}): {message}"),
        Some(typed::ErrorInfo {
            message: Some(message),
            ..
        }) => format!("OpenAI API error: {message}"),
        _ => "response failed".to_string(),
    }
}

fn usage_from(response: Option<typed::ResponseInfo>) -> TokenUsage {
    let Some(usage) = response.and_then(|r| r.usage) else {
        return TokenUsage::default();
    };
    TokenUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage
            .total_tokens
            .unwrap_or(usage.input_tokens + usage.output_tokens),
    }
}

impl SseParser for OpenAIParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let Some(event) = parse_sse_payload::<typed::Event>(json, PROVIDER_NAME) else {
            return SseParseAction::Continue;
        };

        let mut events = Vec::new();

        match event {
            typed::Event::OutputTextDelta { item_id, delta } => {
                if let Some(delta) = delta.filter(|d| !d.is_empty()) {
                    if let Some(item_id) = item_id {
                        self.text_delta_seen.insert(item_id);
                    }
                    events.push(StreamEvent::TextDelta(delta));
                }
            }

            typed::Event::OutputTextDone { item_id, text } => {
                // Only emit fallback if no deltas were seen for this item
                let saw_delta = item_id
                    .as_ref()
                    .is_some_and(|id| self.text_delta_seen.contains(id));
                if !saw_delta && let Some(text) = text.filter(|t| !t.is_empty()) {
                    events.push(StreamEvent::TextDelta(text));
                }
            }

            typed::Event::OutputItemAdded { item_id, item } => {
                if let Some(typed::OutputItem::FunctionCall {
                    id, call_id, name, ..
                }) = item
                {
                    let key = id.or(item_id).unwrap_or_default();
                    events.extend(self.handle_function_item(&key, call_id, name));
                }
            }

            typed::Event::FunctionCallArgumentsDelta {
                item_id,
                call_id,
                delta,
            } => {
                let key = item_id.unwrap_or_default();
                if let Some(call) = self.pending(&key) {
                    call.merge_identity(call_id, None);
                    let delta = delta.unwrap_or_default();
                    call.arguments.push_str(&delta);
                    events.extend(call.try_start());
                    if !delta.is_empty() {
                        let id = call.call_id.clone().unwrap_or_else(|| key.clone());
                        events.push(StreamEvent::ToolCallDelta {
                            id,
                            arguments: delta,
                        });
                    }
                }
            }

            typed::Event::FunctionCallArgumentsDone {
                item_id,
                call_id,
                arguments,
            } => {
                let key = item_id.unwrap_or_default();
                if let Some(call) = self.pending(&key) {
                    call.merge_identity(call_id, None);
                    events.extend(self.finalize(&key, arguments));
                }
            }

            typed::Event::OutputItemDone { item_id, item } => {
                if let Some(typed::OutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                }) = item
                {
                    let key = id.or(item_id).unwrap_or_default();
                    events.extend(self.handle_function_item(&key, call_id, name));
                    events.extend(self.finalize(&key, arguments));
                }
            }

            typed::Event::Completed { response } => {
                events.extend(self.flush_open_calls());
                events.push(StreamEvent::Done(usage_from(response)));
            }

            typed::Event::Incomplete { .. } => {
                events.extend(self.flush_open_calls());
                events.push(StreamEvent::Error(
                    "response incomplete (model stopped early)".to_string(),
                ));
            }

            typed::Event::Failed { response, error } => {
                let error = error.or(response.and_then(|r| r.error));
                events.extend(self.flush_open_calls());
                events.push(StreamEvent::Error(failure_message(error)));
            }

            typed::Event::Error {
                error,
                message,
                code,
            } => {
                let error = error.or(Some(typed::ErrorInfo { code, message }));
                events.extend(self.flush_open_calls());
                events.push(StreamEvent::Error(failure_message(error)));
            }

            typed::Event::Unknown => {}
        }

        emit_or_continue(events)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.flush_open_calls()
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

// ========================================================================
// Request Building
// ========================================================================

fn build_input_items(messages: &[Message]) -> Vec<Value> {
    let mut items = Vec::new();

    for msg in messages {
        match msg.role() {
            Role::User => {
                items.push(json!({ "role": "user", "content": msg.content() }));
            }
            Role::Assistant => {
                if !msg.content().is_empty() {
                    items.push(json!({ "role": "assistant", "content": msg.content() }));
                }
                for call in msg.tool_calls() {
                    items.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.arguments,
                    }));
                }
            }
            Role::Tool => {
                for result in msg.tool_results() {
                    items.push(json!({
                        "type": "function_call_output",
                        "call_id": result.tool_call_id,
                        "output": result.output,
                    }));
                }
            }
            // The top-level system prompt travels in `instructions`; history
            // system messages go through the developer channel instead.
            Role::System => {
                items.push(json!({ "role": "developer", "content": msg.content() }));
            }
        }
    }

    items
}

pub(crate) fn build_request_body(model: &str, request: &Request) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), json!(model));

    if !request.system_prompt.is_empty() {
        body.insert("instructions".into(), json!(request.system_prompt));
    }

    body.insert(
        "input".into(),
        Value::Array(build_input_items(&request.messages)),
    );

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
    }

    let max_output_tokens = if request.max_tokens == 0 {
        DEFAULT_MAX_OUTPUT_TOKENS
    } else {
        request.max_tokens
    };
    body.insert("max_output_tokens".into(), json!(max_output_tokens));
    body.insert("stream".into(), json!(true));
    body.insert("store".into(), json!(false));

    Value::Object(body)
}

fn is_chat_model(id: &str) -> bool {
    CHAT_MODEL_PREFIXES
        .iter()
        .any(|prefix| id.starts_with(prefix))
}

// ========================================================================
// Provider
// ========================================================================

#[derive(Clone)]
struct Settings {
    api_key: String,
    model: String,
}

/// OpenAI Responses API client.
pub struct OpenAIProvider {
    base_url: String,
    stream_idle_timeout: Duration,
    settings: RwLock<Settings>,
}

impl fmt::Debug for OpenAIProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIProvider")
            .field("base_url", &self.base_url)
            .field("stream_idle_timeout", &self.stream_idle_timeout)
            .field("api_key", &"<redacted>")
            .field("model", &self.settings().model)
            .finish()
    }
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: OPENAI_API_BASE_URL.to_string(),
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            settings: RwLock::new(Settings {
                api_key: api_key.into(),
                model: model.into(),
            }),
        }
    }

    /// Point the client at another API root (proxies, test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// How long a stream may go without a chunk before it ends with an error.
    #[must_use]
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn open_stream(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        // Snapshot: later set_api_key/set_model calls never reach this stream.
        let settings = self.settings();
        let body = build_request_body(&settings.model, &request);
        let url = format!("{}/responses", self.base_url);

        tracing::debug!(model = %settings.model, messages = request.messages.len(), "Sending OpenAI request");

        let send = http_client()
            .post(&url)
            .bearer_auth(&settings.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = send => response?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = read_capped_error_body(response).await;
            return Err(ProviderError::Http {
                provider: PROVIDER_NAME,
                status,
                body,
            });
        }

        let idle_timeout = self.stream_idle_timeout;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut parser = OpenAIParser::default();
            process_sse_stream(response, &mut parser, &tx, &cancel, idle_timeout).await;
        });
        Ok(rx)
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        let settings = self.settings();
        let response = http_client()
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&settings.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = read_capped_error_body(response).await;
            return Err(ProviderError::Http {
                provider: PROVIDER_NAME,
                status,
                body,
            });
        }

        let list: typed::ModelList = response.json().await?;
        let mut models: Vec<String> = list
            .data
            .into_iter()
            .map(|m| m.id)
            .filter(|id| is_chat_model(id))
            .collect();
        models.sort();
        Ok(models)
    }
}

impl Provider for OpenAIProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> String {
        self.settings().model
    }

    fn send_message(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> ProviderFut<'_, mpsc::Receiver<StreamEvent>> {
        Box::pin(self.open_stream(request, cancel))
    }

    fn list_models(&self) -> ProviderFut<'_, Vec<String>> {
        Box::pin(self.fetch_models())
    }

    fn set_api_key(&self, api_key: String) {
        self.settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .api_key = api_key;
    }

    fn set_model(&self, model: String) {
        self.settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .model = model;
    }
}
