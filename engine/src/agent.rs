//! The agent loop: model turns alternating with sequential tool turns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use kiln_providers::{Provider, ProviderError, Request};
use kiln_tools::{ToolCtx, ToolRegistry};
use kiln_types::{
    Message, Mode, SessionId, StreamEvent, TokenUsage, ToolCall, ToolDefinition, ToolResult,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::permission::{PermissionDecision, PermissionGate, PermissionRequest};
use crate::prompt::build_system_prompt;

pub const DEFAULT_MAX_ITERATIONS: usize = 25;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Everything the UI hears from one run, in emission order.
///
/// Exactly one of [`AgentEvent::Done`] or [`AgentEvent::Error`] ends every run.
#[derive(Debug)]
pub enum AgentEvent {
    StreamText(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallEnd {
        id: String,
        name: String,
        input: String,
    },
    ToolResult(ToolResult),
    /// An intermediate assistant or tool message to store before the loop
    /// moves on.
    PersistMessage(Message),
    /// The final tool-free assistant message.
    Done(Message),
    Error(AgentError),
    /// Approval prompt from the [`PermissionGate`]. [`Agent::run`] never
    /// sends this; prompts arrive on the gate's own receiver and the UI
    /// folds them into its event handling with this variant.
    PermissionRequest(PermissionRequest),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM request failed: {0}")]
    Request(#[source] ProviderError),
    #[error("{0}")]
    Stream(String),
    #[error("agent run cancelled")]
    Cancelled,
    #[error("agent reached maximum iterations ({0})")]
    MaxIterations(usize),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model turns per run; `0` selects [`DEFAULT_MAX_ITERATIONS`].
    pub max_iterations: usize,
    /// `0` selects the provider default.
    pub max_tokens: u32,
    pub mode: Mode,
    pub work_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tokens: 0,
            mode: Mode::default(),
            work_dir: PathBuf::from("."),
        }
    }
}

/// Drives one provider through repeated turns, executing requested tools.
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        mut config: AgentConfig,
    ) -> Self {
        if config.max_iterations == 0 {
            config.max_iterations = DEFAULT_MAX_ITERATIONS;
        }
        Self {
            provider,
            registry,
            gate,
            config,
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Takes effect on the next [`Agent::run`].
    pub fn set_mode(&mut self, mode: Mode) {
        self.config.mode = mode;
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) {
        self.config.max_iterations = if max_iterations == 0 {
            DEFAULT_MAX_ITERATIONS
        } else {
            max_iterations
        };
    }

    #[must_use]
    pub fn max_iterations(&self) -> usize {
        self.config.max_iterations
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    /// Tools offered to the model: plan mode hides permission-requiring tools.
    #[must_use]
    pub fn declared_tools(&self) -> Vec<ToolDefinition> {
        let mode = self.config.mode;
        self.registry
            .iter()
            .filter(|tool| mode == Mode::Build || !tool.requires_permission())
            .map(|tool| tool.definition())
            .collect()
    }

    /// Start a run on its own task. Read the receiver until it closes.
    pub fn run(
        &self,
        history: Vec<Message>,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let run = Run {
            agent: self.clone(),
            session_id,
            cancel,
            tx,
        };
        tokio::spawn(run.drive(history));
        rx
    }
}

/// Tool call still receiving argument fragments.
struct PendingCall {
    name: String,
    arguments: String,
}

/// What one model turn produced.
struct TurnOutput {
    text: String,
    calls: Vec<ToolCall>,
    usage: TokenUsage,
}

struct Run {
    agent: Agent,
    session_id: SessionId,
    cancel: CancellationToken,
    tx: mpsc::Sender<AgentEvent>,
}

impl Run {
    async fn emit(&self, event: AgentEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("agent event receiver dropped");
        }
    }

    async fn drive(self, history: Vec<Message>) {
        let outcome = self.run_loop(history).await;
        let event = match outcome {
            Ok(message) => AgentEvent::Done(message),
            Err(err) => {
                tracing::warn!(error = %err, "agent run failed");
                AgentEvent::Error(err)
            }
        };
        self.emit(event).await;
    }

    async fn run_loop(&self, mut history: Vec<Message>) -> Result<Message, AgentError> {
        let config = &self.agent.config;
        let tools = self.agent.declared_tools();
        let system_prompt = build_system_prompt(config.mode, &config.work_dir, &tools);

        for iteration in 0..config.max_iterations {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            tracing::debug!(
                iteration,
                mode = %config.mode,
                messages = history.len(),
                "starting model turn"
            );

            let request = Request {
                system_prompt: system_prompt.clone(),
                messages: history.clone(),
                tools: tools.clone(),
                max_tokens: config.max_tokens,
            };
            let turn = self.model_turn(request).await?;

            let assistant = Message::assistant(self.session_id.clone(), turn.text, turn.calls)
                .with_usage(turn.usage);
            if !assistant.has_tool_calls() {
                return Ok(assistant);
            }

            history.push(assistant.clone());
            self.emit(AgentEvent::PersistMessage(assistant.clone())).await;

            let mut results = Vec::with_capacity(assistant.tool_calls().len());
            for call in assistant.tool_calls() {
                if self.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                let result = self.execute_tool(call).await;
                self.emit(AgentEvent::ToolResult(result.clone())).await;
                results.push(result);
            }

            let tool_message = Message::tool_turn(self.session_id.clone(), results);
            history.push(tool_message.clone());
            self.emit(AgentEvent::PersistMessage(tool_message)).await;
        }

        Err(AgentError::MaxIterations(config.max_iterations))
    }

    async fn model_turn(&self, request: Request) -> Result<TurnOutput, AgentError> {
        let mut stream = match self
            .agent
            .provider
            .send_message(request, self.cancel.clone())
            .await
        {
            Ok(stream) => stream,
            Err(ProviderError::Cancelled) => return Err(AgentError::Cancelled),
            Err(err) => return Err(AgentError::Request(err)),
        };

        let mut text = String::new();
        let mut calls = Vec::new();
        let mut pending: HashMap<String, PendingCall> = HashMap::new();
        let mut usage = TokenUsage::default();

        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                event = stream.recv() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                StreamEvent::TextDelta(delta) => {
                    text.push_str(&delta);
                    self.emit(AgentEvent::StreamText(delta)).await;
                }
                StreamEvent::ToolCallStart { id, name } => {
                    pending.insert(
                        id.clone(),
                        PendingCall {
                            name: name.clone(),
                            arguments: String::new(),
                        },
                    );
                    self.emit(AgentEvent::ToolCallStart { id, name }).await;
                }
                StreamEvent::ToolCallDelta { id, arguments } => {
                    if let Some(call) = pending.get_mut(&id) {
                        call.arguments.push_str(&arguments);
                    }
                }
                StreamEvent::ToolCallEnd {
                    id,
                    name,
                    arguments,
                } => {
                    let Some(call) = pending.remove(&id) else {
                        tracing::warn!(id = %id, "tool call end without start; ignoring");
                        continue;
                    };
                    let input = if arguments.is_empty() {
                        call.arguments
                    } else {
                        arguments
                    };
                    let name = if call.name.is_empty() { name } else { call.name };
                    self.emit(AgentEvent::ToolCallEnd {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    })
                    .await;
                    calls.push(ToolCall::new(id, name, input));
                }
                StreamEvent::Done(reported) => {
                    usage = reported;
                    break;
                }
                StreamEvent::Error(message) => {
                    if self.cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    return Err(AgentError::Stream(message));
                }
            }
        }

        Ok(TurnOutput { text, calls, usage })
    }

    async fn execute_tool(&self, call: &ToolCall) -> ToolResult {
        let Ok(tool) = self.agent.registry.lookup(&call.name) else {
            return ToolResult::error(
                &call.id,
                &call.name,
                format!("Error: unknown tool '{}'", call.name),
            );
        };

        if tool.requires_permission() {
            if self.agent.config.mode == Mode::Plan {
                return ToolResult::error(
                    &call.id,
                    &call.name,
                    format!(
                        "Error: tool '{}' is not available in PLAN mode. Switch to BUILD mode to use this tool.",
                        call.name
                    ),
                );
            }
            let decision = self
                .agent
                .gate
                .check(&call.name, &call.arguments, &self.cancel)
                .await;
            if decision == PermissionDecision::Deny {
                return ToolResult::error(&call.id, &call.name, "Permission denied by user.");
            }
        }

        let ctx = ToolCtx::new(&self.agent.config.work_dir, self.cancel.clone());
        tracing::debug!(tool = %call.name, id = %call.id, "executing tool");
        match tool.execute(&call.arguments, &ctx).await {
            Ok(output) => ToolResult::success(&call.id, &call.name, output),
            Err(err) => {
                tracing::debug!(tool = %call.name, error = %err, "tool failed");
                ToolResult::error(&call.id, &call.name, format!("Error: {err}"))
            }
        }
    }
}
