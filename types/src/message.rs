//! Conversation messages.
//!
//! A [`Message`] carries tool calls (assistant turns that request tools) or
//! tool results (the aggregated tool turn that answers them), never both.
//! Constructors enforce this; [`Message::from_parts`] re-checks it when a
//! message is rehydrated from storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MessageId, SessionId, TokenUsage, ToolCall, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(MessageError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message role: {0}")]
    UnknownRole(String),
    #[error("message carries both tool calls and tool results")]
    CallsAndResults,
    #[error("only assistant messages may carry tool calls (got {0})")]
    CallsOnRole(Role),
    #[error("only tool messages may carry tool results (got {0})")]
    ResultsOnRole(Role),
}

/// Raw fields of a stored message, validated by [`Message::from_parts`].
#[derive(Debug, Clone)]
pub struct MessageParts {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    session_id: SessionId,
    role: Role,
    content: String,
    tool_calls: Vec<ToolCall>,
    tool_results: Vec<ToolResult>,
    usage: TokenUsage,
    created_at: DateTime<Utc>,
}

impl Message {
    fn build(
        session_id: SessionId,
        role: Role,
        content: String,
        tool_calls: Vec<ToolCall>,
        tool_results: Vec<ToolResult>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            session_id,
            role,
            content,
            tool_calls,
            tool_results,
            usage: TokenUsage::default(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn user(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::build(session_id, Role::User, content.into(), Vec::new(), Vec::new())
    }

    #[must_use]
    pub fn system(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::build(session_id, Role::System, content.into(), Vec::new(), Vec::new())
    }

    /// An assistant turn; `tool_calls` may be empty for a plain text answer.
    #[must_use]
    pub fn assistant(
        session_id: SessionId,
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self::build(
            session_id,
            Role::Assistant,
            content.into(),
            tool_calls,
            Vec::new(),
        )
    }

    /// The tool turn answering one assistant turn, one result per call.
    #[must_use]
    pub fn tool_turn(session_id: SessionId, results: Vec<ToolResult>) -> Self {
        Self::build(session_id, Role::Tool, String::new(), Vec::new(), results)
    }

    pub fn from_parts(parts: MessageParts) -> Result<Self, MessageError> {
        if !parts.tool_calls.is_empty() && !parts.tool_results.is_empty() {
            return Err(MessageError::CallsAndResults);
        }
        if !parts.tool_calls.is_empty() && parts.role != Role::Assistant {
            return Err(MessageError::CallsOnRole(parts.role));
        }
        if !parts.tool_results.is_empty() && parts.role != Role::Tool {
            return Err(MessageError::ResultsOnRole(parts.role));
        }
        Ok(Self {
            id: parts.id,
            session_id: parts.session_id,
            role: parts.role,
            content: parts.content,
            tool_calls: parts.tool_calls,
            tool_results: parts.tool_results,
            usage: parts.usage,
            created_at: parts.created_at,
        })
    }

    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    #[must_use]
    pub fn tool_results(&self) -> &[ToolResult] {
        &self.tool_results
    }

    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    #[must_use]
    pub fn has_tool_results(&self) -> bool {
        !self.tool_results.is_empty()
    }
}
