//! User approval for permission-requiring tool calls.
//!
//! The gate publishes a [`PermissionRequest`] on a single-slot channel and
//! waits on the request's one-shot reply. Cancellation while publishing or
//! waiting resolves to [`PermissionDecision::Deny`]; a dropped request does
//! too. Tools approved with [`PermissionResponse::AllowForSession`] skip the
//! prompt until [`PermissionGate::reset`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// What the user answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResponse {
    Allow,
    Deny,
    AllowForSession,
}

/// What the gate tells the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// A pending approval prompt. Answer it with [`PermissionRequest::respond`].
pub struct PermissionRequest {
    pub tool_name: String,
    /// Raw tool arguments, shown to the user.
    pub input: String,
    reply: oneshot::Sender<PermissionResponse>,
}

impl PermissionRequest {
    /// Consumes the request; the reply slot is single-use.
    pub fn respond(self, response: PermissionResponse) {
        if self.reply.send(response).is_err() {
            tracing::debug!(tool = %self.tool_name, "permission answer arrived after the caller gave up");
        }
    }
}

impl fmt::Debug for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionRequest")
            .field("tool_name", &self.tool_name)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct PermissionGate {
    session_allowed: RwLock<HashSet<String>>,
    requests: mpsc::Sender<PermissionRequest>,
}

impl PermissionGate {
    /// The receiver is where the UI picks up prompts.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<PermissionRequest>) {
        let (requests, rx) = mpsc::channel(1);
        let gate = Self {
            session_allowed: RwLock::new(HashSet::new()),
            requests,
        };
        (gate, rx)
    }

    pub async fn check(
        &self,
        tool_name: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> PermissionDecision {
        if self.is_allowed(tool_name) {
            return PermissionDecision::Allow;
        }
        if cancel.is_cancelled() {
            return PermissionDecision::Deny;
        }

        let (reply, answer) = oneshot::channel();
        let request = PermissionRequest {
            tool_name: tool_name.to_string(),
            input: input.to_string(),
            reply,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return PermissionDecision::Deny,
            sent = self.requests.send(request) => {
                if sent.is_err() {
                    tracing::warn!(tool = tool_name, "no permission listener; denying");
                    return PermissionDecision::Deny;
                }
            }
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return PermissionDecision::Deny,
            response = answer => response.unwrap_or(PermissionResponse::Deny),
        };

        tracing::debug!(tool = tool_name, ?response, "permission answered");
        match response {
            PermissionResponse::Allow => PermissionDecision::Allow,
            PermissionResponse::AllowForSession => {
                self.session_allowed
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(tool_name.to_string());
                PermissionDecision::Allow
            }
            PermissionResponse::Deny => PermissionDecision::Deny,
        }
    }

    #[must_use]
    pub fn is_allowed(&self, tool_name: &str) -> bool {
        self.session_allowed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tool_name)
    }

    /// Forget every session-wide approval.
    pub fn reset(&self) {
        self.session_allowed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
