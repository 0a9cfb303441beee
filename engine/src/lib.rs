//! Orchestration core for Kiln.
//!
//! [`Agent`] drives model turns through a [`kiln_providers::Provider`],
//! executes requested tools from a [`kiln_tools::ToolRegistry`], and reports
//! progress as [`AgentEvent`]s. Permission-requiring tools are hidden in
//! [`Mode::Plan`] and routed through the [`PermissionGate`] in
//! [`Mode::Build`].

mod agent;
mod permission;
mod prompt;

pub use agent::{Agent, AgentConfig, AgentError, AgentEvent, DEFAULT_MAX_ITERATIONS};
pub use permission::{PermissionDecision, PermissionGate, PermissionRequest, PermissionResponse};
pub use prompt::build_system_prompt;

pub use kiln_types::Mode;
