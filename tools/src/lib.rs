//! Tool framework: the capability trait, an ordered registry, shared helpers,
//! and the built-in tools.

pub mod builtins;
pub mod fetch;
pub mod process;
pub mod search;
pub mod shell;

pub use builtins::{EditTool, GlobTool, LsTool, ViewTool, WriteTool, register_builtins};
pub use fetch::FetchTool;
pub use search::GrepTool;
pub use shell::{BashTool, DetectedShell, detect_shell};

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use kiln_types::ToolDefinition;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Type alias for tool execution futures.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

/// Tool error types.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("{tool} timed out after {}s", .elapsed.as_secs())]
    Timeout { tool: String, elapsed: Duration },
    #[error("{message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
    #[error("{tool} cancelled")]
    Cancelled { tool: String },
}

impl ToolError {
    pub(crate) fn failed(tool: &str, message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Per-run execution context shared by every tool call.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    /// Relative paths resolve against this directory.
    pub work_dir: PathBuf,
    /// Fired when the user cancels the run; long-running tools stop early.
    pub cancel: CancellationToken,
}

impl ToolCtx {
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            work_dir: work_dir.into(),
            cancel,
        }
    }

    #[must_use]
    pub fn resolve(&self, raw: &str) -> PathBuf {
        resolve_path(&self.work_dir, raw)
    }

    /// `path` relative to the working directory when it lives beneath it.
    #[must_use]
    pub fn display(&self, path: &Path) -> String {
        display_path(&self.work_dir, path)
    }
}

/// A capability the model can invoke by name.
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;
    /// Mutating tools: hidden in plan mode and gated by the user in build mode.
    fn requires_permission(&self) -> bool {
        false
    }
    /// `input` is the raw argument text streamed by the model.
    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

/// Parse raw tool arguments. Blank input is treated as `{}` so argument-less
/// calls work when the model streams nothing.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(input: &str) -> Result<T, ToolError> {
    let input = if input.trim().is_empty() { "{}" } else { input };
    serde_json::from_str(input).map_err(|e| ToolError::BadArgs {
        message: e.to_string(),
    })
}

/// Tools in registration order, indexed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&dyn Tool, ToolError> {
        self.index
            .get(name)
            .map(|&i| self.tools[i].as_ref())
            .ok_or_else(|| ToolError::UnknownTool {
                name: name.to_string(),
            })
    }

    /// Registered tools in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Tool> {
        self.tools.iter().map(AsRef::as_ref)
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.iter().map(Tool::definition).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[must_use]
pub fn resolve_path(work_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        work_dir.join(path)
    }
}

#[must_use]
pub fn display_path(work_dir: &Path, path: &Path) -> String {
    path.strip_prefix(work_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Cut `output` to at most `max_bytes` (on a char boundary) and append `marker`.
#[must_use]
pub fn truncate_output(output: String, max_bytes: usize, marker: &str) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut end = max_bytes;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = output;
    truncated.truncate(end);
    truncated.push_str(marker);
    truncated
}
