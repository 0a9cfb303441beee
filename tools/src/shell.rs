//! Shell detection and the `bash` command tool.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time;

use crate::process::{ChildGuard, set_new_session};
use crate::{Tool, ToolCtx, ToolError, ToolFut, parse_args, truncate_output};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_OUTPUT_CHARS: usize = 50_000;

/// Detected shell for command execution.
#[derive(Debug, Clone)]
pub struct DetectedShell {
    /// Path or name of the shell binary.
    pub binary: PathBuf,
    /// Arguments to pass before the command (e.g., `["-c"]` or `["/C"]`).
    pub args: Vec<String>,
    /// Human-readable name for logging.
    pub name: String,
}

impl fmt::Display for DetectedShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Pick the shell for the `bash` tool.
///
/// A configured binary wins; otherwise bash from `PATH`, then `$SHELL`, then
/// `/bin/sh`.
#[must_use]
pub fn detect_shell(configured: Option<&str>) -> DetectedShell {
    if let Some(binary) = configured.map(str::trim).filter(|b| !b.is_empty()) {
        return DetectedShell {
            binary: PathBuf::from(binary),
            args: default_args_for(binary),
            name: shell_name(Path::new(binary)),
        };
    }
    detect_platform_shell()
}

/// Infer default args for a shell binary name.
fn default_args_for(binary: &str) -> Vec<String> {
    let name = Path::new(binary)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(binary)
        .to_lowercase();

    match name.as_str() {
        "cmd" => vec!["/C".to_string()],
        "pwsh" | "powershell" => vec!["-NoProfile".to_string(), "-Command".to_string()],
        _ => vec!["-c".to_string()],
    }
}

fn shell_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("shell")
        .to_string()
}

#[cfg(windows)]
fn detect_platform_shell() -> DetectedShell {
    if let Ok(path) = which::which("bash") {
        return DetectedShell {
            binary: path,
            args: vec!["-c".to_string()],
            name: "bash".into(),
        };
    }
    let comspec = env::var("ComSpec")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(r"C:\Windows\System32\cmd.exe"));
    DetectedShell {
        binary: comspec,
        args: vec!["/C".to_string()],
        name: "cmd".into(),
    }
}

#[cfg(not(windows))]
fn detect_platform_shell() -> DetectedShell {
    if let Ok(path) = which::which("bash") {
        return DetectedShell {
            binary: path,
            args: vec!["-c".to_string()],
            name: "bash".into(),
        };
    }

    if let Ok(shell) = env::var("SHELL") {
        let path = PathBuf::from(&shell);
        if path.exists() {
            let name = shell_name(&path);
            return DetectedShell {
                binary: path,
                args: vec!["-c".to_string()],
                name,
            };
        }
    }

    DetectedShell {
        binary: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string()],
        name: "sh".into(),
    }
}

#[derive(Debug, Deserialize)]
struct BashArgs {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

/// Run a shell command in the working directory.
#[derive(Debug)]
pub struct BashTool {
    shell: DetectedShell,
}

impl BashTool {
    #[must_use]
    pub fn new(shell: DetectedShell) -> Self {
        Self { shell }
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// stdout, then stderr under a `STDERR:` heading.
fn combine_output(stdout: &str, stderr: &str) -> String {
    let mut output = String::from(stdout);
    if !stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str("STDERR:\n");
        output.push_str(stderr);
    }
    output
}

impl Tool for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> &'static str {
        "Execute a shell command in the working directory and return its stdout and stderr. \
         Use it for builds, tests, git, and other terminal operations."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 120)"
                }
            },
            "required": ["command"]
        })
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let args: BashArgs = parse_args(input)?;
            let timeout_secs = args
                .timeout
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_TIMEOUT_SECS);

            let mut command = Command::new(&self.shell.binary);
            command
                .args(&self.shell.args)
                .arg(&args.command)
                .current_dir(&ctx.work_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            set_new_session(&mut command);

            let child = command
                .spawn()
                .map_err(|e| ToolError::failed("bash", format!("failed to start {}: {e}", self.shell)))?;
            let mut guard = ChildGuard::new(child);
            let Some(child) = guard.child_mut() else {
                return Err(ToolError::failed("bash", "child process unavailable"));
            };
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let stdout_task = tokio::spawn(async move {
                match stdout {
                    Some(s) => read_all(s).await,
                    None => String::new(),
                }
            });
            let stderr_task = tokio::spawn(async move {
                match stderr {
                    Some(s) => read_all(s).await,
                    None => String::new(),
                }
            });

            let limit = Duration::from_secs(timeout_secs);
            let status = tokio::select! {
                () = ctx.cancel.cancelled() => {
                    return Err(ToolError::Cancelled { tool: "bash".to_string() });
                }
                waited = time::timeout(limit, child.wait()) => match waited {
                    Ok(status) => status.map_err(|e| ToolError::failed("bash", e.to_string()))?,
                    Err(_) => {
                        tracing::debug!(command = %args.command, timeout_secs, "bash command timed out");
                        return Err(ToolError::Timeout {
                            tool: "command".to_string(),
                            elapsed: limit,
                        });
                    }
                },
            };
            guard.disarm();

            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            let output = truncate_output(
                combine_output(&stdout, &stderr),
                MAX_OUTPUT_CHARS,
                "\n... (output truncated)",
            );

            if !status.success() {
                let code = status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                if output.is_empty() {
                    return Err(ToolError::failed(
                        "bash",
                        format!("command failed: exit code {code}"),
                    ));
                }
                return Ok(format!("{output}\n(exit code: {code})"));
            }

            if output.is_empty() {
                return Ok("(no output)".to_string());
            }
            Ok(output)
        })
    }
}
