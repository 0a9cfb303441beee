//! System prompt assembly.

use std::env::consts::{ARCH, OS};
use std::fmt::Write as _;
use std::path::Path;

use chrono::Local;
use kiln_types::{Mode, ToolDefinition};

const BASE_PROMPT: &str = include_str!("prompts/default.md");

const WORKDIR_NOTE: &str = "The working directory is the root of the project you are helping the \
user with. Interpret every request in the context of this directory, default to operating inside \
it when using tools, and use relative paths when referring to files in the project.";

const PLAN_RULES: &str = "\
You are in PLAN mode. Analyze and reason about the codebase but do NOT modify it.
- Tools that modify files or run commands (write, edit, bash) are not available in this mode.
- Explore with the read-only tools (glob, grep, ls, view) BEFORE answering questions about the codebase. Do not rely on general knowledge alone.
- Reference the specific files, functions, and types you found. Avoid generic advice when project-specific guidance is possible.
- When asked how to do something, find existing examples in the codebase first and base the plan on them.
- When asked about changes, explain what you would change and where, with file paths and line numbers.
- If the user wants the changes made, remind them to switch to BUILD mode (ctrl+t).";

const BUILD_RULES: &str = "\
You are in BUILD mode. You can create and edit files and run commands.
- Use the available tools to implement changes.
- Be careful with destructive operations.
- Verify that your changes build and work when possible.";

/// Full system prompt for one run. `tools` is exactly what the model will be
/// offered, so plan mode never mentions permission-requiring tools.
#[must_use]
pub fn build_system_prompt(mode: Mode, work_dir: &Path, tools: &[ToolDefinition]) -> String {
    let date = Local::now().format("%a %b %-d %Y").to_string();
    render(mode, work_dir, tools, &date)
}

fn render(mode: Mode, work_dir: &Path, tools: &[ToolDefinition], date: &str) -> String {
    let mut prompt = String::with_capacity(BASE_PROMPT.len() + 2048);
    prompt.push_str(BASE_PROMPT.trim_end());
    prompt.push_str("\n\n");

    prompt.push_str("# Environment\n\n");
    let _ = writeln!(prompt, "- Working directory: {}", work_dir.display());
    let _ = writeln!(prompt, "- Platform: {OS}/{ARCH}");
    let _ = writeln!(prompt, "- Date: {date}");
    let _ = writeln!(prompt, "- Mode: {mode}");
    prompt.push('\n');
    prompt.push_str(WORKDIR_NOTE);
    prompt.push_str("\n\n");

    let _ = writeln!(prompt, "# Mode: {}\n", mode.label());
    prompt.push_str(match mode {
        Mode::Plan => PLAN_RULES,
        Mode::Build => BUILD_RULES,
    });
    prompt.push_str("\n\n");

    prompt.push_str("# Available Tools\n\n");
    for tool in tools {
        let _ = writeln!(prompt, "## {}\n{}\n", tool.name, tool.description);
    }
    prompt
}
