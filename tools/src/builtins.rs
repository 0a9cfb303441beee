//! Built-in file tools and default registration.

use std::io;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::fs;

use crate::fetch::FetchTool;
use crate::search::GrepTool;
use crate::shell::{BashTool, DetectedShell};
use crate::{Tool, ToolCtx, ToolError, ToolFut, ToolRegistry, parse_args};

const DEFAULT_VIEW_LIMIT: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

fn io_failed(tool: &str, action: &str, path: &Path, e: &io::Error) -> ToolError {
    ToolError::failed(tool, format!("{action} {}: {e}", path.display()))
}

// ============================================================================
// view
// ============================================================================

#[derive(Debug, Deserialize)]
struct ViewArgs {
    file_path: String,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Default)]
pub struct ViewTool;

/// Cut a line to `MAX_LINE_CHARS` characters.
fn clip_line(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_CHARS) {
        Some((cut, _)) => format!("{}... (truncated)", &line[..cut]),
        None => line.to_string(),
    }
}

/// `N: line` for lines `offset..offset+limit` (1-based).
fn number_lines(content: &str, offset: usize, limit: usize) -> String {
    let lines: Vec<String> = content
        .lines()
        .enumerate()
        .skip(offset - 1)
        .take(limit)
        .map(|(i, line)| format!("{}: {}", i + 1, clip_line(line)))
        .collect();

    if lines.is_empty() {
        "(empty file or offset beyond end of file)".to_string()
    } else {
        lines.join("\n")
    }
}

impl Tool for ViewTool {
    fn name(&self) -> &'static str {
        "view"
    }

    fn description(&self) -> &'static str {
        "Read a file and return its lines prefixed with line numbers. \
         Use offset and limit to page through large files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path of the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based line to start from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 2000)"
                }
            },
            "required": ["file_path"]
        })
    }

    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let args: ViewArgs = parse_args(input)?;
            let offset = args.offset.filter(|o| *o > 0).unwrap_or(1) as usize;
            let limit = args
                .limit
                .filter(|l| *l > 0)
                .map_or(DEFAULT_VIEW_LIMIT, |l| l as usize);

            let path = ctx.resolve(&args.file_path);
            let bytes = fs::read(&path)
                .await
                .map_err(|e| io_failed("view", "opening file", &path, &e))?;
            Ok(number_lines(&String::from_utf8_lossy(&bytes), offset, limit))
        })
    }
}

// ============================================================================
// write
// ============================================================================

#[derive(Debug, Deserialize)]
struct WriteArgs {
    file_path: String,
    content: String,
}

#[derive(Debug, Default)]
pub struct WriteTool;

impl Tool for WriteTool {
    fn name(&self) -> &'static str {
        "write"
    }

    fn description(&self) -> &'static str {
        "Write content to a file, creating it (and any missing parent directories) \
         or overwriting it if it already exists."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full content to write"
                }
            },
            "required": ["file_path", "content"]
        })
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let args: WriteArgs = parse_args(input)?;
            let path = ctx.resolve(&args.file_path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_failed("write", "creating directories", parent, &e))?;
            }
            fs::write(&path, args.content.as_bytes())
                .await
                .map_err(|e| io_failed("write", "writing file", &path, &e))?;
            Ok(format!(
                "Successfully wrote {} bytes to {}",
                args.content.len(),
                ctx.display(&path)
            ))
        })
    }
}

// ============================================================================
// edit
// ============================================================================

#[derive(Debug, Deserialize)]
struct EditArgs {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[derive(Debug, Default)]
pub struct EditTool;

/// Apply one exact-match replacement. `Ok(None)` means nothing changed.
fn apply_edit(content: &str, args: &EditArgs) -> Result<Option<String>, ToolError> {
    let count = if args.old_string.is_empty() {
        0
    } else {
        content.matches(&args.old_string).count()
    };
    if count == 0 {
        return Err(ToolError::failed(
            "edit",
            format!("oldString not found in {}", args.file_path),
        ));
    }
    if count > 1 && !args.replace_all {
        return Err(ToolError::failed(
            "edit",
            format!(
                "found {count} matches for oldString in {}. Use replace_all=true to replace all, \
                 or provide more context to make the match unique",
                args.file_path
            ),
        ));
    }

    let updated = if args.replace_all {
        content.replace(&args.old_string, &args.new_string)
    } else {
        content.replacen(&args.old_string, &args.new_string, 1)
    };
    Ok((updated != content).then_some(updated))
}

impl Tool for EditTool {
    fn name(&self) -> &'static str {
        "edit"
    }

    fn description(&self) -> &'static str {
        "Replace an exact string in a file. old_string must match exactly, including \
         whitespace and indentation, and must be unique unless replace_all is set."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path of the file to modify"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let args: EditArgs = parse_args(input)?;
            let path = ctx.resolve(&args.file_path);
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| io_failed("edit", "reading file", &path, &e))?;

            let Some(updated) = apply_edit(&content, &args)? else {
                return Ok("No changes made (old_string equals new_string).".to_string());
            };
            fs::write(&path, updated)
                .await
                .map_err(|e| io_failed("edit", "writing file", &path, &e))?;
            Ok(format!("Successfully edited {}", ctx.display(&path)))
        })
    }
}

// ============================================================================
// ls
// ============================================================================

#[derive(Debug, Deserialize)]
struct LsArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Default)]
pub struct LsTool;

impl Tool for LsTool {
    fn name(&self) -> &'static str {
        "ls"
    }

    fn description(&self) -> &'static str {
        "List a directory, one entry per line, with a trailing / on subdirectories."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: working directory)"
                }
            }
        })
    }

    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let args: LsArgs = parse_args(input)?;
            let dir = match args.path.as_deref().filter(|p| !p.is_empty()) {
                Some(p) => ctx.resolve(p),
                None => ctx.work_dir.clone(),
            };

            let mut reader = fs::read_dir(&dir)
                .await
                .map_err(|e| io_failed("ls", "reading directory", &dir, &e))?;
            let mut entries = Vec::new();
            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|e| io_failed("ls", "reading directory", &dir, &e))?
            {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                    name.push('/');
                }
                entries.push(name);
            }

            if entries.is_empty() {
                return Ok("(empty directory)".to_string());
            }
            entries.sort();
            Ok(entries.join("\n"))
        })
    }
}

// ============================================================================
// glob
// ============================================================================

#[derive(Debug, Deserialize)]
struct GlobArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Default)]
pub struct GlobTool;

/// `**`-aware matcher; `*` never crosses a path separator.
pub(crate) fn path_matcher(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
}

/// Files under `base` whose path relative to `base` matches.
fn glob_walk(base: &Path, matcher: &GlobMatcher) -> Vec<PathBuf> {
    let mut matches: Vec<PathBuf> = WalkBuilder::new(base)
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.depth() > 0)
        .filter(|entry| {
            entry
                .path()
                .strip_prefix(base)
                .is_ok_and(|rel| matcher.is_match(rel))
        })
        .map(ignore::DirEntry::into_path)
        .collect();
    matches.sort();
    matches
}

impl Tool for GlobTool {
    fn name(&self) -> &'static str {
        "glob"
    }

    fn description(&self) -> &'static str {
        "Find files by path pattern such as \"**/*.rs\" or \"src/**/*.{ts,tsx}\". \
         Returns matching paths sorted by name."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to match"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search from (default: working directory)"
                }
            },
            "required": ["pattern"]
        })
    }

    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let args: GlobArgs = parse_args(input)?;
            let matcher = path_matcher(&args.pattern)
                .map_err(|e| ToolError::failed("glob", format!("glob error: {e}")))?;
            let base = match args.path.as_deref().filter(|p| !p.is_empty()) {
                Some(p) => ctx.resolve(p),
                None => ctx.work_dir.clone(),
            };

            let matches = tokio::task::spawn_blocking(move || glob_walk(&base, &matcher))
                .await
                .map_err(|e| ToolError::failed("glob", e.to_string()))?;

            if matches.is_empty() {
                return Ok("No files matched the pattern.".to_string());
            }
            let lines: Vec<String> = matches.iter().map(|p| ctx.display(p)).collect();
            Ok(lines.join("\n"))
        })
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Register the built-in tools in their declaration order:
/// glob, grep, ls, view, bash, write, edit, fetch.
pub fn register_builtins(
    registry: &mut ToolRegistry,
    shell: DetectedShell,
) -> Result<(), ToolError> {
    registry.register(Box::new(GlobTool))?;
    registry.register(Box::new(GrepTool))?;
    registry.register(Box::new(LsTool))?;
    registry.register(Box::new(ViewTool))?;
    registry.register(Box::new(BashTool::new(shell)))?;
    registry.register(Box::new(WriteTool))?;
    registry.register(Box::new(EditTool))?;
    registry.register(Box::new(FetchTool::default()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect_shell;
    use std::fs as stdfs;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn ctx(dir: &TempDir) -> ToolCtx {
        ToolCtx::new(dir.path(), CancellationToken::new())
    }

    #[test]
    fn default_registration_order() {
        let mut registry = ToolRegistry::default();
        register_builtins(&mut registry, detect_shell(Some("/bin/sh"))).unwrap();
        let names: Vec<&str> = registry.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec!["glob", "grep", "ls", "view", "bash", "write", "edit", "fetch"]
        );
        let gated: Vec<&str> = registry
            .iter()
            .filter(|t| t.requires_permission())
            .map(|t| t.name())
            .collect();
        assert_eq!(gated, vec!["bash", "write", "edit"]);
    }

    #[test]
    fn number_lines_applies_offset_and_limit() {
        let content = "a\nb\nc\nd";
        assert_eq!(number_lines(content, 2, 2), "2: b\n3: c");
        assert_eq!(
            number_lines(content, 9, 10),
            "(empty file or offset beyond end of file)"
        );
        assert_eq!(
            number_lines("", 1, 10),
            "(empty file or offset beyond end of file)"
        );
    }

    #[test]
    fn long_lines_are_clipped() {
        let line = "x".repeat(MAX_LINE_CHARS + 5);
        let clipped = clip_line(&line);
        assert!(clipped.ends_with("... (truncated)"));
        assert_eq!(clipped.len(), MAX_LINE_CHARS + "... (truncated)".len());
    }

    #[tokio::test]
    async fn view_reads_relative_paths() {
        let dir = TempDir::new().unwrap();
        stdfs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let out = ViewTool
            .execute(r#"{"file_path": "a.txt"}"#, &ctx(&dir))
            .await
            .unwrap();
        assert_eq!(out, "1: one\n2: two");
    }

    #[tokio::test]
    async fn view_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = ViewTool
            .execute(r#"{"file_path": "nope.txt"}"#, &ctx(&dir))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("opening file"));
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let out = WriteTool
            .execute(
                r#"{"file_path": "deep/nested/f.txt", "content": "hello"}"#,
                &ctx(&dir),
            )
            .await
            .unwrap();
        assert_eq!(out, "Successfully wrote 5 bytes to deep/nested/f.txt");
        assert_eq!(
            stdfs::read_to_string(dir.path().join("deep/nested/f.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn edit_replaces_unique_match() {
        let dir = TempDir::new().unwrap();
        stdfs::write(dir.path().join("f.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        let out = EditTool
            .execute(
                r#"{"file_path": "f.rs", "old_string": "fn b", "new_string": "fn c"}"#,
                &ctx(&dir),
            )
            .await
            .unwrap();
        assert_eq!(out, "Successfully edited f.rs");
        assert_eq!(
            stdfs::read_to_string(dir.path().join("f.rs")).unwrap(),
            "fn a() {}\nfn c() {}\n"
        );
    }

    #[test]
    fn edit_rejects_ambiguous_and_missing_matches() {
        let args = |old: &str, all: bool| EditArgs {
            file_path: "f.rs".into(),
            old_string: old.into(),
            new_string: "z".into(),
            replace_all: all,
        };
        let err = apply_edit("x x", &args("x", false)).unwrap_err();
        assert!(err.to_string().starts_with("found 2 matches for oldString in f.rs"));
        assert_eq!(apply_edit("x x", &args("x", true)).unwrap().unwrap(), "z z");
        assert_eq!(
            apply_edit("abc", &args("q", false)).unwrap_err().to_string(),
            "oldString not found in f.rs"
        );
    }

    #[test]
    fn edit_with_identical_strings_changes_nothing() {
        let args = EditArgs {
            file_path: "f".into(),
            old_string: "a".into(),
            new_string: "a".into(),
            replace_all: false,
        };
        assert!(apply_edit("abc", &args).unwrap().is_none());
    }

    #[tokio::test]
    async fn ls_marks_directories_and_sorts() {
        let dir = TempDir::new().unwrap();
        stdfs::create_dir(dir.path().join("src")).unwrap();
        stdfs::write(dir.path().join("b.txt"), "").unwrap();
        stdfs::write(dir.path().join("a.txt"), "").unwrap();
        let out = LsTool.execute("{}", &ctx(&dir)).await.unwrap();
        assert_eq!(out, "a.txt\nb.txt\nsrc/");

        stdfs::create_dir(dir.path().join("empty")).unwrap();
        let out = LsTool
            .execute(r#"{"path": "empty"}"#, &ctx(&dir))
            .await
            .unwrap();
        assert_eq!(out, "(empty directory)");
    }

    #[tokio::test]
    async fn glob_matches_recursively_with_relative_output() {
        let dir = TempDir::new().unwrap();
        stdfs::create_dir_all(dir.path().join("src/nested")).unwrap();
        stdfs::write(dir.path().join("src/lib.rs"), "").unwrap();
        stdfs::write(dir.path().join("src/nested/mod.rs"), "").unwrap();
        stdfs::write(dir.path().join("README.md"), "").unwrap();

        let out = GlobTool
            .execute(r#"{"pattern": "**/*.rs"}"#, &ctx(&dir))
            .await
            .unwrap();
        assert_eq!(out, "src/lib.rs\nsrc/nested/mod.rs");

        let out = GlobTool
            .execute(r#"{"pattern": "*.rs"}"#, &ctx(&dir))
            .await
            .unwrap();
        assert_eq!(out, "No files matched the pattern.");
    }
}
