//! Regex content search (`grep`).

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use globset::GlobMatcher;
use ignore::WalkBuilder;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::builtins::path_matcher;
use crate::{Tool, ToolCtx, ToolError, ToolFut, display_path, parse_args};

const MAX_RESULTS: usize = 100;
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Debug, Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    include: Option<String>,
}

#[derive(Debug, Default)]
pub struct GrepTool;

struct SearchPlan {
    regex: Regex,
    base: PathBuf,
    work_dir: PathBuf,
    include: Option<GlobMatcher>,
    cancel: CancellationToken,
}

fn looks_binary(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return true;
    };
    let mut head = [0u8; BINARY_SNIFF_BYTES];
    let n = file.read(&mut head).unwrap_or(0);
    head[..n].contains(&0)
}

fn candidate_files(plan: &SearchPlan) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkBuilder::new(&plan.base)
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter(|entry| {
            plan.include.as_ref().is_none_or(|include| {
                entry
                    .path()
                    .strip_prefix(&plan.base)
                    .is_ok_and(|rel| include.is_match(rel))
            })
        })
        .map(ignore::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// `rel:line: text` for every matching line, capped at `MAX_RESULTS`.
fn run_search(plan: &SearchPlan) -> String {
    let mut results = Vec::new();

    for path in candidate_files(plan) {
        if plan.cancel.is_cancelled() {
            break;
        }
        let too_big = fs::metadata(&path).map_or(true, |m| m.len() > MAX_FILE_BYTES);
        if too_big || looks_binary(&path) {
            continue;
        }
        let Ok(file) = File::open(&path) else {
            continue;
        };

        let rel = display_path(&plan.work_dir, &path);
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut line_no = 0usize;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            line_no += 1;
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if plan.regex.is_match(line) {
                results.push(format!("{rel}:{line_no}: {line}"));
                if results.len() >= MAX_RESULTS {
                    results.push(format!("\n(truncated at {MAX_RESULTS} results)"));
                    return results.join("\n");
                }
            }
        }
    }

    if results.is_empty() {
        "No matches found.".to_string()
    } else {
        results.join("\n")
    }
}

impl Tool for GrepTool {
    fn name(&self) -> &'static str {
        "grep"
    }

    fn description(&self) -> &'static str {
        "Search file contents with a regular expression. Returns matching lines \
         as path:line: text. Use include to restrict the file names searched."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in (default: working directory)"
                },
                "include": {
                    "type": "string",
                    "description": "File glob to include, e.g. \"*.rs\" or \"*.{ts,tsx}\""
                }
            },
            "required": ["pattern"]
        })
    }

    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let args: GrepArgs = parse_args(input)?;
            let regex = Regex::new(&args.pattern)
                .map_err(|e| ToolError::failed("grep", format!("invalid regex pattern: {e}")))?;
            let include = args
                .include
                .as_deref()
                .filter(|i| !i.is_empty())
                .map(|i| path_matcher(&format!("**/{i}")))
                .transpose()
                .map_err(|e| ToolError::failed("grep", format!("invalid include glob: {e}")))?;
            let base = match args.path.as_deref().filter(|p| !p.is_empty()) {
                Some(p) => ctx.resolve(p),
                None => ctx.work_dir.clone(),
            };

            let plan = SearchPlan {
                regex,
                base,
                work_dir: ctx.work_dir.clone(),
                include,
                cancel: ctx.cancel.clone(),
            };
            tokio::task::spawn_blocking(move || run_search(&plan))
                .await
                .map_err(|e| ToolError::failed("grep", e.to_string()))
        })
    }
}
