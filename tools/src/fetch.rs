//! HTTP GET (`fetch`).

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::{Tool, ToolCtx, ToolError, ToolFut, parse_args};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct FetchArgs {
    url: String,
    #[serde(default)]
    timeout: Option<u64>,
}

/// Fetch a URL and return the response body as text.
#[derive(Debug, Default)]
pub struct FetchTool {
    client: Client,
}

/// Bare hosts get `https://`; anything else must parse as an http(s) URL.
fn normalize_url(raw: &str) -> Result<Url, ToolError> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    Url::parse(&candidate).map_err(|e| ToolError::failed("fetch", format!("invalid URL: {e}")))
}

fn status_error(status: StatusCode) -> ToolError {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    ToolError::failed("fetch", format!("HTTP {}: {reason}", status.as_u16()))
}

impl FetchTool {
    async fn fetch(&self, url: Url, limit: Duration) -> Result<String, ToolError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(limit)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout {
                        tool: "fetch".to_string(),
                        elapsed: limit,
                    }
                } else {
                    ToolError::failed("fetch", format!("request failed: {e}"))
                }
            })?;

        if response.status() != StatusCode::OK {
            return Err(status_error(response.status()));
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| ToolError::failed("fetch", format!("reading response: {e}")))?;
            let room = MAX_BODY_BYTES - body.len();
            if chunk.len() >= room {
                body.extend_from_slice(&chunk[..room]);
                tracing::debug!(bytes = MAX_BODY_BYTES, "fetch body capped");
                break;
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Ok("(empty response)".to_string());
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

impl Tool for FetchTool {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn description(&self) -> &'static str {
        "Fetch the contents of a URL with an HTTP GET request and return the response body."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30)"
                }
            },
            "required": ["url"]
        })
    }

    fn execute<'a>(&'a self, input: &'a str, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let args: FetchArgs = parse_args(input)?;
            let url = normalize_url(&args.url)?;
            let limit = Duration::from_secs(
                args.timeout
                    .filter(|t| *t > 0)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            );

            tokio::select! {
                () = ctx.cancel.cancelled() => Err(ToolError::Cancelled { tool: "fetch".to_string() }),
                result = self.fetch(url, limit) => result,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> ToolCtx {
        ToolCtx::new("/", CancellationToken::new())
    }

    #[test]
    fn bare_hosts_default_to_https() {
        assert_eq!(
            normalize_url("example.com/docs").unwrap().as_str(),
            "https://example.com/docs"
        );
        assert_eq!(
            normalize_url("http://example.com").unwrap().scheme(),
            "http"
        );
    }

    #[tokio::test]
    async fn returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let input = json!({"url": format!("{}/page", server.uri())}).to_string();
        let out = FetchTool::default().execute(&input, &ctx()).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let input = json!({"url": server.uri()}).to_string();
        let err = FetchTool::default()
            .execute(&input, &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP 404: Not Found");
    }

    #[tokio::test]
    async fn empty_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let input = json!({"url": server.uri()}).to_string();
        let out = FetchTool::default().execute(&input, &ctx()).await.unwrap();
        assert_eq!(out, "(empty response)");
    }

    #[tokio::test]
    async fn large_bodies_are_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a".repeat(MAX_BODY_BYTES + 10)))
            .mount(&server)
            .await;

        let input = json!({"url": server.uri()}).to_string();
        let out = FetchTool::default().execute(&input, &ctx()).await.unwrap();
        assert_eq!(out.len(), MAX_BODY_BYTES);
    }
}
