//! Tavily search API, exposed through the same interface as the MCP backends.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ToolBackend, ToolSegment};
use crate::error::BackendError;

pub const DEFAULT_BASE_URL: &str = "https://api.tavily.com";

const SUMMARY_RESULTS: usize = 5;
const SNIPPET_MAX_CHARS: usize = 280;

pub struct TavilyBackend {
    name: String,
    base_url: String,
    api_key: String,
    client: HttpClient,
}

impl TavilyBackend {
    pub fn new<N: Into<String>, K: Into<String>>(name: N, api_key: K) -> Result<Self, BackendError> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            name: name.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn post(&self, endpoint: &str, arguments: Map<String, Value>) -> Result<Value, BackendError> {
        let mut body = Map::new();
        body.insert("api_key".to_string(), Value::String(self.api_key.clone()));
        body.extend(arguments);

        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let payload: Option<Value> = response.json().await.ok();
        if !status.is_success() {
            let message = payload
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| {
                    format!("Tavily API request failed with status {}.", status.as_u16())
                });
            return Err(BackendError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(payload.unwrap_or(Value::Null))
    }
}

fn endpoint_for(tool: &str) -> Option<&'static str> {
    match tool {
        "tavily_search" => Some("/search"),
        "tavily_extract" => Some("/extract"),
        "tavily_crawl" => Some("/crawl"),
        "tavily_map" => Some("/map"),
        _ => None,
    }
}

fn error_message(body: &Value) -> Option<String> {
    if let Some(message) = body.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Accept a list either as an array of strings or a comma separated string.
fn normalize_array(value: &Value) -> Option<Value> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect(),
        _ => return None,
    };
    Some(Value::Array(items))
}

fn coerce_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let parsed: f64 = s.trim().parse().ok()?;
            if parsed.fract() == 0.0 && parsed.abs() < i64::MAX as f64 {
                Some(Value::Number(Number::from(parsed as i64)))
            } else {
                Number::from_f64(parsed).map(Value::Number)
            }
        }
        _ => None,
    }
}

fn coerce_bool(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(Value::Bool(true)),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(Value::Bool(false)),
        _ => None,
    }
}

fn apply(args: &mut Map<String, Value>, fields: &[&str], coerce: fn(&Value) -> Option<Value>) {
    for field in fields {
        if let Some(coerced) = args.get(*field).and_then(coerce) {
            args.insert(field.to_string(), coerced);
        }
    }
}

/// Models often send numbers and flags as strings; fix up the fields the API is strict about.
fn sanitize_arguments(tool: &str, arguments: Value) -> Map<String, Value> {
    let mut args = match arguments {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    match tool {
        "tavily_search" => {
            apply(&mut args, &["include_domains", "exclude_domains"], normalize_array);
            apply(&mut args, &["max_results", "days"], coerce_number);
            apply(
                &mut args,
                &[
                    "include_images",
                    "include_image_descriptions",
                    "include_raw_content",
                    "include_favicon",
                ],
                coerce_bool,
            );
        }
        "tavily_extract" => {
            apply(&mut args, &["urls"], normalize_array);
            apply(&mut args, &["include_images", "include_favicon"], coerce_bool);
        }
        "tavily_crawl" | "tavily_map" => {
            apply(&mut args, &["max_depth", "max_breadth", "limit"], coerce_number);
            apply(
                &mut args,
                &["select_paths", "select_domains", "exclude_paths", "exclude_domains"],
                normalize_array,
            );
            apply(&mut args, &["allow_external"], coerce_bool);
        }
        _ => {}
    }
    args
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResult {
    title: Option<String>,
    url: Option<String>,
    content: Option<String>,
    snippet: Option<String>,
}

fn bound_snippet(snippet: &str) -> String {
    if snippet.chars().count() > SNIPPET_MAX_CHARS {
        let head: String = snippet.chars().take(SNIPPET_MAX_CHARS - 3).collect();
        format!("{}...", head)
    } else {
        snippet.to_string()
    }
}

fn search_summary(payload: &Value) -> Option<String> {
    let response: SearchResponse = serde_json::from_value(payload.clone()).ok()?;
    let mut lines = Vec::new();

    if let Some(answer) = response.answer.as_deref().map(str::trim) {
        if !answer.is_empty() {
            lines.push(format!("Answer: {}", answer));
        }
    }

    if !response.results.is_empty() {
        lines.push("Top results:".to_string());
        for result in response.results.iter().take(SUMMARY_RESULTS) {
            let title = result
                .title
                .as_deref()
                .or(result.url.as_deref())
                .unwrap_or("Result");
            let url = result
                .url
                .as_deref()
                .map(|u| format!(" ({})", u))
                .unwrap_or_default();
            let snippet = result
                .snippet
                .as_deref()
                .or(result.content.as_deref())
                .map(bound_snippet)
                .unwrap_or_default();
            if snippet.is_empty() {
                lines.push(format!("- {}{}", title, url));
            } else {
                lines.push(format!("- {}{}\n  {}", title, url, snippet));
            }
        }
    }

    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn build_segments(tool: &str, payload: &Value) -> Vec<ToolSegment> {
    let mut segments = Vec::new();
    if tool == "tavily_search" {
        if let Some(summary) = search_summary(payload) {
            segments.push(ToolSegment::text(summary));
        }
    }
    segments.push(ToolSegment::json(payload));
    segments
}

#[async_trait]
impl ToolBackend for TavilyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        tool: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<ToolSegment>, BackendError> {
        let endpoint =
            endpoint_for(tool).ok_or_else(|| BackendError::UnsupportedTool(tool.to_string()))?;
        let arguments = sanitize_arguments(tool, arguments);
        debug!(backend = %self.name, tool, endpoint, "calling Tavily");

        let payload = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BackendError::Aborted(format!("{} call cancelled", tool)));
            }
            payload = self.post(endpoint, arguments) => payload?,
        };
        Ok(build_segments(tool, &payload))
    }
}
