//! Perplexity search API, exposed through the same interface as the MCP backends.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ToolBackend, ToolSegment};
use crate::error::BackendError;

pub const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";

const SEARCH_TOOL: &str = "perplexity_search";
const SEARCH_MODES: [&str; 3] = ["web", "academic", "sec"];

pub struct PerplexityBackend {
    name: String,
    base_url: String,
    api_key: String,
    client: HttpClient,
}

impl PerplexityBackend {
    pub fn new<N: Into<String>, K: Into<String>>(name: N, api_key: K) -> Result<Self, BackendError> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(45))
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

    fn invalid(&self, message: impl Into<String>) -> BackendError {
        BackendError::Application {
            backend: self.name.clone(),
            code: None,
            message: message.into(),
        }
    }

    /// Validate the model's arguments into a search request body.
    fn search_request(&self, arguments: &Value) -> Result<Map<String, Value>, BackendError> {
        let args = arguments.as_object().cloned().unwrap_or_default();
        let mut body = Map::new();

        let queries = match args.get("query") {
            None | Some(Value::Null) => {
                return Err(self.invalid("query is required for perplexity_search."))
            }
            Some(Value::String(q)) => vec![q.trim().to_string()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .map(str::to_string)
                .collect(),
            Some(_) => return Err(self.invalid("query must be a string or an array of strings.")),
        };
        let queries: Vec<String> = queries.into_iter().filter(|q| !q.is_empty()).collect();
        match queries.as_slice() {
            [] => return Err(self.invalid("query must not be empty.")),
            [single] => body.insert("query".to_string(), json!(single)),
            _ => body.insert("query".to_string(), json!(queries)),
        };

        for field in ["max_results", "max_tokens", "max_tokens_per_page"] {
            let Some(value) = args.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|n| n.is_finite())
            .ok_or_else(|| self.invalid(format!("{} must be a number.", field)))?;
            body.insert(field.to_string(), json!(number as i64));
        }

        if let Some(country) = args.get("country").filter(|v| !v.is_null()) {
            match country.as_str().map(str::trim) {
                Some(code) if code.chars().count() == 2 => {
                    body.insert("country".to_string(), json!(code.to_uppercase()));
                }
                _ => return Err(self.invalid("country must be a 2-letter ISO code.")),
            }
        }

        if let Some(mode) = args.get("search_mode").filter(|v| !v.is_null()) {
            match mode.as_str() {
                Some(mode) if SEARCH_MODES.contains(&mode) => {
                    body.insert("search_mode".to_string(), json!(mode));
                }
                _ => {
                    return Err(self.invalid("search_mode must be one of web, academic, or sec."))
                }
            }
        }

        Ok(body)
    }

    async fn search(&self, body: Map<String, Value>) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let payload: Option<Value> = response.json().await.ok();
        if !status.is_success() {
            let message = payload
                .as_ref()
                .and_then(|body| {
                    body.get("error")
                        .and_then(|e| e.get("message"))
                        .or_else(|| body.get("message"))
                        .and_then(Value::as_str)
                })
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!("Perplexity search request failed with status {}.", status.as_u16())
                });
            return Err(BackendError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(payload.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    date: Option<String>,
}

/// One text segment per result, numbered, then the raw response.
fn build_segments(payload: &Value) -> Vec<ToolSegment> {
    let results: Vec<SearchResult> = payload
        .get("results")
        .cloned()
        .and_then(|r| serde_json::from_value(r).ok())
        .unwrap_or_default();

    let mut segments: Vec<ToolSegment> = results
        .iter()
        .enumerate()
        .map(|(index, result)| {
            let mut text = format!("{}. {}", index + 1, result.title);
            if let Some(date) = result.date.as_deref().filter(|d| !d.is_empty()) {
                text.push_str(&format!(" ({})", date));
            }
            if !result.url.is_empty() {
                text.push_str(&format!(" - {}", result.url));
            }
            if !result.snippet.is_empty() {
                text.push('\n');
                text.push_str(&result.snippet);
            }
            ToolSegment::text(text)
        })
        .collect();
    segments.push(ToolSegment::json(payload));
    segments
}

#[async_trait]
impl ToolBackend for PerplexityBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        tool: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<ToolSegment>, BackendError> {
        if tool != SEARCH_TOOL {
            return Err(BackendError::UnsupportedTool(tool.to_string()));
        }
        let body = self.search_request(&arguments)?;
        debug!(backend = %self.name, tool, "calling Perplexity search");

        let payload = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BackendError::Aborted(format!("{} call cancelled", tool)));
            }
            payload = self.search(body) => payload?,
        };
        Ok(build_segments(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> PerplexityBackend {
        PerplexityBackend::new("perplexity", "pplx-test").unwrap()
    }

    #[test]
    fn test_search_request_coerces_fields() {
        let body = backend()
            .search_request(&json!({
                "query": ["  rust async ", "", "tokio"],
                "max_results": "5",
                "max_tokens_per_page": 1024,
                "country": "us",
                "search_mode": "academic"
            }))
            .unwrap();
        assert_eq!(body["query"], json!(["rust async", "tokio"]));
        assert_eq!(body["max_results"], json!(5));
        assert_eq!(body["max_tokens_per_page"], json!(1024));
        assert_eq!(body["country"], "US");
        assert_eq!(body["search_mode"], "academic");
    }

    #[test]
    fn test_single_query_is_sent_as_string() {
        let body = backend().search_request(&json!({"query": [" one "]})).unwrap();
        assert_eq!(body["query"], "one");
    }

    #[test]
    fn test_invalid_requests_are_rejected() {
        let backend = backend();
        for args in [
            json!({}),
            json!({"query": "  "}),
            json!({"query": 7}),
            json!({"query": "q", "max_results": "many"}),
            json!({"query": "q", "country": "USA"}),
            json!({"query": "q", "search_mode": "news"}),
        ] {
            let err = backend.search_request(&args).unwrap_err();
            assert_eq!(err.kind(), "application", "{}", args);
        }
    }

    #[test]
    fn test_segments_list_results_then_raw() {
        let payload = json!({
            "results": [
                {"title": "Tokio", "url": "https://tokio.rs", "snippet": "An async runtime", "date": "2024-01-02"},
                {"title": "Bare"}
            ]
        });
        let segments = build_segments(&payload);
        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments[0].as_text(),
            "1. Tokio (2024-01-02) - https://tokio.rs\nAn async runtime"
        );
        assert_eq!(segments[1].as_text(), "2. Bare");
        assert!(matches!(segments[2], ToolSegment::Json { .. }));
    }
}
