use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::ToolNameMap;
use crate::backend::{ToolBackend, ToolSegment};
use crate::error::BackendError;
use crate::protocol::{CallToolResult, JsonRpcRequest, JsonRpcResponse, METHOD_TOOLS_CALL};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Remote tool backend speaking JSON-RPC 2.0 over a single HTTP POST per call.
///
/// Non-2xx responses and network failures surface as transport errors; an
/// `error` member in a 200 response surfaces as an application error.
pub struct HttpJsonRpcBackend {
    name: String,
    endpoint: Url,
    client: HttpClient,
    headers: Vec<(String, String)>,
    tool_names: ToolNameMap,
}

impl HttpJsonRpcBackend {
    pub fn new<S: Into<String>, E: Into<String>>(name: S, endpoint: E) -> Result<Self, BackendError> {
        let endpoint = endpoint.into();
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| BackendError::Transport(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let client = HttpClient::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            name: name.into(),
            endpoint,
            client,
            headers: Vec::new(),
            tool_names: ToolNameMap::default(),
        })
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_tool_names(mut self, tool_names: ToolNameMap) -> Self {
        self.tool_names = tool_names;
        self
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, BackendError> {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(request);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .ok()
                .filter(|body| !body.trim().is_empty())
                .unwrap_or_else(|| status.to_string());
            return Err(BackendError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let is_event_stream = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response.text().await?;
        let looks_like_events = {
            let head = body.trim_start();
            head.starts_with("event:") || head.starts_with("data:")
        };
        let payload = if is_event_stream || looks_like_events {
            last_event_data(&body).ok_or_else(|| {
                BackendError::Transport("event stream carried no data".to_string())
            })?
        } else {
            body
        };

        Ok(serde_json::from_str(&payload)?)
    }
}

/// Servers may answer a POST with a one-shot event stream; the response is the
/// last `data:` payload.
fn last_event_data(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .last()
        .map(str::to_string)
}

#[async_trait]
impl ToolBackend for HttpJsonRpcBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        tool: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<ToolSegment>, BackendError> {
        let remote_name = self.tool_names.resolve(tool);
        let request = JsonRpcRequest::new(
            METHOD_TOOLS_CALL,
            Some(json!({ "name": remote_name, "arguments": arguments })),
        );
        debug!(backend = %self.name, tool = %remote_name, id = %request.id, "calling remote tool");

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BackendError::Aborted(format!("{} call cancelled", remote_name)));
            }
            response = self.post(&request) => response?,
        };

        let result = response.into_result(&self.name)?;
        let result: CallToolResult = serde_json::from_value(result)?;
        result.into_segments(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_event_data() {
        let body = "event: message\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n\n";
        assert_eq!(last_event_data(body).as_deref(), Some("{\"b\":2}"));
        assert_eq!(last_event_data("event: ping\n\n"), None);
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let err = HttpJsonRpcBackend::new("aws-knowledge", "not a url").err().unwrap();
        assert_eq!(err.kind(), "transport");
    }
}
