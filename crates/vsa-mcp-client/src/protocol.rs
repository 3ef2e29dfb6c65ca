//! JSON-RPC 2.0 wire types shared by the HTTP and stdio backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::ToolSegment;
use crate::error::BackendError;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Fresh id for an outgoing request. Ids are never reused within a process.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: new_request_id(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    /// Servers echo ids as strings or numbers; both compare as strings.
    pub fn id_str(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Split the envelope into its result, turning an `error` member into an
    /// application error tagged with the backend name.
    pub fn into_result(self, backend: &str) -> Result<Value, BackendError> {
        if let Some(error) = self.error {
            let message = error
                .message
                .or_else(|| error.data.map(|d| d.to_string()))
                .unwrap_or_else(|| "unknown JSON-RPC error".to_string());
            return Err(BackendError::Application {
                backend: backend.to_string(),
                code: error.code,
                message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "vsa".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: serde_json::Map<String, Value>,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

impl InitializeParams {
    pub fn new(client_info: ClientInfo) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::Map::new(),
            client_info,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Map MCP content into result segments.
    ///
    /// A result flagged `isError` becomes an application error carrying its
    /// text content. Items without text (images, resources) are skipped.
    pub fn into_segments(self, backend: &str) -> Result<Vec<ToolSegment>, BackendError> {
        let segments: Vec<ToolSegment> = self
            .content
            .into_iter()
            .filter_map(|item| {
                let text = item.text?;
                Some(if item.kind == "text" {
                    ToolSegment::Text { text }
                } else {
                    ToolSegment::Json { text }
                })
            })
            .collect();

        if self.is_error {
            let message = segments
                .iter()
                .map(ToolSegment::as_text)
                .collect::<Vec<_>>()
                .join("\n");
            return Err(BackendError::Application {
                backend: backend.to_string(),
                code: None,
                message: if message.is_empty() {
                    "tool reported an error".to_string()
                } else {
                    message
                },
            });
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_order() {
        let request = JsonRpcRequest::new(METHOD_TOOLS_CALL, Some(json!({"name": "x"})));
        let line = serde_json::to_string(&request).unwrap();
        assert!(line.starts_with(r#"{"jsonrpc":"2.0","id":"req_"#));
        assert!(line.contains(r#""method":"tools/call""#));
    }

    #[test]
    fn test_notification_has_no_id() {
        let line = serde_json::to_string(&JsonRpcNotification::new(METHOD_INITIALIZED)).unwrap();
        assert_eq!(
            line,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#
        );
    }

    #[test]
    fn test_numeric_ids_compare_as_strings() {
        let response: JsonRpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 7, "result": {}})).unwrap();
        assert_eq!(response.id_str().as_deref(), Some("7"));
    }

    #[test]
    fn test_error_envelope_is_application_error() {
        let response: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "a",
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();

        match response.into_result("docs") {
            Err(BackendError::Application { code, message, .. }) => {
                assert_eq!(code, Some(-32601));
                assert_eq!(message, "Method not found");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_is_error_result_becomes_application_error() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "bad diagram code"}],
            "isError": true
        }))
        .unwrap();
        let err = result.into_segments("aws-diagram").unwrap_err();
        assert_eq!(err.kind(), "application");
        assert!(err.to_string().contains("bad diagram code"));
    }

    #[test]
    fn test_non_text_items_without_text_are_skipped() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "text", "text": "saved to /tmp/diagram.png"},
                {"type": "resource", "text": "{\"uri\":\"file:///tmp\"}"}
            ]
        }))
        .unwrap();
        let segments = result.into_segments("aws-diagram").unwrap();
        assert_eq!(
            segments,
            vec![
                ToolSegment::text("saved to /tmp/diagram.png"),
                ToolSegment::Json {
                    text: "{\"uri\":\"file:///tmp\"}".to_string()
                },
            ]
        );
    }
}
