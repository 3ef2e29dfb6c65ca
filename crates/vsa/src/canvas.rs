//! Seam to the shared canvas. Canvas tool calls are translated into command
//! descriptors and handed over; rendering happens elsewhere.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

const MAX_COMMANDS_PER_SESSION: usize = 100;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("Canvas request failed: {0}")]
    Request(String),
    #[error("Canvas rejected commands: {status} - {message}")]
    Rejected { status: u16, message: String },
}

impl From<reqwest::Error> for CanvasError {
    fn from(err: reqwest::Error) -> Self {
        CanvasError::Request(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanvasCommandType {
    #[serde(rename = "mermaid.update")]
    MermaidUpdate,
    #[serde(rename = "excalidraw.initialize")]
    ExcalidrawInitialize,
    #[serde(rename = "excalidraw.patch")]
    ExcalidrawPatch,
    #[serde(rename = "note.append")]
    NoteAppend,
    #[serde(rename = "metadata.set")]
    MetadataSet,
}

impl CanvasCommandType {
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "canvas.update_mermaid" => Some(Self::MermaidUpdate),
            "canvas.initialize_excalidraw" => Some(Self::ExcalidrawInitialize),
            "canvas.patch_excalidraw" => Some(Self::ExcalidrawPatch),
            "canvas.append_note" => Some(Self::NoteAppend),
            "canvas.set_metadata" => Some(Self::MetadataSet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MermaidUpdate => "mermaid.update",
            Self::ExcalidrawInitialize => "excalidraw.initialize",
            Self::ExcalidrawPatch => "excalidraw.patch",
            Self::NoteAppend => "note.append",
            Self::MetadataSet => "metadata.set",
        }
    }
}

/// One canvas operation, as issued by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasCommand {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: CanvasCommandType,
    pub payload: Value,
    /// Milliseconds since the epoch.
    pub issued_at: i64,
    pub issued_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasCommandBatch {
    pub session_id: String,
    pub commands: Vec<CanvasCommand>,
}

/// What the canvas reports back after applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub accepted: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait CanvasCollaborator: Send + Sync {
    /// Translate a canvas tool call, or `None` if the name is not a canvas command.
    fn translate(&self, session_id: &str, name: &str, arguments: &Value) -> Option<CanvasCommand> {
        let kind = CanvasCommandType::from_tool_name(name)?;
        Some(CanvasCommand {
            id: format!("cmd_{}", uuid::Uuid::new_v4().simple()),
            session_id: session_id.to_string(),
            kind,
            payload: if arguments.is_null() {
                Value::Object(Default::default())
            } else {
                arguments.clone()
            },
            issued_at: Utc::now().timestamp_millis(),
            issued_by: "agent".to_string(),
        })
    }

    async fn apply(
        &self,
        session_id: &str,
        commands: Vec<CanvasCommand>,
    ) -> Result<SceneSnapshot, CanvasError>;
}

/// Posts command batches to the canvas service's event endpoint.
pub struct HttpCanvasClient {
    client: HttpClient,
    events_url: String,
}

impl HttpCanvasClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: HttpClient::new(),
            events_url: format!("{}/api/canvas/events", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl CanvasCollaborator for HttpCanvasClient {
    async fn apply(
        &self,
        session_id: &str,
        commands: Vec<CanvasCommand>,
    ) -> Result<SceneSnapshot, CanvasError> {
        let batch = CanvasCommandBatch {
            session_id: session_id.to_string(),
            commands,
        };
        let response = self.client.post(&self.events_url).json(&batch).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("message")?.as_str().map(str::to_string))
                .unwrap_or_else(|| "Failed to send canvas commands.".to_string());
            return Err(CanvasError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

/// Keeps the most recent commands per session in memory.
#[derive(Default)]
pub struct InMemoryCanvas {
    sessions: RwLock<HashMap<String, Vec<CanvasCommand>>>,
}

impl InMemoryCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn commands(&self, session_id: &str) -> Vec<CanvasCommand> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn reset(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}

#[async_trait]
impl CanvasCollaborator for InMemoryCanvas {
    async fn apply(
        &self,
        session_id: &str,
        commands: Vec<CanvasCommand>,
    ) -> Result<SceneSnapshot, CanvasError> {
        let accepted = commands.len();
        let mut sessions = self.sessions.write().await;
        let stored = sessions.entry(session_id.to_string()).or_default();
        stored.extend(commands);
        if stored.len() > MAX_COMMANDS_PER_SESSION {
            let excess = stored.len() - MAX_COMMANDS_PER_SESSION;
            stored.drain(..excess);
        }
        Ok(SceneSnapshot {
            accepted,
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_translate_known_and_unknown_commands() {
        let canvas = InMemoryCanvas::new();
        let command = canvas
            .translate("s1", "canvas.append_note", &json!({"text": "Use ALB"}))
            .unwrap();
        assert_eq!(command.kind, CanvasCommandType::NoteAppend);
        assert_eq!(command.session_id, "s1");
        assert_eq!(command.issued_by, "agent");
        assert!(command.id.starts_with("cmd_"));

        let wire = serde_json::to_value(&command).unwrap();
        assert_eq!(wire["type"], "note.append");
        assert_eq!(wire["sessionId"], "s1");
        assert_eq!(wire["payload"]["text"], "Use ALB");

        assert!(canvas.translate("s1", "canvas.erase_everything", &json!({})).is_none());
    }

    #[tokio::test]
    async fn test_in_memory_canvas_keeps_recent_commands() {
        let canvas = InMemoryCanvas::new();
        for i in 0..105 {
            let command = canvas
                .translate("s1", "canvas.set_metadata", &json!({"n": i}))
                .unwrap();
            canvas.apply("s1", vec![command]).await.unwrap();
        }
        let stored = canvas.commands("s1").await;
        assert_eq!(stored.len(), MAX_COMMANDS_PER_SESSION);
        assert_eq!(stored[0].payload["n"], 5);

        canvas.reset("s1").await;
        assert!(canvas.commands("s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_http_canvas_posts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/canvas/events"))
            .and(body_partial_json(json!({
                "sessionId": "s1",
                "commands": [{"type": "mermaid.update", "payload": {"definition": "graph TD; A-->B"}}]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"accepted": 1, "warnings": ["slow render"]})),
            )
            .mount(&server)
            .await;

        let canvas = HttpCanvasClient::new(&format!("{}/", server.uri()));
        let command = canvas
            .translate("s1", "canvas.update_mermaid", &json!({"definition": "graph TD; A-->B"}))
            .unwrap();
        let snapshot = canvas.apply("s1", vec![command]).await.unwrap();
        assert_eq!(
            snapshot,
            SceneSnapshot {
                accepted: 1,
                warnings: vec!["slow render".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_http_canvas_surfaces_rejection_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "bad patch"})))
            .mount(&server)
            .await;

        let canvas = HttpCanvasClient::new(&server.uri());
        let err = canvas.apply("s1", Vec::new()).await.unwrap_err();
        assert!(matches!(err, CanvasError::Rejected { status: 400, ref message } if message == "bad patch"));
    }
}
