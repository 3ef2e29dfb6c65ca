use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

/// One piece of a tool result.
///
/// `Json` carries the raw machine payload; `Text` a human-readable summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolSegment {
    Text { text: String },
    Json { text: String },
}

impl ToolSegment {
    pub fn text<S: Into<String>>(text: S) -> Self {
        ToolSegment::Text { text: text.into() }
    }

    pub fn json(value: &Value) -> Self {
        ToolSegment::Json {
            text: serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            ToolSegment::Text { text } | ToolSegment::Json { text } => text,
        }
    }
}

/// A uniform client for one family of tool backends.
///
/// Implementations must honour `cancel`: once it fires, the call resolves with
/// [`BackendError::Aborted`] and releases whatever resources it owns.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn call(
        &self,
        tool: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<ToolSegment>, BackendError>;
}
