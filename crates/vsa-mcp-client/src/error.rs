use std::time::Duration;
use thiserror::Error;

/// Errors raised by a tool backend call.
///
/// Cloneable so that a single process failure can reject every pending
/// request that was waiting on it.
#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{backend} returned an error: {message}")]
    Application {
        backend: String,
        code: Option<i64>,
        message: String,
    },

    #[error("Request '{method}' timed out after {}ms", .timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("Request aborted: {0}")]
    Aborted(String),

    #[error("Stdio process error: {0}")]
    Process(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported tool: {0}")]
    UnsupportedTool(String),
}

impl BackendError {
    /// Short tag used when reporting the failure as a diagnostic.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Http { .. } | BackendError::Transport(_) => "transport",
            BackendError::Application { .. } => "application",
            BackendError::Timeout { .. } => "timeout",
            BackendError::Aborted(_) => "aborted",
            BackendError::Process(_) => "process",
            BackendError::Serialization(_) => "serialization",
            BackendError::UnsupportedTool(_) => "unsupported",
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return BackendError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        BackendError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Process(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_separates_transport_from_application() {
        let http = BackendError::Http {
            status: 502,
            message: "Bad Gateway".to_string(),
        };
        let app = BackendError::Application {
            backend: "aws-knowledge".to_string(),
            code: Some(-32602),
            message: "Invalid params".to_string(),
        };
        assert_eq!(http.kind(), "transport");
        assert_eq!(app.kind(), "application");
        assert_eq!(
            app.to_string(),
            "aws-knowledge returned an error: Invalid params"
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = BackendError::Timeout {
            method: "tools/call".to_string(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Request 'tools/call' timed out after 1500ms");
    }
}
