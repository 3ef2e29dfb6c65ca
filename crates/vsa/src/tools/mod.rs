mod diagram;
mod injector;
mod registry;
mod router;
mod summary;

pub use diagram::DiagramResult;
pub use injector::{
    truncate_with_marker, ConversationItem, FollowUpPolicy, OutboundMessage, ResultInjector,
    TRUNCATION_MARKER,
};
pub use registry::{BackendRoute, ToolRegistry, ToolTarget};
pub use router::{CompletedCall, Dispatch, ToolCallRouter, ToolCompletion};
pub use summary::{summarize_result, summarize_segments, EMPTY_SUMMARY};

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Invoking,
    Completed,
    Failed,
    Abandoned,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub seq: u64,
    pub call_id: Option<String>,
    pub name: String,
    pub arguments: Value,
    pub response_id: Option<String>,
    pub status: ToolCallStatus,
}

impl ToolCall {
    pub fn new(
        seq: u64,
        name: String,
        arguments: Value,
        call_id: Option<String>,
        response_id: Option<String>,
    ) -> Self {
        Self {
            seq,
            call_id,
            name,
            arguments,
            response_id,
            status: ToolCallStatus::Pending,
        }
    }

    pub fn begin_invoke(&mut self) {
        debug_assert_eq!(self.status, ToolCallStatus::Pending);
        self.status = ToolCallStatus::Invoking;
    }

    pub fn finish(&mut self, succeeded: bool) {
        debug_assert_eq!(self.status, ToolCallStatus::Invoking);
        self.status = if succeeded {
            ToolCallStatus::Completed
        } else {
            ToolCallStatus::Failed
        };
    }

    pub fn abandon(&mut self) {
        self.status = ToolCallStatus::Abandoned;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ToolCallStatus::Completed | ToolCallStatus::Failed | ToolCallStatus::Abandoned
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        let mut call = ToolCall::new(1, "tavily_search".into(), json!({}), Some("c1".into()), None);
        assert_eq!(call.status, ToolCallStatus::Pending);
        assert!(!call.is_terminal());

        call.begin_invoke();
        assert_eq!(call.status, ToolCallStatus::Invoking);

        call.finish(false);
        assert_eq!(call.status, ToolCallStatus::Failed);
        assert!(call.is_terminal());
    }
}
