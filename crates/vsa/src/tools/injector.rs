use serde::Serialize;
use tracing::debug;

use crate::channel::ControlSender;
use crate::session::{EventSink, SessionError};

pub const TRUNCATION_MARKER: &str = "…";

/// Cut `content` to at most `cap` characters, appending the marker when cut.
pub fn truncate_with_marker(content: &str, cap: usize) -> String {
    match content.char_indices().nth(cap) {
        Some((byte_index, _)) => format!("{}{}", &content[..byte_index], TRUNCATION_MARKER),
        None => content.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseRequest },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    FunctionCallOutput { call_id: String, output: String },
    Message { role: String, content: Vec<InputText> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputText {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRequest {
    pub modalities: Vec<&'static str>,
    pub instructions: String,
    pub metadata: ResumeMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeMetadata {
    pub resumed_after_tool: String,
}

/// Which tools get a follow-up asking the model to continue once their result
/// lands. Search and lookup results do not make the model resume on its own.
#[derive(Debug, Clone, Default)]
pub struct FollowUpPolicy {
    prefixes: Vec<String>,
}

impl FollowUpPolicy {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn wants_follow_up(&self, tool: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| tool.starts_with(prefix.as_str()))
    }
}

/// Writes tool results back into the conversation.
#[derive(Debug, Clone)]
pub struct ResultInjector {
    max_chars: usize,
    excerpt_chars: usize,
    policy: FollowUpPolicy,
}

impl ResultInjector {
    pub fn new(max_chars: usize, excerpt_chars: usize, policy: FollowUpPolicy) -> Self {
        Self {
            max_chars,
            excerpt_chars,
            policy,
        }
    }

    /// The messages to send for one result: the result itself, addressed to
    /// `call_id` when known or as a system message otherwise, then an optional
    /// follow-up.
    pub fn messages(
        &self,
        tool: &str,
        call_id: Option<&str>,
        content: &str,
        is_error: bool,
    ) -> Vec<OutboundMessage> {
        let output = truncate_with_marker(content, self.max_chars);
        let mut messages = Vec::with_capacity(2);

        messages.push(match call_id {
            Some(call_id) => OutboundMessage::ConversationItemCreate {
                item: ConversationItem::FunctionCallOutput {
                    call_id: call_id.to_string(),
                    output,
                },
            },
            None => OutboundMessage::ConversationItemCreate {
                item: ConversationItem::Message {
                    role: "system".to_string(),
                    content: vec![InputText {
                        kind: "input_text",
                        text: if is_error {
                            format!("Tool {} failed: {}", tool, output)
                        } else {
                            format!("Tool {} result:\n{}", tool, output)
                        },
                    }],
                },
            },
        });

        if self.policy.wants_follow_up(tool) {
            messages.push(self.follow_up(tool, content));
        }
        messages
    }

    fn follow_up(&self, tool: &str, content: &str) -> OutboundMessage {
        let excerpt: String = content.trim().chars().take(self.excerpt_chars).collect();
        let instructions = if excerpt.is_empty() {
            "Continue assisting the user using the latest tool results. Only pause if you need clarification.".to_string()
        } else {
            format!(
                "You just received new information from the tool {}: {}\nUse it to continue the task without waiting for the user unless clarification is needed.",
                tool, excerpt
            )
        };
        OutboundMessage::ResponseCreate {
            response: ResponseRequest {
                modalities: vec!["text", "audio"],
                instructions,
                metadata: ResumeMetadata {
                    resumed_after_tool: tool.to_string(),
                },
            },
        }
    }

    /// Serialize and send the messages for one result on `channel`.
    ///
    /// Returns how many messages were written. A closed channel drops the
    /// remaining messages and reports the drop as a diagnostic.
    pub fn inject(
        &self,
        channel: &ControlSender,
        events: &EventSink,
        tool: &str,
        call_id: Option<&str>,
        content: &str,
        is_error: bool,
    ) -> Result<usize, SessionError> {
        let mut sent = 0;
        for message in self.messages(tool, call_id, content, is_error) {
            let frame = serde_json::to_string(&message)
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            if let Err(e) = channel.send(frame.clone()) {
                events.diagnostic(
                    "tool.warning",
                    "Control channel closed; tool output not delivered.".to_string(),
                );
                return Err(e);
            }
            debug!(tool, call_id = ?call_id, "sent tool output");
            events.outbound(frame);
            sent += 1;
        }
        Ok(sent)
    }
}
