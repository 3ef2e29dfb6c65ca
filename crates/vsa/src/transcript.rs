use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// A finished turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    pub id: String,
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug)]
struct TranscriptBuffer {
    role: Speaker,
    text: String,
}

/// Accumulates streamed text per turn until the turn is finalized.
///
/// User and assistant turns live in separate maps: the service scopes turn ids
/// per direction, so the same id may appear on both sides.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    user: HashMap<String, TranscriptBuffer>,
    assistant: HashMap<String, TranscriptBuffer>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers(&mut self, direction: Speaker) -> &mut HashMap<String, TranscriptBuffer> {
        match direction {
            Speaker::User => &mut self.user,
            Speaker::Assistant => &mut self.assistant,
        }
    }

    /// Append `chunk` to the buffer for `turn_id`, creating it with `role` if needed.
    pub fn upsert(&mut self, direction: Speaker, turn_id: &str, role: Speaker, chunk: &str) {
        self.buffers(direction)
            .entry(turn_id.to_string())
            .or_insert_with(|| TranscriptBuffer {
                role,
                text: String::new(),
            })
            .text
            .push_str(chunk);
    }

    /// Remove the buffer for `turn_id`, yielding a line if it held any text.
    pub fn finalize(&mut self, direction: Speaker, turn_id: &str) -> Option<TranscriptLine> {
        let buffer = self.buffers(direction).remove(turn_id)?;
        let text = buffer.text.trim();
        if text.is_empty() {
            return None;
        }
        Some(TranscriptLine {
            id: turn_id.to_string(),
            speaker: buffer.role,
            text: text.to_string(),
        })
    }

    pub fn open_turns(&self) -> usize {
        self.user.len() + self.assistant.len()
    }

    pub fn clear(&mut self) {
        self.user.clear();
        self.assistant.clear();
    }
}
