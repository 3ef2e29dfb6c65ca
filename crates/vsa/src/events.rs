//! Decoding of inbound control-channel frames.
//!
//! Each frame is one JSON object with a `type` discriminator. Frames are turned
//! into a [`ProtocolEvent`] for the audit trail and, when the type is one we act
//! on, into a typed [`RealtimeEvent`] that is dispatched to a
//! [`RealtimeEventHandler`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub const TRANSCRIPTION_DELTA: &str = "conversation.item.input_audio_transcription.delta";
pub const TRANSCRIPTION_COMPLETED: &str = "conversation.item.input_audio_transcription.completed";
pub const OUTPUT_TEXT_DELTA: &str = "response.output_text.delta";
pub const OUTPUT_TEXT_DONE: &str = "response.output_text.done";
pub const AUDIO_TRANSCRIPT_DELTA: &str = "response.audio_transcript.delta";
pub const AUDIO_TRANSCRIPT_DONE: &str = "response.audio_transcript.done";
pub const RESPONSE_COMPLETED: &str = "response.completed";
pub const RESPONSE_DONE: &str = "response.done";
pub const FUNCTION_CALL_ARGUMENTS_DELTA: &str = "response.function_call_arguments.delta";
pub const FUNCTION_CALL_ARGUMENTS_DONE: &str = "response.function_call_arguments.done";

// Bound for the last-resort call_id scan through unknown payload shapes.
const CALL_ID_SCAN_DEPTH: usize = 6;

/// One inbound frame, as observed.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// The text carried by a delta, in any of the shapes the service has used.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DeltaPayload {
    Text(String),
    Chunks(Vec<String>),
    Wrapped { text: WrappedText },
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WrappedText {
    Text(String),
    Chunks(Vec<String>),
}

impl DeltaPayload {
    pub fn into_text(self) -> String {
        match self {
            DeltaPayload::Text(text) | DeltaPayload::Wrapped { text: WrappedText::Text(text) } => {
                text
            }
            DeltaPayload::Chunks(chunks)
            | DeltaPayload::Wrapped {
                text: WrappedText::Chunks(chunks),
            } => chunks.concat(),
            DeltaPayload::Other(_) => String::new(),
        }
    }
}

/// A function call whose arguments have finished streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallDone {
    pub name: String,
    pub arguments: String,
    pub response_id: Option<String>,
    pub call_id: Option<String>,
}

/// The frames the engine acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    TranscriptionDelta { item_id: String, text: String },
    TranscriptionCompleted { item_id: String },
    ResponseTextDelta { response_id: String, text: String },
    ResponseTextDone { response_id: String },
    FunctionCallArgumentsDelta {
        key: String,
        response_id: Option<String>,
        text: String,
    },
    FunctionCallArgumentsDone(FunctionCallDone),
    Unknown,
}

/// Receives parsed frames. The parser never fails outward; problems are
/// reported through [`RealtimeEventHandler::on_diagnostic`].
pub trait RealtimeEventHandler {
    /// Every decoded frame, before any further handling.
    fn on_protocol_event(&mut self, event: &ProtocolEvent);
    fn on_user_delta(&mut self, item_id: &str, text: &str);
    fn on_user_done(&mut self, item_id: &str);
    fn on_assistant_delta(&mut self, response_id: &str, text: &str);
    fn on_assistant_done(&mut self, response_id: &str);
    fn on_function_call(&mut self, call: FunctionCallDone);
    fn on_diagnostic(&mut self, kind: &str, label: String);
}

#[derive(Deserialize)]
struct IdHolder {
    id: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionFrame {
    item_id: Option<String>,
    item: Option<IdHolder>,
    delta: Option<DeltaPayload>,
}

#[derive(Deserialize)]
struct ResponseFrame {
    response_id: Option<String>,
    response: Option<IdHolder>,
    delta: Option<DeltaPayload>,
}

#[derive(Deserialize)]
struct ArgumentsDeltaFrame {
    call_id: Option<String>,
    item_id: Option<String>,
    response_id: Option<String>,
    delta: Option<DeltaPayload>,
    arguments_delta: Option<DeltaPayload>,
}

impl RealtimeEvent {
    /// Decode a typed event from a frame's `type` and payload. Frames of a
    /// known type that lack the ids we key on decode as `Unknown`.
    pub fn decode(kind: &str, payload: &Value) -> RealtimeEvent {
        match kind {
            TRANSCRIPTION_DELTA | TRANSCRIPTION_COMPLETED => {
                let Ok(frame) = TranscriptionFrame::deserialize(payload) else {
                    return RealtimeEvent::Unknown;
                };
                let Some(item_id) = frame.item.and_then(|i| i.id).or(frame.item_id) else {
                    return RealtimeEvent::Unknown;
                };
                if kind == TRANSCRIPTION_DELTA {
                    RealtimeEvent::TranscriptionDelta {
                        item_id,
                        text: frame.delta.map(DeltaPayload::into_text).unwrap_or_default(),
                    }
                } else {
                    RealtimeEvent::TranscriptionCompleted { item_id }
                }
            }
            OUTPUT_TEXT_DELTA | AUDIO_TRANSCRIPT_DELTA | OUTPUT_TEXT_DONE
            | AUDIO_TRANSCRIPT_DONE | RESPONSE_COMPLETED | RESPONSE_DONE => {
                let Ok(frame) = ResponseFrame::deserialize(payload) else {
                    return RealtimeEvent::Unknown;
                };
                let Some(response_id) = frame.response.and_then(|r| r.id).or(frame.response_id)
                else {
                    return RealtimeEvent::Unknown;
                };
                if kind == OUTPUT_TEXT_DELTA || kind == AUDIO_TRANSCRIPT_DELTA {
                    RealtimeEvent::ResponseTextDelta {
                        response_id,
                        text: frame.delta.map(DeltaPayload::into_text).unwrap_or_default(),
                    }
                } else {
                    RealtimeEvent::ResponseTextDone { response_id }
                }
            }
            FUNCTION_CALL_ARGUMENTS_DELTA => {
                let Ok(frame) = ArgumentsDeltaFrame::deserialize(payload) else {
                    return RealtimeEvent::Unknown;
                };
                let response_id = frame.response_id.filter(|id| !id.is_empty());
                let Some(key) = frame.call_id.or(frame.item_id).or(response_id.clone()) else {
                    return RealtimeEvent::Unknown;
                };
                let text = frame
                    .delta
                    .or(frame.arguments_delta)
                    .map(DeltaPayload::into_text)
                    .unwrap_or_default();
                RealtimeEvent::FunctionCallArgumentsDelta {
                    key,
                    response_id,
                    text,
                }
            }
            FUNCTION_CALL_ARGUMENTS_DONE => {
                RealtimeEvent::FunctionCallArgumentsDone(FunctionCallDone {
                    name: function_call_name(payload).unwrap_or_default(),
                    arguments: payload
                        .get("arguments")
                        .or_else(|| function_call_content(payload).and_then(|c| c.get("arguments")))
                        .map(arguments_text)
                        .unwrap_or_default(),
                    response_id: str_at(payload, &["response", "id"])
                        .or_else(|| str_at(payload, &["response_id"])),
                    call_id: resolve_call_id(payload),
                })
            }
            _ => RealtimeEvent::Unknown,
        }
    }
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn arguments_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The first output item of the wrapping response, if any.
fn function_call_output(payload: &Value) -> Option<&Value> {
    payload.get("response")?.get("output")?.get(0)
}

/// The function-call content item nested in the response wrapper, if any.
fn function_call_content(payload: &Value) -> Option<&Value> {
    function_call_output(payload)?.get("content")?.get(0)
}

fn function_call_name(payload: &Value) -> Option<String> {
    str_at(payload, &["name"])
        .or_else(|| function_call_content(payload).and_then(|c| str_at(c, &["name"])))
        .or_else(|| function_call_output(payload).and_then(|o| str_at(o, &["name"])))
}

/// Resolve the correlation id of a finished function call.
///
/// Candidates are taken from the most specific location outward: the
/// function-call content item, then its output wrapper, then the top level.
/// Only when none of those carry one is the payload scanned, depth first and
/// bounded, for any `call_id`. Disagreeing candidates are logged.
pub fn resolve_call_id(payload: &Value) -> Option<String> {
    let candidates: Vec<String> = [
        function_call_content(payload).and_then(|c| str_at(c, &["call_id"])),
        function_call_output(payload).and_then(|o| str_at(o, &["call_id"])),
        str_at(payload, &["item", "call_id"]),
        str_at(payload, &["call_id"]),
    ]
    .into_iter()
    .flatten()
    .collect();

    if let Some(first) = candidates.first() {
        if candidates.iter().any(|c| c != first) {
            warn!(
                chosen = %first,
                candidates = ?candidates,
                "function call carries conflicting call_id values"
            );
        }
        return Some(first.clone());
    }

    scan_for_call_id(payload, CALL_ID_SCAN_DEPTH)
}

fn scan_for_call_id(value: &Value, depth: usize) -> Option<String> {
    if depth == 0 {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(id) = map.get("call_id").and_then(Value::as_str) {
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
            map.values().find_map(|v| scan_for_call_id(v, depth - 1))
        }
        Value::Array(items) => items.iter().find_map(|v| scan_for_call_id(v, depth - 1)),
        _ => None,
    }
}

/// Stateful frame parser. Owns the argument buffers of function calls that
/// are still streaming, keyed by call id (or item/response id when the
/// service omits it). Buffers are released when their call finishes or when
/// the response that carried them ends.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    arguments: HashMap<String, String>,
    /// Buffer keys opened under each response.
    owners: HashMap<String, HashSet<String>>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse<H: RealtimeEventHandler + ?Sized>(&mut self, raw: &str, handler: &mut H) {
        let payload: Value = match serde_json::from_str(raw) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "dropping undecodable frame");
                handler.on_diagnostic("parse_error", format!("Failed to parse event: {}", e));
                return;
            }
        };
        let Some(kind) = payload.get("type").and_then(Value::as_str).map(str::to_string) else {
            handler.on_diagnostic("parse_error", "Event without a type discriminator".to_string());
            return;
        };

        let event = ProtocolEvent {
            id: str_at(&payload, &["event_id"])
                .unwrap_or_else(|| format!("evt_{}", uuid::Uuid::new_v4().simple())),
            kind,
            payload,
            timestamp: Utc::now(),
        };
        handler.on_protocol_event(&event);

        match RealtimeEvent::decode(&event.kind, &event.payload) {
            RealtimeEvent::TranscriptionDelta { item_id, text } => {
                if !text.is_empty() {
                    handler.on_user_delta(&item_id, &text);
                }
            }
            RealtimeEvent::TranscriptionCompleted { item_id } => handler.on_user_done(&item_id),
            RealtimeEvent::ResponseTextDelta { response_id, text } => {
                if !text.is_empty() {
                    handler.on_assistant_delta(&response_id, &text);
                }
            }
            RealtimeEvent::ResponseTextDone { response_id } => {
                if event.kind == RESPONSE_DONE || event.kind == RESPONSE_COMPLETED {
                    self.release_response(&response_id);
                }
                handler.on_assistant_done(&response_id)
            }
            RealtimeEvent::FunctionCallArgumentsDelta {
                key,
                response_id,
                text,
            } => {
                if let Some(response_id) = response_id {
                    self.owners.entry(response_id).or_default().insert(key.clone());
                }
                self.arguments.entry(key).or_default().push_str(&text);
            }
            RealtimeEvent::FunctionCallArgumentsDone(mut call) => {
                let buffered = self.take_buffered(&event.payload, call.call_id.as_deref());
                if call.arguments.is_empty() {
                    call.arguments = buffered.unwrap_or_default();
                }
                if call.name.is_empty() {
                    handler.on_diagnostic(
                        "function_call_parse_error",
                        "Function call finished without a name".to_string(),
                    );
                    return;
                }
                handler.on_function_call(call);
            }
            RealtimeEvent::Unknown => {}
        }
    }

    fn take_buffered(&mut self, payload: &Value, call_id: Option<&str>) -> Option<String> {
        let keys = [
            call_id.map(str::to_string),
            str_at(payload, &["call_id"]),
            str_at(payload, &["item_id"]),
            str_at(payload, &["response_id"]),
            str_at(payload, &["response", "id"]),
        ];
        let mut found = None;
        for key in keys.into_iter().flatten() {
            if let Some(buffer) = self.arguments.remove(&key) {
                found.get_or_insert(buffer);
            }
            self.owners.retain(|_, owned| {
                owned.remove(&key);
                !owned.is_empty()
            });
        }
        found
    }

    /// Drop argument buffers of a response that ended without finishing
    /// their calls.
    fn release_response(&mut self, response_id: &str) {
        let mut keys = self.owners.remove(response_id).unwrap_or_default();
        keys.insert(response_id.to_string());
        for key in keys {
            if self.arguments.remove(&key).is_some() {
                debug!(key = %key, response_id, "dropping unfinished function call arguments");
            }
        }
    }

    /// Number of function calls whose arguments are still streaming.
    pub fn pending_arguments(&self) -> usize {
        self.arguments.len()
    }

    pub fn clear(&mut self) {
        self.arguments.clear();
        self.owners.clear();
    }
}
