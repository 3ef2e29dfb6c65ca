//! A realtime session: negotiation, the driver task that owns all per-session
//! state, and the handle callers use to control it.

mod driver;
pub mod negotiator;
pub mod signaling;

pub use driver::{RealtimeSession, SessionRuntime};
pub use negotiator::{
    CredentialIssuer, Credentials, IceGatheringState, LocalMedia, MediaSource, MediaTrack,
    NegotiatedSession, Negotiator, PeerTransport, SdpRelay, TransportFactory,
};
pub use signaling::{DirectSdpRelay, HttpCredentialIssuer, HttpSdpRelay, OpenAiSessionIssuer};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::events::ProtocolEvent;
use crate::transcript::TranscriptLine;

/// Failures that end a session, or prevent one from starting.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to obtain session credentials: {0}")]
    Credentials(String),
    #[error("Failed to acquire local media: {0}")]
    Media(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Signaling failed: {0}")]
    Signaling(String),
    #[error("Control channel is closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Closed,
}

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States the session does not recover from.
    pub fn is_fatal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Everything a session reports to its observer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    State {
        state: SessionState,
    },
    Connection {
        state: ConnectionState,
    },
    Protocol {
        protocol: ProtocolEvent,
    },
    Transcript {
        line: TranscriptLine,
    },
    /// A frame written to the control channel.
    Outbound {
        frame: String,
    },
    Diagnostic {
        kind: String,
        label: String,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn diagnostic_kind(&self) -> Option<&str> {
        match self {
            SessionEvent::Diagnostic { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// Where session events go. Sending never fails; events are dropped once the
/// observer has gone away.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn diagnostic(&self, kind: &str, label: String) {
        debug!(kind, label = %label, "session diagnostic");
        self.emit(SessionEvent::Diagnostic {
            kind: kind.to_string(),
            label,
            timestamp: Utc::now(),
        });
    }

    pub fn outbound(&self, frame: String) {
        self.emit(SessionEvent::Outbound { frame });
    }
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Stop,
    CancelToolCall(String),
}

/// Control handle for a running session. Cloneable; every clone talks to the
/// same driver task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Ask the driver to tear the session down and wait until it has.
    pub async fn stop(&self) {
        let _ = self.commands.send(SessionCommand::Stop);
        self.closed().await;
    }

    /// Wait until the session is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Cancel the in-flight tool call with this call id. The backend rejects
    /// with an abort error, which is injected like any other tool failure.
    /// Returns `false` once the session has stopped.
    pub fn cancel_tool_call(&self, call_id: &str) -> bool {
        self.commands
            .send(SessionCommand::CancelToolCall(call_id.to_string()))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fatal_connection_states() {
        assert!(ConnectionState::Failed.is_fatal());
        assert!(ConnectionState::Closed.is_fatal());
        assert!(!ConnectionState::Disconnected.is_fatal());
        assert!(!ConnectionState::Connected.is_fatal());
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::State {
            state: SessionState::Active,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "state", "state": "active"})
        );
        assert_eq!(event.diagnostic_kind(), None);
    }

    #[test]
    fn test_protocol_event_serialization() {
        let event = SessionEvent::Protocol {
            protocol: ProtocolEvent {
                id: "evt_1".to_string(),
                kind: "session.created".to_string(),
                payload: json!({"type": "session.created"}),
                timestamp: Utc::now(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "protocol");
        assert_eq!(value["protocol"]["type"], "session.created");
    }

    #[test]
    fn test_sink_outlives_observer() {
        let (events, rx) = EventSink::channel();
        drop(rx);
        events.diagnostic("parse_error", "ignored".to_string());
        events.outbound("{}".to_string());
    }
}
