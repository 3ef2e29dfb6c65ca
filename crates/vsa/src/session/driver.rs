use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::negotiator::{LocalMedia, NegotiatedSession, Negotiator, PeerTransport};
use super::{
    ConnectionState, EventSink, SessionCommand, SessionError, SessionEvent, SessionHandle,
    SessionState,
};
use crate::canvas::CanvasCollaborator;
use crate::channel::{ControlChannel, ControlSender};
use crate::config::RealtimeSettings;
use crate::events::{EventStreamParser, FunctionCallDone, ProtocolEvent, RealtimeEventHandler};
use crate::tools::{
    summarize_result, truncate_with_marker, CompletedCall, FollowUpPolicy, ResultInjector,
    ToolCallRouter, ToolCompletion, ToolRegistry, EMPTY_SUMMARY,
};
use crate::transcript::{Speaker, TranscriptAssembler};

/// What a session needs beyond its transport.
#[derive(Clone)]
pub struct SessionRuntime {
    pub session_name: String,
    pub registry: Arc<ToolRegistry>,
    pub canvas: Arc<dyn CanvasCollaborator>,
    pub injector: ResultInjector,
    pub error_max_chars: usize,
}

impl SessionRuntime {
    /// Follow-ups are requested for every backend flagged informational.
    pub fn new(
        settings: &RealtimeSettings,
        registry: Arc<ToolRegistry>,
        canvas: Arc<dyn CanvasCollaborator>,
    ) -> Self {
        let policy = FollowUpPolicy::new(
            registry
                .routes()
                .iter()
                .filter(|route| route.informational)
                .map(|route| route.prefix.clone())
                .collect(),
        );
        Self {
            session_name: settings.session_name.clone(),
            registry,
            canvas,
            injector: ResultInjector::new(
                settings.tool_result_max_chars,
                settings.resume_excerpt_chars,
                policy,
            ),
            error_max_chars: settings.tool_error_max_chars,
        }
    }
}

/// The state of one live session. Owned by its driver task; nothing else
/// touches the buffers or the in-flight table.
pub struct RealtimeSession {
    id: String,
    runtime: SessionRuntime,
    events: EventSink,
    state: watch::Sender<SessionState>,
    channel: ControlSender,
    parser: EventStreamParser,
    transcripts: TranscriptAssembler,
    router: ToolCallRouter,
    transport: Option<Box<dyn PeerTransport>>,
    media: Option<Box<dyn LocalMedia>>,
}

struct Inputs {
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    inbound: mpsc::Receiver<String>,
    completions: mpsc::UnboundedReceiver<ToolCompletion>,
    connection: Option<watch::Receiver<ConnectionState>>,
}

impl RealtimeSession {
    /// Negotiate a transport and start driving the session.
    pub async fn start(
        negotiator: &Negotiator,
        runtime: SessionRuntime,
        events: EventSink,
    ) -> Result<SessionHandle, SessionError> {
        events.emit(SessionEvent::State {
            state: SessionState::Connecting,
        });
        let NegotiatedSession {
            transport,
            media,
            channel,
            connection,
        } = match negotiator.negotiate().await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                events.emit(SessionEvent::State {
                    state: SessionState::Closed,
                });
                return Err(e);
            }
        };
        Ok(Self::spawn(
            runtime,
            events,
            channel,
            Some(connection),
            Some(transport),
            Some(media),
        ))
    }

    /// Drive a session over a control channel that is already open. The
    /// connection watch is optional; without one only the channel closing or
    /// an explicit stop ends the session.
    pub fn attach(
        runtime: SessionRuntime,
        events: EventSink,
        channel: ControlChannel,
        connection: Option<watch::Receiver<ConnectionState>>,
    ) -> SessionHandle {
        Self::spawn(runtime, events, channel, connection, None, None)
    }

    fn spawn(
        runtime: SessionRuntime,
        events: EventSink,
        channel: ControlChannel,
        connection: Option<watch::Receiver<ConnectionState>>,
        transport: Option<Box<dyn PeerTransport>>,
        media: Option<Box<dyn LocalMedia>>,
    ) -> SessionHandle {
        let id = format!("{}-{}", runtime.session_name, uuid::Uuid::new_v4().simple());
        let (sender, inbound) = channel.into_parts();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SessionState::Connecting);

        // Canvas viewers read commands under the configured session name
        let router = ToolCallRouter::new(
            runtime.session_name.clone(),
            Arc::clone(&runtime.registry),
            Arc::clone(&runtime.canvas),
            completion_tx,
        );
        let session = RealtimeSession {
            id: id.clone(),
            runtime,
            events,
            state,
            channel: sender,
            parser: EventStreamParser::new(),
            transcripts: TranscriptAssembler::new(),
            router,
            transport,
            media,
        };
        tokio::spawn(session.run(Inputs {
            commands,
            inbound,
            completions,
            connection,
        }));

        SessionHandle {
            id,
            commands: command_tx,
            state: state_rx,
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
        self.events.emit(SessionEvent::State { state });
    }

    async fn run(mut self, mut inputs: Inputs) {
        info!(session = %self.id, "realtime session active");
        self.set_state(SessionState::Active);

        let reason = loop {
            tokio::select! {
                command = inputs.commands.recv() => match command {
                    Some(SessionCommand::CancelToolCall(call_id)) => {
                        if !self.router.cancel(&call_id) {
                            debug!(call_id = %call_id, "no in-flight tool call to cancel");
                        }
                    }
                    Some(SessionCommand::Stop) | None => break "stopped",
                },
                frame = inputs.inbound.recv() => match frame {
                    Some(raw) => self.handle_frame(&raw),
                    None => {
                        self.events.diagnostic(
                            "connection.state",
                            "Control channel closed by remote".to_string(),
                        );
                        break "control channel closed";
                    }
                },
                Some(completion) = inputs.completions.recv() => self.handle_completion(completion),
                state = next_connection_state(&mut inputs.connection) => {
                    let Some(state) = state else { continue };
                    self.events.emit(SessionEvent::Connection { state });
                    self.events.diagnostic("connection.state", format!("{:?}", state));
                    if state.is_fatal() {
                        break "connection lost";
                    }
                }
            }
        };

        self.teardown(reason).await;
        // Dropping the completion queue here discards results that arrive late.
        drop(inputs);
    }

    fn handle_frame(&mut self, raw: &str) {
        let mut dispatch = FrameDispatch {
            events: &self.events,
            transcripts: &mut self.transcripts,
            router: &mut self.router,
        };
        self.parser.parse(raw, &mut dispatch);
    }

    fn handle_completion(&mut self, completion: ToolCompletion) {
        let ToolCompletion { seq, outcome } = completion;
        let Some(CompletedCall {
            call,
            backend,
            heading,
            hook,
        }) = self.router.complete(seq, outcome.is_ok())
        else {
            debug!(seq, "completion for a call that is no longer tracked");
            return;
        };

        let mut diagram = None;
        let (content, is_error) = match outcome {
            Ok(segments) => {
                let (summary, decoded) = summarize_result(&segments, heading.as_deref(), hook);
                diagram = decoded;
                let summary = if summary.trim().is_empty() {
                    EMPTY_SUMMARY.to_string()
                } else {
                    summary
                };
                self.events.diagnostic(
                    &format!("{}.result", backend),
                    truncate_with_marker(&summary, 200),
                );
                (summary, false)
            }
            Err(e) => {
                self.events
                    .diagnostic(&format!("{}.error", backend), format!("[{}] {}", e.kind(), e));
                (
                    truncate_with_marker(&e.to_string(), self.runtime.error_max_chars),
                    true,
                )
            }
        };

        let call_id = call.call_id.as_deref();
        match self.runtime.injector.inject(
            &self.channel,
            &self.events,
            &call.name,
            call_id,
            &content,
            is_error,
        ) {
            Ok(_) => self.events.diagnostic(
                "tool.output",
                format!("{} -> {}", call.name, call_id.unwrap_or("system message")),
            ),
            Err(e) => warn!(tool = %call.name, error = %e, "tool result not delivered"),
        }

        if let Some(diagram) = diagram {
            self.router.place_diagram(diagram, &self.events);
        }
    }

    async fn teardown(&mut self, reason: &str) {
        info!(session = %self.id, reason, "stopping realtime session");
        for call in self.router.abandon_all() {
            self.events.diagnostic(
                "tool.abandoned",
                format!("{} ({})", call.name, call.call_id.as_deref().unwrap_or("no call_id")),
            );
        }
        self.transcripts.clear();
        self.parser.clear();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        self.set_state(SessionState::Closed);
    }
}

/// The next connection state change, or `None` once the transport stops
/// reporting. After that the branch never fires again.
async fn next_connection_state(
    connection: &mut Option<watch::Receiver<ConnectionState>>,
) -> Option<ConnectionState> {
    let Some(receiver) = connection.as_mut() else {
        return std::future::pending().await;
    };
    if receiver.changed().await.is_err() {
        *connection = None;
        return None;
    }
    let state = *receiver.borrow_and_update();
    Some(state)
}

struct FrameDispatch<'a> {
    events: &'a EventSink,
    transcripts: &'a mut TranscriptAssembler,
    router: &'a mut ToolCallRouter,
}

impl RealtimeEventHandler for FrameDispatch<'_> {
    fn on_protocol_event(&mut self, event: &ProtocolEvent) {
        self.events.emit(SessionEvent::Protocol {
            protocol: event.clone(),
        });
    }

    fn on_user_delta(&mut self, item_id: &str, text: &str) {
        self.transcripts
            .upsert(Speaker::User, item_id, Speaker::User, text);
    }

    fn on_user_done(&mut self, item_id: &str) {
        if let Some(line) = self.transcripts.finalize(Speaker::User, item_id) {
            self.events.emit(SessionEvent::Transcript { line });
        }
    }

    fn on_assistant_delta(&mut self, response_id: &str, text: &str) {
        self.transcripts
            .upsert(Speaker::Assistant, response_id, Speaker::Assistant, text);
    }

    fn on_assistant_done(&mut self, response_id: &str) {
        if let Some(line) = self.transcripts.finalize(Speaker::Assistant, response_id) {
            self.events.emit(SessionEvent::Transcript { line });
        }
    }

    fn on_function_call(&mut self, call: FunctionCallDone) {
        let dispatch = self.router.route(call, self.events);
        debug!(?dispatch, "routed function call");
    }

    fn on_diagnostic(&mut self, kind: &str, label: String) {
        self.events.diagnostic(kind, label);
    }
}
