use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vsa_mcp_client::{BackendError, ToolSegment};

use super::diagram::DiagramResult;
use super::registry::{ToolRegistry, ToolTarget};
use super::{ToolCall, ToolCallStatus};
use crate::canvas::{CanvasCollaborator, CanvasCommand};
use crate::config::ResultHook;
use crate::events::FunctionCallDone;
use crate::session::EventSink;

/// A backend call that has finished, posted back to the session task.
#[derive(Debug)]
pub struct ToolCompletion {
    pub seq: u64,
    pub outcome: Result<Vec<ToolSegment>, BackendError>,
}

/// What the router did with a finished function call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Canvas,
    Invoking(u64),
    ArgumentError,
    Unsupported,
}

struct InFlight {
    call: ToolCall,
    backend: String,
    heading: Option<String>,
    hook: Option<ResultHook>,
    cancel: CancellationToken,
}

/// A finished call together with what the injector needs to report it.
#[derive(Debug)]
pub struct CompletedCall {
    pub call: ToolCall,
    pub backend: String,
    pub heading: Option<String>,
    pub hook: Option<ResultHook>,
}

/// Classifies finished function calls and dispatches them.
///
/// Backend calls run on their own tasks and report back through the
/// completion queue, so any number may be in flight and they may finish in
/// any order. The router only tracks them; it never blocks on one.
pub struct ToolCallRouter {
    session_id: String,
    registry: Arc<ToolRegistry>,
    canvas: Arc<dyn CanvasCollaborator>,
    completions: mpsc::UnboundedSender<ToolCompletion>,
    in_flight: HashMap<u64, InFlight>,
    next_seq: u64,
    shutdown: CancellationToken,
}

impl ToolCallRouter {
    pub fn new(
        session_id: String,
        registry: Arc<ToolRegistry>,
        canvas: Arc<dyn CanvasCollaborator>,
        completions: mpsc::UnboundedSender<ToolCompletion>,
    ) -> Self {
        Self {
            session_id,
            registry,
            canvas,
            completions,
            in_flight: HashMap::new(),
            next_seq: 0,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn route(&mut self, done: FunctionCallDone, events: &EventSink) -> Dispatch {
        let arguments = if done.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str::<Value>(&done.arguments) {
                Ok(arguments) => arguments,
                Err(e) => {
                    events.diagnostic(
                        "function_call_parse_error",
                        format!("Invalid arguments for {}: {}", done.name, e),
                    );
                    return Dispatch::ArgumentError;
                }
            }
        };

        self.next_seq += 1;
        let mut call = ToolCall::new(
            self.next_seq,
            done.name,
            arguments,
            done.call_id,
            done.response_id,
        );

        match self.registry.classify(&call.name) {
            ToolTarget::Internal => {
                self.apply_canvas(&call, events);
                Dispatch::Canvas
            }
            ToolTarget::Backend(route) => {
                if call.call_id.is_none() {
                    events.diagnostic(
                        &format!("{}.warning", route.name),
                        "Missing call_id for external tool invocation; falling back to system memo."
                            .to_string(),
                    );
                }
                call.arguments = route.enrich(std::mem::take(&mut call.arguments));
                call.begin_invoke();
                events.diagnostic(
                    &format!("{}.request", route.name),
                    format!("{} {}", call.name, call.arguments),
                );

                let seq = call.seq;
                let cancel = self.shutdown.child_token();
                let backend = Arc::clone(&route.backend);
                let tool = call.name.clone();
                let arguments = call.arguments.clone();
                let completions = self.completions.clone();
                let token = cancel.clone();
                tokio::spawn(async move {
                    let outcome = backend.call(&tool, arguments, token).await;
                    // The session may be gone; the result is then discarded.
                    let _ = completions.send(ToolCompletion { seq, outcome });
                });

                self.in_flight.insert(
                    seq,
                    InFlight {
                        backend: route.name.clone(),
                        heading: route.heading_for(&call.name),
                        hook: route.result_hook,
                        cancel,
                        call,
                    },
                );
                Dispatch::Invoking(seq)
            }
            ToolTarget::Unsupported => {
                events.diagnostic(
                    "unsupported_tool",
                    format!("No handler registered for tool {}", call.name),
                );
                Dispatch::Unsupported
            }
        }
    }

    fn apply_canvas(&self, call: &ToolCall, events: &EventSink) {
        let Some(command) = self
            .canvas
            .translate(&self.session_id, &call.name, &call.arguments)
        else {
            events.diagnostic(
                "unsupported_tool",
                format!("Unknown canvas command {}", call.name),
            );
            return;
        };

        report_command(&command, events);
        let canvas = Arc::clone(&self.canvas);
        let session_id = self.session_id.clone();
        let events = events.clone();
        tokio::spawn(async move {
            apply_on_canvas(canvas.as_ref(), &session_id, command, &events).await;
        });
    }

    /// Put a rendered diagram on the canvas. Reading the image and applying
    /// the patch happen on their own task.
    pub fn place_diagram(&self, diagram: DiagramResult, events: &EventSink) {
        let canvas = Arc::clone(&self.canvas);
        let session_id = self.session_id.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match diagram.canvas_command(&session_id).await {
                Ok(Some(command)) => {
                    report_command(&command, &events);
                    apply_on_canvas(canvas.as_ref(), &session_id, command, &events).await
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = ?diagram.path, error = %e, "unable to read generated diagram");
                    events.diagnostic(
                        "canvas.warning",
                        format!("Unable to read generated diagram: {}", e),
                    );
                }
            }
        });
    }

    /// Take a finished call out of the in-flight table. Returns `None` for a
    /// sequence number that is not in flight, so each call completes once.
    pub fn complete(&mut self, seq: u64, succeeded: bool) -> Option<CompletedCall> {
        let InFlight {
            mut call,
            backend,
            heading,
            hook,
            ..
        } = self.in_flight.remove(&seq)?;
        call.finish(succeeded);
        Some(CompletedCall {
            call,
            backend,
            heading,
            hook,
        })
    }

    /// Fire the cancellation token of the in-flight call with this call id.
    pub fn cancel(&self, call_id: &str) -> bool {
        let Some(entry) = self
            .in_flight
            .values()
            .find(|entry| entry.call.call_id.as_deref() == Some(call_id))
        else {
            return false;
        };
        info!(call_id, tool = %entry.call.name, "cancelling tool call");
        entry.cancel.cancel();
        true
    }

    /// Forget every in-flight call. Backend tasks keep running; their results
    /// have nowhere to go once the completion queue is dropped.
    pub fn abandon_all(&mut self) -> Vec<ToolCall> {
        self.in_flight
            .drain()
            .map(|(_, mut entry)| {
                debug!(tool = %entry.call.name, seq = entry.call.seq, "abandoning tool call");
                entry.call.abandon();
                entry.call
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn status(&self, seq: u64) -> Option<ToolCallStatus> {
        self.in_flight.get(&seq).map(|entry| entry.call.status)
    }
}

fn report_command(command: &CanvasCommand, events: &EventSink) {
    events.diagnostic(
        "canvas.command",
        format!("{} {}", command.kind.as_str(), command.id),
    );
}

async fn apply_on_canvas(
    canvas: &dyn CanvasCollaborator,
    session_id: &str,
    command: CanvasCommand,
    events: &EventSink,
) {
    match canvas.apply(session_id, vec![command]).await {
        Ok(snapshot) => {
            for warning in snapshot.warnings {
                events.diagnostic("canvas.warning", warning);
            }
        }
        Err(e) => events.diagnostic("canvas.error", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::InMemoryCanvas;
    use crate::session::SessionEvent;
    use crate::tools::BackendRoute;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use vsa_mcp_client::ToolBackend;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolBackend for Recording {
        fn name(&self) -> &str {
            "tavily"
        }

        async fn call(
            &self,
            tool: &str,
            arguments: Value,
            _cancel: CancellationToken,
        ) -> Result<Vec<ToolSegment>, BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push((tool.to_string(), arguments));
            Ok(vec![ToolSegment::text("ok")])
        }
    }

    fn done(name: &str, arguments: &str, call_id: Option<&str>) -> FunctionCallDone {
        FunctionCallDone {
            name: name.to_string(),
            arguments: arguments.to_string(),
            response_id: Some("r1".to_string()),
            call_id: call_id.map(str::to_string),
        }
    }

    fn router(
        backend: Arc<Recording>,
        canvas: Arc<InMemoryCanvas>,
    ) -> (ToolCallRouter, mpsc::UnboundedReceiver<ToolCompletion>) {
        let registry = ToolRegistry::new(
            vec!["canvas.".to_string()],
            vec![BackendRoute::new("tavily", "tavily_", backend)
                .with_defaults(json!({"max_results": 4}).as_object().cloned().unwrap())],
        );
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ToolCallRouter::new("s1".to_string(), Arc::new(registry), canvas, tx),
            rx,
        )
    }

    fn diagnostics(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| event.diagnostic_kind().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_backend_call_is_enriched_and_completes_once() {
        let backend = Arc::new(Recording::default());
        let (mut router, mut completions) = router(Arc::clone(&backend), Arc::new(InMemoryCanvas::new()));
        let (events, _rx) = EventSink::channel();

        let dispatch = router.route(done("tavily_search", r#"{"query":"foo"}"#, Some("c1")), &events);
        let Dispatch::Invoking(seq) = dispatch else {
            panic!("unexpected dispatch {:?}", dispatch);
        };
        assert_eq!(router.status(seq), Some(ToolCallStatus::Invoking));

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.seq, seq);
        assert_eq!(
            backend.calls.lock().unwrap()[0],
            ("tavily_search".to_string(), json!({"query": "foo", "max_results": 4}))
        );

        let finished = router.complete(seq, completion.outcome.is_ok()).unwrap();
        assert_eq!(finished.call.status, ToolCallStatus::Completed);
        assert_eq!(finished.call.call_id.as_deref(), Some("c1"));
        assert!(router.complete(seq, true).is_none());
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_bad_arguments_never_reach_backend() {
        let backend = Arc::new(Recording::default());
        let (mut router, _completions) = router(Arc::clone(&backend), Arc::new(InMemoryCanvas::new()));
        let (events, mut rx) = EventSink::channel();

        let dispatch = router.route(done("tavily_search", "{\"query\":", Some("c1")), &events);
        assert_eq!(dispatch, Dispatch::ArgumentError);
        assert_eq!(router.in_flight(), 0);
        assert!(backend.calls.lock().unwrap().is_empty());
        assert_eq!(diagnostics(&mut rx), vec!["function_call_parse_error"]);
    }

    #[tokio::test]
    async fn test_canvas_command_is_applied_without_tracking() {
        let canvas = Arc::new(InMemoryCanvas::new());
        let (mut router, _completions) = router(Arc::new(Recording::default()), Arc::clone(&canvas));
        let (events, mut rx) = EventSink::channel();

        let dispatch = router.route(
            done("canvas.append_note", r#"{"text":"Use multi-AZ"}"#, Some("c2")),
            &events,
        );
        assert_eq!(dispatch, Dispatch::Canvas);
        assert_eq!(router.in_flight(), 0);

        // apply runs on its own task
        for _ in 0..50 {
            if !canvas.commands("s1").await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let commands = canvas.commands("s1").await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].payload["text"], "Use multi-AZ");
        assert_eq!(diagnostics(&mut rx), vec!["canvas.command"]);
    }

    #[tokio::test]
    async fn test_unknown_tools_are_dropped() {
        let (mut router, _completions) =
            router(Arc::new(Recording::default()), Arc::new(InMemoryCanvas::new()));
        let (events, mut rx) = EventSink::channel();

        assert_eq!(
            router.route(done("bing_search", "{}", Some("c3")), &events),
            Dispatch::Unsupported
        );
        assert_eq!(
            router.route(done("canvas.erase", "{}", Some("c4")), &events),
            Dispatch::Canvas
        );
        assert_eq!(diagnostics(&mut rx), vec!["unsupported_tool", "unsupported_tool"]);
    }

    #[tokio::test]
    async fn test_missing_call_id_warns_but_dispatches() {
        let (mut router, mut completions) =
            router(Arc::new(Recording::default()), Arc::new(InMemoryCanvas::new()));
        let (events, mut rx) = EventSink::channel();

        let dispatch = router.route(done("tavily_map", "", None), &events);
        assert!(matches!(dispatch, Dispatch::Invoking(_)));
        assert!(completions.recv().await.unwrap().outcome.is_ok());
        assert_eq!(diagnostics(&mut rx), vec!["tavily.warning", "tavily.request"]);
    }

    #[tokio::test]
    async fn test_abandon_all_marks_calls() {
        let (mut router, _completions) =
            router(Arc::new(Recording::default()), Arc::new(InMemoryCanvas::new()));
        let (events, _rx) = EventSink::channel();
        router.route(done("tavily_search", "{}", Some("a")), &events);
        router.route(done("tavily_search", "{}", Some("b")), &events);

        let abandoned = router.abandon_all();
        assert_eq!(abandoned.len(), 2);
        assert!(abandoned
            .iter()
            .all(|call| call.status == ToolCallStatus::Abandoned));
        assert_eq!(router.in_flight(), 0);
    }
}
