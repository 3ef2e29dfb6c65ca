use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use vsa::canvas::{CanvasCollaborator, HttpCanvasClient, InMemoryCanvas};
use vsa::channel::{ControlChannel, ControlPeer, CONTROL_CHANNEL_LABEL};
use vsa::config::{Config, RealtimeSettings};
use vsa::session::{EventSink, RealtimeSession, SessionEvent, SessionRuntime};
use vsa::tools::ToolRegistry;
use vsa::transcript::Speaker;

use crate::signal::shutdown_signal;

pub struct ReplayOptions {
    pub path: PathBuf,
    pub linger: Duration,
    pub canvas_url: Option<String>,
    pub json: bool,
    pub verbose: bool,
}

/// Inbound frames from a capture: one per line, skipping blank lines and `#` comments.
pub async fn read_frames(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read capture {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub async fn handle_replay(config: &Config, options: ReplayOptions) -> Result<()> {
    let settings = RealtimeSettings::from_config(config)?;
    let registry = Arc::new(ToolRegistry::from_settings(&settings, config)?);
    let canvas: Arc<dyn CanvasCollaborator> = match &options.canvas_url {
        Some(url) => Arc::new(HttpCanvasClient::new(url)),
        None => Arc::new(InMemoryCanvas::new()),
    };
    let frames = read_frames(&options.path).await?;

    let runtime = SessionRuntime::new(&settings, registry, canvas);
    let (sink, events) = EventSink::channel();
    let (channel, peer) = ControlChannel::pair(CONTROL_CHANNEL_LABEL);
    // Outbound frames are printed from the session's own events.
    let ControlPeer {
        outbound: _outbound,
        inbound,
    } = peer;
    let handle = RealtimeSession::attach(runtime, sink, channel, None);
    info!(session = handle.id(), frames = frames.len(), "replaying capture");

    let printer = tokio::spawn(print_events(events, options.json, options.verbose));
    for frame in frames {
        if inbound.send(frame).await.is_err() {
            warn!("session closed before the capture was fully replayed");
            break;
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(options.linger) => {}
        _ = shutdown_signal() => {}
        _ = handle.closed() => {}
    }
    handle.stop().await;
    drop(inbound);
    printer.await?;
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>, json: bool, verbose: bool) {
    while let Some(event) = events.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to serialize session event"),
            }
            continue;
        }
        match event {
            SessionEvent::State { state } => {
                println!("{} {:?}", style("session").dim(), state);
            }
            SessionEvent::Connection { state } => {
                println!("{} {:?}", style("connection").dim(), state);
            }
            SessionEvent::Protocol { protocol } if verbose => {
                println!("{} {}", style("<-").dim(), style(&protocol.kind).dim());
            }
            SessionEvent::Protocol { .. } => {}
            SessionEvent::Transcript { line } => {
                let speaker = match line.speaker {
                    Speaker::User => style("user:").cyan().bold(),
                    Speaker::Assistant => style("assistant:").green().bold(),
                };
                println!("{} {}", speaker, line.text);
            }
            SessionEvent::Outbound { frame } => {
                println!("{} {}", style("->").yellow(), frame);
            }
            SessionEvent::Diagnostic { kind, label, .. } => {
                let tag = format!("[{}]", kind);
                let tag = if kind.ends_with("error") {
                    style(tag).red()
                } else if kind.ends_with("warning") || kind == "unsupported_tool" {
                    style(tag).yellow()
                } else {
                    style(tag).dim()
                };
                println!("{} {}", tag, label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_read_frames_skips_blank_and_comment_lines() {
        let mut capture = NamedTempFile::new().unwrap();
        writeln!(capture, "# captured from a browser session").unwrap();
        writeln!(capture, r#"{{"type":"response.output_text.delta","response_id":"r1","delta":"Hi"}}"#).unwrap();
        writeln!(capture).unwrap();
        writeln!(capture, r#"  {{"type":"response.completed","response_id":"r1"}}  "#).unwrap();

        let frames = read_frames(capture.path()).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].starts_with('{'));
    }

    #[tokio::test]
    async fn test_missing_capture_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_frames(&dir.path().join("missing.jsonl"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read capture"));
    }
}
