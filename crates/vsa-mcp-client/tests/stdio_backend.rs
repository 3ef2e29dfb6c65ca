#![cfg(unix)]

use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vsa_mcp_client::transport::ToolNameMap;
use vsa_mcp_client::{BackendError, StdioBackend, ToolBackend, ToolSegment};

// Answers initialize, then answers tools/call with an echo of the requested
// tool name. Noise lines and a response for an unknown id come first.
const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  tool=$(printf '%s\n' "$line" | sed -n 's/.*"name":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      echo "starting diagram render" >&2
      printf 'this is not json\n'
      printf '{"jsonrpc":"2.0","id":"req_unknown","result":{}}\n'
      sleep "${DELAY:-0}"
      printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"called %s"}]}}\n' "$id" "$tool"
      ;;
  esac
done
"#;

const SILENT_SERVER: &str = r#"
echo $$ > "$PID_FILE"
while IFS= read -r line; do :; done
"#;

const STUBBORN_SERVER: &str = r#"
trap '' TERM
echo $$ > "$PID_FILE"
while IFS= read -r line; do :; done
"#;

const EXITING_SERVER: &str = r#"
IFS= read -r line
echo "fatal: missing credentials" >&2
exit 3
"#;

const TOOL_ERROR_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":"%s","error":{"code":-32602,"message":"unknown tool"}}\n' "$id" ;;
  esac
done
"#;

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn backend(script: &Path) -> StdioBackend {
    StdioBackend::new("aws-diagram", "sh", vec![script.to_string_lossy().to_string()])
}

fn process_alive(pid_file: &Path) -> bool {
    let pid: i32 = std::fs::read_to_string(pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

async fn wait_for_file(path: &Path) {
    for _ in 0..100 {
        if path.exists() && !std::fs::read_to_string(path).unwrap().trim().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never written", path.display());
}

#[tokio::test]
async fn test_handshake_and_tool_call() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "echo.sh", ECHO_SERVER);
    let backend = backend(&script).with_tool_names(
        [("aws_generate_diagram", "generate_diagram")]
            .into_iter()
            .collect::<ToolNameMap>(),
    );

    let segments = backend
        .call(
            "aws_generate_diagram",
            json!({"code": "with Diagram('x'): pass"}),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(segments, vec![ToolSegment::text("called generate_diagram")]);
}

#[tokio::test]
async fn test_concurrent_calls_do_not_cross_resolve() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "echo.sh", ECHO_SERVER);
    let slow = backend(&script).with_env([("DELAY".to_string(), "0.3".to_string())].into());
    let fast = backend(&script);

    let (slow_result, fast_result) = tokio::join!(
        slow.call("list_icons", json!({}), CancellationToken::new()),
        fast.call("get_diagram_examples", json!({}), CancellationToken::new()),
    );

    assert_eq!(
        slow_result.unwrap(),
        vec![ToolSegment::text("called list_icons")]
    );
    assert_eq!(
        fast_result.unwrap(),
        vec![ToolSegment::text("called get_diagram_examples")]
    );
}

#[tokio::test]
async fn test_silent_process_times_out_and_is_terminated() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "silent.sh", SILENT_SERVER);
    let pid_file = dir.path().join("pid");
    let backend = backend(&script)
        .with_env([("PID_FILE".to_string(), pid_file.to_string_lossy().to_string())].into())
        .with_request_timeout(Duration::from_millis(300))
        .with_kill_grace(Duration::from_millis(200));

    let started = Instant::now();
    let err = backend
        .call("list_icons", json!({}), CancellationToken::new())
        .await
        .unwrap_err();

    // timeout plus the teardown grace, with room for a slow machine
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(err, BackendError::Timeout { ref method, .. } if method == "initialize"));
    assert!(!process_alive(&pid_file));
}

#[tokio::test]
async fn test_process_ignoring_sigterm_is_killed() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "stubborn.sh", STUBBORN_SERVER);
    let pid_file = dir.path().join("pid");
    let backend = backend(&script)
        .with_env([("PID_FILE".to_string(), pid_file.to_string_lossy().to_string())].into())
        .with_request_timeout(Duration::from_millis(200))
        .with_kill_grace(Duration::from_millis(200));

    let err = backend
        .call("list_icons", json!({}), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "timeout");
    assert!(!process_alive(&pid_file));
}

#[tokio::test]
async fn test_exit_before_responding_is_application_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit.sh", EXITING_SERVER);

    let err = backend(&script)
        .call("list_icons", json!({}), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "application");
    assert!(err.to_string().contains("process exited before responding"));
}

#[tokio::test]
async fn test_rpc_error_is_application_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "error.sh", TOOL_ERROR_SERVER);

    let err = backend(&script)
        .call("render", json!({}), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BackendError::Application { code: Some(-32602), ref message, .. } if message == "unknown tool"
    ));
}

#[tokio::test]
async fn test_cancel_only_affects_its_own_call() {
    let dir = TempDir::new().unwrap();
    let silent = write_script(&dir, "silent.sh", SILENT_SERVER);
    let echo = write_script(&dir, "echo.sh", ECHO_SERVER);
    let pid_file = dir.path().join("pid");

    let hanging = backend(&silent)
        .with_env([("PID_FILE".to_string(), pid_file.to_string_lossy().to_string())].into());
    let healthy = backend(&echo).with_env([("DELAY".to_string(), "0.2".to_string())].into());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let pid_path = pid_file.clone();
    tokio::spawn(async move {
        wait_for_file(&pid_path).await;
        trigger.cancel();
    });

    let (cancelled, completed) = tokio::join!(
        hanging.call("list_icons", json!({}), cancel),
        healthy.call("list_icons", json!({}), CancellationToken::new()),
    );

    assert_eq!(cancelled.unwrap_err().kind(), "aborted");
    assert!(!process_alive(&pid_file));
    assert_eq!(completed.unwrap(), vec![ToolSegment::text("called list_icons")]);
}

#[tokio::test]
async fn test_spawn_failure() {
    let backend = StdioBackend::new("aws-diagram", "definitely-not-a-real-binary-vsa", vec![]);
    let err = backend
        .call("list_icons", json!({}), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Process(_)));
}
