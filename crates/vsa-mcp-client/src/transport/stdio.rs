use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use super::ToolNameMap;
use crate::backend::{ToolBackend, ToolSegment};
use crate::error::BackendError;
use crate::protocol::{
    CallToolResult, ClientInfo, InitializeParams, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_TOOLS_CALL,
};
use crate::service::PendingRequests;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(1000);

// Keep enough stderr to explain a crash without holding a whole log in memory.
const STDERR_TAIL_CHARS: usize = 2000;

/// Local tool backend that runs an MCP server as a subprocess, one process per call.
///
/// Each call spawns the command, performs the `initialize` handshake, sends the
/// `initialized` notification and a single `tools/call`, then tears the process
/// down. Calls share nothing, so concurrent calls cannot interfere.
pub struct StdioBackend {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    request_timeout: Duration,
    kill_grace: Duration,
    tool_names: ToolNameMap,
    client_info: ClientInfo,
}

impl StdioBackend {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, command: C, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            tool_names: ToolNameMap::default(),
            client_info: ClientInfo::default(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_tool_names(mut self, tool_names: ToolNameMap) -> Self {
        self.tool_names = tool_names;
        self
    }

    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    async fn exchange(
        &self,
        process: &mut StdioProcess,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolSegment>, BackendError> {
        let init = serde_json::to_value(InitializeParams::new(self.client_info.clone()))?;
        process
            .request(METHOD_INITIALIZE, init, self.request_timeout, cancel)
            .await?;
        process.notify(METHOD_INITIALIZED).await?;

        let remote_name = self.tool_names.resolve(tool);
        let result = process
            .request(
                METHOD_TOOLS_CALL,
                json!({ "name": remote_name, "arguments": arguments }),
                self.request_timeout,
                cancel,
            )
            .await?;

        let result: CallToolResult = serde_json::from_value(result)?;
        result.into_segments(&self.name)
    }
}

#[async_trait]
impl ToolBackend for StdioBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        tool: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<ToolSegment>, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Aborted(format!("{} call cancelled", tool)));
        }

        let mut process = StdioProcess::spawn(self)?;
        let outcome = self.exchange(&mut process, tool, arguments, &cancel).await;
        process.shutdown(self.kill_grace).await;
        outcome
    }
}

/// One running backend process and the requests waiting on it.
struct StdioProcess {
    backend: String,
    child: Child,
    stdin: Option<ChildStdin>,
    pending: Arc<PendingRequests>,
    exited: CancellationToken,
    stderr_tail: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl StdioProcess {
    fn spawn(backend: &StdioBackend) -> Result<Self, BackendError> {
        let mut command = Command::new(&backend.command);
        command
            .envs(&backend.env)
            .args(&backend.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so teardown reaches anything the server spawns
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            BackendError::Process(format!("failed to spawn '{}': {}", backend.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Process("failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Process("failed to get stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Process("failed to get stderr".into()))?;

        let pending = Arc::new(PendingRequests::new());
        let exited = CancellationToken::new();
        let stderr_tail = Arc::new(Mutex::new(String::new()));

        let readers = vec![
            tokio::spawn(read_stdout(
                backend.name.clone(),
                stdout,
                Arc::clone(&pending),
                exited.clone(),
                Arc::clone(&stderr_tail),
            )),
            tokio::spawn(read_stderr(
                backend.name.clone(),
                stderr,
                Arc::clone(&stderr_tail),
            )),
        ];

        debug!(backend = %backend.name, pid = ?child.id(), "spawned tool process");

        Ok(Self {
            backend: backend.name.clone(),
            child,
            stdin: Some(stdin),
            pending,
            exited,
            stderr_tail,
            readers,
        })
    }

    async fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, BackendError> {
        let request = JsonRpcRequest::new(method, Some(params));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request.id.clone(), tx).await;

        if let Err(e) = self.write_line(&request).await {
            self.pending.remove(&request.id).await;
            return Err(e);
        }

        let response: JsonRpcResponse = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.pending
                    .reject_all(BackendError::Aborted(format!("{} cancelled", method)))
                    .await;
                return Err(BackendError::Aborted(format!("{} cancelled", method)));
            }
            response = rx => match response {
                Ok(response) => response?,
                Err(_) => return Err(self.exit_error()),
            },
            _ = self.exited.cancelled() => return Err(self.exit_error()),
            _ = tokio::time::sleep(timeout) => {
                self.pending.remove(&request.id).await;
                warn!(backend = %self.backend, method, "request timed out");
                return Err(BackendError::Timeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        response.into_result(&self.backend)
    }

    async fn notify(&mut self, method: &str) -> Result<(), BackendError> {
        self.write_line(&JsonRpcNotification::new(method)).await
    }

    async fn write_line<T: Serialize>(&mut self, message: &T) -> Result<(), BackendError> {
        let line = serde_json::to_string(message)?;
        debug!(backend = %self.backend, message = %line, "sending outgoing message");

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| BackendError::Process("stdin already closed".into()))?;
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        written.map_err(|e| {
            if self.exited.is_cancelled() || e.kind() == std::io::ErrorKind::BrokenPipe {
                self.exit_error()
            } else {
                BackendError::Process(e.to_string())
            }
        })
    }

    fn exit_error(&self) -> BackendError {
        exited_before_responding(&self.backend, &self.stderr_tail)
    }

    /// SIGTERM the process group, escalating to SIGKILL once `grace` passes.
    async fn shutdown(mut self, grace: Duration) {
        drop(self.stdin.take());

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                debug!(backend = %self.backend, status = ?status, "tool process exited");
            }
            Err(_) => {
                warn!(backend = %self.backend, "tool process ignored SIGTERM, killing");
                #[cfg(unix)]
                if let Some(pid) = self.child.id() {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = self.child.kill().await;
            }
        }

        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

fn exited_before_responding(backend: &str, stderr_tail: &Mutex<String>) -> BackendError {
    let tail = stderr_tail
        .lock()
        .map(|tail| tail.trim().to_string())
        .unwrap_or_default();
    let message = if tail.is_empty() {
        "process exited before responding".to_string()
    } else {
        format!("process exited before responding: {}", tail)
    };
    BackendError::Application {
        backend: backend.to_string(),
        code: None,
        message,
    }
}

async fn read_stdout(
    backend: String,
    stdout: ChildStdout,
    pending: Arc<PendingRequests>,
    exited: CancellationToken,
    stderr_tail: Arc<Mutex<String>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(response) => response,
                    Err(_) => {
                        warn!(backend = %backend, line = %line, "failed to parse incoming message");
                        continue;
                    }
                };
                match response.id_str() {
                    Some(id) => {
                        if !pending.respond(&id, response).await {
                            debug!(backend = %backend, id = %id, "no pending request for response");
                        }
                    }
                    None => debug!(backend = %backend, line = %line, "ignoring message without id"),
                }
            }
            Ok(None) => {
                debug!(backend = %backend, "tool process closed stdout");
                break;
            }
            Err(e) => {
                warn!(backend = %backend, error = ?e, "error reading tool process output");
                break;
            }
        }
    }

    pending
        .reject_all(exited_before_responding(&backend, &stderr_tail))
        .await;
    exited.cancel();
}

async fn read_stderr(backend: String, stderr: ChildStderr, tail: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(backend = %backend, "{}", line);
        if let Ok(mut tail) = tail.lock() {
            tail.push_str(&line);
            tail.push('\n');
            let excess = tail.chars().count().saturating_sub(STDERR_TAIL_CHARS);
            if excess > 0 {
                let cut = tail
                    .char_indices()
                    .nth(excess)
                    .map(|(i, _)| i)
                    .unwrap_or(tail.len());
                tail.drain(..cut);
            }
        }
    }
}
