use crate::config::{CommandSpec, expand_env_map};
use crate::upstream::{
    diagnostics::Diagnostics,
    error::{Result, UpstreamError},
    types::JsonRpcRequest,
};
use std::{
    collections::HashMap,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
};

/// How long `shutdown` waits for a child to exit after its stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Request/response channel over one child process's stdio.
///
/// Every request is written as a single JSON line and answered by exactly
/// one line. The pipes sit behind an async lock held for the whole
/// write-then-read exchange, so concurrent callers are served one at a time.
pub struct ProcessChannel {
    server: String,
    request_timeout: Duration,
    diagnostics: Arc<dyn Diagnostics>,
    // Kept apart from the pipes so liveness checks never wait on a request.
    child: Mutex<Option<Child>>,
    pipes: tokio::sync::Mutex<PipeState>,
}

enum PipeState {
    Unstarted,
    Open(Pipes),
    Closed,
}

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl std::fmt::Debug for ProcessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessChannel")
            .field("server", &self.server)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ProcessChannel {
    pub fn new(
        server: impl Into<String>,
        request_timeout: Duration,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        Self {
            server: server.into(),
            request_timeout,
            diagnostics,
            child: Mutex::new(None),
            pipes: tokio::sync::Mutex::new(PipeState::Unstarted),
        }
    }

    /// Spawn the child with all three standard streams piped.
    ///
    /// Starting an open channel is a no-op; a closed channel stays closed.
    pub async fn start(&self, command: &CommandSpec, env: &HashMap<String, String>) -> Result<()> {
        let mut state = self.pipes.lock().await;
        match *state {
            PipeState::Unstarted => {}
            PipeState::Open(_) => return Ok(()),
            PipeState::Closed => return Err(self.closed()),
        }

        let (program, args) = command
            .program_and_args()
            .ok_or_else(|| self.launch_error("empty command"))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(expand_env_map(env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| self.launch_error(&e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.launch_error("missing stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.launch_error("missing stdout"))?;

        // Drain stderr so a chatty child never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let diagnostics = Arc::clone(&self.diagnostics);
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    diagnostics.debug(&format!("[{server}] stderr: {line}"));
                }
            });
        }

        self.diagnostics.debug(&format!(
            "[{}] spawned pid {:?}: {command}",
            self.server,
            child.id()
        ));

        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        *state = PipeState::Open(Pipes {
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        });
        Ok(())
    }

    /// Send one request and wait for its single-line response.
    ///
    /// Returns the full parsed response object. A response carrying an
    /// `error` field fails with [`UpstreamError::Protocol`]. End-of-stream,
    /// a read timeout, an I/O failure or a response for an unknown id closes
    /// the channel for good.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut state = self.pipes.lock().await;
        let pipes = match &mut *state {
            PipeState::Unstarted => {
                return Err(UpstreamError::NotStarted {
                    server: self.server.clone(),
                });
            }
            PipeState::Closed => return Err(self.closed()),
            PipeState::Open(pipes) => pipes,
        };

        let id = pipes.next_id;
        pipes.next_id += 1;

        let outcome = self.exchange(pipes, id, method, params).await;
        if let Err(err) = &outcome {
            if err.is_fatal_to_channel() {
                self.diagnostics
                    .error(&format!("[{}] channel closed: {err}", self.server));
                *state = PipeState::Closed;
                self.discard_child();
            }
        }
        outcome
    }

    async fn exchange(
        &self,
        pipes: &mut Pipes,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request).map_err(|e| self.io_error(e.into()))?;
        self.diagnostics
            .debug(&format!("[{}] → {line}", self.server));
        line.push('\n');

        // A write failure means the child is gone.
        if pipes.stdin.write_all(line.as_bytes()).await.is_err()
            || pipes.stdin.flush().await.is_err()
        {
            return Err(self.closed());
        }

        // Notifications and replies to earlier requests are skipped; the
        // deadline covers the whole wait, not each line.
        let deadline = tokio::time::Instant::now() + self.request_timeout;
        let mut buf = String::new();
        let response = loop {
            buf.clear();
            let read = tokio::time::timeout_at(deadline, pipes.stdout.read_line(&mut buf))
                .await
                .map_err(|_| UpstreamError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                    timeout_ms: u64::try_from(self.request_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })?
                .map_err(|e| self.io_error(e))?;
            if read == 0 {
                return Err(self.closed());
            }

            let line = buf.trim();
            self.diagnostics
                .debug(&format!("[{}] ← {line}", self.server));

            let response: serde_json::Value =
                serde_json::from_str(line).map_err(|source| UpstreamError::MalformedResponse {
                    server: self.server.clone(),
                    source,
                })?;

            if is_stray(&response, id) {
                self.diagnostics.debug(&format!(
                    "[{}] skipped line while waiting for response {id}",
                    self.server
                ));
                continue;
            }
            break response;
        };

        if let Some(error) = response.get("error") {
            return Err(UpstreamError::Protocol {
                server: self.server.clone(),
                error: error.clone(),
            });
        }

        let received = response.get("id").cloned().unwrap_or_default();
        if received.as_u64() != Some(id) {
            return Err(UpstreamError::ResponseMismatch {
                server: self.server.clone(),
                expected: id,
                received,
            });
        }

        Ok(response)
    }

    /// `true` while the child process exists and has not exited.
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child
            .as_mut()
            .is_some_and(|c| matches!(c.try_wait(), Ok(None)))
    }

    /// Close the pipes, then wait briefly for the child before killing it.
    pub async fn shutdown(&self) {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // Dropping stdin signals EOF; an in-flight request is left to fail
        // once the child dies.
        if let Ok(mut state) = self.pipes.try_lock() {
            *state = PipeState::Closed;
        }

        if let Some(mut child) = child {
            if tokio::time::timeout(SHUTDOWN_GRACE, child.wait())
                .await
                .is_err()
            {
                let _ = child.kill().await;
            }
            self.diagnostics
                .debug(&format!("[{}] process stopped", self.server));
        }

        *self.pipes.lock().await = PipeState::Closed;
    }

    fn discard_child(&self) {
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            // kill_on_drop reaps whatever survives this.
            let _ = child.start_kill();
        }
    }

    fn closed(&self) -> UpstreamError {
        UpstreamError::Closed {
            server: self.server.clone(),
        }
    }

    fn launch_error(&self, reason: &str) -> UpstreamError {
        UpstreamError::Launch {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> UpstreamError {
        UpstreamError::Io {
            server: self.server.clone(),
            source,
        }
    }
}

/// A line that is not the answer to request `id`: a notification or
/// server-initiated request (it carries `method`), or a late reply to an
/// earlier request.
fn is_stray(message: &serde_json::Value, id: u64) -> bool {
    message.get("method").is_some()
        || message
            .get("id")
            .and_then(serde_json::Value::as_u64)
            .is_some_and(|received| received < id)
}
