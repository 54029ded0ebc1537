//! Stdio child provider.
//!
//! The child is spawned lazily on first use and kept alive for
//! subsequent calls. A reader task routes responses to waiters by id,
//! so calls from different sessions can interleave; a response whose
//! waiter already timed out finds no entry and is discarded. Crashes
//! respawn with exponential backoff (1 s base, 60 s cap, 5 attempts
//! before the provider is marked unhealthy).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;

use hearth_domain::error::{Error, Result};
use hearth_domain::tool::ToolDefinition;

use crate::protocol::{Request, Response, METHOD_CALL, METHOD_LIST};
use crate::{ToolOutput, ToolProvider};

const RESPAWN_BASE: Duration = Duration::from_secs(1);
const RESPAWN_CAP: Duration = Duration::from_secs(60);
const RESPAWN_ATTEMPTS: u32 = 5;
#[cfg(unix)]
const SIGTERM_GRACE: Duration = Duration::from_secs(2);

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

struct Running {
    stdin: ChildStdin,
    child: Child,
    waiters: Waiters,
    reader: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct SpawnState {
    consecutive_failures: u32,
    retry_at: Option<tokio::time::Instant>,
}

pub struct StdioProvider {
    name: String,
    command: String,
    args: Vec<String>,
    running: tokio::sync::Mutex<Option<Running>>,
    spawn_state: Mutex<SpawnState>,
    next_id: AtomicU64,
}

impl StdioProvider {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            running: tokio::sync::Mutex::new(None),
            spawn_state: Mutex::new(SpawnState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn spawn_child(&self) -> Result<Running> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Tool {
                tool: self.name.clone(),
                message: "failed to capture child stdin".into(),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Tool {
            tool: self.name.clone(),
            message: "failed to capture child stdout".into(),
        })?;

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let reader_waiters = waiters.clone();
        let provider = self.name.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Response>(line) {
                    Ok(response) => {
                        // A missing waiter means the call already timed
                        // out; the late response is dropped here.
                        if let Some(tx) = reader_waiters.lock().remove(&response.id) {
                            let _ = tx.send(response);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(provider = %provider, error = %e, "skipping non-protocol line");
                    }
                }
            }
            // Child stdout closed: fail everything still waiting.
            reader_waiters.lock().clear();
        });

        tracing::info!(provider = %self.name, command = %self.command, "stdio tool server started");
        Ok(Running {
            stdin,
            child,
            waiters,
            reader,
        })
    }

    /// Ensure a live child, respecting the respawn backoff window.
    async fn ensure_running(&self) -> Result<()> {
        let mut running = self.running.lock().await;

        if let Some(r) = running.as_mut() {
            match r.child.try_wait() {
                Ok(None) => return Ok(()),
                _ => {
                    tracing::warn!(provider = %self.name, "stdio tool server exited");
                    r.reader.abort();
                    *running = None;
                }
            }
        }

        {
            let state = self.spawn_state.lock();
            if state.consecutive_failures >= RESPAWN_ATTEMPTS {
                return Err(Error::Tool {
                    tool: self.name.clone(),
                    message: format!(
                        "provider unhealthy after {RESPAWN_ATTEMPTS} failed spawns"
                    ),
                });
            }
            if let Some(retry_at) = state.retry_at {
                if tokio::time::Instant::now() < retry_at {
                    return Err(Error::Tool {
                        tool: self.name.clone(),
                        message: "provider in respawn backoff".into(),
                    });
                }
            }
        }

        match self.spawn_child() {
            Ok(r) => {
                *running = Some(r);
                self.spawn_state.lock().consecutive_failures = 0;
                Ok(())
            }
            Err(e) => {
                let mut state = self.spawn_state.lock();
                state.consecutive_failures += 1;
                let exp = state.consecutive_failures.saturating_sub(1).min(16);
                let delay = RESPAWN_BASE.saturating_mul(1u32 << exp).min(RESPAWN_CAP);
                state.retry_at = Some(tokio::time::Instant::now() + delay);
                tracing::warn!(
                    provider = %self.name,
                    failures = state.consecutive_failures,
                    backoff_secs = delay.as_secs(),
                    error = %e,
                    "stdio tool server spawn failed"
                );
                Err(e)
            }
        }
    }

    async fn request(&self, method: &str, params: Option<serde_json::Value>) -> Result<Response> {
        self.ensure_running().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let rx = {
            let mut running = self.running.lock().await;
            let r = running.as_mut().ok_or_else(|| Error::Tool {
                tool: self.name.clone(),
                message: "provider not running".into(),
            })?;
            let (tx, rx) = oneshot::channel();
            r.waiters.lock().insert(id, tx);
            if let Err(e) = r.stdin.write_all(line.as_bytes()).await {
                r.waiters.lock().remove(&id);
                return Err(Error::Io(e));
            }
            rx
        };

        rx.await.map_err(|_| Error::Tool {
            tool: self.name.clone(),
            message: "tool server closed before responding".into(),
        })
    }
}

#[async_trait::async_trait]
impl ToolProvider for StdioProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let response = self.request(METHOD_LIST, None).await?;
        if let Some(error) = response.error {
            return Err(Error::Tool {
                tool: self.name.clone(),
                message: error.message,
            });
        }
        let tools = response
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![]));
        Ok(serde_json::from_value(tools)?)
    }

    async fn call(&self, tool: &str, arguments: &serde_json::Value) -> Result<ToolOutput> {
        let params = serde_json::json!({ "tool": tool, "arguments": arguments });
        let response = self.request(METHOD_CALL, Some(params)).await?;

        if let Some(error) = response.error {
            return Ok(ToolOutput::error(error.message));
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        let content = match result.get("content").and_then(|c| c.as_str()) {
            Some(text) => text.to_owned(),
            None => result.to_string(),
        };
        let is_error = result
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(ToolOutput { content, is_error })
    }

    async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        if let Some(mut r) = running.take() {
            r.reader.abort();

            #[cfg(unix)]
            {
                if let Some(pid) = r.child.id() {
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                    let graceful =
                        tokio::time::timeout(SIGTERM_GRACE, r.child.wait()).await;
                    if graceful.is_ok() {
                        return;
                    }
                }
            }
            let _ = r.child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A shell one-liner that answers the protocol: replies to every
    /// request line with a canned response keyed by method.
    fn echo_server() -> StdioProvider {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *tools/list*)
      printf '{"id":%s,"result":{"tools":[{"name":"echo.say","description":"echo","parameters":{"type":"object"}}]}}\n' "$id"
      ;;
    *tools/call*)
      printf '{"id":%s,"result":{"content":"pong"}}\n' "$id"
      ;;
  esac
done
"#;
        StdioProvider::new("echo", "sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn list_and_call_round_trip() {
        let provider = echo_server();
        let tools = provider.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo.say");

        let output = provider
            .call("echo.say", &serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(output.content, "pong");
        assert!(!output.is_error);

        provider.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_backs_off_and_goes_unhealthy() {
        let provider = StdioProvider::new(
            "broken",
            "/nonexistent/definitely-not-a-binary",
            vec![],
        );
        // First failure starts the backoff window.
        assert!(provider.list_tools().await.is_err());
        let failures = provider.spawn_state.lock().consecutive_failures;
        assert_eq!(failures, 1);

        // Within the backoff window: rejected without another spawn.
        let err = provider.list_tools().await.unwrap_err();
        assert!(err.to_string().contains("backoff"));
    }
}
