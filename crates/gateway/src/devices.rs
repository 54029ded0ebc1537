//! Paired-device surface (local side).
//!
//! Devices connect over WebSocket, announce themselves with a hello
//! frame, and receive forwarded task runs. Pairing, identity, and
//! connectivity belong to the external federation layer; the core only
//! speaks this protocol.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use hearth_domain::error::{Error, Result};
use hearth_domain::task::{ScheduledTask, TaskRun};
use hearth_scheduler::TaskOutcome;

use crate::state::AppState;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(300);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Device → gateway: handshake.
    Hello { device_id: String },
    /// Gateway → device: handshake accepted.
    Welcome { gateway_version: String },
    /// Gateway → device: execute this task run.
    TaskRun {
        request_id: String,
        task: ScheduledTask,
        run: TaskRun,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_payload: Option<serde_json::Value>,
    },
    /// Device → gateway: run finished.
    TaskResult {
        request_id: String,
        success: bool,
        #[serde(default)]
        tokens_used: u64,
        #[serde(default)]
        cost: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingForward {
    respond: oneshot::Sender<DeviceMessage>,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, mpsc::Sender<DeviceMessage>>>,
    pending: Mutex<HashMap<String, PendingForward>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }

    fn register(&self, device_id: &str, sender: mpsc::Sender<DeviceMessage>) {
        self.devices.lock().insert(device_id.to_owned(), sender);
        tracing::info!(device_id, "paired device connected");
    }

    fn unregister(&self, device_id: &str) {
        self.devices.lock().remove(device_id);
        tracing::info!(device_id, "paired device disconnected");
    }

    /// Forward a task run to a connected device and wait for its
    /// result (per-call timeout).
    pub async fn forward(
        &self,
        task: &ScheduledTask,
        run: &TaskRun,
        trigger_payload: Option<serde_json::Value>,
        device_id: &str,
    ) -> Result<TaskOutcome> {
        let sender = self
            .devices
            .lock()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("device {device_id} not connected")))?;

        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(request_id.clone(), PendingForward { respond: tx });

        let frame = DeviceMessage::TaskRun {
            request_id: request_id.clone(),
            task: task.clone(),
            run: run.clone(),
            trigger_payload,
        };
        if sender.send(frame).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(Error::NotFound(format!("device {device_id} dropped")));
        }

        let response = tokio::time::timeout(FORWARD_TIMEOUT, rx).await;
        match response {
            Ok(Ok(DeviceMessage::TaskResult {
                success,
                tokens_used,
                cost,
                result,
                error,
                ..
            })) => {
                if success {
                    Ok(TaskOutcome {
                        tokens_used,
                        cost,
                        result,
                    })
                } else {
                    Err(Error::Other(
                        error.unwrap_or_else(|| "device reported failure".into()),
                    ))
                }
            }
            Ok(Ok(other)) => Err(Error::Other(format!(
                "unexpected device response: {other:?}"
            ))),
            Ok(Err(_)) => Err(Error::Other("device connection closed mid-run".into())),
            Err(_) => {
                // Late results find no pending entry and are dropped.
                self.pending.lock().remove(&request_id);
                Err(Error::Timeout(format!(
                    "device {device_id} did not answer within {}s",
                    FORWARD_TIMEOUT.as_secs()
                )))
            }
        }
    }

    fn resolve(&self, request_id: &str, message: DeviceMessage) {
        if let Some(pending) = self.pending.lock().remove(request_id) {
            let _ = pending.respond.send(message);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn device_ws(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| device_session(state, socket))
}

async fn device_session(state: AppState, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();

    // First frame must be the hello.
    let device_id = loop {
        match source.next().await {
            Some(Ok(WsFrame::Text(text))) => {
                match serde_json::from_str::<DeviceMessage>(&text) {
                    Ok(DeviceMessage::Hello { device_id }) => break device_id,
                    _ => {
                        tracing::warn!("device sent a non-hello first frame, closing");
                        return;
                    }
                }
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let welcome = DeviceMessage::Welcome {
        gateway_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        if sink.send(WsFrame::Text(json)).await.is_err() {
            return;
        }
    }

    let (tx, mut rx) = mpsc::channel::<DeviceMessage>(32);
    state.devices.register(&device_id, tx);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                let Ok(json) = serde_json::to_string(&message) else { continue };
                if sink.send(WsFrame::Text(json)).await.is_err() {
                    break;
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(WsFrame::Text(text))) => {
                        match serde_json::from_str::<DeviceMessage>(&text) {
                            Ok(message @ DeviceMessage::TaskResult { .. }) => {
                                let request_id = match &message {
                                    DeviceMessage::TaskResult { request_id, .. } => {
                                        request_id.clone()
                                    }
                                    _ => continue,
                                };
                                state.devices.resolve(&request_id, message);
                            }
                            Ok(DeviceMessage::Ping { timestamp }) => {
                                let pong = DeviceMessage::Pong { timestamp };
                                if let Ok(json) = serde_json::to_string(&pong) {
                                    let _ = sink.send(WsFrame::Text(json)).await;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::debug!(error = %e, "unparseable device frame");
                            }
                        }
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "device socket error");
                        break;
                    }
                }
            }
        }
    }

    state.devices.unregister(&device_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_domain::id;
    use hearth_domain::task::{RetryPolicy, TaskAction, TaskRunStatus, TaskStatus, Trigger};

    fn task_and_run() -> (ScheduledTask, TaskRun) {
        let now = Utc::now();
        let task = ScheduledTask {
            id: id::new_id(id::TASK),
            name: "remote digest".into(),
            workspace_id: "ws1".into(),
            trigger: Trigger::Interval { seconds: 60 },
            action: TaskAction::Prompt {
                prompt: "go".into(),
                model: None,
            },
            target_device: Some("laptop".into()),
            retry_policy: RetryPolicy::default(),
            budget: None,
            status: TaskStatus::Active,
            next_fire_at: Some(now),
            last_fire_at: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        let run = TaskRun {
            id: id::new_id(id::TASK_RUN),
            task_id: task.id.clone(),
            run_number: 1,
            attempt_number: 1,
            started_at: now,
            completed_at: None,
            status: TaskRunStatus::Running,
            tokens_used: 0,
            cost: 0.0,
            error: None,
            result: None,
        };
        (task, run)
    }

    #[tokio::test]
    async fn forward_to_unknown_device_is_not_found() {
        let registry = DeviceRegistry::new();
        let (task, run) = task_and_run();
        let err = registry.forward(&task, &run, None, "laptop").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn forward_round_trip_through_registry() {
        let registry = DeviceRegistry::new();
        let (task, run) = task_and_run();

        let (tx, mut rx) = mpsc::channel(4);
        registry.register("laptop", tx);

        // A fake device: answer the forwarded run.
        let registry_ref = &registry;
        let device = async move {
            if let Some(DeviceMessage::TaskRun { request_id, .. }) = rx.recv().await {
                registry_ref.resolve(
                    &request_id,
                    DeviceMessage::TaskResult {
                        request_id: request_id.clone(),
                        success: true,
                        tokens_used: 42,
                        cost: 0.001,
                        result: Some("remote ok".into()),
                        error: None,
                    },
                );
            }
        };

        let (outcome, ()) = tokio::join!(registry.forward(&task, &run, None, "laptop"), device);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.tokens_used, 42);
        assert_eq!(outcome.result.as_deref(), Some("remote ok"));
    }
}
