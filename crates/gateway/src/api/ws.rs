//! WebSocket event bridge.
//!
//! Carries the event bus to subscribers as JSON frames. Clients send
//! `{type: "subscribe", topics, session_id?, last_sequence?}` and may
//! resolve approvals inline with `{type: "approval.resolve", …}`.

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use hearth_bus::{ReplayCheckpoint, SubscribeOptions, Subscription};
use hearth_domain::event::{Topic, TopicFilter};
use hearth_domain::tool::ApprovalScope;

use crate::runtime;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
        /// Replay checkpoint: events for this session with sequence
        /// greater than `last_sequence` are re-delivered first.
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        last_sequence: Option<u64>,
    },
    #[serde(rename = "approval.resolve")]
    ApprovalResolve {
        tool_call_id: String,
        decision: String,
        #[serde(default)]
        scope: Option<ApprovalScope>,
    },
}

pub async fn event_ws(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| event_session(state, socket))
}

async fn event_session(state: AppState, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();
    let mut subscription: Option<Subscription> = None;

    loop {
        tokio::select! {
            event = next_event(&mut subscription) => {
                let Some(event) = event else { break };
                let frame = serde_json::json!({
                    "type": "event",
                    "event": event.topic.as_str(),
                    "session_id": event.session_id,
                    "sequence": event.sequence,
                    "payload": event.payload,
                    "timestamp": event.timestamp.to_rfc3339(),
                });
                let Ok(json) = serde_json::to_string(&frame) else { continue };
                if sink.send(WsFrame::Text(json)).await.is_err() {
                    break;
                }
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { topics, session_id, last_sequence }) => {
                                let filter = parse_topics(&topics);
                                let replay = match (session_id, last_sequence) {
                                    (Some(session_id), Some(last_sequence)) => {
                                        vec![ReplayCheckpoint { session_id, last_sequence }]
                                    }
                                    _ => Vec::new(),
                                };
                                match state.bus.subscribe(SubscribeOptions {
                                    topics: filter,
                                    replay,
                                    ..Default::default()
                                }).await {
                                    Ok(new_subscription) => {
                                        subscription = Some(new_subscription);
                                        let ack = serde_json::json!({"type": "subscribed"});
                                        let _ = sink
                                            .send(WsFrame::Text(ack.to_string()))
                                            .await;
                                    }
                                    Err(e) => {
                                        let err = serde_json::json!({
                                            "type": "error",
                                            "message": e.to_string(),
                                        });
                                        let _ = sink.send(WsFrame::Text(err.to_string())).await;
                                    }
                                }
                            }
                            Ok(ClientFrame::ApprovalResolve { tool_call_id, decision, scope }) => {
                                let approved = decision == "approve";
                                let result = runtime::resolve_approval(
                                    &state,
                                    &tool_call_id,
                                    approved,
                                    scope.unwrap_or_default(),
                                    "ws:client",
                                );
                                if let Err(e) = result {
                                    let err = serde_json::json!({
                                        "type": "error",
                                        "message": e.to_string(),
                                    });
                                    let _ = sink.send(WsFrame::Text(err.to_string())).await;
                                }
                            }
                            Err(e) => {
                                let err = serde_json::json!({
                                    "type": "error",
                                    "message": format!("bad frame: {e}"),
                                });
                                let _ = sink.send(WsFrame::Text(err.to_string())).await;
                            }
                        }
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

/// Wait on the live subscription; before any subscribe frame arrives,
/// park forever so `select!` only sees client traffic.
async fn next_event(
    subscription: &mut Option<Subscription>,
) -> Option<hearth_domain::event::Event> {
    match subscription {
        Some(active) => active.recv().await,
        None => futures_util::future::pending().await,
    }
}

fn parse_topics(topics: &[String]) -> TopicFilter {
    if topics.is_empty() {
        return TopicFilter::All;
    }
    let parsed: Vec<Topic> = topics.iter().filter_map(|t| Topic::parse(t)).collect();
    if parsed.is_empty() {
        TopicFilter::All
    } else {
        TopicFilter::Only(parsed)
    }
}
