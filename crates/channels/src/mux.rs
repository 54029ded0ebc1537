//! Channel multiplexer.
//!
//! Registers adapters, normalizes inbound messages into sessions,
//! delivers outbound replies from the bus, enforces per-identity token
//! buckets, deduplicates redeliveries, and reconnects dropped adapters
//! with exponential backoff (1 s base, 30 s cap, forever).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use hearth_bus::{EventBus, SubscribeOptions};
use hearth_domain::error::{Error, Result};
use hearth_domain::event::{Event, Topic, TopicFilter};
use hearth_store::Store;

use crate::adapter::{AdapterStatus, ChannelAdapter, InboundEnvelope, OutboundMessage};
use crate::dedupe::DedupeCache;
use crate::ratelimit::TokenBuckets;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const STATUS_POLL: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound handler (implemented by the orchestrator)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    /// Create a new session for an unknown (channel, thread) key.
    async fn create_session(&self, envelope: &InboundEnvelope) -> Result<String>;

    /// Hand a session-bound message to the conversational runtime.
    async fn deliver(&self, session_id: &str, envelope: InboundEnvelope);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound gate (handed to adapters)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type BucketPair = (Arc<TokenBuckets>, Arc<TokenBuckets>);

/// The adapter-facing entry point. Admission control happens here so
/// the adapter gets a refusal it can translate to its transport.
#[derive(Clone)]
pub struct InboundGate {
    dedupe: Arc<DedupeCache>,
    /// (inbound, outbound) buckets per adapter, from declared limits.
    channel_buckets: Arc<RwLock<HashMap<String, BucketPair>>>,
    default_inbound: Arc<TokenBuckets>,
    queue: mpsc::Sender<InboundEnvelope>,
}

impl InboundGate {
    /// Admit one inbound message. Duplicates succeed silently (the
    /// redelivery is absorbed); rate overflows are refused.
    pub async fn submit(&self, envelope: InboundEnvelope) -> Result<bool> {
        if let Some(message_id) = &envelope.message_id {
            if self.dedupe.check_and_insert(&envelope.channel_id, message_id) {
                tracing::debug!(
                    channel = %envelope.channel_id,
                    message_id = %message_id,
                    "duplicate inbound message absorbed"
                );
                return Ok(false);
            }
        }

        let bucket = self
            .channel_buckets
            .read()
            .get(&envelope.channel_id)
            .map(|(inbound, _)| inbound.clone())
            .unwrap_or_else(|| self.default_inbound.clone());
        if !bucket.try_take(&envelope.sender) {
            return Err(Error::Channel {
                channel: envelope.channel_id.clone(),
                message: format!("inbound rate limit exceeded for {}", envelope.sender),
            });
        }

        self.queue
            .send(envelope)
            .await
            .map_err(|_| Error::Other("multiplexer stopped".into()))?;
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Multiplexer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChannelMultiplexer {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    handler: Arc<dyn InboundHandler>,
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    dedupe: Arc<DedupeCache>,
    channel_buckets: Arc<RwLock<HashMap<String, BucketPair>>>,
    default_inbound: Arc<TokenBuckets>,
    default_outbound: Arc<TokenBuckets>,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ChannelMultiplexer {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        handler: Arc<dyn InboundHandler>,
        inbound_per_minute: u32,
        outbound_per_minute: u32,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let mux = Arc::new(Self {
            store,
            bus,
            handler,
            adapters: RwLock::new(HashMap::new()),
            dedupe: Arc::new(DedupeCache::default()),
            channel_buckets: Arc::new(RwLock::new(HashMap::new())),
            default_inbound: Arc::new(TokenBuckets::new(inbound_per_minute)),
            default_outbound: Arc::new(TokenBuckets::new(outbound_per_minute)),
            inbound_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let inbound_task = tokio::spawn(Self::inbound_loop(mux.clone(), inbound_rx));
        let outbound_task = tokio::spawn(Self::outbound_loop(mux.clone()));
        mux.tasks.lock().extend([inbound_task, outbound_task]);
        mux
    }

    pub fn gate(&self) -> InboundGate {
        InboundGate {
            dedupe: self.dedupe.clone(),
            channel_buckets: self.channel_buckets.clone(),
            default_inbound: self.default_inbound.clone(),
            queue: self.inbound_tx.clone(),
        }
    }

    /// Start an adapter and watch it for disconnects.
    pub async fn start_adapter(self: &Arc<Self>, adapter: Arc<dyn ChannelAdapter>) -> Result<()> {
        let limits = adapter.limits();
        self.channel_buckets.write().insert(
            adapter.id().to_owned(),
            (
                Arc::new(TokenBuckets::new(limits.inbound_per_minute)),
                Arc::new(TokenBuckets::new(limits.outbound_per_minute)),
            ),
        );
        adapter.start(self.gate()).await?;
        self.adapters
            .write()
            .insert(adapter.id().to_owned(), adapter.clone());

        let mux = self.clone();
        let watcher = tokio::spawn(async move {
            mux.watch_adapter(adapter).await;
        });
        self.tasks.lock().push(watcher);
        Ok(())
    }

    pub async fn stop_adapter(&self, adapter_id: &str) {
        let adapter = self.adapters.write().remove(adapter_id);
        if let Some(adapter) = adapter {
            adapter.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        let adapters: Vec<_> = self.adapters.write().drain().map(|(_, a)| a).collect();
        for adapter in adapters {
            adapter.stop().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn adapter_statuses(&self) -> HashMap<String, AdapterStatus> {
        self.adapters
            .read()
            .iter()
            .map(|(id, adapter)| (id.clone(), adapter.status()))
            .collect()
    }

    // ── Inbound path ─────────────────────────────────────────────────

    async fn inbound_loop(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<InboundEnvelope>) {
        while let Some(envelope) = inbound_rx.recv().await {
            if let Err(e) = self.route_inbound(envelope).await {
                tracing::warn!(error = %e, "inbound routing failed");
            }
        }
    }

    /// Map (channel, thread) to a stable session, creating one for an
    /// unknown key, then hand the message to the runtime.
    async fn route_inbound(&self, envelope: InboundEnvelope) -> Result<()> {
        let session_id = match self
            .store
            .lookup_session_key(&envelope.channel_id, &envelope.external_thread_id)?
        {
            Some(session_id) => session_id,
            None => {
                let session_id = self.handler.create_session(&envelope).await?;
                self.store.bind_session_key(
                    &envelope.channel_id,
                    &envelope.external_thread_id,
                    &session_id,
                )?;
                session_id
            }
        };

        self.handler.deliver(&session_id, envelope).await;
        Ok(())
    }

    // ── Outbound path ────────────────────────────────────────────────

    /// Deliver assistant messages to the channels their sessions are
    /// bound to. Persistent send failures surface as `error.occurred`
    /// and the session continues.
    async fn outbound_loop(self: Arc<Self>) {
        let mut subscription = match self
            .bus
            .subscribe(SubscribeOptions {
                topics: TopicFilter::Only(vec![Topic::SessionMessage]),
                ..Default::default()
            })
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "outbound loop could not subscribe");
                return;
            }
        };

        while let Some(event) = subscription.recv().await {
            if event.payload.get("role").and_then(|r| r.as_str()) != Some("assistant") {
                continue;
            }
            let Some(session_id) = event.session_id.clone() else {
                continue;
            };
            let content = event
                .payload
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_owned();
            if content.is_empty() {
                continue;
            }

            let bindings = match self.store.bindings_for_session(&session_id) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "binding lookup failed");
                    continue;
                }
            };

            for (channel_id, external_thread_id) in bindings {
                let adapter = self.adapters.read().get(&channel_id).cloned();
                let Some(adapter) = adapter else { continue };

                // Outbound over-limit is delayed, not dropped.
                let bucket = self
                    .channel_buckets
                    .read()
                    .get(&channel_id)
                    .map(|(_, outbound)| outbound.clone())
                    .unwrap_or_else(|| self.default_outbound.clone());
                bucket.take(&external_thread_id).await;

                let message = OutboundMessage {
                    external_thread_id: external_thread_id.clone(),
                    content: content.clone(),
                };
                if let Err(e) = adapter.send(message).await {
                    tracing::warn!(
                        channel = %channel_id,
                        error = %e,
                        "outbound delivery failed"
                    );
                    self.bus
                        .publish_or_log(Event::for_session(
                            Topic::ErrorOccurred,
                            session_id.clone(),
                            serde_json::json!({
                                "scope": "channel",
                                "channel_id": channel_id,
                                "error": e.to_string(),
                            }),
                        ))
                        .await;
                }
            }
        }
    }

    // ── Reconnect ────────────────────────────────────────────────────

    /// Poll adapter status; on disconnect, retry `start` with backoff
    /// until it sticks or the adapter is stopped.
    async fn watch_adapter(self: &Arc<Self>, adapter: Arc<dyn ChannelAdapter>) {
        let mut backoff = RECONNECT_BASE;
        loop {
            tokio::time::sleep(STATUS_POLL).await;

            // Removed from the map = stopped on purpose.
            if !self.adapters.read().contains_key(adapter.id()) {
                return;
            }

            match adapter.status() {
                AdapterStatus::Connected => {
                    backoff = RECONNECT_BASE;
                }
                AdapterStatus::Stopped => return,
                AdapterStatus::Disconnected { reason } => {
                    tracing::warn!(
                        adapter = %adapter.id(),
                        reason = %reason,
                        backoff_secs = backoff.as_secs(),
                        "adapter disconnected, reconnecting"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                    if let Err(e) = adapter.start(self.gate()).await {
                        tracing::warn!(adapter = %adapter.id(), error = %e, "reconnect failed");
                    }
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_domain::id;
    use hearth_domain::session::{Session, SessionStatus};
    use parking_lot::Mutex;

    struct RecordingHandler {
        store: Arc<Store>,
        delivered: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl InboundHandler for RecordingHandler {
        async fn create_session(&self, envelope: &InboundEnvelope) -> Result<String> {
            let now = Utc::now();
            let session = Session {
                id: id::new_id(id::SESSION),
                workspace_id: envelope.workspace_id.clone(),
                title: "channel session".into(),
                model_id: "m1".into(),
                fallback_models: vec![],
                created_at: now,
                updated_at: now,
                total_tokens: 0,
                total_cost: 0.0,
                status: SessionStatus::Active,
                sequence_counter: 0,
            };
            self.store.create_session(&session)?;
            Ok(session.id)
        }

        async fn deliver(&self, session_id: &str, envelope: InboundEnvelope) {
            self.delivered
                .lock()
                .push((session_id.to_owned(), envelope.content));
        }
    }

    fn envelope(message_id: &str, content: &str) -> InboundEnvelope {
        InboundEnvelope {
            channel_id: "chn_1".into(),
            workspace_id: "ws1".into(),
            external_thread_id: "thread-1".into(),
            sender: "peer-1".into(),
            message_id: Some(message_id.into()),
            content: content.into(),
            attachments: vec![],
        }
    }

    async fn setup() -> (Arc<Store>, Arc<ChannelMultiplexer>, Arc<RecordingHandler>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let handler = Arc::new(RecordingHandler {
            store: store.clone(),
            delivered: Mutex::new(Vec::new()),
        });
        let mux = ChannelMultiplexer::new(store.clone(), bus, handler.clone(), 60, 60);
        (store, mux, handler)
    }

    #[tokio::test]
    async fn unknown_thread_creates_session_and_binds() {
        let (store, mux, handler) = setup().await;
        let gate = mux.gate();

        assert!(gate.submit(envelope("m1", "hello")).await.unwrap());
        // Give the routing task a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let delivered = handler.delivered.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, "hello");

        // The binding is persistent: the next message reuses the session.
        assert!(gate.submit(envelope("m2", "again")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = handler.delivered.lock().clone();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].0, delivered[1].0, "same session for same thread");

        let bound = store.lookup_session_key("chn_1", "thread-1").unwrap();
        assert_eq!(bound.as_deref(), Some(delivered[0].0.as_str()));
    }

    #[tokio::test]
    async fn duplicate_message_id_produces_single_delivery() {
        let (_store, mux, handler) = setup().await;
        let gate = mux.gate();

        assert!(gate.submit(envelope("dup", "first")).await.unwrap());
        // Redelivery: absorbed, reported as non-new.
        assert!(!gate.submit(envelope("dup", "first again")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handler.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn inbound_rate_overflow_is_refused() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let handler = Arc::new(RecordingHandler {
            store: store.clone(),
            delivered: Mutex::new(Vec::new()),
        });
        let mux = ChannelMultiplexer::new(store, bus, handler, 2, 60);
        let gate = mux.gate();

        assert!(gate.submit(envelope("a", "1")).await.unwrap());
        assert!(gate.submit(envelope("b", "2")).await.unwrap());
        let err = gate.submit(envelope("c", "3")).await.unwrap_err();
        assert!(matches!(err, Error::Channel { .. }));
    }
}
