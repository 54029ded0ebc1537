//! In-process pub/sub with per-subscriber bounded queues.
//!
//! Delivery guarantees:
//! - at-least-once, ordered per session: events for one session reach a
//!   subscriber in sequence order (a per-session publish lock covers
//!   sequence assignment + fan-out);
//! - unordered and parallel across sessions;
//! - a subscriber never observes the same (session, sequence) twice,
//!   which makes replay + live overlap look exactly-once.
//!
//! Backpressure is per subscriber: `block` makes the publisher wait,
//! `drop-oldest` sheds the front of the queue, `coalesce` replaces an
//! unsent event of the same (topic, session) for topics the
//! subscription declared coalescible.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use hearth_domain::error::Result;
use hearth_domain::event::{Event, Topic, TopicFilter};
use hearth_store::Store;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Publisher waits for queue space.
    #[default]
    Block,
    /// Shed the oldest unsent event (ephemeral consumers).
    DropOldest,
    /// Latest snapshot of the same (topic, session) supersedes prior
    /// unsent ones; non-coalescible topics block.
    Coalesce,
}

/// A subscriber's checkpoint for reconnect replay.
#[derive(Debug, Clone)]
pub struct ReplayCheckpoint {
    pub session_id: String,
    /// Last sequence the subscriber observed; replay starts after it.
    pub last_sequence: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub topics: TopicFilter,
    /// Queue bound; 0 uses the bus default.
    pub capacity: usize,
    pub policy: BackpressurePolicy,
    /// Topics eligible for coalescing under the `Coalesce` policy.
    pub coalescible: Vec<Topic>,
    /// Replay persisted events past these checkpoints before going live.
    pub replay: Vec<ReplayCheckpoint>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriber internals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SubscriberInner {
    id: u64,
    filter: TopicFilter,
    policy: BackpressurePolicy,
    coalescible: HashSet<Topic>,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    /// Highest sequence enqueued per session (duplicate suppression).
    seen: Mutex<HashMap<String, u64>>,
    /// While replay runs, live events park here so replayed (older)
    /// events keep their place in line.
    paused: AtomicBool,
    parked: Mutex<Vec<Event>>,
    data: Notify,
    space: Notify,
    closed: AtomicBool,
}

impl SubscriberInner {
    /// Live-delivery entry point: parks events while replay is
    /// catching the subscriber up.
    async fn deliver(&self, event: Event) {
        if self.paused.load(Ordering::Acquire) {
            self.parked.lock().push(event);
            return;
        }
        self.enqueue(event).await;
    }

    /// Enqueue one event, honoring the backpressure policy.
    async fn enqueue(&self, event: Event) {
        // Per-session duplicate suppression.
        if let (Some(session_id), Some(seq)) = (&event.session_id, event.sequence) {
            let mut seen = self.seen.lock();
            match seen.get(session_id) {
                Some(last) if *last >= seq => return,
                _ => {
                    seen.insert(session_id.clone(), seq);
                }
            }
        }

        loop {
            {
                let mut queue = self.queue.lock();

                if self.policy == BackpressurePolicy::Coalesce
                    && self.coalescible.contains(&event.topic)
                {
                    if let Some(slot) = queue.iter_mut().find(|e| {
                        e.topic == event.topic && e.session_id == event.session_id
                    }) {
                        *slot = event;
                        self.data.notify_one();
                        return;
                    }
                }

                if queue.len() < self.capacity {
                    queue.push_back(event);
                    self.data.notify_one();
                    return;
                }

                match self.policy {
                    BackpressurePolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(event);
                        self.data.notify_one();
                        return;
                    }
                    BackpressurePolicy::Block | BackpressurePolicy::Coalesce => {
                        // Fall through to wait for space.
                    }
                }
            }

            if self.closed.load(Ordering::Acquire) {
                return;
            }
            self.space.notified().await;
        }
    }
}

/// Receiving half handed to the subscriber. Dropping it closes the
/// subscription; the bus prunes closed subscribers on publish.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.data.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        let event = self.inner.queue.lock().pop_front();
        if event.is_some() {
            self.inner.space.notify_one();
        }
        event
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        // Wake any publisher blocked on this queue.
        self.inner.space.notify_waiters();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventBus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventBus {
    store: Arc<Store>,
    default_capacity: usize,
    subscribers: RwLock<Vec<Arc<SubscriberInner>>>,
    next_subscriber_id: AtomicU64,
    /// Serializes sequence assignment + fan-out per session so delivery
    /// order always matches sequence order.
    session_publish_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EventBus {
    pub fn new(store: Arc<Store>, default_capacity: usize) -> Self {
        Self {
            store,
            default_capacity: default_capacity.max(1),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            session_publish_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber, replaying persisted events past the given
    /// checkpoints before live delivery resumes.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription> {
        let capacity = if options.capacity == 0 {
            self.default_capacity
        } else {
            options.capacity
        };
        let replaying = !options.replay.is_empty();
        let inner = Arc::new(SubscriberInner {
            id: self.next_subscriber_id.fetch_add(1, Ordering::Relaxed),
            filter: options.topics,
            policy: options.policy,
            coalescible: options.coalescible.into_iter().collect(),
            capacity,
            queue: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(replaying),
            parked: Mutex::new(Vec::new()),
            data: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
        });

        // Go live immediately (events published during replay park on
        // the subscriber), then replay, then drain the parked tail —
        // the seen-map suppresses any overlap, so the subscriber
        // observes each (session, sequence) once, in order.
        self.subscribers.write().push(inner.clone());

        for checkpoint in &options.replay {
            let events = self
                .store
                .events_after(&checkpoint.session_id, checkpoint.last_sequence)?;
            for event in events {
                if inner.filter.matches(event.topic) {
                    inner.enqueue(event).await;
                }
            }
        }

        if replaying {
            inner.paused.store(false, Ordering::Release);
            let parked: Vec<Event> = std::mem::take(&mut *inner.parked.lock());
            for event in parked {
                inner.enqueue(event).await;
            }
        }

        Ok(Subscription { inner })
    }

    /// Publish an event. Assigns the session's next sequence when
    /// `session_id` is set and `sequence` is omitted, persists
    /// non-ephemeral session events for replay, then fans out. Returns
    /// the event as delivered (sequence filled in).
    pub async fn publish(&self, mut event: Event) -> Result<Event> {
        let session_lock = event.session_id.as_ref().map(|sid| {
            self.session_publish_locks
                .lock()
                .entry(sid.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        });
        let _guard = match &session_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        if let Some(session_id) = event.session_id.clone() {
            if event.sequence.is_none() {
                event.sequence = Some(self.store.next_sequence(&session_id)?);
            }
            if !event.topic.is_ephemeral() {
                self.store.persist_event(&event)?;
            }
        }

        let targets: Vec<Arc<SubscriberInner>> = {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
            subscribers
                .iter()
                .filter(|s| s.filter.matches(event.topic))
                .cloned()
                .collect()
        };

        for subscriber in targets {
            subscriber.deliver(event.clone()).await;
        }

        Ok(event)
    }

    /// Convenience: publish fire-and-forget, logging failures.
    pub async fn publish_or_log(&self, event: Event) {
        let topic = event.topic;
        if let Err(e) = self.publish(event).await {
            tracing::warn!(topic = topic.as_str(), error = %e, "event publish failed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
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

    fn bus() -> (Arc<Store>, EventBus) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone(), 16);
        (store, bus)
    }

    fn session(store: &Store) -> String {
        let now = Utc::now();
        let s = Session {
            id: id::new_id(id::SESSION),
            workspace_id: "ws1".into(),
            title: "t".into(),
            model_id: "m1".into(),
            fallback_models: vec![],
            created_at: now,
            updated_at: now,
            total_tokens: 0,
            total_cost: 0.0,
            status: SessionStatus::Active,
            sequence_counter: 0,
        };
        store.create_session(&s).unwrap();
        s.id
    }

    #[tokio::test]
    async fn sequences_are_assigned_and_ordered() {
        let (store, bus) = bus();
        let sid = session(&store);
        let mut sub = bus.subscribe(SubscribeOptions::default()).await.unwrap();

        for i in 0..5 {
            bus.publish(Event::for_session(
                Topic::SessionMessage,
                sid.clone(),
                serde_json::json!({"i": i}),
            ))
            .await
            .unwrap();
        }

        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(sub.recv().await.unwrap().sequence.unwrap());
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn topic_filter_limits_delivery() {
        let (store, bus) = bus();
        let sid = session(&store);
        let mut sub = bus
            .subscribe(SubscribeOptions {
                topics: TopicFilter::Only(vec![Topic::ToolComplete]),
                ..Default::default()
            })
            .await
            .unwrap();

        bus.publish(Event::for_session(
            Topic::SessionMessage,
            sid.clone(),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
        bus.publish(Event::for_session(
            Topic::ToolComplete,
            sid.clone(),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

        let got = sub.recv().await.unwrap();
        assert_eq!(got.topic, Topic::ToolComplete);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_oldest_sheds_front() {
        let (store, bus) = bus();
        let sid = session(&store);
        let mut sub = bus
            .subscribe(SubscribeOptions {
                capacity: 2,
                policy: BackpressurePolicy::DropOldest,
                ..Default::default()
            })
            .await
            .unwrap();

        for i in 0..4u64 {
            bus.publish(Event::for_session(
                Topic::SessionTokens,
                sid.clone(),
                serde_json::json!({"i": i}),
            ))
            .await
            .unwrap();
        }

        // Only the newest two remain.
        let a = sub.recv().await.unwrap();
        let b = sub.recv().await.unwrap();
        assert_eq!(a.payload["i"], 2);
        assert_eq!(b.payload["i"], 3);
    }

    #[tokio::test]
    async fn coalesce_replaces_unsent_snapshot() {
        let (store, bus) = bus();
        let sid = session(&store);
        let mut sub = bus
            .subscribe(SubscribeOptions {
                capacity: 8,
                policy: BackpressurePolicy::Coalesce,
                coalescible: vec![Topic::SessionTokens],
                ..Default::default()
            })
            .await
            .unwrap();

        for i in 0..3u64 {
            bus.publish(Event::for_session(
                Topic::SessionTokens,
                sid.clone(),
                serde_json::json!({"tokens": i}),
            ))
            .await
            .unwrap();
        }

        let got = sub.recv().await.unwrap();
        assert_eq!(got.payload["tokens"], 2, "latest snapshot wins");
        assert!(sub.try_recv().is_none(), "prior snapshots superseded");
    }

    #[tokio::test]
    async fn block_policy_waits_for_space() {
        let (store, bus) = bus();
        let bus = Arc::new(bus);
        let sid = session(&store);
        let mut sub = bus
            .subscribe(SubscribeOptions {
                capacity: 1,
                policy: BackpressurePolicy::Block,
                ..Default::default()
            })
            .await
            .unwrap();

        bus.publish(Event::for_session(
            Topic::SessionMessage,
            sid.clone(),
            serde_json::json!({"n": 1}),
        ))
        .await
        .unwrap();

        // Second publish must wait until the subscriber drains.
        let bus2 = bus.clone();
        let sid2 = sid.clone();
        let publisher = tokio::spawn(async move {
            bus2.publish(Event::for_session(
                Topic::SessionMessage,
                sid2,
                serde_json::json!({"n": 2}),
            ))
            .await
            .unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!publisher.is_finished(), "publisher should be blocked");

        assert_eq!(sub.recv().await.unwrap().payload["n"], 1);
        publisher.await.unwrap();
        assert_eq!(sub.recv().await.unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn replay_then_live_without_duplicates() {
        let (store, bus) = bus();
        let sid = session(&store);

        // Three persisted events before the subscriber connects.
        for i in 1..=3u64 {
            bus.publish(Event::for_session(
                Topic::SessionMessage,
                sid.clone(),
                serde_json::json!({"i": i}),
            ))
            .await
            .unwrap();
        }

        // Reconnect claiming to have seen sequence 1.
        let mut sub = bus
            .subscribe(SubscribeOptions {
                replay: vec![ReplayCheckpoint {
                    session_id: sid.clone(),
                    last_sequence: 1,
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        // A live event after subscribing.
        bus.publish(Event::for_session(
            Topic::SessionMessage,
            sid.clone(),
            serde_json::json!({"i": 4}),
        ))
        .await
        .unwrap();

        let mut seqs = Vec::new();
        for _ in 0..3 {
            seqs.push(sub.recv().await.unwrap().sequence.unwrap());
        }
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(sub.try_recv().is_none(), "no duplicate deliveries");
    }

    #[tokio::test]
    async fn ephemeral_events_are_not_replayed() {
        let (store, bus) = bus();
        let sid = session(&store);

        bus.publish(Event::for_session(
            Topic::SessionTokens,
            sid.clone(),
            serde_json::json!({"t": 1}),
        ))
        .await
        .unwrap();

        let mut sub = bus
            .subscribe(SubscribeOptions {
                replay: vec![ReplayCheckpoint {
                    session_id: sid.clone(),
                    last_sequence: 0,
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let (store, bus) = bus();
        let sid = session(&store);
        let sub = bus.subscribe(SubscribeOptions::default()).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(Event::for_session(
            Topic::SessionMessage,
            sid,
            serde_json::json!({}),
        ))
        .await
        .unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
