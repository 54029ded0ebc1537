//! The channel adapter capability.
//!
//! Adapters are capability-shaped, not inheritance-shaped: the
//! multiplexer only ever calls `{start, stop, send, status}` plus the
//! declared limits, never introspecting adapter internals.

use serde::{Deserialize, Serialize};

use hearth_domain::error::Result;

/// A transport message normalized into the runtime's vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Integration id of the adapter that produced this.
    pub channel_id: String,
    pub workspace_id: String,
    /// Stable per-conversation key on the remote transport.
    pub external_thread_id: String,
    /// Remote identity of the sender (rate-limit key).
    pub sender: String,
    /// Transport-native message id, for redelivery dedupe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

/// A reply on its way out through an adapter.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub external_thread_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    Connected,
    Disconnected { reason: String },
    Stopped,
}

/// Declared rate limits, applied per remote identity.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    pub inbound_per_minute: u32,
    pub outbound_per_minute: u32,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            inbound_per_minute: 60,
            outbound_per_minute: 60,
        }
    }
}

#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The integration id this adapter instance serves.
    fn id(&self) -> &str;

    /// Adapter type (`"webhook"`, `"telegram"`, …).
    fn kind(&self) -> &str;

    fn limits(&self) -> ChannelLimits {
        ChannelLimits::default()
    }

    /// Bring up the transport. The gate is how inbound messages enter
    /// the runtime; the adapter keeps it for its connection lifetime.
    async fn start(&self, gate: crate::mux::InboundGate) -> Result<()>;

    async fn stop(&self);

    /// Deliver one outbound message. Transport-specific retries are the
    /// adapter's responsibility; a returned error is persistent.
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    fn status(&self) -> AdapterStatus;
}
