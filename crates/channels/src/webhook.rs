//! Webhook adapter.
//!
//! Inbound messages arrive as HTTP posts on the gateway's webhook
//! route, optionally signed with HMAC-SHA256 over the raw body.
//! Outbound replies POST to the configured reply URL.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use hearth_domain::error::{Error, Result};
use hearth_domain::integration::ChannelIntegration;
use hearth_domain::secret::SecretStore;

use crate::adapter::{AdapterStatus, ChannelAdapter, InboundEnvelope, OutboundMessage};
use crate::mux::InboundGate;

/// Per-integration webhook settings (the opaque config blob).
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Secret-store reference for the HMAC signing key. Unsigned
    /// webhooks are accepted when unset.
    #[serde(default)]
    pub secret_ref: Option<String>,
    /// Where outbound replies are POSTed. Reply-less integrations may
    /// omit it.
    #[serde(default)]
    pub reply_url: Option<String>,
}

/// Body shape accepted on the inbound webhook route.
#[derive(Debug, Deserialize)]
pub struct WebhookInbound {
    pub thread_id: String,
    pub sender: String,
    pub text: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

pub struct WebhookAdapter {
    integration_id: String,
    workspace_id: String,
    config: WebhookConfig,
    secrets: Arc<dyn SecretStore>,
    client: reqwest::Client,
    gate: RwLock<Option<InboundGate>>,
    status: RwLock<AdapterStatus>,
}

impl WebhookAdapter {
    pub fn from_integration(
        integration: &ChannelIntegration,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        let config: WebhookConfig = serde_json::from_value(integration.config.clone())
            .map_err(|e| Error::Channel {
                channel: integration.id.clone(),
                message: format!("invalid webhook config: {e}"),
            })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            integration_id: integration.id.clone(),
            workspace_id: integration.workspace_id.clone(),
            config,
            secrets,
            client,
            gate: RwLock::new(None),
            status: RwLock::new(AdapterStatus::Stopped),
        })
    }

    /// Verify `X-Hearth-Signature: sha256=<hex>` over the raw body.
    pub fn verify_signature(&self, body: &[u8], signature_header: Option<&str>) -> Result<()> {
        let Some(secret_ref) = &self.config.secret_ref else {
            return Ok(());
        };
        let provided = signature_header
            .and_then(|h| h.strip_prefix("sha256="))
            .ok_or_else(|| Error::Auth("missing webhook signature".into()))?;
        let provided = hex::decode(provided.trim())
            .map_err(|_| Error::Auth("malformed webhook signature".into()))?;

        let key = self.secrets.get(secret_ref)?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&key)
            .map_err(|_| Error::Auth("webhook secret unusable".into()))?;
        mac.update(body);
        let expected = mac.finalize().into_bytes();

        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(Error::Auth("webhook signature mismatch".into()));
        }
        Ok(())
    }

    /// Called by the gateway's webhook route with a verified body.
    pub async fn handle_inbound(&self, inbound: WebhookInbound) -> Result<bool> {
        let gate = self.gate.read().clone().ok_or_else(|| Error::Channel {
            channel: self.integration_id.clone(),
            message: "adapter not started".into(),
        })?;
        gate.submit(InboundEnvelope {
            channel_id: self.integration_id.clone(),
            workspace_id: self.workspace_id.clone(),
            external_thread_id: inbound.thread_id,
            sender: inbound.sender,
            message_id: inbound.message_id,
            content: inbound.text,
            attachments: inbound.attachments,
        })
        .await
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn id(&self) -> &str {
        &self.integration_id
    }

    fn kind(&self) -> &str {
        "webhook"
    }

    async fn start(&self, gate: InboundGate) -> Result<()> {
        *self.gate.write() = Some(gate);
        *self.status.write() = AdapterStatus::Connected;
        Ok(())
    }

    async fn stop(&self) {
        *self.gate.write() = None;
        *self.status.write() = AdapterStatus::Stopped;
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let Some(reply_url) = &self.config.reply_url else {
            // Reply-less webhook: outbound is a no-op.
            return Ok(());
        };
        let resp = self
            .client
            .post(reply_url)
            .json(&serde_json::json!({
                "thread_id": message.external_thread_id,
                "text": message.content,
            }))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Channel {
                channel: self.integration_id.clone(),
                message: format!("reply endpoint returned HTTP {}", resp.status().as_u16()),
            });
        }
        Ok(())
    }

    fn status(&self) -> AdapterStatus {
        self.status.read().clone()
    }
}
