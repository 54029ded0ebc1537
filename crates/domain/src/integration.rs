//! Channel integrations — persisted adapter configurations.
//!
//! The `config` blob is opaque per adapter type. Secrets are never
//! stored inline; the blob carries references the adapter resolves
//! against the external secret store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Connected,
    Disconnected,
    Error,
}

impl IntegrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelIntegration {
    pub id: String,
    /// Adapter type: `"webhook"`, `"telegram"`, `"discord"`, …
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    /// Opaque per-type configuration. Secret values appear only as
    /// references (`"secret_ref": "hearth/webhook-token"`).
    pub config: serde_json::Value,
    pub enabled: bool,
    pub workspace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    pub status: IntegrationStatus,
}
