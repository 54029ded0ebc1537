//! Shared application state passed to all API handlers and workers.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use std::collections::HashMap;

use hearth_bus::EventBus;
use hearth_channels::{ChannelMultiplexer, WebhookAdapter};
use hearth_context::ContextManager;
use hearth_scheduler::Scheduler;
use hearth_domain::config::Config;
use hearth_domain::secret::SecretStore;
use hearth_policy::PolicyEngine;
use hearth_providers::ProviderRegistry;
use hearth_store::Store;
use hearth_tools::Dispatcher;

use crate::devices::DeviceRegistry;
use crate::runtime::approval::ApprovalWaiters;
use crate::runtime::cancel::CancelMap;
use crate::runtime::workers::SessionWorkers;

/// Shared application state. Fields are grouped by concern:
/// - **Core** — config, store, bus
/// - **Decisions** — policy engine, approval waiters, cancel map
/// - **Model plane** — provider registry, context manager
/// - **Execution** — tool dispatcher, session workers, devices
/// - **Edges** — channel multiplexer, secret store, auth
#[derive(Clone)]
pub struct AppState {
    // ── Core ─────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,

    // ── Decisions ────────────────────────────────────────────────────
    pub policy: Arc<PolicyEngine>,
    pub approvals: Arc<ApprovalWaiters>,
    pub cancels: Arc<CancelMap>,

    // ── Model plane ──────────────────────────────────────────────────
    pub providers: Arc<ProviderRegistry>,
    pub context: Arc<ContextManager>,
    /// Caps in-flight provider HTTP calls across all sessions.
    pub llm_slots: Arc<tokio::sync::Semaphore>,

    // ── Execution ────────────────────────────────────────────────────
    pub dispatcher: Arc<Dispatcher>,
    pub workers: Arc<SessionWorkers>,
    pub devices: Arc<DeviceRegistry>,

    // ── Edges ────────────────────────────────────────────────────────
    /// Set once the multiplexer is wired (it needs the state itself for
    /// its inbound handler).
    pub mux: Arc<OnceLock<Arc<ChannelMultiplexer>>>,
    /// Set once the scheduler is wired (same circularity).
    pub scheduler: Arc<OnceLock<Arc<Scheduler>>>,
    /// Live webhook adapters by integration id (the webhook route needs
    /// the concrete type for signature checks).
    pub webhooks: Arc<parking_lot::RwLock<HashMap<String, Arc<WebhookAdapter>>>>,
    pub secrets: Arc<dyn SecretStore>,
    /// SHA-256 of the API bearer token; `None` = dev mode (no auth).
    pub api_token_hash: Option<Vec<u8>>,

    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
