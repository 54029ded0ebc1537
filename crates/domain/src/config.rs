//! Runtime configuration.
//!
//! All configuration is file-driven (`hearth.toml`) except a small set
//! of environment overrides: `HEARTH_LISTEN`, `HEARTH_DATA_DIR`,
//! `HEARTH_CATALOG_URL`, and the API token env var named by
//! `server.api_token_env`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Env var holding the API bearer token. Unset/empty = dev mode.
    #[serde(default = "default_token_env")]
    pub api_token_env: String,
}

fn default_listen() -> String {
    "127.0.0.1:7171".to_string()
}
fn default_token_env() -> String {
    "HEARTH_API_TOKEN".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_token_env: default_token_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_id")]
    pub id: String,
    /// Root directory that path arguments must stay inside.
    pub root: PathBuf,
}

fn default_workspace_id() -> String {
    "default".to_string()
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            id: default_workspace_id(),
            root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub url: String,
    #[serde(default = "default_catalog_ttl")]
    pub ttl_secs: u64,
}

fn default_catalog_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
    #[serde(default = "default_summarize_ratio")]
    pub summarize_ratio: f64,
    /// The last K assistant messages are never summarized away.
    #[serde(default = "default_keep_last_assistant")]
    pub keep_last_assistant: usize,
    /// Minimum share of the context window a summarized prefix must
    /// cover for summarization to be worthwhile.
    #[serde(default = "default_prefix_ratio")]
    pub summarize_prefix_ratio: f64,
    /// Cheaper model used for summarization calls; falls back to the
    /// session model when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer_model: Option<String>,
}

fn default_warn_ratio() -> f64 {
    0.80
}
fn default_summarize_ratio() -> f64 {
    0.90
}
fn default_keep_last_assistant() -> usize {
    3
}
fn default_prefix_ratio() -> f64 {
    0.20
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            warn_ratio: default_warn_ratio(),
            summarize_ratio: default_summarize_ratio(),
            keep_last_assistant: default_keep_last_assistant(),
            summarize_prefix_ratio: default_prefix_ratio(),
            summarizer_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long an `ask` decision waits for a human before it becomes a
    /// deny with reason `timeout`.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
    #[serde(default = "default_max_tool_loops")]
    pub max_tool_loops: usize,
    /// Archive sessions idle for this many hours. Unset = never.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_archive_hours: Option<u64>,
}

fn default_approval_timeout() -> u64 {
    300
}
fn default_max_tool_loops() -> usize {
    25
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout(),
            max_tool_loops: default_max_tool_loops(),
            idle_archive_hours: None,
        }
    }
}

/// A configured tool provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolProviderConfig {
    Stdio {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        name: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_secret_ref: Option<String>,
    },
}

impl ToolProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Stdio { name, .. } | Self::Http { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub providers: Vec<ToolProviderConfig>,
    #[serde(default = "default_tool_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_provider_concurrency")]
    pub max_concurrent_per_provider: usize,
}

fn default_tool_timeout() -> u64 {
    60
}
fn default_provider_concurrency() -> usize {
    4
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            default_timeout_secs: default_tool_timeout(),
            max_concurrent_per_provider: default_provider_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Workspace-wide cost ceiling across all task runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_budget_usd: Option<f64>,
    /// Pause a task whose own budget is exceeded.
    #[serde(default = "yes")]
    pub pause_on_budget_exceeded: bool,
}

fn default_workers() -> usize {
    8
}
fn yes() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            workspace_budget_usd: None,
            pause_on_budget_exceeded: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages_per_session: usize,
    #[serde(default = "default_max_children")]
    pub max_tool_children: usize,
    #[serde(default = "default_max_inflight")]
    pub max_inflight_provider_calls: usize,
    /// Requests per minute per workspace before the policy engine
    /// answers `rate_limited`.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tool_calls_per_minute")]
    pub tool_calls_per_minute: u32,
}

fn default_max_sessions() -> usize {
    10_000
}
fn default_max_messages() -> usize {
    10_000
}
fn default_max_children() -> usize {
    32
}
fn default_max_inflight() -> usize {
    128
}
fn default_requests_per_minute() -> u32 {
    120
}
fn default_tool_calls_per_minute() -> u32 {
    60
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_messages_per_session: default_max_messages(),
            max_tool_children: default_max_children(),
            max_inflight_provider_calls: default_max_inflight(),
            requests_per_minute: default_requests_per_minute(),
            tool_calls_per_minute: default_tool_calls_per_minute(),
        }
    }
}

/// Connection details for one LLM provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmEndpointConfig {
    pub base_url: String,
    /// Secret-store reference for the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Keyed by wire-format family (`"openai"`, `"anthropic"`).
    #[serde(default)]
    pub endpoints: HashMap<String, LlmEndpointConfig>,
    /// Default model for new sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Per-model fallback chains applied at session creation.
    #[serde(default)]
    pub fallbacks: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Default per-subscriber queue bound.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Parse the config file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("HEARTH_LISTEN") {
            if !listen.is_empty() {
                self.server.listen = listen;
            }
        }
        if let Ok(dir) = std::env::var("HEARTH_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(url) = std::env::var("HEARTH_CATALOG_URL") {
            if !url.is_empty() {
                self.catalog.url = url;
            }
        }
    }

    /// Sanity-check the configuration. Errors prevent startup.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.catalog.url.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "catalog.url must be set".into(),
            });
        }
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: format!("server.listen is not a socket address: {}", self.server.listen),
            });
        }
        if !(0.0..=1.0).contains(&self.context.warn_ratio)
            || !(0.0..=1.0).contains(&self.context.summarize_ratio)
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "context ratios must be within 0.0..=1.0".into(),
            });
        }
        if self.context.warn_ratio > self.context.summarize_ratio {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "context.warn_ratio exceeds summarize_ratio; warnings will lag".into(),
            });
        }
        if self.llm.endpoints.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "no [llm.endpoints] configured — model calls will fail".into(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.tools.providers {
            if !seen.insert(p.name().to_owned()) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("duplicate tool provider name: {}", p.name()),
                });
            }
        }
        let stdio_children = self
            .tools
            .providers
            .iter()
            .filter(|p| matches!(p, ToolProviderConfig::Stdio { .. }))
            .count();
        if stdio_children > self.limits.max_tool_children {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: format!(
                    "{} stdio tool providers configured, limits.max_tool_children is {}",
                    stdio_children, self.limits.max_tool_children
                ),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
            data_dir = "/tmp/hearth"
            [catalog]
            url = "https://models.example/catalog.json"
            [workspace]
            root = "/tmp/ws"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let c = minimal();
        assert_eq!(c.server.listen, "127.0.0.1:7171");
        assert_eq!(c.context.warn_ratio, 0.80);
        assert_eq!(c.context.summarize_ratio, 0.90);
        assert_eq!(c.limits.max_messages_per_session, 10_000);
        assert_eq!(c.tools.default_timeout_secs, 60);
        assert_eq!(c.scheduler.workers, 8);
    }

    #[test]
    fn validate_flags_bad_listen() {
        let mut c = minimal();
        c.server.listen = "not-an-addr".into();
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("server.listen")));
    }

    #[test]
    fn validate_flags_duplicate_tool_provider() {
        let mut c = minimal();
        c.tools.providers = vec![
            ToolProviderConfig::Stdio {
                name: "fs".into(),
                command: "hearth-fs".into(),
                args: vec![],
            },
            ToolProviderConfig::Http {
                name: "fs".into(),
                url: "http://localhost:9000".into(),
                auth_secret_ref: None,
            },
        ];
        assert!(c
            .validate()
            .iter()
            .any(|i| i.message.contains("duplicate tool provider")));
    }
}
