//! Shared error type used across all hearth crates.
//!
//! The taxonomy mirrors how errors propagate at runtime: input errors
//! surface to the caller, provider errors may retry, constraint
//! violations let the orchestrator decide, infrastructure errors are
//! fatal for their scope.

use std::time::Duration;

/// Machine-readable kinds for context-manager constraint violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    ContextLength,
    MaxTools,
    MaxImages,
    MaxOutput,
}

impl ConstraintKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContextLength => "context_length",
            Self::MaxTools => "max_tools",
            Self::MaxImages => "max_images",
            Self::MaxOutput => "max_output",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Provider rejected the request with 429 and all retries were spent.
    /// The orchestrator may route the turn to the session's fallback chain.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("constraint violated ({}): {message}", .kind.as_str())]
    Constraint {
        kind: ConstraintKind,
        message: String,
    },

    #[error("denied by policy {rule}: {reason}")]
    PolicyDenied { rule: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("config: {0}")]
    Config(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("channel {channel}: {message}")]
    Channel { channel: String, message: String },

    #[error("model catalog: {0}")]
    Catalog(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Timeout(_) | Error::RateLimited { .. }
        )
    }

    /// Infrastructure errors are fatal for the owning scope.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Catalog(_))
    }

    /// The wire-level error code used by the HTTP API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io_error",
            Error::Json(_) | Error::InvalidInput(_) => "invalid_input",
            Error::Storage(_) => "storage_unavailable",
            Error::Http(_) => "upstream_http",
            Error::Timeout(_) => "timeout",
            Error::Provider { .. } => "provider_error",
            Error::RateLimited { .. } => "rate_limited",
            Error::Constraint { kind, .. } => kind.as_str(),
            Error::PolicyDenied { .. } => "policy_denied",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "state_conflict",
            Error::Auth(_) => "unauthorized",
            Error::Config(_) => "config_error",
            Error::Tool { .. } => "tool_error",
            Error::Channel { .. } => "channel_error",
            Error::Catalog(_) => "catalog_error",
            Error::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout("t".into()).is_transient());
        assert!(Error::RateLimited { retry_after: None }.is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }

    #[test]
    fn constraint_codes_are_machine_readable() {
        let e = Error::Constraint {
            kind: ConstraintKind::ContextLength,
            message: "too big".into(),
        };
        assert_eq!(e.code(), "context_length");
    }
}
