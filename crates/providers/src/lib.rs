//! LLM gateway: provider-agnostic request building, streaming
//! receivers, retry/fallback, cost attribution, and the model catalog
//! client.
//!
//! Adapters translate between the internal types and each provider
//! family's HTTP wire format. Two families are supported: OpenAI-
//! compatible and Anthropic.

pub mod anthropic;
pub mod catalog;
pub mod openai;
pub mod registry;
pub mod retry;
mod sse;
pub mod traits;

pub use registry::ProviderRegistry;
pub use traits::{ChatMessage, ChatRequest, ChatResponse, LlmProvider};

use hearth_domain::error::Error;

/// Convert a [`reqwest::Error`] into the domain error type. Timeouts
/// map to [`Error::Timeout`]; everything else to [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Map a non-success HTTP response to the retry-aware error taxonomy:
/// 429 → `RateLimited` (with `Retry-After` when present), 5xx → `Http`
/// (transient), anything else → `Provider` (permanent).
pub(crate) fn status_error(
    provider: &str,
    status: reqwest::StatusCode,
    retry_after: Option<std::time::Duration>,
    body: &str,
) -> Error {
    if status.as_u16() == 429 {
        return Error::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return Error::Http(format!("{provider}: HTTP {} - {body}", status.as_u16()));
    }
    Error::Provider {
        provider: provider.to_owned(),
        message: format!("HTTP {} - {body}", status.as_u16()),
    }
}

/// Parse a `Retry-After` header value (seconds form).
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<std::time::Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(std::time::Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let headers = reqwest::header::HeaderMap::new();
        let e = status_error(
            "openai",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            parse_retry_after(&headers),
            "slow down",
        );
        assert!(matches!(e, Error::RateLimited { retry_after: None }));

        let e = status_error("openai", reqwest::StatusCode::BAD_GATEWAY, None, "oops");
        assert!(matches!(e, Error::Http(_)));
        assert!(e.is_transient());

        let e = status_error("openai", reqwest::StatusCode::BAD_REQUEST, None, "bad");
        assert!(matches!(e, Error::Provider { .. }));
        assert!(!e.is_transient());
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(
            parse_retry_after(&headers),
            Some(std::time::Duration::from_secs(7))
        );
    }
}
