//! Model catalog schema.
//!
//! The catalog is an external collaborator fetched at startup and
//! cached with a TTL; the runtime depends only on this schema, never on
//! specific entries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-provider overrides of the base constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    /// Wire-format family: `"openai"` or `"anthropic"`.
    pub provider: String,
    pub context_length: u64,
    /// Tokenizer id used for client-side estimation
    /// (`"cl100k"`, `"o200k"`, `"claude"`).
    pub tokenizer: String,
    pub max_completion_tokens: u64,
    #[serde(default = "default_max_tools")]
    pub max_tools_per_request: usize,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_tool_calls: usize,
    #[serde(default = "default_max_images")]
    pub max_images_per_request: usize,
    pub pricing_input_per_million: f64,
    pub pricing_output_per_million: f64,
    #[serde(default = "yes")]
    pub supports_streaming: bool,
    #[serde(default = "yes")]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_caching: bool,
    #[serde(default)]
    pub provider_overrides: HashMap<String, ProviderOverrides>,
}

fn default_max_tools() -> usize {
    128
}
fn default_max_parallel() -> usize {
    4
}
fn default_max_images() -> usize {
    20
}
fn yes() -> bool {
    true
}

impl ModelDescriptor {
    /// Effective context length after provider overrides.
    pub fn effective_context_length(&self) -> u64 {
        self.provider_overrides
            .get(&self.provider)
            .and_then(|o| o.context_length)
            .unwrap_or(self.context_length)
    }

    pub fn effective_max_completion(&self) -> u64 {
        self.provider_overrides
            .get(&self.provider)
            .and_then(|o| o.max_completion_tokens)
            .unwrap_or(self.max_completion_tokens)
    }

    /// Cost in USD for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.pricing_input_per_million
            + output_tokens as f64 * self.pricing_output_per_million)
            / 1_000_000.0
    }
}

/// The catalog document: a list of model descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m1() -> ModelDescriptor {
        ModelDescriptor {
            id: "m1".into(),
            provider: "openai".into(),
            context_length: 4_000,
            tokenizer: "cl100k".into(),
            max_completion_tokens: 1_000,
            max_tools_per_request: 128,
            max_parallel_tool_calls: 4,
            max_images_per_request: 20,
            pricing_input_per_million: 1.0,
            pricing_output_per_million: 2.0,
            supports_streaming: true,
            supports_tools: true,
            supports_caching: false,
            provider_overrides: HashMap::new(),
        }
    }

    #[test]
    fn cost_per_million() {
        // 1 input token at $1/M + 1 output token at $2/M = 3e-6.
        let c = m1().cost(1, 1);
        assert!((c - 3e-6).abs() < 1e-12);
    }

    #[test]
    fn overrides_take_precedence() {
        let mut m = m1();
        m.provider_overrides.insert(
            "openai".into(),
            ProviderOverrides {
                context_length: Some(2_000),
                max_completion_tokens: None,
            },
        );
        assert_eq!(m.effective_context_length(), 2_000);
        assert_eq!(m.effective_max_completion(), 1_000);
    }
}
