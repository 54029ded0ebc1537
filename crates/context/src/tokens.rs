//! Token estimation.
//!
//! The runtime never runs a real tokenizer; it estimates from byte
//! length using a per-tokenizer ratio declared in the model catalog.
//! Estimator instances are cached by tokenizer id. Images count at a
//! flat per-image cost.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use hearth_domain::session::MessageContent;

/// Flat token cost attributed to each inline image.
pub const IMAGE_TOKENS: u64 = 768;

/// Bytes-per-token ratio for one tokenizer family.
#[derive(Debug, Clone, Copy)]
pub struct Estimator {
    bytes_per_token: f64,
}

impl Estimator {
    fn for_tokenizer(tokenizer_id: &str) -> Self {
        let bytes_per_token = match tokenizer_id {
            "cl100k" => 4.0,
            "o200k" => 4.2,
            "claude" => 3.8,
            _ => 4.0,
        };
        Self { bytes_per_token }
    }

    pub fn count_text(&self, text_bytes: usize) -> u64 {
        if text_bytes == 0 {
            return 0;
        }
        (text_bytes as f64 / self.bytes_per_token).ceil() as u64
    }

    pub fn count_content(&self, content: &MessageContent) -> u64 {
        self.count_text(content.byte_len()) + content.image_count() as u64 * IMAGE_TOKENS
    }
}

/// Cache of estimator instances keyed by tokenizer id.
#[derive(Default)]
pub struct TokenCounters {
    cache: RwLock<HashMap<String, Arc<Estimator>>>,
}

impl TokenCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tokenizer_id: &str) -> Arc<Estimator> {
        if let Some(estimator) = self.cache.read().get(tokenizer_id) {
            return estimator.clone();
        }
        let estimator = Arc::new(Estimator::for_tokenizer(tokenizer_id));
        self.cache
            .write()
            .insert(tokenizer_id.to_owned(), estimator.clone());
        estimator
    }

    pub fn count(&self, tokenizer_id: &str, content: &MessageContent) -> u64 {
        self.get(tokenizer_id).count_content(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::session::ContentPart;

    #[test]
    fn text_estimate_rounds_up() {
        let counters = TokenCounters::new();
        let content = MessageContent::Text("abcde".into()); // 5 bytes / 4.0
        assert_eq!(counters.count("cl100k", &content), 2);
        assert_eq!(counters.count("cl100k", &MessageContent::Text(String::new())), 0);
    }

    #[test]
    fn images_cost_flat_tokens() {
        let counters = TokenCounters::new();
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "hi".into() },
            ContentPart::Image {
                url: "data:...".into(),
                media_type: None,
            },
        ]);
        assert_eq!(counters.count("cl100k", &content), 1 + IMAGE_TOKENS);
    }

    #[test]
    fn estimators_are_cached_per_tokenizer() {
        let counters = TokenCounters::new();
        let a = counters.get("claude");
        let b = counters.get("claude");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
