//! Context manager — maintains the per-session view of messages sent
//! to the model, enforces token thresholds, runs the summarization
//! protocol, and validates provider constraints.
//!
//! The view excludes messages covered by a later summary (or by hard
//! truncation); summaries count their own tokens; nothing is counted
//! twice.

pub mod constraints;
pub mod summarize;
pub mod tokens;

pub use summarize::{Summarizer, TRUNCATED};
pub use tokens::TokenCounters;

use std::sync::Arc;

use hearth_domain::catalog::ModelDescriptor;
use hearth_domain::config::ContextConfig;
use hearth_domain::error::{ConstraintKind, Error, Result};
use hearth_domain::session::{Message, Role, Session};
use hearth_domain::tool::ToolDefinition;
use hearth_providers::{ChatMessage, ChatRequest};
use hearth_store::Store;

/// The request handed to the gateway plus what it took to build it.
pub struct PreparedContext {
    pub request: ChatRequest,
    /// Token count of the view + system prompt (the context pressure).
    pub input_tokens: u64,
    /// Pressure crossed `warn_ratio`.
    pub warned: bool,
    /// A summarization ran while preparing.
    pub summarized: bool,
    /// Number of messages dropped by hard truncation (0 normally).
    pub truncated: usize,
}

pub struct ContextManager {
    store: Arc<Store>,
    config: ContextConfig,
    counters: TokenCounters,
}

impl ContextManager {
    pub fn new(store: Arc<Store>, config: ContextConfig) -> Self {
        Self {
            store,
            config,
            counters: TokenCounters::new(),
        }
    }

    pub fn counters(&self) -> &TokenCounters {
        &self.counters
    }

    /// Count tokens the way this model's tokenizer would.
    pub fn count(&self, descriptor: &ModelDescriptor, content: &hearth_domain::session::MessageContent) -> u64 {
        self.counters.count(&descriptor.tokenizer, content)
    }

    /// Token weight of one stored message: measured counts when the
    /// row has them, estimate otherwise.
    fn token_of(&self, descriptor: &ModelDescriptor, message: &Message) -> u64 {
        let stored = message.token_total();
        if stored > 0 {
            stored
        } else {
            self.counters.count(&descriptor.tokenizer, &message.content)
        }
    }

    /// Build the wire request for a session turn. The pending user
    /// message is already persisted. Summarizes (at most twice) when
    /// pressure crosses `summarize_ratio`, falling back to hard
    /// truncation when the summarizer is unavailable or the prefix is
    /// too small to be worth summarizing.
    pub async fn prepare(
        &self,
        session: &Session,
        descriptor: &ModelDescriptor,
        system_prompt: &str,
        tools: Vec<ToolDefinition>,
        summarizer: Option<Summarizer<'_>>,
        max_output: Option<u64>,
    ) -> Result<PreparedContext> {
        let limit = descriptor.effective_context_length();
        let summarize_limit = (limit as f64 * self.config.summarize_ratio) as u64;
        let warn_limit = (limit as f64 * self.config.warn_ratio) as u64;
        let min_prefix = (limit as f64 * self.config.summarize_prefix_ratio) as u64;

        let system_tokens = self
            .counters
            .get(&descriptor.tokenizer)
            .count_text(system_prompt.len());

        let mut summarized = false;
        let mut truncated = 0;

        // Up to two passes: summarize, re-check, summarize again, then
        // truncate if the view still does not fit.
        for _pass in 0..2 {
            let visible = self.store.visible_messages(&session.id)?;
            let pressure: u64 = system_tokens
                + visible
                    .iter()
                    .map(|m| self.token_of(descriptor, m))
                    .sum::<u64>();
            if pressure <= summarize_limit {
                break;
            }

            let outcome = match &summarizer {
                Some(s) => {
                    let candidates = summarize::select_prefix(
                        &visible,
                        self.config.keep_last_assistant,
                        min_prefix,
                        |m| self.token_of(descriptor, m),
                    );
                    match candidates {
                        Some(candidates) => {
                            summarize::run_summarization(
                                &self.store,
                                &self.counters,
                                &session.id,
                                &candidates,
                                s,
                            )
                            .await
                        }
                        None => Err(Error::Other("prefix too small to summarize".into())),
                    }
                }
                None => Err(Error::Other("no summarizer available".into())),
            };

            match outcome {
                Ok(_) => {
                    summarized = true;
                    self.store.sync_session_tokens(&session.id)?;
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "summarization unavailable, truncating");
                    let visible = self.store.visible_messages(&session.id)?;
                    truncated += summarize::truncate_to_fit(
                        &self.store,
                        &session.id,
                        &visible,
                        self.config.keep_last_assistant,
                        summarize_limit,
                        system_tokens,
                        |m| self.token_of(descriptor, m),
                    )?;
                    self.store.sync_session_tokens(&session.id)?;
                    break;
                }
            }
        }

        // Assemble the final view.
        let visible = self.store.visible_messages(&session.id)?;
        let input_tokens: u64 = system_tokens
            + visible
                .iter()
                .map(|m| self.token_of(descriptor, m))
                .sum::<u64>();

        let mut messages = Vec::with_capacity(visible.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        for message in &visible {
            messages.push(to_chat_message(message));
        }

        let request = ChatRequest {
            model_id: descriptor.id.clone(),
            messages,
            tools,
            max_output: max_output.or(Some(descriptor.effective_max_completion())),
            cache_control: descriptor.supports_caching,
        };

        // A request that still exceeds the window fails with
        // `context_exceeded` semantics, never silent truncation.
        constraints::check_request(descriptor, &request, input_tokens).map_err(|e| match e {
            Error::Constraint {
                kind: ConstraintKind::ContextLength,
                message,
            } if summarized || truncated > 0 => Error::Constraint {
                kind: ConstraintKind::ContextLength,
                message: format!("{message} (after summarization)"),
            },
            other => other,
        })?;

        Ok(PreparedContext {
            request,
            input_tokens,
            warned: input_tokens > warn_limit,
            summarized,
            truncated,
        })
    }
}

/// Convert a stored row to its wire form. Summaries travel as system
/// messages so every provider family renders them.
fn to_chat_message(message: &Message) -> ChatMessage {
    match message.role {
        Role::Summary => ChatMessage::system(format!(
            "Summary of earlier conversation:\n{}",
            message.content.extract_all_text()
        )),
        role => ChatMessage {
            role,
            content: message.content.clone(),
        },
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
    use hearth_domain::session::{MessageContent, SessionStatus};
    use hearth_domain::stream::{BoxStream, StreamEvent, Usage};
    use hearth_providers::{ChatResponse, LlmProvider};

    struct FixedSummarizer;

    #[async_trait::async_trait]
    impl LlmProvider for FixedSummarizer {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: "summary of the earlier exchange".into(),
                tool_calls: vec![],
                usage: Some(Usage {
                    input_tokens: 50,
                    output_tokens: 8,
                    cache_read_tokens: 0,
                }),
                model: "m1".into(),
                finish_reason: Some("stop".into()),
            })
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            Err(Error::Other("not used".into()))
        }

        fn family(&self) -> &str {
            "openai"
        }
    }

    struct BrokenSummarizer;

    #[async_trait::async_trait]
    impl LlmProvider for BrokenSummarizer {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Err(Error::Http("503".into()))
        }
        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            Err(Error::Other("not used".into()))
        }
        fn family(&self) -> &str {
            "openai"
        }
    }

    fn descriptor(context_length: u64) -> ModelDescriptor {
        ModelDescriptor {
            id: "m2".into(),
            provider: "openai".into(),
            context_length,
            tokenizer: "cl100k".into(),
            max_completion_tokens: 500,
            max_tools_per_request: 16,
            max_parallel_tool_calls: 4,
            max_images_per_request: 4,
            pricing_input_per_million: 1.0,
            pricing_output_per_million: 2.0,
            supports_streaming: true,
            supports_tools: true,
            supports_caching: false,
            provider_overrides: Default::default(),
        }
    }

    fn setup() -> (Arc<Store>, ContextManager, Session) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = ContextManager::new(store.clone(), ContextConfig::default());
        let now = Utc::now();
        let session = Session {
            id: id::new_id(id::SESSION),
            workspace_id: "ws1".into(),
            title: "t".into(),
            model_id: "m2".into(),
            fallback_models: vec![],
            created_at: now,
            updated_at: now,
            total_tokens: 0,
            total_cost: 0.0,
            status: SessionStatus::Active,
            sequence_counter: 0,
        };
        store.create_session(&session).unwrap();
        (store, manager, session)
    }

    fn add_message(store: &Store, session_id: &str, role: Role, tokens: u64) -> Message {
        let message = Message {
            id: id::new_id(id::MESSAGE),
            session_id: session_id.into(),
            role,
            content: MessageContent::Text(format!("{} message", role.as_str())),
            tool_call_id: None,
            tokens_in: tokens,
            tokens_out: 0,
            created_at: store.now(),
            is_summary: role == Role::Summary,
            covered_by: None,
        };
        store.append_message(&message).unwrap();
        message
    }

    #[tokio::test]
    async fn small_context_passes_through() {
        let (store, manager, session) = setup();
        add_message(&store, &session.id, Role::User, 10);

        let prepared = manager
            .prepare(&session, &descriptor(1000), "system", vec![], None, None)
            .await
            .unwrap();
        assert!(!prepared.summarized);
        assert!(!prepared.warned);
        assert_eq!(prepared.truncated, 0);
        // system + one user message
        assert_eq!(prepared.request.messages.len(), 2);
    }

    #[tokio::test]
    async fn summarization_fires_past_ratio_and_restores_headroom() {
        let (store, manager, session) = setup();
        // 800 tokens of history then a 150-token user message → over
        // 0.9 × 1000.
        for _ in 0..8 {
            add_message(&store, &session.id, Role::User, 50);
            add_message(&store, &session.id, Role::Assistant, 50);
        }
        add_message(&store, &session.id, Role::User, 150);

        let desc = descriptor(1000);
        let provider = FixedSummarizer;
        let prepared = manager
            .prepare(
                &session,
                &desc,
                "",
                vec![],
                Some(Summarizer {
                    provider: &provider,
                    descriptor: &desc,
                }),
                None,
            )
            .await
            .unwrap();

        assert!(prepared.summarized);
        // Invariant: pressure after summarization is under the ratio.
        assert!(
            prepared.input_tokens < 900,
            "pressure {} should be < summarize threshold",
            prepared.input_tokens
        );
        // The user message is still the last visible message.
        let last = prepared.request.messages.last().unwrap();
        assert_eq!(last.role, Role::User);

        // One summary row exists and covers a prefix; originals remain.
        let all = store.messages_by_session(&session.id).unwrap();
        assert!(all.iter().any(|m| m.is_summary));
        assert!(all.iter().any(|m| m.covered_by.is_some()));

        // Session accounting matches the visible sum.
        let s = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(s.total_tokens, store.visible_token_sum(&session.id).unwrap());
        // The summarization call accrued its own cost.
        assert!(s.total_cost > 0.0);
    }

    #[tokio::test]
    async fn broken_summarizer_falls_back_to_truncation() {
        let (store, manager, session) = setup();
        for _ in 0..10 {
            add_message(&store, &session.id, Role::User, 60);
            add_message(&store, &session.id, Role::Assistant, 40);
        }

        let desc = descriptor(1000);
        let provider = BrokenSummarizer;
        let prepared = manager
            .prepare(
                &session,
                &desc,
                "",
                vec![],
                Some(Summarizer {
                    provider: &provider,
                    descriptor: &desc,
                }),
                None,
            )
            .await
            .unwrap();

        assert!(!prepared.summarized);
        assert!(prepared.truncated > 0);
        assert!(prepared.input_tokens <= 900);

        // Truncated rows carry the sentinel, not a summary id.
        let all = store.messages_by_session(&session.id).unwrap();
        assert!(all
            .iter()
            .any(|m| m.covered_by.as_deref() == Some(TRUNCATED)));
    }

    #[tokio::test]
    async fn last_assistant_messages_are_protected() {
        let (store, manager, session) = setup();
        for _ in 0..10 {
            add_message(&store, &session.id, Role::User, 60);
            add_message(&store, &session.id, Role::Assistant, 40);
        }

        let desc = descriptor(1000);
        let provider = FixedSummarizer;
        manager
            .prepare(
                &session,
                &desc,
                "",
                vec![],
                Some(Summarizer {
                    provider: &provider,
                    descriptor: &desc,
                }),
                None,
            )
            .await
            .unwrap();

        // The last 3 assistant messages must still be visible.
        let visible = store.visible_messages(&session.id).unwrap();
        let assistants = visible.iter().filter(|m| m.role == Role::Assistant).count();
        assert!(assistants >= 3, "kept {assistants} assistant messages");
    }

    #[tokio::test]
    async fn warn_threshold_reports_without_mutating() {
        let (store, manager, session) = setup();
        // 850 tokens: past warn (800) but under summarize (900).
        for _ in 0..17 {
            add_message(&store, &session.id, Role::User, 50);
        }

        let prepared = manager
            .prepare(&session, &descriptor(1000), "", vec![], None, None)
            .await
            .unwrap();
        assert!(prepared.warned);
        assert!(!prepared.summarized);
        assert_eq!(prepared.truncated, 0);
    }
}
