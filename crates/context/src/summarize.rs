//! Summarization protocol and the hard-truncation fallback.
//!
//! A summary is an LLM call with a reserved purpose: it consumes its
//! own tokens, accrues its own cost, and is audited separately. The
//! summarized prefix stays in the store; coverage marking excludes it
//! from the context view.

use hearth_domain::audit::{AuditEntry, AuditOutcome};
use hearth_domain::catalog::ModelDescriptor;
use hearth_domain::error::{Error, Result};
use hearth_domain::id;
use hearth_domain::session::{Message, MessageContent, Role};
use hearth_domain::tool::ToolDefinition;
use hearth_providers::{ChatMessage, ChatRequest, LlmProvider};
use hearth_store::Store;

use crate::tokens::TokenCounters;

/// `covered_by` sentinel for rows excluded by hard truncation rather
/// than by a summary.
pub const TRUNCATED: &str = "truncated";

/// The summarizer to use: a provider plus the model it should run as
/// (the session model, or a configured cheaper one).
pub struct Summarizer<'a> {
    pub provider: &'a dyn LlmProvider,
    pub descriptor: &'a ModelDescriptor,
}

/// Pick the prefix to summarize: the longest run of view messages that
/// excludes the last `keep_last_assistant` assistant messages and any
/// existing summary, and whose cumulative tokens reach `min_tokens`.
pub(crate) fn select_prefix<'a>(
    visible: &'a [Message],
    keep_last_assistant: usize,
    min_tokens: u64,
    token_of: impl Fn(&Message) -> u64,
) -> Option<Vec<&'a Message>> {
    // Index of the K-th assistant message counted from the end; nothing
    // at or after it is eligible.
    let mut assistant_seen = 0;
    let mut cutoff = visible.len();
    for (i, message) in visible.iter().enumerate().rev() {
        if message.role == Role::Assistant {
            assistant_seen += 1;
            if assistant_seen >= keep_last_assistant {
                cutoff = i;
                break;
            }
        }
    }
    if assistant_seen < keep_last_assistant {
        cutoff = 0;
    }

    let candidates: Vec<&Message> = visible[..cutoff]
        .iter()
        .filter(|m| !m.is_summary)
        .collect();

    let total: u64 = candidates.iter().map(|m| token_of(m)).sum::<u64>();
    if candidates.is_empty() || total < min_tokens {
        return None;
    }
    Some(candidates)
}

pub(crate) fn summary_prompt(messages: &[&Message]) -> String {
    let mut conversation = String::new();
    for message in messages {
        let label = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
            Role::Summary => "Summary",
        };
        conversation.push_str(label);
        conversation.push_str(": ");
        let text = message.content.extract_all_text();
        // Long tool output bloats the prompt without informing the summary.
        if text.len() > 2000 {
            conversation.push_str(&text[..1000]);
            conversation.push_str(" [...] ");
        } else {
            conversation.push_str(&text);
        }
        conversation.push('\n');
    }

    format!(
        "Summarize the following conversation history into a concise summary \
         that preserves:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned about the user or context\n\
         5. Tool state (running processes, pending work)\n\n\
         Be concise but preserve all actionable context. Write in present \
         tense. Omit greetings and pleasantries.\n\n\
         CONVERSATION:\n{conversation}"
    )
}

/// Run one summarization pass. Returns the new summary message id.
pub(crate) async fn run_summarization(
    store: &Store,
    counters: &TokenCounters,
    session_id: &str,
    candidates: &[&Message],
    summarizer: &Summarizer<'_>,
) -> Result<String> {
    let request = ChatRequest {
        model_id: summarizer.descriptor.id.clone(),
        messages: vec![ChatMessage::user(summary_prompt(candidates))],
        tools: Vec::<ToolDefinition>::new(),
        max_output: Some(summarizer.descriptor.effective_max_completion().min(2000)),
        cache_control: false,
    };

    let response = summarizer.provider.chat(&request).await?;
    if response.content.trim().is_empty() {
        return Err(Error::Provider {
            provider: summarizer.provider.family().to_owned(),
            message: "summarizer returned empty content".into(),
        });
    }

    let content = MessageContent::Text(response.content.clone());
    let tokens = counters.count(&summarizer.descriptor.tokenizer, &content);
    // Place the summary at the boundary it covers: one microsecond
    // after the last summarized row, so the view keeps the live tail
    // (including the pending user message) after it.
    let boundary = candidates
        .last()
        .map(|m| m.created_at + chrono::Duration::microseconds(1))
        .unwrap_or_else(|| store.now());
    let summary = Message {
        id: id::new_id(id::MESSAGE),
        session_id: session_id.to_owned(),
        role: Role::Summary,
        content,
        tool_call_id: None,
        tokens_in: tokens,
        tokens_out: 0,
        created_at: boundary,
        is_summary: true,
        covered_by: None,
    };
    store.append_message(&summary)?;

    let covered_ids: Vec<String> = candidates.iter().map(|m| m.id.clone()).collect();
    store.mark_covered(&covered_ids, &summary.id)?;

    // The summarization call pays its own way.
    let cost = response
        .usage
        .as_ref()
        .map(|u| summarizer.descriptor.cost(u.input_tokens, u.output_tokens))
        .unwrap_or(0.0);
    store.add_session_cost(session_id, cost)?;

    store.append_audit(&AuditEntry::new(
        "context",
        "session.summarize",
        "session",
        session_id.to_owned(),
        AuditOutcome::Ok,
        serde_json::json!({
            "session_id": session_id,
            "summary_id": summary.id,
            "covered": covered_ids.len(),
            "model": summarizer.descriptor.id,
            "cost": cost,
        }),
    ))?;

    tracing::info!(
        session_id,
        covered = covered_ids.len(),
        summary_id = %summary.id,
        "conversation prefix summarized"
    );

    Ok(summary.id)
}

/// Hard truncation: logically drop the oldest non-summary,
/// non-protected messages until the view fits `target_tokens`.
/// Protected: summaries, the last `keep_last_assistant` assistant
/// messages, and messages carrying image blocks.
pub(crate) fn truncate_to_fit(
    store: &Store,
    session_id: &str,
    visible: &[Message],
    keep_last_assistant: usize,
    target_tokens: u64,
    system_tokens: u64,
    token_of: impl Fn(&Message) -> u64,
) -> Result<usize> {
    let mut pressure: u64 = system_tokens + visible.iter().map(|m| token_of(m)).sum::<u64>();

    let mut assistant_seen = 0;
    let mut cutoff = visible.len();
    for (i, message) in visible.iter().enumerate().rev() {
        if message.role == Role::Assistant {
            assistant_seen += 1;
            if assistant_seen >= keep_last_assistant {
                cutoff = i;
                break;
            }
        }
    }
    if assistant_seen < keep_last_assistant {
        cutoff = 0;
    }

    let mut dropped = Vec::new();
    for message in &visible[..cutoff] {
        if pressure <= target_tokens {
            break;
        }
        if message.is_summary || message.has_image() {
            continue;
        }
        pressure = pressure.saturating_sub(token_of(message));
        dropped.push(message.id.clone());
    }

    if !dropped.is_empty() {
        store.mark_covered(&dropped, TRUNCATED)?;
        tracing::warn!(
            session_id,
            dropped = dropped.len(),
            "context hard-truncated after summarization was unavailable"
        );
    }
    Ok(dropped.len())
}
