//! The turn loop.
//!
//! One turn: persist the inbound message, build the context, stream
//! the model, gate and dispatch tool calls, loop until the model
//! finishes. Approval waits park the worker; cancellation aborts at
//! the next suspension point; rate-limit exhaustion walks the
//! session's per-turn fallback chain without touching
//! `session.model_id`.

use std::sync::Arc;

use futures_util::StreamExt;

use hearth_context::Summarizer;
use hearth_domain::audit::{AuditEntry, AuditOutcome};
use hearth_domain::catalog::ModelDescriptor;
use hearth_domain::error::{Error, Result};
use hearth_domain::event::{Event, Topic};
use hearth_domain::id;
use hearth_domain::session::{ContentPart, Message, MessageContent, Role, Session, SessionStatus};
use hearth_domain::stream::{StreamEvent, Usage};
use hearth_domain::tool::{
    ApprovalScope, ToolCall, ToolCallStatus, ToolDefinition, ToolRequest,
};
use hearth_policy::ToolInvocation;
use hearth_providers::retry::with_retry;
use hearth_providers::LlmProvider;
use hearth_store::ToolCallUpdate;

use crate::state::AppState;

use super::cancel::CancelToken;
use super::workers::TurnReport;
use super::{advance_tool_call_audited, persist_and_publish_message, system_prompt};

/// Hard stop for runaway tool loops.
const MAX_TOOL_LOOPS_DEFAULT: usize = 25;

pub async fn run_turn(
    state: &AppState,
    session_id: &str,
    content: MessageContent,
    actor: &str,
    model_override: Option<String>,
    cancel: CancelToken,
) -> Result<TurnReport> {
    let session = state.store.require_session(session_id)?;
    if session.status != SessionStatus::Active {
        return Err(Error::Conflict(format!(
            "session {session_id} is {}; re-open it first",
            session.status.as_str()
        )));
    }

    // ── Persist the inbound message ──────────────────────────────────
    let user_message = Message {
        id: id::new_id(id::MESSAGE),
        session_id: session_id.to_owned(),
        role: Role::User,
        content,
        tool_call_id: None,
        tokens_in: 0, // measured from provider usage after the call
        tokens_out: 0,
        created_at: state.store.now(),
        is_summary: false,
        covered_by: None,
    };
    persist_and_publish_message(state, &user_message).await?;

    let model_id = model_override.unwrap_or_else(|| session.model_id.clone());
    let mut fallback_queue = session.fallback_models.clone();
    fallback_queue.reverse(); // pop() walks the chain in order

    let mut turn = TurnState {
        state,
        session,
        actor,
        cancel,
        model_id,
        fallback_queue,
        input_anchor_id: user_message.id.clone(),
        usage: Usage::default(),
        cost: 0.0,
        finish_reason: None,
    };
    turn.run().await
}

struct TurnState<'a> {
    state: &'a AppState,
    session: Session,
    actor: &'a str,
    cancel: CancelToken,
    /// Model for this turn (fallbacks swap it; the session row keeps
    /// its configured model).
    model_id: String,
    fallback_queue: Vec<String>,
    /// Message row that absorbs the next call's input-token count.
    input_anchor_id: String,
    usage: Usage,
    cost: f64,
    finish_reason: Option<String>,
}

enum StreamOutcome {
    /// Model produced a final answer.
    Final { text: String },
    /// Model requested tools; results are appended, loop again.
    ToolRound,
    /// Cancelled mid-stream.
    Stopped { partial: String },
}

/// How an approval park ended.
enum ParkOutcome {
    Approved(ToolCall),
    Denied,
    Cancelled,
}

impl<'a> TurnState<'a> {
    async fn run(&mut self) -> Result<TurnReport> {
        let max_loops = self
            .state
            .config
            .orchestrator
            .max_tool_loops
            .max(1)
            .min(MAX_TOOL_LOOPS_DEFAULT.max(1));

        for _ in 0..max_loops {
            if self.cancel.is_cancelled() {
                return self.finish_stopped(String::new()).await;
            }

            match self.one_model_round().await? {
                StreamOutcome::Final { text } => return self.finish_success(text).await,
                StreamOutcome::ToolRound => continue,
                StreamOutcome::Stopped { partial } => {
                    return self.finish_stopped(partial).await
                }
            }
        }

        Err(Error::Other(format!(
            "tool loop limit reached ({max_loops} iterations)"
        )))
    }

    // ── One LLM call + tool round ────────────────────────────────────

    async fn one_model_round(&mut self) -> Result<StreamOutcome> {
        // One of the bounded in-flight provider slots, held for the
        // call + stream consumption, released before tool dispatch.
        let llm_slot = self
            .state
            .llm_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("gateway shutting down".into()))?;

        // Resolve the turn's current model; walk the fallback chain on
        // rate-limit exhaustion (request start only, never mid-stream).
        let (descriptor, stream) = loop {
            let (provider, descriptor) = self.state.providers.resolve(&self.model_id)?;
            let prepared = self.prepare_context(&descriptor).await?;

            match self.open_stream(&provider, &prepared).await {
                Ok(stream) => break (descriptor, stream),
                Err(Error::RateLimited { .. }) => match self.fallback_queue.pop() {
                    Some(next_model) => {
                        self.audit_fallback(&next_model)?;
                        self.model_id = next_model;
                        continue;
                    }
                    None => return Err(Error::RateLimited { retry_after: None }),
                },
                Err(other) => return Err(other),
            }
        };

        // ── Assistant row, streamed into incrementally ───────────────
        let assistant = Message {
            id: id::new_id(id::MESSAGE),
            session_id: self.session.id.clone(),
            role: Role::Assistant,
            content: MessageContent::Text(String::new()),
            tool_call_id: None,
            tokens_in: 0,
            tokens_out: 0,
            created_at: self.state.store.now(),
            is_summary: false,
            covered_by: None,
        };
        self.state.store.append_message(&assistant)?;

        let consumed = self.consume_stream(stream, &assistant.id).await?;
        drop(llm_slot);
        let ConsumedStream {
            text,
            tool_requests,
            usage,
            finish_reason,
            stopped,
        } = consumed;

        // ── Usage accounting ─────────────────────────────────────────
        if let Some(usage) = &usage {
            self.state
                .store
                .set_message_tokens(&self.input_anchor_id, usage.input_tokens, 0)?;
            self.state
                .store
                .set_message_tokens(&assistant.id, 0, usage.output_tokens)?;
            self.usage.add(usage);
            self.cost += descriptor.cost(usage.input_tokens, usage.output_tokens);
        }

        if stopped {
            return Ok(StreamOutcome::Stopped { partial: text });
        }

        if tool_requests.is_empty() {
            self.finish_reason = finish_reason;
            return Ok(StreamOutcome::Final { text });
        }

        // ── Tool round ───────────────────────────────────────────────
        self.record_assistant_tool_uses(&assistant.id, &text, &tool_requests)?;
        let stopped = self
            .gate_and_dispatch(&descriptor, &assistant.id, tool_requests)
            .await?;
        if stopped {
            return Ok(StreamOutcome::Stopped { partial: text });
        }
        Ok(StreamOutcome::ToolRound)
    }

    async fn prepare_context(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<hearth_context::PreparedContext> {
        let session = self.state.store.require_session(&self.session.id)?;
        let tools = self.state.dispatcher.registry().definitions();

        // Summarizer: configured cheaper model, else the turn's model.
        let summarizer_model = self
            .state
            .config
            .context
            .summarizer_model
            .clone()
            .unwrap_or_else(|| self.model_id.clone());
        let summarizer_pair = self.state.providers.resolve(&summarizer_model).ok();

        let prepared = match &summarizer_pair {
            Some((provider, descriptor_s)) => {
                self.state
                    .context
                    .prepare(
                        &session,
                        descriptor,
                        &system_prompt(self.state),
                        tools,
                        Some(Summarizer {
                            provider: provider.as_ref(),
                            descriptor: descriptor_s,
                        }),
                        None,
                    )
                    .await?
            }
            None => {
                self.state
                    .context
                    .prepare(
                        &session,
                        descriptor,
                        &system_prompt(self.state),
                        tools,
                        None,
                        None,
                    )
                    .await?
            }
        };

        if prepared.summarized {
            self.state
                .bus
                .publish_or_log(Event::for_session(
                    Topic::SessionMessage,
                    self.session.id.clone(),
                    serde_json::json!({
                        "role": "system",
                        "kind": "summarization",
                        "content": "earlier conversation was summarized",
                    }),
                ))
                .await;
        }
        if prepared.truncated > 0 {
            self.state
                .bus
                .publish_or_log(Event::for_session(
                    Topic::TraceEvent,
                    self.session.id.clone(),
                    serde_json::json!({
                        "reason": "truncated",
                        "dropped": prepared.truncated,
                    }),
                ))
                .await;
        }
        if prepared.warned {
            self.state
                .bus
                .publish_or_log(Event::for_session(
                    Topic::TraceEvent,
                    self.session.id.clone(),
                    serde_json::json!({
                        "reason": "context_pressure",
                        "input_tokens": prepared.input_tokens,
                    }),
                ))
                .await;
        }

        Ok(prepared)
    }

    /// Open the provider stream with the transient-failure retry
    /// policy; every retry is audited.
    async fn open_stream(
        &self,
        provider: &Arc<dyn LlmProvider>,
        prepared: &hearth_context::PreparedContext,
    ) -> Result<hearth_domain::stream::BoxStream<'static, Result<StreamEvent>>> {
        let store = &self.state.store;
        let session_id = self.session.id.clone();
        let model = self.model_id.clone();
        with_retry(
            || provider.chat_stream(&prepared.request),
            |attempt, error, delay| {
                let entry = AuditEntry::new(
                    "gateway",
                    "provider.retry",
                    "session",
                    session_id.clone(),
                    AuditOutcome::Failed,
                    serde_json::json!({
                        "session_id": session_id,
                        "model": model,
                        "attempt": attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "error": error.to_string(),
                    }),
                );
                if let Err(e) = store.append_audit(&entry) {
                    tracing::warn!(error = %e, "failed to audit provider retry");
                }
            },
        )
        .await
    }

    fn audit_fallback(&self, next_model: &str) -> Result<()> {
        tracing::warn!(
            session_id = %self.session.id,
            from = %self.model_id,
            to = %next_model,
            "rate limited; routing turn to fallback model"
        );
        self.state.store.append_audit(&AuditEntry::new(
            "gateway",
            "provider.fallback",
            "session",
            self.session.id.clone(),
            AuditOutcome::Ok,
            serde_json::json!({
                "session_id": self.session.id,
                "from": self.model_id,
                "to": next_model,
            }),
        ))
    }

    // ── Stream consumption ───────────────────────────────────────────

    async fn consume_stream(
        &self,
        mut stream: hearth_domain::stream::BoxStream<'static, Result<StreamEvent>>,
        assistant_id: &str,
    ) -> Result<ConsumedStream> {
        let mut consumed = ConsumedStream::default();

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    consumed.stopped = true;
                    break;
                }
                event = stream.next() => event,
            };

            let Some(event) = event else { break };
            match event? {
                StreamEvent::Token { text } => {
                    consumed.text.push_str(&text);
                    self.state.store.set_message_content(
                        assistant_id,
                        &MessageContent::Text(consumed.text.clone()),
                    )?;
                    self.state
                        .bus
                        .publish_or_log(Event::for_session(
                            Topic::SessionTokens,
                            self.session.id.clone(),
                            serde_json::json!({
                                "message_id": assistant_id,
                                "delta": text,
                            }),
                        ))
                        .await;
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    consumed.tool_requests.push(ToolRequest {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::ToolCallStarted { .. } | StreamEvent::ToolCallDelta { .. } => {}
                StreamEvent::Done {
                    usage,
                    finish_reason,
                } => {
                    // Some wire formats emit a usage-only chunk and then
                    // a bare sentinel; keep the richer values.
                    if usage.is_some() {
                        consumed.usage = usage;
                    }
                    if finish_reason.is_some() {
                        consumed.finish_reason = finish_reason;
                    }
                }
                StreamEvent::Error { message } => {
                    return Err(Error::Provider {
                        provider: self.model_id.clone(),
                        message,
                    });
                }
            }
        }

        Ok(consumed)
    }

    fn record_assistant_tool_uses(
        &self,
        assistant_id: &str,
        text: &str,
        requests: &[ToolRequest],
    ) -> Result<()> {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text: text.to_owned() });
        }
        for request in requests {
            parts.push(ContentPart::ToolUse {
                id: request.call_id.clone(),
                name: request.tool_name.clone(),
                input: request.arguments.clone(),
            });
        }
        self.state
            .store
            .set_message_content(assistant_id, &MessageContent::Parts(parts))
    }

    // ── Policy gate + dispatch ───────────────────────────────────────

    /// Gate each requested call through policy (parking on `ask`),
    /// dispatch approved ones in parallel up to the model's cap, and
    /// append results. Returns `true` when cancelled.
    async fn gate_and_dispatch(
        &mut self,
        descriptor: &ModelDescriptor,
        assistant_id: &str,
        requests: Vec<ToolRequest>,
    ) -> Result<bool> {
        let mut approved: Vec<(ToolRequest, ToolCall, ToolDefinition)> = Vec::new();

        for request in requests {
            let mut call = ToolCall::new(&self.session.id, assistant_id, &request);
            call.started_at = self.state.store.now();
            self.state.store.insert_tool_call(&call)?;
            self.state
                .bus
                .publish_or_log(Event::for_session(
                    Topic::ToolRequest,
                    self.session.id.clone(),
                    serde_json::json!({
                        "tool_call_id": call.id,
                        "tool_name": call.tool_name,
                        "arguments": call.arguments,
                    }),
                ))
                .await;

            let Some((_, definition)) = self.state.dispatcher.registry().lookup(&request.tool_name)
            else {
                let failed = advance_tool_call_audited(
                    self.state,
                    &call,
                    ToolCallStatus::Failed,
                    ToolCallUpdate {
                        error: Some(format!("unknown tool {}", request.tool_name)),
                        ..Default::default()
                    },
                    "orchestrator",
                )?;
                self.append_tool_result(
                    &request,
                    &failed,
                    format!("Unknown tool: {}", request.tool_name),
                    true,
                )
                .await?;
                continue;
            };

            let decision = self.state.policy.evaluate(&ToolInvocation {
                session_id: self.session.id.clone(),
                workspace_id: self.session.workspace_id.clone(),
                tool_name: request.tool_name.clone(),
                arguments: request.arguments.clone(),
                caller_identity: self.actor.to_owned(),
                capability: definition.capability,
            })?;

            match decision.action {
                hearth_domain::policy::PolicyAction::Allow => {
                    let call = advance_tool_call_audited(
                        self.state,
                        &call,
                        ToolCallStatus::Approved,
                        ToolCallUpdate {
                            approval_scope: Some(decision.scope),
                            ..Default::default()
                        },
                        "orchestrator",
                    )?;
                    approved.push((request, call, definition));
                }
                hearth_domain::policy::PolicyAction::Deny => {
                    let denied = advance_tool_call_audited(
                        self.state,
                        &call,
                        ToolCallStatus::Denied,
                        ToolCallUpdate {
                            error: Some(decision.reason.clone()),
                            ..Default::default()
                        },
                        "orchestrator",
                    )?;
                    self.append_tool_result(
                        &request,
                        &denied,
                        format!("Denied by policy ({}): {}", decision.rule, decision.reason),
                        true,
                    )
                    .await?;
                }
                hearth_domain::policy::PolicyAction::Ask => {
                    match self.park_for_approval(&request, &call, &decision).await? {
                        ParkOutcome::Approved(call) => approved.push((request, call, definition)),
                        ParkOutcome::Denied => {}
                        ParkOutcome::Cancelled => return Ok(true),
                    }
                }
            }
        }

        // Dispatch approved calls in parallel, bounded by the model's cap.
        let cap = descriptor.max_parallel_tool_calls.max(1);
        for batch in approved.chunks_mut(cap) {
            if self.cancel.is_cancelled() {
                for (_, call, _) in batch.iter() {
                    let _ = advance_tool_call_audited(
                        self.state,
                        call,
                        ToolCallStatus::Failed,
                        ToolCallUpdate {
                            error: Some("cancelled".into()),
                            ..Default::default()
                        },
                        "orchestrator",
                    );
                }
                return Ok(true);
            }

            let mut executing = Vec::new();
            for (request, call, definition) in batch.iter() {
                let call = advance_tool_call_audited(
                    self.state,
                    call,
                    ToolCallStatus::Executing,
                    ToolCallUpdate::default(),
                    "orchestrator",
                )?;
                self.state
                    .bus
                    .publish_or_log(Event::for_session(
                        Topic::ToolExecuting,
                        self.session.id.clone(),
                        serde_json::json!({ "tool_call_id": call.id }),
                    ))
                    .await;
                executing.push((request.clone(), call, definition.clone()));
            }

            let futures: Vec<_> = executing
                .into_iter()
                .map(|(request, call, definition)| {
                    let bus = self.state.bus.clone();
                    let dispatcher = self.state.dispatcher.clone();
                    let session_id = self.session.id.clone();
                    let call_id = call.id.clone();
                    async move {
                        let heartbeat = {
                            let bus = bus.clone();
                            let session_id = session_id.clone();
                            let call_id = call_id.clone();
                            move || {
                                let bus = bus.clone();
                                let session_id = session_id.clone();
                                let call_id = call_id.clone();
                                tokio::spawn(async move {
                                    bus.publish_or_log(Event::for_session(
                                        Topic::ToolExecuting,
                                        session_id,
                                        serde_json::json!({
                                            "tool_call_id": call_id,
                                            "heartbeat": true,
                                        }),
                                    ))
                                    .await;
                                });
                            }
                        };
                        let result = dispatcher
                            .dispatch(&call.tool_name, &call.arguments, heartbeat)
                            .await;
                        (request, call, definition, result)
                    }
                })
                .collect();

            for (request, call, definition, result) in
                futures_util::future::join_all(futures).await
            {
                match result {
                    Ok(output) => {
                        let done = advance_tool_call_audited(
                            self.state,
                            &call,
                            ToolCallStatus::Completed,
                            ToolCallUpdate {
                                result: Some(output.content.clone()),
                                ..Default::default()
                            },
                            "orchestrator",
                        )?;
                        self.publish_tool_complete(&done, !output.is_error).await;
                        self.append_tool_result(&request, &done, output.content, output.is_error)
                            .await?;
                    }
                    Err(error) => {
                        let reason = match &error {
                            Error::Timeout(_) => "timeout",
                            _ => "error",
                        };
                        let failed = advance_tool_call_audited(
                            self.state,
                            &call,
                            ToolCallStatus::Failed,
                            ToolCallUpdate {
                                error: Some(format!("{reason}: {error}")),
                                ..Default::default()
                            },
                            "orchestrator",
                        )?;
                        self.publish_tool_complete(&failed, false).await;
                        self.append_tool_result(
                            &request,
                            &failed,
                            format!("Tool failed ({reason}): {error}"),
                            true,
                        )
                        .await?;

                        if definition.critical {
                            return Err(Error::Tool {
                                tool: call.tool_name.clone(),
                                message: format!("critical tool failed: {error}"),
                            });
                        }
                    }
                }
            }
        }

        Ok(false)
    }

    /// Park the worker until a human answers, the TTL expires (treated
    /// as deny with reason `timeout`), or the session is cancelled.
    async fn park_for_approval(
        &mut self,
        request: &ToolRequest,
        call: &ToolCall,
        decision: &hearth_domain::policy::PolicyDecision,
    ) -> Result<ParkOutcome> {
        let call = advance_tool_call_audited(
            self.state,
            call,
            ToolCallStatus::PendingApproval,
            ToolCallUpdate::default(),
            "orchestrator",
        )?;

        let receiver = self
            .state
            .approvals
            .park(&call.id, &self.session.id, &call.tool_name);

        self.state
            .bus
            .publish_or_log(Event::for_session(
                Topic::ApprovalNeeded,
                self.session.id.clone(),
                serde_json::json!({
                    "tool_call_id": call.id,
                    "tool_name": call.tool_name,
                    "arguments": call.arguments,
                    "ttl_secs": decision.approval_ttl_secs,
                }),
            ))
            .await;

        let timeout = std::time::Duration::from_secs(
            decision
                .approval_ttl_secs
                .unwrap_or(self.state.config.orchestrator.approval_timeout_secs),
        );

        let resolution = tokio::select! {
            resolution = receiver => resolution.ok(),
            _ = tokio::time::sleep(timeout) => {
                self.state.approvals.abandon(&call.id);
                None
            }
            _ = self.cancel.cancelled() => {
                self.state.approvals.abandon(&call.id);
                let _ = advance_tool_call_audited(
                    self.state,
                    &call,
                    ToolCallStatus::Failed,
                    ToolCallUpdate {
                        error: Some("cancelled".into()),
                        ..Default::default()
                    },
                    "orchestrator",
                );
                return Ok(ParkOutcome::Cancelled);
            }
        };

        match resolution {
            Some(resolution) if resolution.approved => {
                self.state.store.append_audit(&AuditEntry::new(
                    resolution.resolved_by.clone(),
                    "approval.resolved",
                    "tool_call",
                    call.id.clone(),
                    AuditOutcome::Ok,
                    serde_json::json!({
                        "session_id": self.session.id,
                        "tool_name": call.tool_name,
                        "decision": "approve",
                        "scope": resolution.scope.as_str(),
                    }),
                ))?;
                self.state
                    .bus
                    .publish_or_log(Event::for_session(
                        Topic::ApprovalResolved,
                        self.session.id.clone(),
                        serde_json::json!({
                            "tool_call_id": call.id,
                            "decision": "approve",
                            "scope": resolution.scope.as_str(),
                        }),
                    ))
                    .await;
                self.state.policy.record_approval(
                    &self.session.workspace_id,
                    &self.session.id,
                    &call.tool_name,
                    &call.arguments,
                    resolution.scope,
                )?;
                let approved = advance_tool_call_audited(
                    self.state,
                    &call,
                    ToolCallStatus::Approved,
                    ToolCallUpdate {
                        approval_scope: Some(resolution.scope),
                        ..Default::default()
                    },
                    "orchestrator",
                )?;
                Ok(ParkOutcome::Approved(approved))
            }
            other => {
                // Explicit denial or timeout.
                let (reason, resolved_by, scope) = match other {
                    Some(resolution) => (
                        "denied".to_string(),
                        resolution.resolved_by,
                        resolution.scope,
                    ),
                    None => ("timeout".to_string(), "gateway".to_string(), ApprovalScope::Once),
                };
                self.state.store.append_audit(&AuditEntry::new(
                    resolved_by,
                    "approval.resolved",
                    "tool_call",
                    call.id.clone(),
                    AuditOutcome::Denied,
                    serde_json::json!({
                        "session_id": self.session.id,
                        "tool_name": call.tool_name,
                        "decision": "deny",
                        "reason": reason,
                        "scope": scope.as_str(),
                    }),
                ))?;
                self.state
                    .bus
                    .publish_or_log(Event::for_session(
                        Topic::ApprovalResolved,
                        self.session.id.clone(),
                        serde_json::json!({
                            "tool_call_id": call.id,
                            "decision": "deny",
                            "reason": reason,
                        }),
                    ))
                    .await;
                let denied = advance_tool_call_audited(
                    self.state,
                    &call,
                    ToolCallStatus::Denied,
                    ToolCallUpdate {
                        error: Some(reason.clone()),
                        ..Default::default()
                    },
                    "orchestrator",
                )?;
                self.append_tool_result(
                    request,
                    &denied,
                    format!("Approval {reason}; the tool was not run."),
                    true,
                )
                .await?;
                Ok(ParkOutcome::Denied)
            }
        }
    }

    // ── Result plumbing ──────────────────────────────────────────────

    async fn publish_tool_complete(&self, call: &ToolCall, success: bool) {
        self.state
            .bus
            .publish_or_log(Event::for_session(
                Topic::ToolComplete,
                self.session.id.clone(),
                serde_json::json!({
                    "tool_call_id": call.id,
                    "tool_name": call.tool_name,
                    "status": call.status.as_str(),
                    "success": success,
                    "duration_ms": call.duration_ms,
                }),
            ))
            .await;
    }

    /// Append the tool result to the conversation; the next model call
    /// anchors its input-token count here.
    async fn append_tool_result(
        &mut self,
        request: &ToolRequest,
        call: &ToolCall,
        content: String,
        is_error: bool,
    ) -> Result<()> {
        let message = Message {
            id: id::new_id(id::MESSAGE),
            session_id: self.session.id.clone(),
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: request.call_id.clone(),
                content,
                is_error,
            }]),
            tool_call_id: Some(call.id.clone()),
            tokens_in: 0,
            tokens_out: 0,
            created_at: self.state.store.now(),
            is_summary: false,
            covered_by: None,
        };
        self.state.store.append_message(&message)?;
        self.input_anchor_id = message.id;
        Ok(())
    }

    // ── Terminal paths ───────────────────────────────────────────────

    async fn finish_success(&mut self, text: String) -> Result<TurnReport> {
        self.state
            .store
            .add_session_cost(&self.session.id, self.cost)?;
        self.state.store.sync_session_tokens(&self.session.id)?;

        self.state
            .bus
            .publish(Event::for_session(
                Topic::SessionMessage,
                self.session.id.clone(),
                serde_json::json!({
                    "role": "assistant",
                    "content": text,
                    "final": true,
                    "finish_reason": self.finish_reason,
                }),
            ))
            .await?;

        Ok(TurnReport {
            final_text: text,
            usage: self.usage.clone(),
            cost: self.cost,
            stopped: false,
        })
    }

    async fn finish_stopped(&mut self, partial: String) -> Result<TurnReport> {
        self.state
            .store
            .add_session_cost(&self.session.id, self.cost)?;
        self.state.store.sync_session_tokens(&self.session.id)?;

        self.state
            .bus
            .publish_or_log(Event::for_session(
                Topic::TraceEvent,
                self.session.id.clone(),
                serde_json::json!({
                    "reason": "cancelled",
                    "partial_chars": partial.len(),
                }),
            ))
            .await;

        Ok(TurnReport {
            final_text: partial,
            usage: self.usage.clone(),
            cost: self.cost,
            stopped: true,
        })
    }
}

#[derive(Default)]
struct ConsumedStream {
    text: String,
    tool_requests: Vec<ToolRequest>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    stopped: bool,
}
