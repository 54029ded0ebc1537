//! Per-session serial workers.
//!
//! Each session has one logical worker draining a bounded queue; one
//! unit of conversational state advances at a time, while workers for
//! different sessions run concurrently. Everything that mutates a
//! session flows through its worker.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use hearth_domain::error::{Error, Result};
use hearth_domain::session::{MessageContent, SessionStatus};
use hearth_domain::stream::Usage;

use crate::state::AppState;

use super::turn;

const QUEUE_DEPTH: usize = 64;

/// What one finished turn produced.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    pub final_text: String,
    pub usage: Usage,
    pub cost: f64,
    /// The turn was aborted by a cancel request.
    pub stopped: bool,
}

/// An input to a session worker.
pub enum WorkItem {
    Turn {
        content: MessageContent,
        /// Who injected this turn (`"api:<ident>"`, `"channel:<id>"`,
        /// `"scheduler"`).
        actor: String,
        /// Per-turn model override (scheduled prompts may pin one).
        model_override: Option<String>,
        /// Resolves when the turn completes (None = fire-and-forget).
        reply: Option<oneshot::Sender<Result<TurnReport>>>,
    },
}

struct WorkerHandle {
    sender: mpsc::Sender<WorkItem>,
    join: tokio::task::JoinHandle<()>,
}

/// The map of live session workers.
#[derive(Default)]
pub struct SessionWorkers {
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl SessionWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue work for a session, spawning its worker on first use.
    pub async fn submit(&self, state: AppState, session_id: &str, item: WorkItem) -> Result<()> {
        let sender = {
            let mut workers = self.workers.lock();
            let live = workers
                .get(session_id)
                .filter(|handle| !handle.join.is_finished())
                .map(|handle| handle.sender.clone());
            match live {
                Some(sender) => sender,
                None => {
                    let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
                    let join = tokio::spawn(worker_loop(
                        state.clone(),
                        session_id.to_owned(),
                        receiver,
                    ));
                    workers.insert(
                        session_id.to_owned(),
                        WorkerHandle {
                            sender: sender.clone(),
                            join,
                        },
                    );
                    sender
                }
            }
        };

        sender
            .send(item)
            .await
            .map_err(|_| Error::Conflict(format!("session {session_id} worker is gone")))
    }

    pub fn active_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop accepting work and abort workers (called at shutdown after
    /// the grace period).
    pub fn abort_all(&self) {
        let mut workers = self.workers.lock();
        for (_, handle) in workers.drain() {
            handle.join.abort();
        }
    }
}

/// Drain the session's queue, one turn at a time. Errors are contained
/// to the session: the worker records them and keeps serving others.
async fn worker_loop(state: AppState, session_id: String, mut receiver: mpsc::Receiver<WorkItem>) {
    while let Some(item) = receiver.recv().await {
        match item {
            WorkItem::Turn {
                content,
                actor,
                model_override,
                reply,
            } => {
                let cancel = state.cancels.register(&session_id);
                let result = turn::run_turn(
                    &state,
                    &session_id,
                    content,
                    &actor,
                    model_override,
                    cancel,
                )
                .await;
                state.cancels.remove(&session_id);

                if let Err(error) = &result {
                    super::record_turn_failure(&state, &session_id, error).await;
                    if error.is_fatal() {
                        // Storage-class failures poison the session until
                        // it is explicitly re-opened.
                        let _ = state
                            .store
                            .set_session_status(&session_id, SessionStatus::Failed);
                    }
                }

                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }
}
