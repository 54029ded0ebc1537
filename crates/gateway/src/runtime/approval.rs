//! Parked approval waits.
//!
//! When policy answers `ask`, the session worker parks on a oneshot
//! registered here and the approval surfaces (REST, WS) resolve it.
//! The park is not a callback registry: `approval.resolved` is just
//! another input the worker selects on, next to its timeout and the
//! session's cancel token.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use hearth_domain::tool::ApprovalScope;

/// A human's answer to one pending tool call.
#[derive(Debug, Clone)]
pub struct ApprovalResolution {
    pub approved: bool,
    pub scope: ApprovalScope,
    pub resolved_by: String,
}

/// Snapshot of a pending approval (for listings).
#[derive(Debug, Clone, Serialize)]
pub struct PendingApprovalInfo {
    pub tool_call_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub requested_at: DateTime<Utc>,
}

struct Parked {
    info: PendingApprovalInfo,
    respond: oneshot::Sender<ApprovalResolution>,
}

/// Pending approvals keyed by tool-call id.
#[derive(Default)]
pub struct ApprovalWaiters {
    parked: Mutex<HashMap<String, Parked>>,
}

impl ApprovalWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a tool call; the returned receiver resolves when a human
    /// answers. The worker owns the timeout.
    pub fn park(
        &self,
        tool_call_id: &str,
        session_id: &str,
        tool_name: &str,
    ) -> oneshot::Receiver<ApprovalResolution> {
        let (tx, rx) = oneshot::channel();
        self.parked.lock().insert(
            tool_call_id.to_owned(),
            Parked {
                info: PendingApprovalInfo {
                    tool_call_id: tool_call_id.to_owned(),
                    session_id: session_id.to_owned(),
                    tool_name: tool_name.to_owned(),
                    requested_at: Utc::now(),
                },
                respond: tx,
            },
        );
        rx
    }

    /// Resolve a pending approval. Returns `false` when nothing is
    /// parked under that id (already resolved, timed out, or unknown).
    pub fn resolve(&self, tool_call_id: &str, resolution: ApprovalResolution) -> bool {
        match self.parked.lock().remove(tool_call_id) {
            Some(parked) => parked.respond.send(resolution).is_ok(),
            None => false,
        }
    }

    /// Drop a park that timed out or was cancelled.
    pub fn abandon(&self, tool_call_id: &str) {
        self.parked.lock().remove(tool_call_id);
    }

    pub fn list_pending(&self) -> Vec<PendingApprovalInfo> {
        self.parked.lock().values().map(|p| p.info.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn park_and_resolve() {
        let waiters = ApprovalWaiters::new();
        let rx = waiters.park("tc_1", "ses_1", "shell.exec");
        assert_eq!(waiters.list_pending().len(), 1);

        assert!(waiters.resolve(
            "tc_1",
            ApprovalResolution {
                approved: true,
                scope: ApprovalScope::Once,
                resolved_by: "api:alice".into(),
            },
        ));
        let resolution = rx.await.unwrap();
        assert!(resolution.approved);
        assert!(waiters.list_pending().is_empty());
    }

    #[test]
    fn resolve_unknown_is_false() {
        let waiters = ApprovalWaiters::new();
        assert!(!waiters.resolve(
            "tc_missing",
            ApprovalResolution {
                approved: false,
                scope: ApprovalScope::Once,
                resolved_by: "api:x".into(),
            },
        ));
    }

    #[tokio::test]
    async fn abandon_drops_the_park() {
        let waiters = ApprovalWaiters::new();
        let rx = waiters.park("tc_2", "ses_1", "fs.write");
        waiters.abandon("tc_2");
        assert!(rx.await.is_err(), "receiver sees the park dropped");
        assert!(!waiters.resolve(
            "tc_2",
            ApprovalResolution {
                approved: true,
                scope: ApprovalScope::Once,
                resolved_by: "api:x".into(),
            },
        ));
    }
}
