//! Per-session cancellation tokens.
//!
//! Every running turn registers a token; cancelling it aborts the
//! in-flight provider stream and any parked approval wait at the next
//! suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve when cancellation is requested (for `select!` arms).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

/// Active cancellation tokens keyed by session id.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a token for a session's running turn.
    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(session_id.to_owned(), token.clone());
        token
    }

    /// Cancel a session's running turn. Returns `true` if one existed.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.tokens.lock().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let map = CancelMap::new();
        let token = map.register("ses_1");
        assert!(map.is_running("ses_1"));
        assert!(!token.is_cancelled());

        assert!(map.cancel("ses_1"));
        assert!(token.is_cancelled());

        map.remove("ses_1");
        assert!(!map.is_running("ses_1"));
        assert!(!map.cancel("ses_1"));
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
