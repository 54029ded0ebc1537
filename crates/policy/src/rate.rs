//! Fixed-window per-minute counters, keyed by (workspace, kind).

use std::collections::HashMap;

use parking_lot::Mutex;

struct Window {
    /// Minute index since the epoch.
    minute: i64,
    count: u32,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, &'static str), Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one event; returns `false` when the per-minute limit is
    /// already spent. The window resets cleanly at each minute boundary
    /// and an admitted event is counted exactly once.
    pub fn check_and_count(&self, workspace_id: &str, kind: &'static str, limit: u32) -> bool {
        self.check_at(workspace_id, kind, limit, chrono::Utc::now().timestamp() / 60)
    }

    fn check_at(&self, workspace_id: &str, kind: &'static str, limit: u32, minute: i64) -> bool {
        let mut windows = self.windows.lock();
        let window = windows
            .entry((workspace_id.to_owned(), kind))
            .or_insert(Window { minute, count: 0 });

        if window.minute != minute {
            window.minute = minute;
            window.count = 0;
        }
        if window.count >= limit {
            return false;
        }
        window.count += 1;
        true
    }
}
