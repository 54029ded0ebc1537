//! Opaque sortable identifiers.
//!
//! Ids are `{prefix}_{micros_hex}{entropy}`: a 14-hex-digit microsecond
//! timestamp followed by 8 hex digits of uuid entropy. Lexicographic
//! order equals creation order down to the microsecond.

use chrono::Utc;

pub const SESSION: &str = "ses";
pub const MESSAGE: &str = "msg";
pub const TOOL_CALL: &str = "tc";
pub const AUDIT: &str = "aud";
pub const POLICY: &str = "pol";
pub const APPROVAL: &str = "apr";
pub const TASK: &str = "task";
pub const TASK_RUN: &str = "run";
pub const INTEGRATION: &str = "chn";

/// Mint a new sortable id with the given prefix.
pub fn new_id(prefix: &str) -> String {
    let micros = Utc::now().timestamp_micros().max(0) as u64;
    let entropy = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{micros:014x}{}", &entropy[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix() {
        let id = new_id(SESSION);
        assert!(id.starts_with("ses_"));
    }

    #[test]
    fn ids_sort_by_creation() {
        let a = new_id(MESSAGE);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id(MESSAGE);
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_id(TOOL_CALL)));
        }
    }
}
