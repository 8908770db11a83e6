//! Short-lived dedup window over provider notification ids.
//!
//! Providers deliver at-least-once; redeliveries within a minutes-scale
//! window carry the same notification id. This is bookkeeping for the
//! ingestors only — it is never persisted, and idempotency beyond the
//! window is the orchestrator's fingerprint check.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Lazy-prune threshold; keeps `first_seen` O(1) amortized without a timer.
const PRUNE_AT: usize = 1024;

pub struct DedupWindow {
    ttl: Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DedupWindow {
    pub fn new(ttl: std::time::Duration) -> DedupWindow {
        DedupWindow {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(5)),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a notification id; returns false when it was already seen
    /// within the window (a redelivery to drop).
    pub fn first_seen(&self, provider_event_id: &str) -> bool {
        let now = Utc::now();
        let mut seen = self.seen.lock().unwrap();

        if seen.len() >= PRUNE_AT {
            let ttl = self.ttl;
            seen.retain(|_, at| now - *at <= ttl);
        }

        match seen.get(provider_event_id) {
            Some(at) if now - *at <= self.ttl => false,
            _ => {
                seen.insert(provider_event_id.to_string(), now);
                true
            }
        }
    }

    /// Drop entries older than the window.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let mut seen = self.seen.lock().unwrap();
        let before = seen.len();
        let ttl = self.ttl;
        seen.retain(|_, at| now - *at <= ttl);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_within_window_is_dropped() {
        let window = DedupWindow::new(std::time::Duration::from_secs(300));
        assert!(window.first_seen("evt-1"));
        assert!(!window.first_seen("evt-1"));
        assert!(window.first_seen("evt-2"));
    }

    #[test]
    fn test_stale_entry_is_readmitted() {
        // Zero-width window: everything is immediately stale
        let window = DedupWindow::new(std::time::Duration::from_secs(0));
        assert!(window.first_seen("evt-1"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(window.first_seen("evt-1"));
    }

    #[test]
    fn test_prune_clears_old_entries() {
        let window = DedupWindow::new(std::time::Duration::from_secs(0));
        window.first_seen("evt-1");
        window.first_seen("evt-2");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(window.prune(), 2);
        assert!(window.is_empty());
    }
}
