//! Outbound action rate limiting
//!
//! Sliding-window limiter applied per key on the send path. An action is
//! admitted when fewer than `max_actions` admitted timestamps fall inside
//! the trailing window; rejected actions are not recorded, so a burst of
//! rejections never extends the lockout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateLimit;

/// Per-key sliding-window rate limiter
pub struct RateLimiter {
    name: &'static str,
    limit: RateLimit,
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: RateLimit) -> Self {
        Self {
            name,
            limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record one action for `key`.
    ///
    /// Expired timestamps are pruned lazily on each check.
    pub fn is_allowed(&self, key: &str) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.limit.window()).unwrap_or(now);

        let mut windows = self.windows.lock().unwrap();
        let stamps = windows.entry(key.to_string()).or_default();
        stamps.retain(|&t| t > cutoff);

        if stamps.len() >= self.limit.max_actions as usize {
            tracing::warn!(
                limiter = self.name,
                key = %key,
                admitted = stamps.len(),
                max = self.limit.max_actions,
                "Rate limit exceeded"
            );
            return false;
        }

        stamps.push(now);
        true
    }

    /// Label used in logs and user-facing errors
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Drop keys whose windows have fully expired
    pub fn prune_idle(&self) {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.limit.window()).unwrap_or(now);

        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, stamps| {
            stamps.retain(|&t| t > cutoff);
            !stamps.is_empty()
        });
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}
