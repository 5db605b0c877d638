//! Per-IP sliding-window burst limiter.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Sliding-window request counter keyed by client IP.
///
/// Timestamps older than the window are pruned before every check; only
/// admitted requests are recorded, so a rejected caller does not extend its
/// own lockout.
#[derive(Debug)]
pub struct IpBurstLimiter {
    buckets: DashMap<IpAddr, VecDeque<i64>>,
    limit: usize,
    window_ms: i64,
}

impl IpBurstLimiter {
    /// Create a limiter admitting `limit` requests per `window`.
    ///
    /// A limit of zero disables the check.
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            limit,
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Record a request from `ip` at `now_ms`.
    ///
    /// Returns `Err(retry_after)` when the IP already issued `limit`
    /// requests inside the trailing window; `retry_after` is the time until
    /// the oldest of them leaves the window.
    pub fn check(&self, ip: IpAddr, now_ms: i64) -> std::result::Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }

        let mut bucket = self.buckets.entry(ip).or_default();
        let horizon = now_ms.saturating_sub(self.window_ms);
        while bucket.front().is_some_and(|&ts| ts <= horizon) {
            bucket.pop_front();
        }

        if bucket.len() >= self.limit {
            let oldest = bucket.front().copied().unwrap_or(now_ms);
            let wait_ms = oldest.saturating_add(self.window_ms).saturating_sub(now_ms);
            debug!(
                "IP {} over burst limit ({} in {}ms)",
                ip,
                bucket.len(),
                self.window_ms
            );
            return Err(Duration::from_millis(u64::try_from(wait_ms.max(1)).unwrap_or(1)));
        }

        bucket.push_back(now_ms);
        Ok(())
    }

    /// Drop buckets whose every timestamp has left the window.
    pub fn sweep(&self, now_ms: i64) {
        let horizon = now_ms.saturating_sub(self.window_ms);
        self.buckets
            .retain(|_, bucket| bucket.back().is_some_and(|&ts| ts > horizon));
    }

    /// Number of IPs currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}
