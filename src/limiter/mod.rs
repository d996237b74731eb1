//! Shared rate limiter for outbound calls.
//!
//! Every external service the engine talks to (each RPC endpoint, each
//! explorer API key) is its own resource key with its own sliding window.
//! `allow` reserves the returned slot, so a caller that sleeps the returned
//! duration may proceed without re-checking.

use crate::error::Result;
use dashmap::DashMap;
use log::{debug, trace};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Sliding-window limiter: at most `burst` calls inside any window of
/// `burst / max_rps` seconds, which allows short spikes while holding the
/// sustained rate to `max_rps`.
pub struct ApiRateLimiter {
    windows: DashMap<String, Arc<Mutex<VecDeque<Instant>>>>,
    capacity: usize,
    window: Duration,
    total_allowed: AtomicU64,
    total_delayed: AtomicU64,
}

impl ApiRateLimiter {
    pub fn new(max_rps: u32, burst: u32) -> Self {
        let max_rps = max_rps.max(1);
        let burst = burst.max(max_rps);
        let window = Duration::from_secs_f64(f64::from(burst) / f64::from(max_rps));
        debug!(
            "Rate limiter configured: {} calls per {:?} window per resource",
            burst, window
        );
        Self {
            windows: DashMap::new(),
            capacity: burst as usize,
            window,
            total_allowed: AtomicU64::new(0),
            total_delayed: AtomicU64::new(0),
        }
    }

    fn window_for(&self, key: &str) -> Arc<Mutex<VecDeque<Instant>>> {
        self.windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    /// Returns how long the caller must sleep before issuing the call. Zero
    /// means go now. A positive duration reserves the slot at the end of the
    /// wait; no second call is needed.
    pub async fn allow(&self, key: &str) -> Duration {
        let window_arc = self.window_for(key);
        let mut stamps = window_arc.lock().await;
        let now = Instant::now();

        while let Some(front) = stamps.front() {
            if *front + self.window <= now {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() < self.capacity {
            // Reserved slots may sit in the future; keep the deque ordered.
            let stamp = stamps.back().map_or(now, |b| now.max(*b));
            stamps.push_back(stamp);
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
            return Duration::ZERO;
        }

        // The new call may go once all but capacity-1 of the earlier stamps
        // have left the window; reservations already queued push it further.
        let blocking = stamps[stamps.len() - self.capacity];
        let slot = blocking + self.window;
        let wait = slot.saturating_duration_since(now);
        stamps.push_back(slot);
        self.total_allowed.fetch_add(1, Ordering::Relaxed);
        self.total_delayed.fetch_add(1, Ordering::Relaxed);
        trace!("Rate limit on {}: deferring {:?}", key, wait);
        wait
    }

    /// `allow` plus the sleep, for callers with nothing better to do.
    pub async fn acquire(&self, key: &str) -> Result<()> {
        let wait = self.allow(key).await;
        if !wait.is_zero() {
            sleep(wait).await;
        }
        Ok(())
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let mut keys = Vec::new();
        let entries: Vec<(String, Arc<Mutex<VecDeque<Instant>>>)> = self
            .windows
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let now = Instant::now();
        for (key, window_arc) in entries {
            let stamps = window_arc.lock().await;
            let recent = stamps
                .iter()
                .filter(|t| **t <= now && now.duration_since(**t) < self.window)
                .count();
            keys.push(KeyRate {
                key,
                recent_calls: recent,
                recent_rate: recent as f64 / self.window.as_secs_f64(),
            });
        }

        RateLimiterStats {
            total_allowed: self.total_allowed.load(Ordering::Relaxed),
            total_delayed: self.total_delayed.load(Ordering::Relaxed),
            window_secs: self.window.as_secs_f64(),
            per_key: keys,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyRate {
    pub key: String,
    pub recent_calls: usize,
    pub recent_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub total_allowed: u64,
    pub total_delayed: u64,
    pub window_secs: f64,
    pub per_key: Vec<KeyRate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_passes_then_delays() {
        let limiter = ApiRateLimiter::new(2, 2);

        assert!(limiter.allow("rpc").await.is_zero());
        assert!(limiter.allow("rpc").await.is_zero());
        let wait = limiter.allow("rpc").await;
        assert!(!wait.is_zero());
        assert!(wait <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn resources_are_independent() {
        let limiter = ApiRateLimiter::new(1, 1);

        assert!(limiter.allow("rpc:a").await.is_zero());
        assert!(!limiter.allow("rpc:a").await.is_zero());
        // A different endpoint is a different resource.
        assert!(limiter.allow("rpc:b").await.is_zero());
    }

    #[tokio::test]
    async fn stats_track_recent_rate() {
        let limiter = ApiRateLimiter::new(10, 10);
        limiter.allow("explorer:key1").await;
        limiter.allow("explorer:key1").await;

        let stats = limiter.stats().await;
        assert_eq!(stats.total_allowed, 2);
        assert_eq!(stats.total_delayed, 0);
        let key = stats
            .per_key
            .iter()
            .find(|k| k.key == "explorer:key1")
            .unwrap();
        assert_eq!(key.recent_calls, 2);
    }

    #[tokio::test]
    async fn reserved_slots_respect_ordering() {
        let limiter = ApiRateLimiter::new(1, 1);
        assert!(limiter.allow("k").await.is_zero());
        let w1 = limiter.allow("k").await;
        let w2 = limiter.allow("k").await;
        // Each reservation lands strictly after the previous one.
        assert!(w2 > w1);
    }
}
