use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::upstream::Source;

/// What readers get back. A snapshot, never a live reference.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Option<u64>,
    pub all_time_max: u64,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub source: Option<Source>,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            value: None,
            all_time_max: 0,
            last_updated_at: None,
            healthy: false,
            source: None,
        }
    }
}

/// Widen the TTL after a run of identical readings; any change or failure
/// snaps it back.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    base: Duration,
    relaxed: Duration,
    streak_threshold: u32,
    unchanged_streak: u32,
}

impl TtlPolicy {
    pub fn new(base: Duration, relaxed: Duration, streak_threshold: u32) -> Self {
        Self {
            base,
            relaxed: relaxed.max(base),
            streak_threshold,
            unchanged_streak: 0,
        }
    }

    pub fn fixed(ttl: Duration) -> Self {
        Self::new(ttl, ttl, 0)
    }

    pub fn effective(&self) -> Duration {
        if self.streak_threshold > 0 && self.unchanged_streak >= self.streak_threshold {
            self.relaxed
        } else {
            self.base
        }
    }

    fn on_success(&mut self, previous: Option<u64>, value: u64) {
        if previous == Some(value) {
            self.unchanged_streak = self.unchanged_streak.saturating_add(1);
        } else {
            self.unchanged_streak = 0;
        }
    }

    fn on_failure(&mut self) {
        self.unchanged_streak = 0;
    }
}

#[derive(Debug)]
struct CacheState {
    entry: CacheEntry,
    // Monotonic twin of `entry.last_updated_at`, used for freshness.
    updated_at: Option<Instant>,
    ttl: TtlPolicy,
}

/// The single process-wide cache slot. All writes go through `record_*`.
pub struct SharedCache {
    inner: RwLock<CacheState>,
}

impl SharedCache {
    pub fn new(ttl: TtlPolicy) -> Self {
        Self {
            inner: RwLock::new(CacheState {
                entry: CacheEntry::default(),
                updated_at: None,
                ttl,
            }),
        }
    }

    pub fn snapshot(&self) -> CacheEntry {
        self.inner.read().entry.clone()
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        let st = self.inner.read();
        match (st.entry.value, st.updated_at) {
            (Some(_), Some(at)) => now.saturating_duration_since(at) < st.ttl.effective(),
            _ => false,
        }
    }

    /// Snapshot if fresh, in one lock acquisition.
    pub fn read_fresh(&self, now: Instant) -> Option<CacheEntry> {
        let st = self.inner.read();
        match (st.entry.value, st.updated_at) {
            (Some(_), Some(at)) if now.saturating_duration_since(at) < st.ttl.effective() => {
                Some(st.entry.clone())
            }
            _ => None,
        }
    }

    pub fn effective_ttl(&self) -> Duration {
        self.inner.read().ttl.effective()
    }

    pub fn record_success(&self, value: u64, source: Source, now: Instant, wall: DateTime<Utc>) -> CacheEntry {
        let mut st = self.inner.write();
        let previous = st.entry.value;
        st.ttl.on_success(previous, value);
        st.entry.value = Some(value);
        st.entry.all_time_max = st.entry.all_time_max.max(value);
        st.entry.healthy = true;
        st.entry.source = Some(source);
        st.entry.last_updated_at = Some(wall);
        st.updated_at = Some(now);
        st.entry.clone()
    }

    /// Keep the last good value; only health and the attempt time move.
    pub fn record_failure(&self, now: Instant, wall: DateTime<Utc>) -> CacheEntry {
        let mut st = self.inner.write();
        st.ttl.on_failure();
        st.entry.healthy = false;
        st.entry.last_updated_at = Some(wall);
        st.updated_at = Some(now);
        st.entry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;

    fn cache(ttl_ms: u64) -> SharedCache {
        SharedCache::new(TtlPolicy::fixed(Duration::from_millis(ttl_ms)))
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cache_is_never_fresh() {
        let c = cache(1000);
        assert!(!c.is_fresh(Instant::now()));
        assert_eq!(c.snapshot(), CacheEntry::default());
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_follows_ttl() {
        let c = cache(1000);
        let t0 = Instant::now();
        c.record_success(10, Source::Dexscreener, t0, now_utc());
        assert!(c.is_fresh(t0 + Duration::from_millis(999)));
        assert!(!c.is_fresh(t0 + Duration::from_millis(1000)));
        assert!(c.read_fresh(t0).is_some());
        assert!(c.read_fresh(t0 + Duration::from_secs(2)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn all_time_max_is_running_max() {
        let c = cache(1000);
        let values = [5u64, 9, 3, 9, 12, 1];
        let mut expected = 0;
        for v in values {
            expected = expected.max(v);
            let e = c.record_success(v, Source::Dexscreener, Instant::now(), now_utc());
            assert_eq!(e.value, Some(v));
            assert_eq!(e.all_time_max, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_value_and_advances_attempt_time() {
        let c = cache(1000);
        let before = c.record_success(42, Source::BirdeyeOverview, Instant::now(), now_utc());

        tokio::time::advance(Duration::from_secs(5)).await;
        let wall = before.last_updated_at.unwrap() + chrono::Duration::seconds(5);
        let after = c.record_failure(Instant::now(), wall);

        assert_eq!(after.value, Some(42));
        assert_eq!(after.all_time_max, 42);
        assert_eq!(after.source, Some(Source::BirdeyeOverview));
        assert!(!after.healthy);
        assert_eq!(after.last_updated_at, Some(wall));
        // The attempt time moved, so the stale value is served for another TTL.
        assert!(c.is_fresh(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_before_first_success_stays_empty() {
        let c = cache(1000);
        let e = c.record_failure(Instant::now(), now_utc());
        assert_eq!(e.value, None);
        assert_eq!(e.all_time_max, 0);
        assert!(e.last_updated_at.is_some());
        assert!(!c.is_fresh(Instant::now()));
    }

    #[test]
    fn ttl_widens_after_identical_streak() {
        let mut p = TtlPolicy::new(Duration::from_secs(10), Duration::from_secs(60), 2);
        p.on_success(None, 5);
        assert_eq!(p.effective(), Duration::from_secs(10));
        p.on_success(Some(5), 5);
        assert_eq!(p.effective(), Duration::from_secs(10));
        p.on_success(Some(5), 5);
        assert_eq!(p.effective(), Duration::from_secs(60));

        p.on_success(Some(5), 6);
        assert_eq!(p.effective(), Duration::from_secs(10));

        p.on_success(Some(6), 6);
        p.on_success(Some(6), 6);
        assert_eq!(p.effective(), Duration::from_secs(60));
        p.on_failure();
        assert_eq!(p.effective(), Duration::from_secs(10));
    }

    #[test]
    fn zero_threshold_disables_widening() {
        let mut p = TtlPolicy::new(Duration::from_secs(10), Duration::from_secs(60), 0);
        for _ in 0..10 {
            p.on_success(Some(1), 1);
        }
        assert_eq!(p.effective(), Duration::from_secs(10));
    }
}
