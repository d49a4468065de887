use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    cache::{CacheEntry, SharedCache, TtlPolicy},
    config::Settings,
    fallback::FallbackChain,
    pacer::Pacer,
    single_flight::SingleFlight,
    upstream::{self, Source},
    utils::now_utc,
};

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Someone else refreshed between our staleness check and the flight starting.
    Skipped,
    Succeeded { value: u64, source: Source },
    Failed { attempts: usize },
}

/// Owns the cache, the pacer and the fallback chain. `read` is the only entry
/// point request handlers need.
pub struct MarketCapService {
    subject: String,
    budget: Duration,
    cache: SharedCache,
    pacer: Pacer,
    chain: FallbackChain,
    flight: SingleFlight<RefreshOutcome>,
    chain_runs: AtomicU64,
}

impl MarketCapService {
    pub fn new(
        subject: impl Into<String>,
        budget: Duration,
        cache: SharedCache,
        pacer: Pacer,
        chain: FallbackChain,
    ) -> Arc<Self> {
        Arc::new(Self {
            subject: subject.into(),
            budget,
            cache,
            pacer,
            chain,
            flight: SingleFlight::new(),
            chain_runs: AtomicU64::new(0),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Arc<Self>> {
        let chain = FallbackChain::new(upstream::default_tiers(settings)?);
        log::info!(
            "refresher.tiers order={}",
            chain
                .sources()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
        Ok(Self::new(
            settings.mint.clone(),
            settings.upstream_timeout(),
            SharedCache::new(TtlPolicy::new(
                settings.cache_ttl(),
                settings.adaptive_ttl(),
                settings.adaptive_ttl_streak,
            )),
            Pacer::new(
                settings.min_interval(),
                settings.default_backoff(),
                settings.max_backoff(),
            ),
            chain,
        ))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    pub fn refreshing(&self) -> bool {
        self.flight.in_flight().is_some()
    }

    pub fn effective_ttl(&self) -> Duration {
        self.cache.effective_ttl()
    }

    /// How many fallback-chain executions have been issued.
    pub fn chain_runs(&self) -> u64 {
        self.chain_runs.load(Ordering::Relaxed)
    }

    /// Current entry without ever touching upstream.
    pub fn peek(&self) -> CacheEntry {
        self.cache.snapshot()
    }

    /// Fresh entries come straight from the cache. Stale readers join the
    /// in-flight refresh, or start one, and return whatever it left behind.
    /// Never fails: a failed refresh shows up as `healthy == false`.
    pub async fn read(self: &Arc<Self>) -> CacheEntry {
        if let Some(entry) = self.cache.read_fresh(Instant::now()) {
            return entry;
        }

        let this = Arc::clone(self);
        let joined = self
            .flight
            .run(move |id| async move { this.refresh(id).await })
            .await;

        match &joined.result {
            Ok(outcome) => {
                log::debug!("refresh.joined flight={} led={} outcome={:?}", joined.id, joined.led, outcome);
            }
            Err(e) => log::error!("refresh.aborted {}", e),
        }
        self.cache.snapshot()
    }

    async fn refresh(&self, id: Uuid) -> RefreshOutcome {
        if self.cache.is_fresh(Instant::now()) {
            return RefreshOutcome::Skipped;
        }

        let waited = self.pacer.acquire().await;
        if !waited.is_zero() {
            log::debug!("refresh.paced flight={} waited_ms={}", id, waited.as_millis());
        }

        self.chain_runs.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = self.chain.attempt(&self.subject, self.budget).await;
        let now = Instant::now();
        let elapsed_ms = (now - started).as_millis();

        match result {
            Ok(ok) => {
                self.pacer.report_success();
                let entry = self.cache.record_success(ok.value, ok.source, now, now_utc());
                log::info!(
                    "refresh.ok flight={} source={} value={} ath={} elapsed_ms={} ttl_ms={}",
                    id,
                    ok.source,
                    ok.value,
                    entry.all_time_max,
                    elapsed_ms,
                    self.cache.effective_ttl().as_millis()
                );
                RefreshOutcome::Succeeded {
                    value: ok.value,
                    source: ok.source,
                }
            }
            Err(err) => {
                if let Some(delay) = err.rate_limit(self.pacer.default_backoff()) {
                    self.pacer.report_rate_limited(Some(delay));
                }
                self.cache.record_failure(now, now_utc());
                log::warn!("refresh.failed flight={} elapsed_ms={} {}", id, elapsed_ms, err);
                for (source, e) in &err.attempts {
                    log::debug!("refresh.failed.attempt flight={} source={} err={}", id, source, e);
                }
                RefreshOutcome::Failed {
                    attempts: err.attempts.len(),
                }
            }
        }
    }
}
