use std::{fmt, time::Duration};

use tokio::time::Instant;

use crate::upstream::{Source, Tier, UpstreamError};

#[derive(Debug, Clone, PartialEq)]
pub struct ChainSuccess {
    pub value: u64,
    pub source: Source,
}

/// Every tier failed. `attempts` keeps each failure in tier order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainError {
    pub attempts: Vec<(Source, UpstreamError)>,
}

impl ChainError {
    /// Longest delay asked for by any rate-limited attempt, if any were. A 429
    /// without `retry-after` counts as `default_backoff`.
    pub fn rate_limit(&self, default_backoff: Duration) -> Option<Duration> {
        self.attempts
            .iter()
            .filter_map(|(_, e)| match e {
                UpstreamError::RateLimited { retry_after } => Some(retry_after.unwrap_or(default_backoff)),
                _ => None,
            })
            .max()
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attempts.last() {
            None => write!(f, "no tiers configured"),
            Some((source, e)) => write!(
                f,
                "all {} tiers failed; last {source}: {e}",
                self.attempts.len()
            ),
        }
    }
}

impl std::error::Error for ChainError {}

pub struct FallbackChain {
    tiers: Vec<Box<dyn Tier>>,
}

impl FallbackChain {
    pub fn new(tiers: Vec<Box<dyn Tier>>) -> Self {
        Self { tiers }
    }

    pub fn sources(&self) -> Vec<Source> {
        self.tiers.iter().map(|t| t.source()).collect()
    }

    /// Try tiers in order under one shared budget. Once the budget is spent the
    /// running tier is dropped and the rest fail as `Timeout` without a call.
    pub async fn attempt(&self, subject: &str, budget: Duration) -> Result<ChainSuccess, ChainError> {
        let deadline = Instant::now() + budget;
        let mut attempts = Vec::with_capacity(self.tiers.len());

        for tier in &self.tiers {
            let source = tier.source();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = if remaining.is_zero() {
                Err(UpstreamError::Timeout)
            } else {
                match tokio::time::timeout_at(deadline, tier.fetch(subject, remaining)).await {
                    Ok(r) => r,
                    Err(_) => Err(UpstreamError::Timeout),
                }
            };

            match result {
                Ok(value) => {
                    if !attempts.is_empty() {
                        log::info!(
                            "chain.fallback.ok source={} value={} failed_tiers={}",
                            source,
                            value,
                            attempts.len()
                        );
                    }
                    return Ok(ChainSuccess { value, source });
                }
                Err(e) => {
                    log::warn!("chain.tier.failed source={} err={}", source, e);
                    attempts.push((source, e));
                }
            }
        }

        Err(ChainError { attempts })
    }
}
