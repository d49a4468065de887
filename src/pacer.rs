use std::{ops::Add, time::Duration};

use governor::{
    clock::{Clock, Reference},
    middleware::NoOpMiddleware,
    nanos::Nanos,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::Mutex;
use tokio::time::Instant;

/// governor reference instant read from the tokio clock, so spacing and
/// backoff share one timeline (and paused test time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TokioInstant(Instant);

impl Add<Nanos> for TokioInstant {
    type Output = TokioInstant;

    fn add(self, rhs: Nanos) -> Self::Output {
        TokioInstant(self.0 + Duration::from(rhs))
    }
}

impl Reference for TokioInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        self.0.saturating_duration_since(earlier.0).into()
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        TokioInstant(self.0.checked_sub(duration.into()).unwrap_or(self.0))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
    type Instant = TokioInstant;

    fn now(&self) -> Self::Instant {
        TokioInstant(Instant::now())
    }
}

type SpacingLimiter = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<TokioInstant>>;

#[derive(Debug, Clone, Copy)]
struct PacerState {
    last_attempt_at: Option<Instant>,
    next_allowed_at: Instant,
}

/// Per-process upstream pacing. A GCRA limiter (one cell per `min_interval`,
/// burst 1) spaces calls; provider-issued backoff, capped at `max_backoff`,
/// sits on top of it.
pub struct Pacer {
    // None when min_interval is zero.
    limiter: Option<SpacingLimiter>,
    state: Mutex<PacerState>,
    min_interval: Duration,
    default_backoff: Duration,
    max_backoff: Duration,
}

impl Pacer {
    pub fn new(min_interval: Duration, default_backoff: Duration, max_backoff: Duration) -> Self {
        let limiter = Quota::with_period(min_interval)
            .map(|quota| RateLimiter::direct_with_clock(quota, &TokioClock));
        Self {
            limiter,
            state: Mutex::new(PacerState {
                last_attempt_at: None,
                next_allowed_at: Instant::now(),
            }),
            min_interval,
            default_backoff,
            max_backoff,
        }
    }

    /// Wait until both the backoff window and the spacing limiter allow a
    /// call, then claim the slot. Returns how long we waited.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            let wait_until = {
                let mut st = self.state.lock();
                let now = Instant::now();
                if now < st.next_allowed_at {
                    st.next_allowed_at
                } else {
                    match self.limiter.as_ref().map(|l| l.check()) {
                        Some(Err(not_until)) => now + not_until.wait_time_from(TokioInstant(now)),
                        _ => {
                            st.last_attempt_at = Some(now);
                            return now - started;
                        }
                    }
                }
            };
            // Re-check after waking: a backoff may have been reported meanwhile.
            tokio::time::sleep_until(wait_until).await;
        }
    }

    pub fn report_success(&self) {
        self.state.lock().next_allowed_at = Instant::now();
    }

    pub fn default_backoff(&self) -> Duration {
        self.default_backoff
    }

    /// Returns the delay actually applied.
    pub fn report_rate_limited(&self, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after.unwrap_or(self.default_backoff).min(self.max_backoff);
        self.state.lock().next_allowed_at = Instant::now() + delay;
        log::warn!(
            "pacer.backoff delay_ms={} requested_ms={:?}",
            delay.as_millis(),
            retry_after.map(|d| d.as_millis())
        );
        delay
    }

    pub fn next_allowed_at(&self) -> Instant {
        self.state.lock().next_allowed_at
    }

    pub fn last_attempt_at(&self) -> Option<Instant> {
        self.state.lock().last_attempt_at
    }

    /// When the next call could go out if `acquire` were called now.
    pub fn next_permitted_at(&self) -> Instant {
        let st = self.state.lock();
        match st.last_attempt_at {
            Some(last) => (last + self.min_interval).max(st.next_allowed_at),
            None => st.next_allowed_at,
        }
    }
}
