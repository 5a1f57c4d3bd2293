//! Per-exchange outbound rate-limit governor.
//!
//! Tracks a requests-per-minute budget with a burst allowance per
//! exchange, and enters exponential backoff with jitter whenever the
//! exchange itself reports a 429. State lives behind a
//! `parking_lot::Mutex<HashMap<..>>` keyed by exchange.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct ExchangeLimit {
    pub requests_per_minute: u32,
    pub burst: u32,
}

/// Per-exchange default request budget, tuned against each exchange's
/// published public-API rate limits.
pub fn default_limit_for(exchange: &str) -> ExchangeLimit {
    match exchange {
        "BINANCE" => ExchangeLimit {
            requests_per_minute: 60,
            burst: 10,
        },
        "OKX" => ExchangeLimit {
            requests_per_minute: 120,
            burst: 20,
        },
        "BITGET" => ExchangeLimit {
            requests_per_minute: 60,
            burst: 10,
        },
        _ => ExchangeLimit {
            requests_per_minute: 60,
            burst: 10,
        },
    }
}

struct ExchangeState {
    limit: ExchangeLimit,
    window_started_at: Instant,
    requests_this_window: u32,
    consecutive_rate_limits: u32,
    cooldown_until: Option<Instant>,
}

impl ExchangeState {
    fn new(limit: ExchangeLimit) -> Self {
        Self {
            limit,
            window_started_at: Instant::now(),
            requests_this_window: 0,
            consecutive_rate_limits: 0,
            cooldown_until: None,
        }
    }

    fn reset_window_if_elapsed(&mut self) {
        if self.window_started_at.elapsed() >= Duration::from_secs(60) {
            self.window_started_at = Instant::now();
            self.requests_this_window = 0;
        }
    }

    fn is_in_cooldown(&self) -> bool {
        self.cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

pub struct RateLimitGovernor {
    states: Mutex<HashMap<String, ExchangeState>>,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter_factor: f64,
    cooldown: Duration,
}

pub enum GovernorDecision {
    Proceed,
    Wait(Duration),
}

impl RateLimitGovernor {
    pub fn new(
        initial_backoff_seconds: f64,
        max_backoff_seconds: f64,
        multiplier: f64,
        jitter_factor: f64,
        cooldown_seconds: i64,
    ) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            initial_backoff: Duration::from_secs_f64(initial_backoff_seconds),
            max_backoff: Duration::from_secs_f64(max_backoff_seconds),
            multiplier,
            jitter_factor,
            cooldown: Duration::from_secs(cooldown_seconds.max(0) as u64),
        }
    }

    fn with_state<R>(&self, exchange: &str, f: impl FnOnce(&mut ExchangeState) -> R) -> R {
        let mut states = self.states.lock();
        let state = states
            .entry(exchange.to_string())
            .or_insert_with(|| ExchangeState::new(default_limit_for(exchange)));
        state.reset_window_if_elapsed();
        f(state)
    }

    /// Whether a request may proceed right now, per
    /// `RateLimitManager.can_proceed`.
    pub fn can_proceed(&self, exchange: &str) -> GovernorDecision {
        self.with_state(exchange, |state| {
            if state.is_in_cooldown() {
                let remaining = state
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(Instant::now()))
                    .unwrap_or_default();
                return GovernorDecision::Wait(remaining);
            }
            let allowance = state.limit.requests_per_minute + state.limit.burst;
            if state.requests_this_window >= allowance {
                let remaining = Duration::from_secs(60)
                    .saturating_sub(state.window_started_at.elapsed());
                return GovernorDecision::Wait(remaining);
            }
            state.requests_this_window += 1;
            GovernorDecision::Proceed
        })
    }

    /// Clears the consecutive-rate-limit counter after a clean request.
    pub fn record_success(&self, exchange: &str) {
        self.with_state(exchange, |state| {
            state.consecutive_rate_limits = 0;
        });
    }

    /// Enters (or extends) an exponential-backoff cooldown after the
    /// exchange itself reports a rate limit. Returns the backoff applied.
    pub fn record_rate_limit(&self, exchange: &str) -> Duration {
        let result = self.with_state(exchange, |state| {
            state.consecutive_rate_limits += 1;
            let raw = self.initial_backoff.as_secs_f64()
                * self.multiplier.powi(state.consecutive_rate_limits as i32 - 1);
            let capped = raw.min(self.max_backoff.as_secs_f64());
            let jitter = capped * self.jitter_factor * rand::thread_rng().gen_range(-1.0..=1.0);
            let backoff = (capped + jitter).max(self.cooldown.as_secs_f64());
            let backoff = Duration::from_secs_f64(backoff.max(0.0));
            state.cooldown_until = Some(Instant::now() + backoff);
            backoff
        });
        metrics::counter!("copytrade_rate_limit_backoffs_total", "exchange" => exchange.to_string())
            .increment(1);
        metrics::gauge!("copytrade_rate_limit_cooldown_seconds", "exchange" => exchange.to_string())
            .set(result.as_secs_f64());
        result
    }

    pub fn reset(&self, exchange: &str) {
        self.states.lock().remove(exchange);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_the_budget() {
        let gov = RateLimitGovernor::new(5.0, 300.0, 2.0, 0.0, 60);
        for _ in 0..10 {
            assert!(matches!(gov.can_proceed("BINANCE"), GovernorDecision::Proceed));
        }
    }

    #[test]
    fn cooldown_after_rate_limit_blocks_further_requests() {
        let gov = RateLimitGovernor::new(5.0, 300.0, 2.0, 0.0, 60);
        let backoff = gov.record_rate_limit("OKX");
        assert!(backoff >= Duration::from_secs(60));
        assert!(matches!(gov.can_proceed("OKX"), GovernorDecision::Wait(_)));
    }

    #[test]
    fn backoff_grows_exponentially_with_consecutive_limits() {
        let gov = RateLimitGovernor::new(5.0, 300.0, 2.0, 0.0, 0);
        let first = gov.record_rate_limit("BYBIT");
        let second = gov.record_rate_limit("BYBIT");
        assert!(second >= first);
    }
}
