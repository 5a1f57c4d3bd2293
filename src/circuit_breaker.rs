//! Per-exchange circuit breaker.
//!
//! CLOSED/OPEN/HALF_OPEN state machine: `failure_threshold` consecutive
//! failures trip the breaker, `timeout_seconds` before a half-open probe is
//! allowed, `success_threshold` consecutive successes in HALF_OPEN close it
//! again. State is guarded by a `tokio::sync::Mutex` for a single-writer-
//! at-a-time guarantee.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::events::{DomainEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    success_threshold: u32,
    inner: Mutex<Inner>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, timeout: Duration, success_threshold: u32) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            timeout,
            success_threshold,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
            events: None,
        }
    }

    /// Attaches an event bus so OPEN/CLOSED transitions publish
    /// `DomainEvent::CircuitOpened`/`CircuitClosed`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    fn should_attempt_reset(inner: &Inner, timeout: Duration) -> bool {
        match inner.last_failure_at {
            Some(t) => t.elapsed() >= timeout,
            None => true,
        }
    }

    /// Guard an async call with the breaker, mirroring the Python
    /// `CircuitBreaker.call()` coroutine wrapper.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == CircuitState::Open {
                if Self::should_attempt_reset(&inner, self.timeout) {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(exchange = %self.name, "circuit half-open, probing");
                } else {
                    return Err(CoreError::CircuitOpen {
                        exchange: self.name.clone(),
                    });
                }
            }
        }

        match f().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(err)
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(exchange = %self.name, "circuit closed after recovery");
                    metrics::gauge!("copytrade_circuit_breaker_state", "exchange" => self.name.clone())
                        .set(0.0);
                    if let Some(events) = &self.events {
                        events.publish(DomainEvent::CircuitClosed {
                            exchange: self.name.clone(),
                        });
                    }
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!(exchange = %self.name, "probe failed, circuit re-opened");
                metrics::gauge!("copytrade_circuit_breaker_state", "exchange" => self.name.clone())
                    .set(1.0);
                if let Some(events) = &self.events {
                    events.publish(DomainEvent::CircuitOpened {
                        exchange: self.name.clone(),
                    });
                }
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(exchange = %self.name, failures = inner.failure_count, "circuit opened");
                    metrics::gauge!("copytrade_circuit_breaker_state", "exchange" => self.name.clone())
                        .set(1.0);
                    if let Some(events) = &self.events {
                        events.publish(DomainEvent::CircuitOpened {
                            exchange: self.name.clone(),
                        });
                    }
                }
            }
            CircuitState::Open => {}
        }
        metrics::counter!("copytrade_circuit_breaker_failures_total", "exchange" => self.name.clone())
            .increment(1);
    }

    /// Administrative/test reset, mirroring the Python `reset()` method.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_at = None;
    }
}

/// Process-wide registry of one breaker per exchange, constructed once in
/// `AppState` rather than living behind a global mutable singleton.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    failure_threshold: u32,
    timeout: Duration,
    success_threshold: u32,
    events: Arc<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        failure_threshold: u32,
        timeout: Duration,
        success_threshold: u32,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            timeout,
            success_threshold,
            events,
        }
    }

    pub fn get_or_create(&self, exchange: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(exchange) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(exchange.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(
                        exchange,
                        self.failure_threshold,
                        self.timeout,
                        self.success_threshold,
                    )
                    .with_events(self.events.clone()),
                )
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trips_after_threshold_failures() {
        let cb = CircuitBreaker::new("BINANCE", 2, Duration::from_millis(10), 1);
        for _ in 0..2 {
            let _ = cb
                .call(|| async { Err::<(), _>(CoreError::Transient("boom".into())) })
                .await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_opens_after_timeout_and_closes_on_success() {
        let cb = CircuitBreaker::new("OKX", 1, Duration::from_millis(5), 1);
        let _ = cb
            .call(|| async { Err::<(), _>(CoreError::Transient("boom".into())) })
            .await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = cb.call(|| async { Ok::<_, CoreError>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_rejects_calls_before_timeout() {
        let cb = CircuitBreaker::new("BYBIT", 1, Duration::from_secs(60), 1);
        let _ = cb
            .call(|| async { Err::<(), _>(CoreError::Transient("boom".into())) })
            .await;

        let result = cb.call(|| async { Ok::<_, CoreError>(()) }).await;
        assert!(matches!(result, Err(CoreError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn open_and_close_transitions_publish_domain_events() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_open = seen.clone();
        events.subscribe("circuit_opened", Arc::new(move |_: &DomainEvent| seen_open.lock().push("opened")));
        let seen_closed = seen.clone();
        events.subscribe("circuit_closed", Arc::new(move |_: &DomainEvent| seen_closed.lock().push("closed")));

        let cb = CircuitBreaker::new("BINANCE", 1, Duration::from_millis(5), 1).with_events(events);
        let _ = cb
            .call(|| async { Err::<(), _>(CoreError::Transient("boom".into())) })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        cb.call(|| async { Ok::<_, CoreError>(()) }).await.unwrap();

        assert_eq!(*seen.lock(), vec!["opened", "closed"]);
    }
}
