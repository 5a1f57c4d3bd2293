//! PollingScheduler: decides which whales to observe on each tick and
//! fans fetches out behind the proxy pool, rate-limit governor, and circuit
//! breakers.
//!
//! One `tokio::sync::Semaphore` per exchange bounds
//! `max_inflight_per_exchange`, a global `Semaphore` bounds total
//! concurrency. Each tick checks a shutdown signal between whales.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::differ::{
    diff_cex_positions, emit_signal_for_delta, emit_signal_for_swap, ObservedPosition, SwapDetector,
};
use crate::error::CoreError;
use crate::events::{DomainEvent, EventBus};
use crate::exchange::factory::ExchangeFactory;
use crate::models::{Exchange, SignalAction, Whale, WhaleDataStatus, WhaleType};
use crate::proxy::{ProxyOutcome, ProxyPool};
use crate::queue::SignalQueue;
use crate::rate_limit::{GovernorDecision, RateLimitGovernor};
use crate::repository::{FollowRepository, SignalRepository, WhaleRepository};
use crate::sharing_validator::SharingValidator;

/// Injected collaborator that surfaces new on-chain transaction hashes for
/// a tracked wallet; ABI decoding itself lives behind `SwapDetector`, not here.
#[async_trait::async_trait]
pub trait TransactionFeed: Send + Sync {
    async fn poll_new_hashes(&self, wallet_address: &str, chain: &str) -> Result<Vec<String>, CoreError>;
}

/// Warm per-whale snapshot cache the differ compares against. TTL-less here: entries are replaced
/// on every successful fetch and naturally bounded by the whale set size.
#[derive(Default)]
pub struct SnapshotCache {
    cex: Mutex<HashMap<i64, Vec<ObservedPosition>>>,
    onchain_seen_hashes: Mutex<HashMap<i64, std::collections::HashSet<String>>>,
}

enum ProxyFailure {
    Network,
    Banned,
    Benign,
}

pub struct PollingScheduler {
    whales: Arc<WhaleRepository>,
    follows: Arc<FollowRepository>,
    signals: Arc<SignalRepository>,
    queue: Arc<SignalQueue>,
    proxies: Arc<ProxyPool>,
    governor: Arc<RateLimitGovernor>,
    validator: Arc<SharingValidator>,
    exchanges: Arc<ExchangeFactory>,
    swap_detector: Option<Arc<dyn SwapDetector>>,
    tx_feed: Option<Arc<dyn TransactionFeed>>,
    events: Arc<EventBus>,
    snapshots: Arc<SnapshotCache>,
    global_inflight: Arc<Semaphore>,
    per_exchange_inflight: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_inflight_per_exchange: usize,
    signal_expiry: chrono::Duration,
}

impl PollingScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        whales: Arc<WhaleRepository>,
        follows: Arc<FollowRepository>,
        signals: Arc<SignalRepository>,
        queue: Arc<SignalQueue>,
        proxies: Arc<ProxyPool>,
        governor: Arc<RateLimitGovernor>,
        validator: Arc<SharingValidator>,
        exchanges: Arc<ExchangeFactory>,
        swap_detector: Option<Arc<dyn SwapDetector>>,
        tx_feed: Option<Arc<dyn TransactionFeed>>,
        events: Arc<EventBus>,
        max_global_inflight: usize,
        max_inflight_per_exchange: usize,
        signal_expiry_seconds: i64,
    ) -> Self {
        Self {
            whales,
            follows,
            signals,
            queue,
            proxies,
            governor,
            validator,
            exchanges,
            swap_detector,
            tx_feed,
            events,
            snapshots: Arc::new(SnapshotCache::default()),
            global_inflight: Arc::new(Semaphore::new(max_global_inflight.max(1))),
            per_exchange_inflight: Mutex::new(HashMap::new()),
            max_inflight_per_exchange: max_inflight_per_exchange.max(1),
            signal_expiry: chrono::Duration::seconds(signal_expiry_seconds.max(1)),
        }
    }

    fn exchange_semaphore(&self, exchange: &str) -> Arc<Semaphore> {
        self.per_exchange_inflight
            .lock()
            .entry(exchange.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_inflight_per_exchange)))
            .clone()
    }

    /// One scheduler tick: select eligible whales by the poll-eligibility
    /// predicate, then fetch each concurrently (bounded). Returns the
    /// number of whales actually fetched (the rest were deferred for lack
    /// of rate-limit budget or a free proxy).
    ///
    /// Fetches run as concurrent futures on the calling task rather than
    /// `tokio::spawn`ed tasks: a leased proxy borrows the pool for the
    /// lease's lifetime, which a spawned `'static` task can't hold.
    pub async fn tick(&self, shutdown: &tokio::sync::watch::Receiver<bool>) -> usize {
        let now = Utc::now();
        let candidates: Vec<Whale> = self
            .whales
            .all_for_scheduling()
            .into_iter()
            .filter(|w| self.validator.is_eligible_for_polling(w, now))
            .collect();

        let mut fetched = 0usize;
        let mut futures: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>> = Vec::new();

        for whale in candidates {
            if *shutdown.borrow() {
                info!("scheduler tick interrupted by shutdown signal");
                break;
            }

            match whale.whale_type {
                WhaleType::CexTrader => {
                    let Some(exchange) = whale.exchange else { continue };
                    if let GovernorDecision::Wait(_) = self.governor.can_proceed(exchange.as_str()) {
                        debug!(whale_id = whale.id, exchange = exchange.as_str(), "deferred: no rate-limit budget");
                        continue;
                    }
                    let Some(leased) = self.proxies.lease() else {
                        debug!(whale_id = whale.id, "deferred: no proxy available");
                        continue;
                    };

                    let global = self.global_inflight.clone();
                    let per_exchange = self.exchange_semaphore(exchange.as_str());
                    fetched += 1;
                    futures.push(Box::pin(async move {
                        let _global_permit = global.acquire_owned().await.ok();
                        let _exchange_permit = per_exchange.acquire_owned().await.ok();
                        let outcome = self.fetch_cex_whale(&whale, exchange).await;
                        match outcome {
                            Ok(()) => leased.release(ProxyOutcome::Success),
                            Err(ProxyFailure::Network) => leased.release(ProxyOutcome::Failure),
                            Err(ProxyFailure::Banned) => leased.release(ProxyOutcome::Banned),
                            Err(ProxyFailure::Benign) => leased.release(ProxyOutcome::Success),
                        }
                    }));
                }
                WhaleType::OnChain => {
                    let Some(tx_feed) = self.tx_feed.clone() else { continue };
                    let global = self.global_inflight.clone();
                    fetched += 1;
                    futures.push(Box::pin(async move {
                        let _permit = global.acquire_owned().await.ok();
                        self.fetch_onchain_whale(&whale, tx_feed).await;
                    }));
                }
            }
        }

        futures_util::future::join_all(futures).await;
        fetched
    }

    async fn fetch_cex_whale(&self, whale: &Whale, exchange: Exchange) -> Result<(), ProxyFailure> {
        let Some(adapter) = self.exchanges.get(exchange) else {
            warn!(whale_id = whale.id, exchange = exchange.as_str(), "no adapter configured");
            return Err(ProxyFailure::Benign);
        };

        let now = Utc::now();
        let result = adapter.get_leaderboard_positions(&whale.external_id).await;

        let (found_positions, failure) = match &result {
            Ok(positions) => (!positions.is_empty(), None),
            Err(CoreError::SharingDisabled) => (false, None),
            Err(CoreError::RateLimited { retry_after_seconds }) => {
                self.governor.record_rate_limit(exchange.as_str());
                let until = now + chrono::Duration::seconds(*retry_after_seconds as i64);
                if let Some(w) = self.whales.get(whale.id) {
                    let version = w.version;
                    let _ = self.whales.update_with_version(whale.id, version, |w| {
                        self.validator.mark_rate_limited(w, until);
                    });
                }
                return Err(ProxyFailure::Benign);
            }
            Err(CoreError::Transient(_)) | Err(CoreError::Timeout(_)) => {
                // Ambiguous/network: do not touch the empty-check counter.
                return Err(ProxyFailure::Network);
            }
            Err(_) => (false, Some(())),
        };
        let _ = failure;
        self.governor.record_success(exchange.as_str());

        let Some(mut stored) = self.whales.get(whale.id) else {
            return Ok(());
        };
        let version = stored.version;
        let is_sharing_disabled_error = matches!(result, Err(CoreError::SharingDisabled));
        let updated = self.whales.update_with_version(whale.id, version, |w| {
            if is_sharing_disabled_error {
                w.data_status = WhaleDataStatus::SharingDisabled;
                w.sharing_disabled_at = Some(now);
                w.sharing_recheck_at = Some(now + self.validator.recheck_interval);
            } else {
                self.validator.check_and_update_status(w, found_positions, now);
            }
        });
        let Ok(updated) = updated else { return Ok(()) };
        if updated.data_status == WhaleDataStatus::SharingDisabled
            && stored.data_status != WhaleDataStatus::SharingDisabled
        {
            self.events
                .publish(DomainEvent::WhaleSharingDisabled { whale_id: whale.id });
        }
        stored = updated;

        let Ok(positions) = result else { return Ok(()) };
        let current: Vec<ObservedPosition> = positions
            .into_iter()
            .map(|p| ObservedPosition {
                symbol: p.symbol,
                side: match p.side {
                    crate::models::TradeSide::Sell | crate::models::TradeSide::Short => SignalAction::Sell,
                    _ => SignalAction::Buy,
                },
                size_usd: p.quantity * p.mark_price,
                leverage: Some(p.leverage),
                entry_price: p.mark_price,
            })
            .collect();

        let previous = self
            .snapshots
            .cex
            .lock()
            .insert(whale.id, current.clone())
            .unwrap_or_default();

        let deltas = diff_cex_positions(&previous, &current);
        let mut emitted = Vec::new();
        for delta in &deltas {
            if let Some(signal) = emit_signal_for_delta(&stored, delta, now, self.signal_expiry, 0) {
                if let Some(persisted) = self.signals.create_if_new(signal) {
                    emitted.push(persisted);
                }
            }
        }

        for signal in emitted {
            self.events.publish(DomainEvent::SignalEmitted(signal.clone()));
            self.fan_out_to_followers(&signal, &stored);
        }

        Ok(())
    }

    async fn fetch_onchain_whale(&self, whale: &Whale, tx_feed: Arc<dyn TransactionFeed>) {
        let Some(chain) = whale.chain.clone() else { return };
        let Some(detector) = self.swap_detector.clone() else { return };

        let hashes = match tx_feed.poll_new_hashes(&whale.external_id, &chain).await {
            Ok(h) => h,
            Err(_) => return,
        };

        let mut seen_guard = self.snapshots.onchain_seen_hashes.lock();
        let seen = seen_guard.entry(whale.id).or_default();
        let fresh: Vec<String> = hashes.into_iter().filter(|h| seen.insert(h.clone())).collect();
        drop(seen_guard);

        let now = Utc::now();
        for tx_hash in fresh {
            let Some(swap) = detector.detect(&whale.external_id, &tx_hash) else {
                continue;
            };
            let signal = emit_signal_for_swap(whale.id, &swap, now, self.signal_expiry, 0);
            if let Some(persisted) = self.signals.create_if_new(signal) {
                self.events.publish(DomainEvent::SignalEmitted(persisted.clone()));
                self.fan_out_to_followers(&persisted, whale);
            }
        }

        if let Some(w) = self.whales.get(whale.id) {
            let version = w.version;
            let _ = self.whales.update_with_version(whale.id, version, |w| {
                self.validator.check_and_update_status(w, true, now);
            });
        }
    }

    /// Enqueues a freshly emitted signal for every active follower of the
    /// originating whale.
    fn fan_out_to_followers(&self, signal: &crate::models::Signal, whale: &Whale) {
        for follow in self.follows.followers_of(whale.id) {
            self.queue.enqueue(follow.user_id, signal, whale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::exchange::factory::{ExchangeCredentials, ExchangeFactory};
    use crate::models::Exchange as Ex;
    use std::time::Duration;

    fn make_scheduler() -> (Arc<WhaleRepository>, Arc<FollowRepository>, Arc<SignalRepository>, Arc<SignalQueue>, PollingScheduler) {
        let whales = Arc::new(WhaleRepository::new());
        let follows = Arc::new(FollowRepository::new());
        let signals = Arc::new(SignalRepository::new());
        let queue = Arc::new(SignalQueue::new(60, 300));
        let proxies = Arc::new(ProxyPool::new(0));
        proxies.add("http://1.2.3.4:8080".into(), crate::models::ProxyProtocol::Http);
        let governor = Arc::new(RateLimitGovernor::new(1.0, 30.0, 2.0, 0.0, 1));
        let validator = Arc::new(SharingValidator::new(17 * 60, 24));
        let events = Arc::new(EventBus::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(5, Duration::from_secs(60), 2, events.clone()));
        let mut creds = HashMap::new();
        creds.insert(
            Ex::Binance,
            ExchangeCredentials {
                api_key: "k".into(),
                api_secret: "s".into(),
                passphrase: None,
            },
        );
        let exchanges = Arc::new(ExchangeFactory::build(creds, governor.clone(), breakers));

        let scheduler = PollingScheduler::new(
            whales.clone(),
            follows.clone(),
            signals.clone(),
            queue.clone(),
            proxies,
            governor,
            validator,
            exchanges,
            None,
            None,
            events,
            8,
            4,
            60,
        );
        (whales, follows, signals, queue, scheduler)
    }

    #[tokio::test]
    async fn tick_skips_inactive_whales() {
        let (whales, _follows, _signals, _queue, scheduler) = make_scheduler();
        let mut whale = Whale::new_cex(0, Ex::Binance, "uid".into());
        whale.is_active = false;
        whales.insert(whale);

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let fetched = scheduler.tick(&rx).await;
        assert_eq!(fetched, 0);
    }

    #[tokio::test]
    async fn tick_fetches_active_eligible_whale() {
        let (whales, _follows, _signals, _queue, scheduler) = make_scheduler();
        whales.insert(Whale::new_cex(0, Ex::Binance, "uid".into()));

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let fetched = scheduler.tick(&rx).await;
        assert_eq!(fetched, 1);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_tick_early() {
        let (whales, _follows, _signals, _queue, scheduler) = make_scheduler();
        for _ in 0..5 {
            whales.insert(Whale::new_cex(0, Ex::Binance, "uid".into()));
        }
        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        let fetched = scheduler.tick(&rx).await;
        assert_eq!(fetched, 0);
    }
}
