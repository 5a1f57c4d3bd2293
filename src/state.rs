//! Composition root for the service: every shared component is constructed
//! once at startup and handed out from here rather than living behind a
//! global singleton. `AppState` owns every shared service and is cheap to
//! clone (every field is an `Arc`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::Settings;
use crate::events::EventBus;
use crate::exchange::factory::{ExchangeCredentials, ExchangeFactory};
use crate::executor::{CopyTradeExecutor, Reconciler};
use crate::janitor::Janitor;
use crate::models::Exchange;
use crate::proxy::ProxyPool;
use crate::proxy::provider::{default_sources, parse_plain_text, prepare_candidates, refresh};
use crate::queue::SignalQueue;
use crate::rate_limit::RateLimitGovernor;
use crate::repository::{
    BalanceCache, FollowRepository, PositionRepository, SignalRepository, TradeRepository,
    WhaleRepository,
};
use crate::scheduler::PollingScheduler;
use crate::sharing_validator::SharingValidator;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub events: Arc<EventBus>,
    pub whales: Arc<WhaleRepository>,
    pub follows: Arc<FollowRepository>,
    pub signals: Arc<SignalRepository>,
    pub trades: Arc<TradeRepository>,
    pub positions: Arc<PositionRepository>,
    pub balances: Arc<BalanceCache>,
    pub queue: Arc<SignalQueue>,
    pub proxies: Arc<ProxyPool>,
    pub governor: Arc<RateLimitGovernor>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub validator: Arc<SharingValidator>,
    pub exchanges: Arc<ExchangeFactory>,
    pub scheduler: Arc<PollingScheduler>,
    pub executor: Arc<CopyTradeExecutor>,
    pub reconciler: Arc<Reconciler>,
    pub janitor: Arc<Janitor>,
}

impl AppState {
    /// Build the whole pipeline from `Settings` and per-exchange API
    /// credentials. No network or filesystem I/O happens here beyond what
    /// `ExchangeFactory` does constructing its `reqwest::Client`s.
    pub fn new(settings: Settings, credentials: HashMap<Exchange, ExchangeCredentials>) -> Self {
        let settings = Arc::new(settings);
        let events = Arc::new(EventBus::new());

        let whales = Arc::new(WhaleRepository::new());
        let follows = Arc::new(FollowRepository::new());
        let signals = Arc::new(SignalRepository::new());
        let trades = Arc::new(TradeRepository::new());
        let positions = Arc::new(PositionRepository::new());
        let balances = Arc::new(BalanceCache::new());

        let queue = Arc::new(SignalQueue::new(
            settings.processing_lock_ttl_seconds,
            settings.signal_expiry_seconds,
        ));

        let proxies = Arc::new(ProxyPool::new(settings.proxy_min_active));

        let governor = Arc::new(RateLimitGovernor::new(
            settings.rate_limit_initial_backoff_seconds,
            settings.rate_limit_max_backoff_seconds,
            settings.rate_limit_backoff_multiplier,
            settings.rate_limit_jitter_factor,
            settings.rate_limit_cooldown_seconds,
        ));

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            settings.circuit_breaker_failure_threshold,
            Duration::from_secs(settings.circuit_breaker_timeout_seconds.max(0) as u64),
            settings.circuit_breaker_success_threshold,
            events.clone(),
        ));

        let validator = Arc::new(SharingValidator::new(
            settings.empty_checks_duration_threshold_seconds,
            settings.recheck_interval_hours,
        ));

        let exchanges = Arc::new(ExchangeFactory::build(
            credentials,
            governor.clone(),
            breakers.clone(),
        ));

        let scheduler = Arc::new(PollingScheduler::new(
            whales.clone(),
            follows.clone(),
            signals.clone(),
            queue.clone(),
            proxies.clone(),
            governor.clone(),
            validator.clone(),
            exchanges.clone(),
            None,
            None,
            events.clone(),
            settings.max_global_inflight,
            settings.max_inflight_per_exchange,
            settings.signal_expiry_seconds,
        ));

        let executor = Arc::new(CopyTradeExecutor::new(
            signals.clone(),
            trades.clone(),
            positions.clone(),
            follows.clone(),
            whales.clone(),
            balances.clone(),
            queue.clone(),
            exchanges.clone(),
            events.clone(),
            (*settings).clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(trades.clone(), exchanges.clone(), events.clone()));

        let janitor = Arc::new(Janitor::new(
            signals.clone(),
            trades.clone(),
            events.clone(),
            settings.signal_expiry_seconds,
            settings.exchange_call_timeout_seconds as i64,
        ));

        Self {
            settings,
            events,
            whales,
            follows,
            signals,
            trades,
            positions,
            balances,
            queue,
            proxies,
            governor,
            breakers,
            validator,
            exchanges,
            scheduler,
            executor,
            reconciler,
            janitor,
        }
    }

    /// Scheduler loop: one tick every
    /// `poll_interval_default_seconds`, stops observing the shutdown
    /// channel between whales inside `tick` itself.
    pub fn spawn_scheduler_loop(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let interval_secs = self.settings.poll_interval_default_seconds.max(1) as u64;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                if *shutdown.borrow() {
                    break;
                }
                ticker.tick().await;
                if *shutdown.borrow() {
                    break;
                }
                let fetched = scheduler.tick(&shutdown).await;
                info!(fetched, "scheduler tick complete");
            }
        })
    }

    /// Queue-drainer worker pool: one cooperative task per
    /// currently-followed user, draining at most `max_signals_per_batch`
    /// signals before yielding, per the fairness invariant.
    pub fn spawn_queue_drainer_loop(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let executor = self.executor.clone();
        let follows = self.follows.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                if *shutdown.borrow() {
                    break;
                }
                ticker.tick().await;
                let user_ids = follows.distinct_follower_ids();
                for user_id in user_ids {
                    if *shutdown.borrow() {
                        break;
                    }
                    let processed = executor.drain_user(user_id).await;
                    if processed > 0 {
                        info!(user_id, processed, "drained user signal queue");
                    }
                }
            }
        })
    }

    /// Janitor loop: stuck-signal recovery, stuck-trade
    /// reconciliation flagging, expired-queue cleanup, every
    /// `janitor_interval_seconds`.
    pub fn spawn_janitor_loop(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let janitor = self.janitor.clone();
        let interval_secs = self.settings.janitor_interval_seconds.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                if *shutdown.borrow() {
                    break;
                }
                ticker.tick().await;
                let (recovered, reconciled, expired) = janitor.sweep();
                if recovered + reconciled + expired > 0 {
                    info!(recovered, reconciled, expired, "janitor sweep complete");
                }
            }
        })
    }

    /// Reconciler loop: periodically adjudicates
    /// Trades left NEEDS_RECONCILIATION by an ambiguous exchange outcome.
    pub fn spawn_reconciler_loop(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let follows = self.follows.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                if *shutdown.borrow() {
                    break;
                }
                ticker.tick().await;
                for user_id in follows.distinct_follower_ids() {
                    let resolved = reconciler.reconcile_user(user_id).await;
                    if resolved > 0 {
                        info!(user_id, resolved, "reconciled orphaned trades");
                    }
                }
            }
        })
    }

    /// Proxy refresher: run once at startup and then on a slow interval,
    /// imports proxies from public providers, probes them, and tops the
    /// pool back up to `min_active`.
    pub fn spawn_proxy_refresher_loop(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let proxies = self.proxies.clone();
        let min_active = self.settings.proxy_min_active;
        let max_to_test = self.settings.proxy_max_to_test;
        tokio::spawn(async move {
            let client = reqwest::Client::builder()
                .timeout(crate::proxy::provider::PROBE_TIMEOUT)
                .build()
                .expect("reqwest client");
            let mut ticker = tokio::time::interval(Duration::from_secs(900));
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if proxies.needs_refresh() {
                    let mut candidates = Vec::new();
                    for source in default_sources() {
                        match client.get(source.url).send().await {
                            Ok(resp) => match resp.text().await {
                                Ok(body) => candidates.extend(parse_plain_text(&body, source.protocol)),
                                Err(err) => warn!(source = source.url, %err, "proxy source body read failed"),
                            },
                            Err(err) => warn!(source = source.url, %err, "proxy source fetch failed"),
                        }
                    }
                    let candidates = prepare_candidates(candidates, max_to_test);
                    let probe_client = client.clone();
                    refresh(&proxies, candidates, min_active, 20, |candidate| {
                        let probe_client = probe_client.clone();
                        async move {
                            probe_client
                                .get(&candidate.url)
                                .send()
                                .await
                                .map(|r| r.status().is_success())
                                .unwrap_or(false)
                        }
                    })
                    .await;
                }
                ticker.tick().await;
                if *shutdown.borrow() {
                    break;
                }
            }
        })
    }
}
