//! CopyTradeExecutor + background Reconciler.
//!
//! Two-phase reserve/place order execution: reserve funds and create a
//! pending Trade under the user's processing lock, then call the exchange
//! adapter behind a retry envelope and resolve the Trade (and any
//! resulting Position) from the outcome. Owns a `KellyCalculator` for
//! Kelly-sized follows.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{CoreError, CoreResult};
use crate::events::{DomainEvent, EventBus};
use crate::exchange::factory::ExchangeFactory;
use crate::exchange::{self, ExchangePort, OrderResult};
use crate::models::{
    CloseReason, Position, PositionStatus, Signal, SignalAction, SignalStatus, SizingStrategy,
    Trade, TradeSide, TradeStatus, TradeType, WhaleFollow,
};
use crate::queue::SignalQueue;
use crate::repository::{
    BalanceCache, FollowRepository, PositionRepository, SignalRepository, TradeRepository,
    WhaleRepository,
};
use crate::risk::KellyCalculator;

/// Why a signal was dropped before a Trade row was ever created; surfaced
/// only through logging, since there is no separate "rejected" signal
/// status for these (the signal is left PENDING for a later, possibly-eligible,
/// retry — except the daily-loss and max-position guards, which are
/// standing conditions and would just be rejected identically next time,
/// so those transition the signal to FAILED instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReserveRejection {
    InsufficientBalanceCached,
    DirectionalConflict,
    DailyLossLimitBreached,
    MaxOpenPositions,
}

impl ReserveRejection {
    fn is_standing(&self) -> bool {
        matches!(
            self,
            ReserveRejection::DailyLossLimitBreached | ReserveRejection::MaxOpenPositions
        )
    }

    fn reason(&self) -> &'static str {
        match self {
            ReserveRejection::InsufficientBalanceCached => "insufficient_balance_cached",
            ReserveRejection::DirectionalConflict => "directional_conflict",
            ReserveRejection::DailyLossLimitBreached => "daily_loss_limit_breached",
            ReserveRejection::MaxOpenPositions => "max_open_positions",
        }
    }
}

/// Everything the executor needs to know about the user executing this
/// signal, beyond the `WhaleFollow` row itself. `daily_realized_pnl_usdt` and
/// `historical_win_rate_estimate` come from ledgers this crate does not own
/// (a daily P&L rollup, a per-user trade-history stats service); until
/// those exist this crate derives them with safe defaults rather than
/// leaving the `KELLY` strategy or the daily-loss guard unimplemented.
pub struct UserTradingContext {
    pub user_id: i64,
    pub available_balance_usdt: Decimal,
    pub daily_realized_pnl_usdt: Decimal,
    pub historical_win_rate_estimate: f64,
}

pub struct CopyTradeExecutor {
    signals: Arc<SignalRepository>,
    trades: Arc<TradeRepository>,
    positions: Arc<PositionRepository>,
    follows: Arc<FollowRepository>,
    whales: Arc<WhaleRepository>,
    balances: Arc<BalanceCache>,
    queue: Arc<SignalQueue>,
    exchanges: Arc<ExchangeFactory>,
    events: Arc<EventBus>,
    settings: Settings,
}

impl CopyTradeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signals: Arc<SignalRepository>,
        trades: Arc<TradeRepository>,
        positions: Arc<PositionRepository>,
        follows: Arc<FollowRepository>,
        whales: Arc<WhaleRepository>,
        balances: Arc<BalanceCache>,
        queue: Arc<SignalQueue>,
        exchanges: Arc<ExchangeFactory>,
        events: Arc<EventBus>,
        settings: Settings,
    ) -> Self {
        Self {
            signals,
            trades,
            positions,
            follows,
            whales,
            balances,
            queue,
            exchanges,
            events,
            settings,
        }
    }

    /// Drain up to `max_signals_per_batch` queued signals for one user,
    /// serialized behind that user's processing lock so this batch and any
    /// concurrent `copy_now` for the same user never run side by side.
    pub async fn drain_user(&self, user_id: i64) -> usize {
        if !self.queue.acquire_processing_lock(user_id) {
            // another worker already owns this user's lock; stop for now.
            return 0;
        }
        let mut processed = 0usize;
        for _ in 0..self.settings.max_signals_per_batch {
            let Some(queued) = self.queue.pop_next(user_id) else {
                break;
            };
            self.queue.extend_processing_lock(user_id);
            self.execute_one(queued.signal_id, user_id).await;
            processed += 1;
        }
        self.queue.release_processing_lock(user_id);
        processed
    }

    /// Manual "copy now" entry point for the `CopySignalCommand` control
    /// surface: executes one specific (signal, user) pair
    /// out of band from the queue's priority ordering, under the same
    /// per-user processing-lock discipline `drain_user` uses. Returns `false`
    /// without side effects if another worker already holds this user's lock.
    pub async fn copy_now(&self, signal_id: i64, user_id: i64) -> bool {
        if !self.queue.acquire_processing_lock(user_id) {
            return false;
        }
        self.execute_one(signal_id, user_id).await;
        self.queue.release_processing_lock(user_id);
        true
    }

    /// Execute one signal for one user through the full reserve/place
    /// protocol. Any early return implies the processing
    /// lock is about to be released by the caller — this method itself
    /// never touches the lock.
    async fn execute_one(&self, signal_id: i64, user_id: i64) {
        let Some(signal) = self.signals.get(signal_id) else {
            return;
        };
        if signal.status != SignalStatus::Pending {
            return;
        }
        if signal.is_expired(Utc::now()) {
            let _ = self
                .signals
                .update_with_version(signal.id, signal.version, |s| {
                    s.status = SignalStatus::Expired
                });
            self.events
                .publish(DomainEvent::SignalExpired { signal_id: signal.id });
            return;
        }

        let Some(follow) = self
            .follows
            .followers_of(signal.whale_id)
            .into_iter()
            .find(|f| f.user_id == user_id)
        else {
            return;
        };

        let Some(balance_entry) = self.balances.get(user_id) else {
            self.reject_reserve(&signal, ReserveRejection::InsufficientBalanceCached);
            return;
        };
        if balance_entry.free < Decimal::try_from(self.settings.min_trading_balance_usdt).unwrap_or(Decimal::ZERO)
        {
            self.reject_reserve(&signal, ReserveRejection::InsufficientBalanceCached);
            return;
        }
        let context = UserTradingContext {
            user_id,
            available_balance_usdt: balance_entry.free,
            daily_realized_pnl_usdt: Decimal::ZERO,
            historical_win_rate_estimate: 0.5,
        };

        let min_notional = match self.exchanges.get(follow.exchange) {
            Some(adapter) => adapter
                .get_symbol_info(&signal.symbol)
                .await
                .map(|info| info.min_notional)
                .unwrap_or(Decimal::from(5)),
            None => Decimal::from(5),
        };

        let Some(trade) = self.reserve(&signal, &follow, &context, min_notional) else {
            return;
        };

        self.place(signal, trade, follow).await;
    }

    /// Phase 1 — Reserve. Returns the freshly
    /// created PENDING `Trade` on success, having already flipped the
    /// signal to PROCESSING; returns `None` if the signal was rejected (in
    /// which case it has already been fully handled: either left PENDING
    /// for a later retry, or transitioned to FAILED for a standing guard).
    fn reserve(
        &self,
        signal: &Signal,
        follow: &WhaleFollow,
        context: &UserTradingContext,
        min_notional: Decimal,
    ) -> Option<Trade> {
        let exchange = follow.exchange;

        if let Some(open) = self.positions.open_position_for(context.user_id, &signal.symbol) {
            let opening_signal = !signal.is_close;
            let opposite_direction = (open.is_long() && signal.action == SignalAction::Sell)
                || (!open.is_long() && signal.action == SignalAction::Buy);
            if opening_signal && opposite_direction {
                self.reject_reserve(signal, ReserveRejection::DirectionalConflict);
                return None;
            }
        }

        let daily_floor = -Decimal::try_from(self.settings.daily_loss_limit_usdt).unwrap_or(Decimal::ZERO);
        if context.daily_realized_pnl_usdt < daily_floor {
            self.reject_reserve(signal, ReserveRejection::DailyLossLimitBreached);
            return None;
        }

        if self.positions.open_count_for_user(context.user_id) >= self.settings.max_open_positions {
            self.reject_reserve(signal, ReserveRejection::MaxOpenPositions);
            return None;
        }

        let size_usd = self.compute_size_usd(follow, context, signal, min_notional);
        if size_usd <= Decimal::ZERO {
            self.reject_reserve(signal, ReserveRejection::InsufficientBalanceCached);
            return None;
        }

        let leverage = follow.max_leverage.max(1);
        let trade_type = exchange::trade_type_for_leverage(leverage);
        let side = match (signal.action, signal.is_close) {
            (SignalAction::Buy, false) => {
                if trade_type == TradeType::Futures {
                    TradeSide::Long
                } else {
                    TradeSide::Buy
                }
            }
            (SignalAction::Sell, false) => {
                if trade_type == TradeType::Futures {
                    TradeSide::Short
                } else {
                    TradeSide::Sell
                }
            }
            // CLOSE signals always flatten the existing position, direction
            // of the side is whatever offsets it.
            (_, true) => self
                .positions
                .open_position_for(context.user_id, &signal.symbol)
                .map(|p| if p.is_long() { TradeSide::Sell } else { TradeSide::Buy })
                .unwrap_or(TradeSide::Sell),
        };

        // The adapter wants base-asset units, not USD notional: divide by
        // the signal's observed entry price. Signals without a price hint
        // (a malformed on-chain decode) fall back to the notional itself
        // rather than failing the whole reserve.
        let quantity = match signal.entry_price_hint {
            Some(entry_price) if entry_price > Decimal::ZERO => {
                exchange::round_quantity(size_usd / entry_price, 8)
            }
            _ => exchange::round_quantity(size_usd, 4),
        };

        let now = Utc::now();
        let trade = Trade {
            id: 0,
            signal_id: signal.id,
            whale_id: signal.whale_id,
            user_id: context.user_id,
            client_order_id: crate::models::new_request_id().to_string(),
            exchange,
            exchange_order_id: None,
            trade_type,
            side,
            symbol: signal.symbol.clone(),
            requested_size_usd: size_usd,
            quantity,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            leverage,
            fee_amount: Decimal::ZERO,
            status: TradeStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let trade = self.trades.insert(trade);

        if self
            .signals
            .update_with_version(signal.id, signal.version, |s| {
                s.status = SignalStatus::Processing
            })
            .is_err()
        {
            // lost the race to another worker (version already moved on);
            // the Trade we just inserted becomes an orphan the janitor's
            // stuck-trade sweep will pick up as NEEDS_RECONCILIATION.
            return None;
        }

        Some(trade)
    }

    fn compute_size_usd(
        &self,
        follow: &WhaleFollow,
        context: &UserTradingContext,
        signal: &Signal,
        min_notional: Decimal,
    ) -> Decimal {
        let raw = match follow.sizing_strategy {
            SizingStrategy::Fixed => follow
                .trade_size_usdt
                .unwrap_or(Decimal::from(self.settings.min_trade_size_usdt as i64)),
            SizingStrategy::Percent => {
                let pct = follow.trade_size_percent.unwrap_or(Decimal::ZERO);
                context.available_balance_usdt * pct
            }
            SizingStrategy::Kelly => {
                let kelly = KellyCalculator::new(
                    context.available_balance_usdt.to_f64().unwrap_or(0.0),
                    self.settings.kelly_base_fraction,
                );
                let whale = self.whales.get(signal.whale_id);
                let priority = whale.map(|w| w.priority_score).unwrap_or(50) as f64;
                let whale_edge = ((priority / 100.0) * context.historical_win_rate_estimate)
                    .clamp(0.01, 0.99);
                let raw_fraction = kelly.raw_fraction(whale_edge);
                let fraction = raw_fraction * kelly.fraction;
                Decimal::try_from(fraction * kelly.bankroll).unwrap_or(Decimal::ZERO)
            }
        };

        let buffered_floor = min_notional
            * (Decimal::ONE + Decimal::try_from(self.settings.trade_size_buffer_percent).unwrap_or(Decimal::ZERO));
        let floor = Decimal::try_from(self.settings.min_trade_size_usdt)
            .unwrap_or(Decimal::ZERO)
            .max(buffered_floor);
        let ceiling = Decimal::try_from(self.settings.max_trade_size_usdt)
            .unwrap_or(Decimal::MAX)
            .min(context.available_balance_usdt);

        raw.max(floor).min(ceiling.max(Decimal::ZERO))
    }

    fn reject_reserve(&self, signal: &Signal, rejection: ReserveRejection) {
        warn!(
            signal_id = signal.id,
            reason = rejection.reason(),
            "signal rejected at reserve phase"
        );
        let outcome = if rejection.is_standing() {
            SignalStatus::Failed
        } else {
            SignalStatus::Pending
        };
        let _ = self
            .signals
            .update_with_version(signal.id, signal.version, |s| s.status = outcome);
    }

    /// Phase 2 — Place.
    async fn place(&self, signal: Signal, trade: Trade, follow: WhaleFollow) {
        let Some(adapter) = self.exchanges.get(trade.exchange) else {
            self.fail_trade(&signal, &trade, "no adapter configured for exchange".to_string());
            return;
        };

        let outcome = self
            .call_with_retry(adapter.as_ref(), &trade)
            .await;

        match outcome {
            Ok(order) => self.apply_success(signal, trade, follow, order),
            Err(CoreError::Ambiguous { .. }) | Err(CoreError::Timeout(_)) => {
                self.mark_needs_reconciliation(&trade);
            }
            Err(err) => self.fail_trade(&signal, &trade, err.to_string()),
        }
    }

    async fn call_with_retry(
        &self,
        adapter: &dyn ExchangePort,
        trade: &Trade,
    ) -> CoreResult<OrderResult> {
        let mut delay = StdDuration::from_secs_f64(self.settings.exchange_retry_base_delay_seconds);
        let cap = StdDuration::from_secs_f64(self.settings.exchange_retry_max_delay_seconds);
        let mut attempt = 0u32;
        loop {
            let result = self.call_adapter(adapter, trade).await;
            match &result {
                Ok(_) => return result,
                Err(err) if err.is_retryable() && attempt < self.settings.exchange_max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        client_order_id = %trade.client_order_id,
                        error = %err,
                        "retrying exchange call"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(cap);
                }
                _ => return result,
            }
        }
    }

    async fn call_adapter(&self, adapter: &dyn ExchangePort, trade: &Trade) -> CoreResult<OrderResult> {
        match (trade.trade_type, trade.side) {
            (TradeType::Spot, TradeSide::Buy) => {
                adapter
                    .execute_spot_buy(&trade.symbol, trade.quantity, &trade.client_order_id)
                    .await
            }
            (TradeType::Spot, _) => {
                adapter
                    .execute_spot_sell(&trade.symbol, trade.quantity, &trade.client_order_id)
                    .await
            }
            (TradeType::Futures, TradeSide::Long) | (TradeType::Futures, TradeSide::Buy) => {
                adapter
                    .execute_futures_long(
                        &trade.symbol,
                        trade.quantity,
                        trade.leverage,
                        &trade.client_order_id,
                    )
                    .await
            }
            (TradeType::Futures, TradeSide::Short) => {
                adapter
                    .execute_futures_short(
                        &trade.symbol,
                        trade.quantity,
                        trade.leverage,
                        &trade.client_order_id,
                    )
                    .await
            }
            (TradeType::Futures, TradeSide::Sell) => {
                adapter
                    .close_futures_position(&trade.symbol, trade.quantity, &trade.client_order_id)
                    .await
            }
        }
    }

    fn apply_success(&self, signal: Signal, trade: Trade, _follow: WhaleFollow, order: OrderResult) {
        let status = if order.is_filled() {
            TradeStatus::Filled
        } else if order.is_partially_filled() {
            TradeStatus::PartiallyFilled
        } else {
            TradeStatus::Failed
        };

        let updated_trade = self.trades.update_with_version(trade.id, trade.version, |t| {
            t.status = status;
            t.exchange_order_id = Some(order.exchange_order_id.clone());
            t.filled_quantity = order.filled_quantity;
            t.avg_fill_price = order.avg_fill_price;
            t.fee_amount = order.fee_amount;
        });
        let Ok(updated_trade) = updated_trade else {
            self.mark_needs_reconciliation(&trade);
            return;
        };

        if !matches!(status, TradeStatus::Filled | TradeStatus::PartiallyFilled) {
            self.fail_trade(&signal, &updated_trade, "order not filled".to_string());
            return;
        }

        if signal.is_close {
            if let Some(open) = self.positions.open_position_for(trade.user_id, &trade.symbol) {
                let fill_price = order.avg_fill_price.unwrap_or(open.entry_price);
                let realized_pnl = Self::realized_pnl(&open, fill_price);
                if let Ok(closed) = self.positions.update_with_version(open.id, open.version, |p| {
                    p.status = PositionStatus::Closed;
                    p.close_reason = Some(CloseReason::WhaleExit);
                    p.current_price = fill_price;
                    p.realized_pnl = realized_pnl;
                    p.unrealized_pnl = Decimal::ZERO;
                    p.remaining_quantity = Decimal::ZERO;
                    p.exit_trade_id = Some(updated_trade.id);
                    p.closed_at = Some(Utc::now());
                }) {
                    self.events.publish(DomainEvent::PositionClosed(closed));
                }
            }
        } else {
            let fill_price = order.avg_fill_price.unwrap_or(Decimal::ZERO);
            let position = Position {
                id: 0,
                user_id: trade.user_id,
                whale_id: trade.whale_id,
                entry_trade_id: updated_trade.id,
                exit_trade_id: None,
                exchange: trade.exchange,
                symbol: trade.symbol.clone(),
                side: trade.side,
                entry_price: fill_price,
                current_price: fill_price,
                quantity: order.filled_quantity,
                remaining_quantity: order.filled_quantity,
                leverage: trade.leverage,
                status: PositionStatus::Open,
                close_reason: None,
                unrealized_pnl: Decimal::ZERO,
                realized_pnl: Decimal::ZERO,
                opened_at: Utc::now(),
                closed_at: None,
                version: 0,
            };
            let stored = self.positions.insert(position);
            self.events.publish(DomainEvent::PositionOpened(stored));
        }

        let _ = self
            .signals
            .update_with_version(signal.id, signal.version, |s| {
                s.status = SignalStatus::Processed;
                s.processed_at = Some(Utc::now());
            });
        self.events.publish(DomainEvent::TradeExecuted(updated_trade));
    }

    /// Round-trip realized P&L: long pnl = (exit - entry) * qty; short pnl
    /// = (entry - exit) * qty.
    fn realized_pnl(position: &Position, exit_price: Decimal) -> Decimal {
        if position.is_long() {
            (exit_price - position.entry_price) * position.quantity
        } else {
            (position.entry_price - exit_price) * position.quantity
        }
    }

    fn fail_trade(&self, signal: &Signal, trade: &Trade, reason: String) {
        let _ = self.trades.update_with_version(trade.id, trade.version, |t| {
            t.status = TradeStatus::Failed;
            t.error_message = Some(reason.clone());
        });

        let next_status = if signal.retry_count >= 3 {
            SignalStatus::Failed
        } else {
            SignalStatus::Pending
        };
        let _ = self
            .signals
            .update_with_version(signal.id, signal.version, |s| {
                s.status = next_status;
                if next_status == SignalStatus::Pending {
                    s.retry_count += 1;
                }
                s.error_message = Some(reason.clone());
            });

        self.events.publish(DomainEvent::TradeFailed {
            trade_id: trade.id,
            reason,
        });
    }

    fn mark_needs_reconciliation(&self, trade: &Trade) {
        if self
            .trades
            .update_with_version(trade.id, trade.version, |t| {
                t.status = TradeStatus::NeedsReconciliation;
            })
            .is_ok()
        {
            self.events
                .publish(DomainEvent::TradeNeedsReconciliation { trade_id: trade.id });
        }
    }
}

/// Background reconciler for Trades stuck in NEEDS_RECONCILIATION:
/// periodically lists open exchange orders for affected users and matches
/// by client-order-id.
pub struct Reconciler {
    trades: Arc<TradeRepository>,
    exchanges: Arc<ExchangeFactory>,
    events: Arc<EventBus>,
}

impl Reconciler {
    pub fn new(trades: Arc<TradeRepository>, exchanges: Arc<ExchangeFactory>, events: Arc<EventBus>) -> Self {
        Self {
            trades,
            exchanges,
            events,
        }
    }

    /// One reconciliation pass for a single user. Returns the number of
    /// trades resolved (either upgraded to FILLED or given up as FAILED).
    pub async fn reconcile_user(&self, user_id: i64) -> usize {
        let mut resolved = 0;
        for trade in self.trades.needs_reconciliation(user_id) {
            let Some(adapter) = self.exchanges.get(trade.exchange) else {
                continue;
            };
            let lookup = adapter.get_order_by_client_id(&trade.client_order_id).await;
            match lookup {
                Ok(Some(order)) if order.is_filled() || order.is_partially_filled() => {
                    let status = if order.is_filled() {
                        TradeStatus::Filled
                    } else {
                        TradeStatus::PartiallyFilled
                    };
                    if let Ok(updated) = self.trades.update_with_version(trade.id, trade.version, |t| {
                        t.status = status;
                        t.exchange_order_id = Some(order.exchange_order_id.clone());
                        t.filled_quantity = order.filled_quantity;
                        t.avg_fill_price = order.avg_fill_price;
                    }) {
                        resolved += 1;
                        self.events.publish(DomainEvent::TradeExecuted(updated));
                    }
                }
                Ok(Some(_)) | Ok(None) => {
                    if self
                        .trades
                        .update_with_version(trade.id, trade.version, |t| {
                            t.status = TradeStatus::Failed;
                            t.error_message = Some("no matching order found on reconciliation".into());
                        })
                        .is_ok()
                    {
                        resolved += 1;
                        self.events.publish(DomainEvent::TradeFailed {
                            trade_id: trade.id,
                            reason: "reconciliation gave up".to_string(),
                        });
                    }
                }
                Err(err) => {
                    info!(trade_id = trade.id, error = %err, "reconciliation lookup failed, retrying next pass");
                }
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::exchange::factory::ExchangeCredentials;
    use crate::models::{BalanceCacheEntry, Exchange, SignalConfidence};
    use crate::rate_limit::RateLimitGovernor;
    use std::collections::HashMap;

    fn test_settings() -> Settings {
        Settings::default()
    }

    fn make_executor() -> (CopyTradeExecutor, Arc<SignalRepository>, Arc<TradeRepository>, Arc<PositionRepository>, Arc<FollowRepository>, Arc<BalanceCache>) {
        let signals = Arc::new(SignalRepository::new());
        let trades = Arc::new(TradeRepository::new());
        let positions = Arc::new(PositionRepository::new());
        let follows = Arc::new(FollowRepository::new());
        let whales = Arc::new(WhaleRepository::new());
        let balances = Arc::new(BalanceCache::new());
        let queue = Arc::new(SignalQueue::new(60, 300));
        let events = Arc::new(EventBus::new());
        let governor = Arc::new(RateLimitGovernor::new(1.0, 30.0, 2.0, 0.3, 60));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            5,
            std::time::Duration::from_secs(60),
            2,
            events.clone(),
        ));
        let exchanges = Arc::new(ExchangeFactory::build(
            HashMap::from([(
                Exchange::Binance,
                ExchangeCredentials {
                    api_key: "k".into(),
                    api_secret: "s".into(),
                    passphrase: None,
                },
            )]),
            governor,
            breakers,
        ));
        let executor = CopyTradeExecutor::new(
            signals.clone(),
            trades.clone(),
            positions.clone(),
            follows.clone(),
            whales.clone(),
            balances.clone(),
            queue,
            exchanges,
            events,
            test_settings(),
        );
        (executor, signals, trades, positions, follows, balances)
    }

    fn sample_signal(whale_id: i64) -> Signal {
        Signal {
            id: 0,
            whale_id,
            dedup_key: "tx-1".into(),
            symbol: "BTCUSDT".into(),
            action: SignalAction::Buy,
            amount_usd: Decimal::from(1000),
            entry_price_hint: Some(Decimal::from(50_000)),
            confidence: SignalConfidence::High,
            leverage: None,
            is_close: false,
            status: SignalStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(300),
            processed_at: None,
            version: 0,
        }
    }

    fn sample_follow(user_id: i64, whale_id: i64) -> WhaleFollow {
        WhaleFollow {
            id: 0,
            user_id,
            whale_id,
            auto_copy_enabled: true,
            sizing_strategy: SizingStrategy::Fixed,
            trade_size_usdt: Some(Decimal::from(100)),
            trade_size_percent: None,
            max_leverage: 1,
            exchange: Exchange::Binance,
            trades_copied: 0,
            total_profit: Decimal::ZERO,
            version: 0,
        }
    }

    #[tokio::test]
    async fn drains_a_signal_to_a_filled_trade_and_open_position() {
        let (executor, signals, trades, positions, follows, balances) = make_executor();
        let whale_id = 1i64;
        follows.insert(sample_follow(1, whale_id));
        let signal = signals.create_if_new(sample_signal(whale_id)).unwrap();
        balances.update(BalanceCacheEntry {
            user_id: 1,
            exchange: Exchange::Binance,
            asset: "USDT".into(),
            free: Decimal::from(1000),
            locked: Decimal::ZERO,
            cached_at: Utc::now(),
        });

        executor.execute_one(signal.id, 1).await;

        let updated_signal = signals.get(signal.id).unwrap();
        assert_eq!(updated_signal.status, SignalStatus::Processed);
        let all_trades: Vec<_> = (1..=3).filter_map(|id| trades.get(id)).collect();
        assert!(all_trades.iter().any(|t| t.status == TradeStatus::Filled));
        assert_eq!(positions.open_count_for_user(1), 1);
    }

    #[tokio::test]
    async fn rejects_when_balance_cache_is_missing() {
        let (executor, signals, _trades, _positions, follows, _balances) = make_executor();
        follows.insert(sample_follow(1, 1));
        let signal = signals.create_if_new(sample_signal(1)).unwrap();

        executor.execute_one(signal.id, 1).await;

        let updated_signal = signals.get(signal.id).unwrap();
        assert_eq!(updated_signal.status, SignalStatus::Pending);
    }

    #[test]
    fn reserve_converts_usd_notional_to_base_asset_quantity() {
        let (executor, signals, _trades, _positions, _follows, _balances) = make_executor();
        let mut signal = sample_signal(1);
        signal.amount_usd = Decimal::from(1000);
        signal.entry_price_hint = Some(Decimal::from(50_000));
        let signal = signals.create_if_new(signal).unwrap();
        let mut follow = sample_follow(1, 1);
        follow.trade_size_usdt = Some(Decimal::from(1000));
        let context = UserTradingContext {
            user_id: 1,
            available_balance_usdt: Decimal::from(10_000),
            daily_realized_pnl_usdt: Decimal::ZERO,
            historical_win_rate_estimate: 0.5,
        };

        let trade = executor
            .reserve(&signal, &follow, &context, Decimal::from(5))
            .expect("reserve should accept a well-funded signal");

        assert_eq!(trade.requested_size_usd, Decimal::from(1000));
        assert_eq!(trade.quantity, Decimal::new(2, 2)); // 1000 / 50000 = 0.02
    }

    #[test]
    fn realized_pnl_matches_the_long_and_short_formulas() {
        let mut position = Position {
            id: 1,
            user_id: 1,
            whale_id: 1,
            entry_trade_id: 1,
            exit_trade_id: None,
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".into(),
            side: TradeSide::Long,
            entry_price: Decimal::from(100),
            current_price: Decimal::from(100),
            quantity: Decimal::from(2),
            remaining_quantity: Decimal::from(2),
            leverage: 1,
            status: PositionStatus::Open,
            close_reason: None,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            opened_at: Utc::now(),
            closed_at: None,
            version: 0,
        };
        assert_eq!(
            CopyTradeExecutor::realized_pnl(&position, Decimal::from(110)),
            Decimal::from(20)
        );
        position.side = TradeSide::Short;
        assert_eq!(
            CopyTradeExecutor::realized_pnl(&position, Decimal::from(90)),
            Decimal::from(20)
        );
    }
}
