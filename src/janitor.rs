//! Periodic janitor sweep: the small set of housekeeping duties that don't
//! belong to any single component's request path. A plain
//! `tokio::time::interval` loop with a shutdown watch.

use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::events::{DomainEvent, EventBus};
use crate::models::{SignalStatus, TradeStatus};
use crate::repository::{SignalRepository, TradeRepository};

pub struct Janitor {
    signals: Arc<SignalRepository>,
    trades: Arc<TradeRepository>,
    events: Arc<EventBus>,
    signal_expiry: Duration,
    stuck_trade_threshold: Duration,
}

impl Janitor {
    pub fn new(
        signals: Arc<SignalRepository>,
        trades: Arc<TradeRepository>,
        events: Arc<EventBus>,
        signal_expiry_seconds: i64,
        exchange_call_timeout_seconds: i64,
    ) -> Self {
        Self {
            signals,
            trades,
            events,
            signal_expiry: Duration::seconds(signal_expiry_seconds.max(0)),
            // "trades stuck in EXECUTING beyond 2 x call-timeout").
            stuck_trade_threshold: Duration::seconds(exchange_call_timeout_seconds.max(0) * 2),
        }
    }

    /// One sweep. Returns `(recovered_signals, reconciled_trades,
    /// expired_signals)` for observability/tests.
    pub fn sweep(&self) -> (usize, usize, usize) {
        let recovered = self.recover_stuck_signals();
        let reconciled = self.flag_stuck_trades();
        let expired = self.expire_pending_signals();
        (recovered, reconciled, expired)
    }

    /// (i) Signals stuck in PROCESSING beyond `signal_expiry_seconds` go
    /// back to PENDING with `retry_count+1`, or FAILED once the retry
    /// budget (3) is exhausted.
    fn recover_stuck_signals(&self) -> usize {
        let mut count = 0;
        for signal in self.signals.stuck_processing(self.signal_expiry) {
            let next_status = if signal.retry_count >= 3 {
                SignalStatus::Failed
            } else {
                SignalStatus::Pending
            };
            let result = self
                .signals
                .update_with_version(signal.id, signal.version, |s| {
                    s.status = next_status;
                    if next_status == SignalStatus::Pending {
                        s.retry_count += 1;
                    }
                });
            if result.is_ok() {
                count += 1;
                warn!(signal_id = signal.id, ?next_status, "recovered stuck-processing signal");
            }
        }
        count
    }

    /// (ii) Trades stuck in EXECUTING beyond 2x the exchange call timeout
    /// are orphaned — most likely the process died mid-call — and go to
    /// NEEDS_RECONCILIATION so the background `Reconciler` picks them up.
    fn flag_stuck_trades(&self) -> usize {
        let mut count = 0;
        for trade in self.trades.stuck_executing(self.stuck_trade_threshold) {
            let result = self
                .trades
                .update_with_version(trade.id, trade.version, |t| {
                    t.status = TradeStatus::NeedsReconciliation;
                });
            if result.is_ok() {
                count += 1;
                self.events
                    .publish(DomainEvent::TradeNeedsReconciliation { trade_id: trade.id });
            }
        }
        count
    }

    /// (iii) "expired queue entries dropped": `SignalQueue::pop_next`
    /// already silently discards TTL-expired entries as it pops, so queue
    /// memory never grows from them. This sweep instead covers the entity
    /// state this repository layer can still observe once an in-memory
    /// queue entry is gone: a PENDING signal whose `expires_at` has lapsed
    /// is marked EXPIRED so it stops looking actionable to any future
    /// query, even though it was never (or no longer) queued.
    fn expire_pending_signals(&self) -> usize {
        let mut count = 0;
        for signal in self.signals.expired_pending() {
            let result = self
                .signals
                .update_with_version(signal.id, signal.version, |s| {
                    s.status = SignalStatus::Expired
                });
            if result.is_ok() {
                count += 1;
                self.events
                    .publish(DomainEvent::SignalExpired { signal_id: signal.id });
            }
        }
        count
    }

    /// Run forever on a `tokio::time::interval`, checking `shutdown`
    /// between ticks.
    pub async fn run(&self, interval_seconds: u64, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (recovered, reconciled, expired) = self.sweep();
                    if recovered + reconciled + expired > 0 {
                        info!(recovered, reconciled, expired, "janitor sweep");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("janitor loop shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, Signal, SignalAction, SignalConfidence, Trade, TradeSide, TradeType};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn make_janitor() -> (Janitor, Arc<SignalRepository>, Arc<TradeRepository>) {
        let signals = Arc::new(SignalRepository::new());
        let trades = Arc::new(TradeRepository::new());
        let events = Arc::new(EventBus::new());
        let janitor = Janitor::new(signals.clone(), trades.clone(), events, 60, 10);
        (janitor, signals, trades)
    }

    fn stuck_signal(id: i64, retry_count: u8) -> Signal {
        Signal {
            id,
            whale_id: 1,
            dedup_key: format!("k{id}"),
            symbol: "BTCUSDT".into(),
            action: SignalAction::Buy,
            amount_usd: Decimal::from(1000),
            entry_price_hint: Some(Decimal::from(50_000)),
            confidence: SignalConfidence::Medium,
            leverage: None,
            is_close: false,
            status: SignalStatus::Processing,
            retry_count,
            error_message: None,
            created_at: Utc::now() - chrono::Duration::seconds(120),
            expires_at: Utc::now() + chrono::Duration::seconds(600),
            processed_at: None,
            version: 0,
        }
    }

    #[test]
    fn recovers_stuck_signal_to_pending_with_incremented_retry_count() {
        let (janitor, signals, _trades) = make_janitor();
        let sig = signals.create_if_new(stuck_signal(0, 0)).unwrap();
        let (recovered, _, _) = janitor.sweep();
        assert_eq!(recovered, 1);
        let updated = signals.get(sig.id).unwrap();
        assert_eq!(updated.status, SignalStatus::Pending);
        assert_eq!(updated.retry_count, 1);
    }

    #[test]
    fn exhausted_retry_budget_fails_the_signal_instead() {
        let (janitor, signals, _trades) = make_janitor();
        let sig = signals.create_if_new(stuck_signal(0, 3)).unwrap();
        let (recovered, _, _) = janitor.sweep();
        assert_eq!(recovered, 1);
        let updated = signals.get(sig.id).unwrap();
        assert_eq!(updated.status, SignalStatus::Failed);
    }

    #[test]
    fn stuck_executing_trade_becomes_needs_reconciliation() {
        let (janitor, _signals, trades) = make_janitor();
        let trade = trades.insert(Trade {
            id: 0,
            signal_id: 1,
            whale_id: 1,
            user_id: 1,
            client_order_id: "c1".into(),
            exchange: Exchange::Binance,
            exchange_order_id: None,
            trade_type: TradeType::Spot,
            side: TradeSide::Buy,
            symbol: "BTCUSDT".into(),
            requested_size_usd: Decimal::from(100),
            quantity: Decimal::from(1),
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            leverage: 1,
            fee_amount: Decimal::ZERO,
            status: TradeStatus::Pending,
            error_message: None,
            created_at: Utc::now() - chrono::Duration::seconds(30),
            updated_at: Utc::now() - chrono::Duration::seconds(30),
            version: 0,
        });
        trades
            .update_with_version(trade.id, trade.version, |t| t.status = TradeStatus::Executing)
            .unwrap();

        let (_, reconciled, _) = janitor.sweep();
        assert_eq!(reconciled, 1);
        assert_eq!(trades.get(trade.id).unwrap().status, TradeStatus::NeedsReconciliation);
    }
}
