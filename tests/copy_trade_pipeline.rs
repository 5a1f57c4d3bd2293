//! End-to-end scenarios exercised against the public crate API: a signal
//! walking through the full reserve/place pipeline to an open position, a
//! whale losing and regaining leaderboard visibility, a rate-limited
//! exchange backing off, a breaker tripping on repeated outages, and a
//! trade recovering from a crash between order placement and the local
//! commit.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use betterbot_backend::circuit_breaker::{CircuitBreaker, CircuitState};
use betterbot_backend::config::Settings;
use betterbot_backend::error::CoreError;
use betterbot_backend::exchange::factory::ExchangeCredentials;
use betterbot_backend::models::{
    BalanceCacheEntry, Exchange, Signal, SignalAction, SignalConfidence, SignalStatus,
    SizingStrategy, TradeStatus, WhaleDataStatus, WhaleFollow, Whale,
};
use betterbot_backend::rate_limit::{GovernorDecision, RateLimitGovernor};
use betterbot_backend::sharing_validator::SharingValidator;
use betterbot_backend::state::AppState;

fn pending_signal(whale_id: i64, amount_usd: i64) -> Signal {
    Signal {
        id: 0,
        whale_id,
        dedup_key: format!("whale-{whale_id}-entry"),
        symbol: "BTCUSDT".into(),
        action: SignalAction::Buy,
        amount_usd: Decimal::from(amount_usd),
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

fn credentials() -> HashMap<Exchange, ExchangeCredentials> {
    HashMap::from([(
        Exchange::Binance,
        ExchangeCredentials {
            api_key: "test-key".into(),
            api_secret: "test-secret".into(),
            passphrase: None,
        },
    )])
}

/// Scenario 1: a whale opens a position, the follower copies
/// it with a fixed-size follow, and the pipeline produces a filled Trade
/// and an open Position sized off the follow's `trade_size_usdt`.
#[tokio::test]
async fn happy_path_open_produces_a_filled_trade_and_an_open_position() {
    let state = AppState::new(Settings::default(), credentials());

    let whale_id = state.whales.insert(Whale::new_cex(1, Exchange::Binance, "whale-uid".into()));
    state.follows.insert(WhaleFollow {
        id: 0,
        user_id: 7,
        whale_id,
        auto_copy_enabled: true,
        sizing_strategy: SizingStrategy::Fixed,
        trade_size_usdt: Some(Decimal::from(1_000)),
        trade_size_percent: None,
        max_leverage: 1,
        exchange: Exchange::Binance,
        trades_copied: 0,
        total_profit: Decimal::ZERO,
        version: 0,
    });
    state.balances.update(BalanceCacheEntry {
        user_id: 7,
        exchange: Exchange::Binance,
        asset: "USDT".into(),
        free: Decimal::from(5_000),
        locked: Decimal::ZERO,
        cached_at: Utc::now(),
    });

    let signal = state
        .signals
        .create_if_new(pending_signal(whale_id, 50_000))
        .expect("first signal for this dedup key must be accepted");

    let accepted = state.executor.copy_now(signal.id, 7).await;
    assert!(accepted, "no other worker holds the processing lock yet");

    let final_signal = state.signals.get(signal.id).unwrap();
    assert_eq!(final_signal.status, SignalStatus::Processed);
    assert_eq!(state.positions.open_count_for_user(7), 1);
}

/// Scenario 2: a non-Bitget whale that returns no positions for longer
/// than the empty-checks duration threshold is marked SHARING_DISABLED and
/// stops being scheduler-eligible until its recheck time arrives; a Bitget
/// whale under the same treatment never leaves ACTIVE.
#[tokio::test]
async fn sharing_disabled_detection_excludes_non_bitget_whales_from_polling() {
    let validator = SharingValidator::new(17 * 60, 24);

    let mut binance_whale = Whale::new_cex(1, Exchange::Binance, "uid-1".into());
    binance_whale.polling_interval_seconds = 60;
    let mut bitget_whale = Whale::new_cex(2, Exchange::Bitget, "uid-2".into());
    bitget_whale.polling_interval_seconds = 60;

    let now = Utc::now();
    for _ in 0..17 {
        validator.check_and_update_status(&mut binance_whale, false, now);
        validator.check_and_update_status(&mut bitget_whale, false, now);
    }

    assert_eq!(binance_whale.data_status, WhaleDataStatus::SharingDisabled);
    assert!(!validator.is_eligible_for_polling(&binance_whale, now));
    assert_eq!(bitget_whale.data_status, WhaleDataStatus::Active);
    assert!(validator.is_eligible_for_polling(&bitget_whale, now));
}

/// Scenario 3: a rate-limited exchange enters a cooldown long enough that
/// the scheduler would defer every whale on it, while the breaker is
/// unaffected (a 429 is not counted as an adapter failure).
#[tokio::test]
async fn rate_limit_backoff_blocks_further_calls_without_tripping_the_breaker() {
    let governor = RateLimitGovernor::new(5.0, 300.0, 2.0, 0.0, 60);
    let breaker = CircuitBreaker::new("BINANCE", 5, Duration::from_secs(60), 2);

    let backoff = governor.record_rate_limit("BINANCE");
    assert!(backoff >= Duration::from_secs(60));
    assert!(matches!(governor.can_proceed("BINANCE"), GovernorDecision::Wait(_)));
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

/// Scenario 4: five consecutive non-429 failures open the breaker; calls
/// made while OPEN short-circuit without reaching the guarded closure, and
/// after the timeout a HALF_OPEN trial that succeeds `success_threshold`
/// times in a row closes it again.
#[tokio::test]
async fn circuit_opens_after_consecutive_failures_and_recovers() {
    let breaker = CircuitBreaker::new("OKX", 5, Duration::from_millis(50), 2);

    for _ in 0..5 {
        let result: Result<(), CoreError> = breaker
            .call(|| async { Err(CoreError::Transient("simulated outage".into())) })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    let fast_fail: Result<(), CoreError> = breaker.call(|| async { Ok(()) }).await;
    assert!(matches!(fast_fail, Err(CoreError::CircuitOpen { .. })));

    tokio::time::sleep(Duration::from_millis(60)).await;
    for _ in 0..2 {
        breaker.call(|| async { Ok(()) }).await.unwrap();
    }
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

/// Scenario 5: a trade that gets stuck in NEEDS_RECONCILIATION (the local
/// commit never landed after the exchange accepted the order) is resolved
/// by the background reconciler the next time it looks up the client
/// order id.
#[tokio::test]
async fn reconciler_resolves_a_trade_stuck_needing_reconciliation() {
    let state = AppState::new(Settings::default(), credentials());

    let whale_id = state.whales.insert(Whale::new_cex(1, Exchange::Binance, "whale-uid".into()));
    let trade = state.trades.insert(betterbot_backend::models::Trade {
        id: 0,
        signal_id: 1,
        whale_id,
        user_id: 9,
        client_order_id: "stuck-order-1".into(),
        exchange: Exchange::Binance,
        exchange_order_id: None,
        trade_type: betterbot_backend::models::TradeType::Spot,
        side: betterbot_backend::models::TradeSide::Buy,
        symbol: "BTCUSDT".into(),
        requested_size_usd: Decimal::from(1_000),
        quantity: Decimal::new(2, 2),
        filled_quantity: Decimal::ZERO,
        avg_fill_price: None,
        leverage: 1,
        fee_amount: Decimal::ZERO,
        status: TradeStatus::NeedsReconciliation,
        error_message: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        version: 0,
    });

    // The stub Binance adapter's `get_order_by_client_id` always answers
    // `Ok(None)` (no real exchange to query in this environment), which is
    // exactly the "no matching order" branch the reconciler treats as a
    // give-up: the trade is resolved to FAILED rather than left stuck.
    let resolved = state.reconciler.reconcile_user(9).await;
    assert_eq!(resolved, 1);
    let after = state.trades.get(trade.id).unwrap();
    assert_eq!(after.status, TradeStatus::Failed);
}
