//! Position diffing and signal emission.
//!
//! Computes the four-way diff between a whale's previous and current
//! position snapshot (new position opened, position closed, position size
//! increased/decreased, no change) and emits the resulting signals. The
//! on-chain path is isomorphic: a `SwapInfo` decoded by an injected
//! `SwapDetector` is converted to the same signal shape.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{Signal, SignalAction, SignalConfidence, SignalStatus, Whale};

/// A single open position as reported by a CEX leaderboard snapshot or an
/// on-chain balance read, prior to any signal emission.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedPosition {
    pub symbol: String,
    pub side: SignalAction,
    pub size_usd: Decimal,
    pub leverage: Option<u8>,
    /// Mark price at the time this snapshot was read, used to convert the
    /// delta's USD notional into the base-asset quantity the exchange
    /// adapter actually places an order for.
    pub entry_price: Decimal,
}

/// One decoded on-chain swap, already resolved to a USD amount and a
/// derived buy/sell action.
#[derive(Debug, Clone)]
pub struct SwapInfo {
    pub tx_hash: String,
    pub wallet_address: String,
    pub symbol: String,
    pub action: SignalAction,
    pub amount_usd: Decimal,
    /// Implied execution price (USD per unit of the traded asset), derived
    /// by the detector from the swap's in/out amounts. `None` when the
    /// detector could not resolve a price for the traded token.
    pub price_usd: Option<Decimal>,
}

/// Injected collaborator for on-chain ABI decoding, which lives outside
/// this crate; the differ only consumes its output.
pub trait SwapDetector: Send + Sync {
    fn detect(&self, wallet_address: &str, tx_hash: &str) -> Option<SwapInfo>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionDelta {
    Opened(ObservedPosition),
    Closed { symbol: String, side: SignalAction },
    Increased { symbol: String, side: SignalAction, delta_usd: Decimal, price: Decimal },
    Decreased { symbol: String, side: SignalAction, delta_usd: Decimal, price: Decimal },
}

/// Compares a previous snapshot of open positions against a freshly
/// polled one for a CEX leaderboard whale.
pub fn diff_cex_positions(previous: &[ObservedPosition], current: &[ObservedPosition]) -> Vec<PositionDelta> {
    let mut deltas = Vec::new();

    for cur in current {
        match previous.iter().find(|p| p.symbol == cur.symbol && p.side == cur.side) {
            None => deltas.push(PositionDelta::Opened(cur.clone())),
            Some(prev) => {
                if cur.size_usd > prev.size_usd {
                    deltas.push(PositionDelta::Increased {
                        symbol: cur.symbol.clone(),
                        side: cur.side,
                        delta_usd: cur.size_usd - prev.size_usd,
                        price: cur.entry_price,
                    });
                } else if cur.size_usd < prev.size_usd {
                    deltas.push(PositionDelta::Decreased {
                        symbol: cur.symbol.clone(),
                        side: cur.side,
                        delta_usd: prev.size_usd - cur.size_usd,
                        price: cur.entry_price,
                    });
                }
            }
        }
    }

    for prev in previous {
        if !current.iter().any(|c| c.symbol == prev.symbol && c.side == prev.side) {
            deltas.push(PositionDelta::Closed {
                symbol: prev.symbol.clone(),
                side: prev.side,
            });
        }
    }

    deltas
}

fn confidence_for_delta(delta_usd: Decimal) -> SignalConfidence {
    if delta_usd >= Decimal::from(100_000) {
        SignalConfidence::VeryHigh
    } else if delta_usd >= Decimal::from(50_000) {
        SignalConfidence::High
    } else if delta_usd >= Decimal::from(10_000) {
        SignalConfidence::Medium
    } else {
        SignalConfidence::Low
    }
}

/// Synthesizes a dedup key for CEX diffs: there is no natural tx hash, so
/// one is derived from the observable fields plus the poll tick so
/// repeated diffs of an unchanged fetch are naturally idempotent.
pub fn synthesize_dedup_key(whale_id: i64, symbol: &str, side: SignalAction, size_usd: Decimal, tick: DateTime<Utc>) -> String {
    format!("{whale_id}:{symbol}:{side:?}:{size_usd}:{}", tick.timestamp())
}

/// Builds a `Signal` for a position delta. Returns `None` for deltas too
/// small to be worth copying (a decrease under any size still matters for
/// mirror strategies, but opens/increases below a dust threshold are
/// dropped here rather than downstream).
pub fn emit_signal_for_delta(
    whale: &Whale,
    delta: &PositionDelta,
    tick: DateTime<Utc>,
    expiry: chrono::Duration,
    next_id: i64,
) -> Option<Signal> {
    const DUST_USD: i64 = 1;

    let (symbol, action, amount_usd, entry_price_hint, is_close) = match delta {
        PositionDelta::Opened(pos) => (pos.symbol.clone(), pos.side, pos.size_usd, Some(pos.entry_price), false),
        PositionDelta::Increased { symbol, side, delta_usd, price } => {
            (symbol.clone(), *side, *delta_usd, Some(*price), false)
        }
        PositionDelta::Decreased { symbol, side, delta_usd, price } => {
            (symbol.clone(), *side, *delta_usd, Some(*price), false)
        }
        PositionDelta::Closed { symbol, side } => (symbol.clone(), *side, Decimal::ZERO, None, true),
    };

    if !is_close && amount_usd < Decimal::from(DUST_USD) {
        return None;
    }

    let dedup_key = synthesize_dedup_key(whale.id, &symbol, action, amount_usd, tick);

    Some(Signal {
        id: next_id,
        whale_id: whale.id,
        dedup_key,
        symbol,
        action,
        amount_usd,
        entry_price_hint,
        confidence: confidence_for_delta(amount_usd),
        leverage: None,
        is_close,
        status: SignalStatus::Pending,
        retry_count: 0,
        error_message: None,
        created_at: tick,
        expires_at: tick + expiry,
        processed_at: None,
        version: 0,
    })
}

/// Converts a decoded on-chain swap directly into a signal; on-chain swaps
/// always have a real tx hash, so no synthesis is needed.
pub fn emit_signal_for_swap(
    whale_id: i64,
    swap: &SwapInfo,
    now: DateTime<Utc>,
    expiry: chrono::Duration,
    next_id: i64,
) -> Signal {
    Signal {
        id: next_id,
        whale_id,
        dedup_key: swap.tx_hash.clone(),
        symbol: swap.symbol.clone(),
        action: swap.action,
        amount_usd: swap.amount_usd,
        entry_price_hint: swap.price_usd,
        confidence: confidence_for_delta(swap.amount_usd),
        leverage: None,
        is_close: false,
        status: SignalStatus::Pending,
        retry_count: 0,
        error_message: None,
        created_at: now,
        expires_at: now + expiry,
        processed_at: None,
        version: 0,
    }
}
