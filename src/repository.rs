//! In-memory repositories for the core entities.
//!
//! The entity graph (Whale ↔ Signal ↔ Trade ↔ Position) is naturally
//! cyclic, so each entity is keyed by a stable `i64` id and owned by a
//! repository; components look entities up by id rather than holding
//! references into each other. Everything lives in `parking_lot`-guarded
//! maps. Every mutation enforces the `version` optimistic-lock invariant.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::models::{
    BalanceCacheEntry, Position, Signal, SignalStatus, Trade, TradeStatus, Whale, WhaleFollow,
};

/// Generic id allocator shared by every repository below.
#[derive(Default)]
struct IdSeq(i64);
impl IdSeq {
    fn next(&mut self) -> i64 {
        self.0 += 1;
        self.0
    }
}

#[derive(Default)]
pub struct WhaleRepository {
    rows: RwLock<HashMap<i64, Whale>>,
    ids: RwLock<IdSeq>,
}

impl WhaleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut whale: Whale) -> i64 {
        if whale.id == 0 {
            whale.id = self.ids.write().next();
        }
        let id = whale.id;
        self.rows.write().insert(id, whale);
        id
    }

    pub fn get(&self, id: i64) -> Option<Whale> {
        self.rows.read().get(&id).cloned()
    }

    /// Whales the scheduler may consider polling right now, ordered
    /// `priority_score DESC, last_position_check ASC`.
    pub fn all_for_scheduling(&self) -> Vec<Whale> {
        let mut whales: Vec<Whale> = self.rows.read().values().cloned().collect();
        whales.sort_by(|a, b| {
            b.priority_score
                .cmp(&a.priority_score)
                .then_with(|| a.last_position_check_at.cmp(&b.last_position_check_at))
        });
        whales
    }

    /// Optimistic-lock update: `mutator` receives a mutable copy; the write
    /// only commits if `expected_version` still matches what's stored.
    pub fn update_with_version(
        &self,
        id: i64,
        expected_version: i64,
        mutator: impl FnOnce(&mut Whale),
    ) -> CoreResult<Whale> {
        let mut rows = self.rows.write();
        let whale = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::Validation(format!("whale {id} not found")))?;
        if whale.version != expected_version {
            return Err(CoreError::VersionConflict {
                entity: "whale",
                id,
            });
        }
        mutator(whale);
        whale.version += 1;
        Ok(whale.clone())
    }
}

#[derive(Default)]
pub struct FollowRepository {
    rows: RwLock<HashMap<i64, WhaleFollow>>,
    by_whale: RwLock<HashMap<i64, Vec<i64>>>,
    ids: RwLock<IdSeq>,
}

impl FollowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut follow: WhaleFollow) -> i64 {
        if follow.id == 0 {
            follow.id = self.ids.write().next();
        }
        let id = follow.id;
        self.by_whale
            .write()
            .entry(follow.whale_id)
            .or_default()
            .push(id);
        self.rows.write().insert(id, follow);
        id
    }

    pub fn get(&self, id: i64) -> Option<WhaleFollow> {
        self.rows.read().get(&id).cloned()
    }

    /// Applies an `UpdateFollowCommand` in place; follows have
    /// no `version`/terminal-status concept of their own so this is a
    /// plain guarded mutation rather than an optimistic-lock update.
    pub fn update(&self, id: i64, mutator: impl FnOnce(&mut WhaleFollow)) -> CoreResult<WhaleFollow> {
        let mut rows = self.rows.write();
        let follow = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::Validation(format!("follow {id} not found")))?;
        mutator(follow);
        follow.version += 1;
        Ok(follow.clone())
    }

    /// Every distinct user id with at least one follow, the queue-drainer
    /// and reconciler loops' work list.
    pub fn distinct_follower_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .rows
            .read()
            .values()
            .map(|f| f.user_id)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Active followers of a whale, used to fan a signal out to every
    /// subscriber.
    pub fn followers_of(&self, whale_id: i64) -> Vec<WhaleFollow> {
        let by_whale = self.by_whale.read();
        let Some(ids) = by_whale.get(&whale_id) else {
            return Vec::new();
        };
        let rows = self.rows.read();
        ids.iter()
            .filter_map(|id| rows.get(id))
            .filter(|f| f.auto_copy_enabled)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct SignalRepository {
    rows: RwLock<HashMap<i64, Signal>>,
    seen_dedup_keys: RwLock<std::collections::HashSet<String>>,
    ids: RwLock<IdSeq>,
}

impl SignalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a new signal unless its dedup key has already been seen:
    /// at most one signal per external tx id / synthesized CEX revision key.
    pub fn create_if_new(&self, mut signal: Signal) -> Option<Signal> {
        let mut seen = self.seen_dedup_keys.write();
        if !seen.insert(signal.dedup_key.clone()) {
            return None;
        }
        if signal.id == 0 {
            signal.id = self.ids.write().next();
        }
        let stored = signal.clone();
        self.rows.write().insert(signal.id, signal);
        Some(stored)
    }

    pub fn get(&self, id: i64) -> Option<Signal> {
        self.rows.read().get(&id).cloned()
    }

    pub fn update_with_version(
        &self,
        id: i64,
        expected_version: i64,
        mutator: impl FnOnce(&mut Signal),
    ) -> CoreResult<Signal> {
        let mut rows = self.rows.write();
        let signal = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::Validation(format!("signal {id} not found")))?;
        if matches!(
            signal.status,
            SignalStatus::Processed | SignalStatus::Expired | SignalStatus::Failed
        ) {
            return Err(CoreError::VersionConflict {
                entity: "signal",
                id,
            });
        }
        if signal.version != expected_version {
            return Err(CoreError::VersionConflict {
                entity: "signal",
                id,
            });
        }
        mutator(signal);
        signal.version += 1;
        Ok(signal.clone())
    }

    /// Signals stuck in PROCESSING past `signal_expiry_seconds`, candidates
    /// for the janitor's stuck-signal recovery path.
    pub fn stuck_processing(&self, older_than: chrono::Duration) -> Vec<Signal> {
        let now = Utc::now();
        self.rows
            .read()
            .values()
            .filter(|s| {
                s.status == SignalStatus::Processing
                    && now - s.created_at >= older_than
            })
            .cloned()
            .collect()
    }

    /// PENDING signals whose TTL has lapsed, for the janitor's expiry sweep.
    pub fn expired_pending(&self) -> Vec<Signal> {
        let now = Utc::now();
        self.rows
            .read()
            .values()
            .filter(|s| s.status == SignalStatus::Pending && s.is_expired(now))
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct TradeRepository {
    rows: RwLock<HashMap<i64, Trade>>,
    ids: RwLock<IdSeq>,
}

impl TradeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut trade: Trade) -> Trade {
        if trade.id == 0 {
            trade.id = self.ids.write().next();
        }
        let stored = trade.clone();
        self.rows.write().insert(trade.id, trade);
        stored
    }

    pub fn get(&self, id: i64) -> Option<Trade> {
        self.rows.read().get(&id).cloned()
    }

    pub fn update_with_version(
        &self,
        id: i64,
        expected_version: i64,
        mutator: impl FnOnce(&mut Trade),
    ) -> CoreResult<Trade> {
        let mut rows = self.rows.write();
        let trade = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::Validation(format!("trade {id} not found")))?;
        if trade.status.is_terminal() {
            return Err(CoreError::VersionConflict {
                entity: "trade",
                id,
            });
        }
        if trade.version != expected_version {
            return Err(CoreError::VersionConflict {
                entity: "trade",
                id,
            });
        }
        mutator(trade);
        trade.updated_at = Utc::now();
        trade.version += 1;
        Ok(trade.clone())
    }

    /// No-double-spend check: does this user already have a
    /// live (non-terminal-failed) trade for this signal?
    pub fn has_active_trade_for_signal(&self, signal_id: i64, user_id: i64) -> bool {
        self.rows.read().values().any(|t| {
            t.signal_id == signal_id
                && t.user_id == user_id
                && !matches!(t.status, TradeStatus::Failed | TradeStatus::Cancelled)
        })
    }

    /// Trades stuck in EXECUTING past the janitor's threshold, candidates
    /// for NEEDS_RECONCILIATION.
    pub fn stuck_executing(&self, older_than: chrono::Duration) -> Vec<Trade> {
        let now = Utc::now();
        self.rows
            .read()
            .values()
            .filter(|t| t.status == TradeStatus::Executing && now - t.created_at >= older_than)
            .cloned()
            .collect()
    }

    pub fn needs_reconciliation(&self, user_id: i64) -> Vec<Trade> {
        self.rows
            .read()
            .values()
            .filter(|t| t.user_id == user_id && t.status == TradeStatus::NeedsReconciliation)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct PositionRepository {
    rows: RwLock<HashMap<i64, Position>>,
    open_by_user_symbol: RwLock<HashMap<(i64, String), i64>>,
    ids: RwLock<IdSeq>,
}

impl PositionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut position: Position) -> Position {
        if position.id == 0 {
            position.id = self.ids.write().next();
        }
        self.open_by_user_symbol
            .write()
            .insert((position.user_id, position.symbol.clone()), position.id);
        let stored = position.clone();
        self.rows.write().insert(position.id, position);
        stored
    }

    pub fn get(&self, id: i64) -> Option<Position> {
        self.rows.read().get(&id).cloned()
    }

    pub fn open_position_for(&self, user_id: i64, symbol: &str) -> Option<Position> {
        let id = *self
            .open_by_user_symbol
            .read()
            .get(&(user_id, symbol.to_string()))?;
        self.rows.read().get(&id).cloned()
    }

    pub fn open_count_for_user(&self, user_id: i64) -> usize {
        self.rows
            .read()
            .values()
            .filter(|p| p.user_id == user_id && p.status == crate::models::PositionStatus::Open)
            .count()
    }

    pub fn update_with_version(
        &self,
        id: i64,
        expected_version: i64,
        mutator: impl FnOnce(&mut Position),
    ) -> CoreResult<Position> {
        let mut rows = self.rows.write();
        let position = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::Validation(format!("position {id} not found")))?;
        if position.status != crate::models::PositionStatus::Open {
            return Err(CoreError::VersionConflict {
                entity: "position",
                id,
            });
        }
        if position.version != expected_version {
            return Err(CoreError::VersionConflict {
                entity: "position",
                id,
            });
        }
        let was_open = position.status == crate::models::PositionStatus::Open;
        mutator(position);
        if was_open && position.status != crate::models::PositionStatus::Open {
            self.open_by_user_symbol
                .write()
                .remove(&(position.user_id, position.symbol.clone()));
        }
        position.version += 1;
        Ok(position.clone())
    }
}

/// Single-writer, many-reader balance cache: refreshed by
/// an external balance-sync job, read by the executor for eligibility
/// pre-filtering and sizing.
#[derive(Default)]
pub struct BalanceCache {
    rows: RwLock<HashMap<i64, BalanceCacheEntry>>,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, entry: BalanceCacheEntry) {
        self.rows.write().insert(entry.user_id, entry);
    }

    pub fn get(&self, user_id: i64) -> Option<BalanceCacheEntry> {
        self.rows.read().get(&user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, WhaleType};

    #[test]
    fn dedup_key_rejects_a_second_signal_with_the_same_key() {
        let repo = SignalRepository::new();
        let sig = crate::models::Signal {
            id: 0,
            whale_id: 1,
            dedup_key: "tx-1".into(),
            symbol: "BTCUSDT".into(),
            action: crate::models::SignalAction::Buy,
            amount_usd: rust_decimal::Decimal::from(1000),
            entry_price_hint: Some(rust_decimal::Decimal::from(50_000)),
            confidence: crate::models::SignalConfidence::Medium,
            leverage: None,
            is_close: false,
            status: SignalStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            processed_at: None,
            version: 0,
        };
        assert!(repo.create_if_new(sig.clone()).is_some());
        assert!(repo.create_if_new(sig).is_none());
    }

    #[test]
    fn version_conflict_on_stale_write() {
        let repo = WhaleRepository::new();
        let id = repo.insert(Whale::new_cex(0, Exchange::Binance, "uid".into()));
        assert!(repo.update_with_version(id, 5, |_| {}).is_err());
        assert!(repo.update_with_version(id, 0, |w| w.priority_score = 80).is_ok());
    }

    #[test]
    fn terminal_trade_write_is_rejected() {
        let repo = TradeRepository::new();
        let trade = repo.insert(Trade {
            id: 0,
            signal_id: 1,
            whale_id: 1,
            user_id: 1,
            client_order_id: "c1".into(),
            exchange: Exchange::Binance,
            exchange_order_id: None,
            trade_type: crate::models::TradeType::Spot,
            side: crate::models::TradeSide::Buy,
            symbol: "BTCUSDT".into(),
            requested_size_usd: rust_decimal::Decimal::from(100),
            quantity: rust_decimal::Decimal::new(2, 3),
            filled_quantity: rust_decimal::Decimal::ZERO,
            avg_fill_price: None,
            leverage: 1,
            fee_amount: rust_decimal::Decimal::ZERO,
            status: TradeStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 0,
        });
        repo.update_with_version(trade.id, 0, |t| t.status = TradeStatus::Filled)
            .unwrap();
        let result = repo.update_with_version(trade.id, 1, |t| t.status = TradeStatus::Cancelled);
        assert!(result.is_err());
    }

    #[test]
    fn followers_of_excludes_disabled_follows() {
        let repo = FollowRepository::new();
        repo.insert(WhaleFollow {
            id: 0,
            user_id: 1,
            whale_id: 9,
            auto_copy_enabled: true,
            sizing_strategy: crate::models::SizingStrategy::Fixed,
            trade_size_usdt: Some(rust_decimal::Decimal::from(100)),
            trade_size_percent: None,
            max_leverage: 5,
            exchange: Exchange::Binance,
            trades_copied: 0,
            total_profit: rust_decimal::Decimal::ZERO,
            version: 0,
        });
        repo.insert(WhaleFollow {
            id: 0,
            user_id: 2,
            whale_id: 9,
            auto_copy_enabled: false,
            sizing_strategy: crate::models::SizingStrategy::Fixed,
            trade_size_usdt: Some(rust_decimal::Decimal::from(100)),
            trade_size_percent: None,
            max_leverage: 5,
            exchange: Exchange::Binance,
            trades_copied: 0,
            total_profit: rust_decimal::Decimal::ZERO,
            version: 0,
        });
        let followers = repo.followers_of(9);
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].user_id, 1);
        let _ = WhaleType::OnChain;
    }
}
