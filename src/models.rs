//! Core data model: whales, follows, signals, trades, positions, proxies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------
// Whale
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhaleType {
    CexTrader,
    OnChain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Binance,
    Okx,
    Bybit,
    Bitget,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "BINANCE",
            Exchange::Okx => "OKX",
            Exchange::Bybit => "BYBIT",
            Exchange::Bitget => "BITGET",
        }
    }

    /// Bitget leaderboards are always public and never enter
    /// SHARING_DISABLED, regardless of observed empty-check streaks.
    pub fn always_public(&self) -> bool {
        matches!(self, Exchange::Bitget)
    }
}

/// Data-availability state machine for a whale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WhaleDataStatus {
    Active,
    SharingDisabled,
    RateLimited,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Whale {
    pub id: i64,
    pub whale_type: WhaleType,
    /// Exchange UID for CEX_TRADER, wallet address for ON_CHAIN.
    pub external_id: String,
    pub exchange: Option<Exchange>,
    pub chain: Option<String>,
    pub is_active: bool,
    pub is_verified: bool,
    pub data_status: WhaleDataStatus,
    pub consecutive_empty_checks: u32,
    pub last_position_check_at: Option<DateTime<Utc>>,
    pub last_position_found_at: Option<DateTime<Utc>>,
    pub sharing_disabled_at: Option<DateTime<Utc>>,
    pub sharing_recheck_at: Option<DateTime<Utc>>,
    pub rate_limited_until: Option<DateTime<Utc>>,
    /// 0..=100, used for priority weighting.
    pub priority_score: i32,
    pub polling_interval_seconds: u32,
    pub version: i64,
}

impl Whale {
    pub fn new_cex(id: i64, exchange: Exchange, exchange_uid: String) -> Self {
        Self {
            id,
            whale_type: WhaleType::CexTrader,
            external_id: exchange_uid,
            exchange: Some(exchange),
            chain: None,
            is_active: true,
            is_verified: false,
            data_status: WhaleDataStatus::Active,
            consecutive_empty_checks: 0,
            last_position_check_at: None,
            last_position_found_at: None,
            sharing_disabled_at: None,
            sharing_recheck_at: None,
            rate_limited_until: None,
            priority_score: 50,
            polling_interval_seconds: 60,
            version: 0,
        }
    }

    pub fn new_onchain(id: i64, chain: String, wallet_address: String) -> Self {
        Self {
            id,
            whale_type: WhaleType::OnChain,
            external_id: wallet_address,
            exchange: None,
            chain: Some(chain),
            is_active: true,
            is_verified: false,
            data_status: WhaleDataStatus::Active,
            consecutive_empty_checks: 0,
            last_position_check_at: None,
            last_position_found_at: None,
            sharing_disabled_at: None,
            sharing_recheck_at: None,
            rate_limited_until: None,
            priority_score: 50,
            polling_interval_seconds: 60,
            version: 0,
        }
    }

    /// Total elapsed time the whale has returned no positions, used by the
    /// time-based sharing threshold.
    pub fn empty_checks_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.consecutive_empty_checks as i64 * self.polling_interval_seconds as i64,
        )
    }
}

// ---------------------------------------------------------------------
// WhaleFollow
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingStrategy {
    Fixed,
    Percent,
    Kelly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleFollow {
    pub id: i64,
    pub user_id: i64,
    pub whale_id: i64,
    pub auto_copy_enabled: bool,
    pub sizing_strategy: SizingStrategy,
    pub trade_size_usdt: Option<Decimal>,
    pub trade_size_percent: Option<Decimal>,
    pub max_leverage: u8,
    pub exchange: Exchange,
    pub trades_copied: u64,
    pub total_profit: Decimal,
    pub version: i64,
}

// ---------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalConfidence {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl SignalConfidence {
    /// Point weight contributed to the priority queue's additive score.
    pub fn weight(&self) -> i32 {
        match self {
            SignalConfidence::VeryHigh => 40,
            SignalConfidence::High => 30,
            SignalConfidence::Medium => 20,
            SignalConfidence::Low => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Pending,
    Processing,
    Processed,
    Expired,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub whale_id: i64,
    /// Unique dedup key: tx_hash for on-chain swaps, synthesized for CEX
    /// leaderboard diffs.
    pub dedup_key: String,
    pub symbol: String,
    pub action: SignalAction,
    pub amount_usd: Decimal,
    /// Observed price of the underlying asset at signal detection time:
    /// the whale's fill price for a CEX leaderboard diff, the swap's
    /// implied execution price for an on-chain swap. `None` only when
    /// neither source could resolve one; `reserve` then falls back to
    /// treating `amount_usd` as already being in quote-asset quantity.
    pub entry_price_hint: Option<Decimal>,
    pub confidence: SignalConfidence,
    pub leverage: Option<u8>,
    pub is_close: bool,
    pub status: SignalStatus,
    pub retry_count: u8,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Signal {
    pub fn is_large_trade(&self) -> bool {
        self.amount_usd >= Decimal::from(50_000)
    }

    pub fn is_whale_sized(&self) -> bool {
        self.amount_usd >= Decimal::from(100_000)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------
// Trade / Position
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    Spot,
    Futures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Executing,
    Filled,
    PartiallyFilled,
    Cancelled,
    Failed,
    NeedsReconciliation,
}

impl TradeStatus {
    /// Terminal statuses never transition further once written.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Filled
                | TradeStatus::PartiallyFilled
                | TradeStatus::Cancelled
                | TradeStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub signal_id: i64,
    pub whale_id: i64,
    pub user_id: i64,
    pub client_order_id: String,
    pub exchange: Exchange,
    pub exchange_order_id: Option<String>,
    pub trade_type: TradeType,
    pub side: TradeSide,
    pub symbol: String,
    pub requested_size_usd: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub leverage: u8,
    pub fee_amount: Decimal,
    pub status: TradeStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    WhaleExit,
    Liquidation,
    AutoClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    pub whale_id: i64,
    pub entry_trade_id: i64,
    pub exit_trade_id: Option<i64>,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub leverage: u8,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Position {
    pub fn is_long(&self) -> bool {
        matches!(self.side, TradeSide::Buy | TradeSide::Long)
    }

    pub fn is_profitable(&self) -> bool {
        self.realized_pnl + self.unrealized_pnl > Decimal::ZERO
    }
}

// ---------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyProtocol {
    Http,
    Socks5,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
    pub url: String,
    pub protocol: ProxyProtocol,
    pub is_active: bool,
    pub health_score: i32,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_tested_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------
// User balance cache
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceCacheEntry {
    pub user_id: i64,
    pub exchange: Exchange,
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
    pub cached_at: DateTime<Utc>,
}

impl BalanceCacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.cached_at < ttl
    }
}

/// Request identifier helper shared by the API layer and the executor for
/// idempotency keys.
pub fn new_request_id() -> Uuid {
    Uuid::new_v4()
}
