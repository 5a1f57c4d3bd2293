//! ExchangePort: the hexagonal boundary between the core pipeline and
//! concrete exchange APIs.
//!
//! Defines the normalized DTOs (`Balance`, `OrderResult`, `Position`) and
//! the symbol-normalization / quantity-rounding helpers every adapter
//! shares, so the rest of the system speaks exchange-native symbols only
//! inside the adapter boundary and a canonical symbol everywhere else.

pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod factory;
pub mod okx;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::models::{Exchange, TradeSide, TradeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub status: OrderStatus,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee_amount: Decimal,
    pub fee_asset: String,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn is_partially_filled(&self) -> bool {
        self.status == OrderStatus::PartiallyFilled
    }

    pub fn fill_percentage(&self) -> Decimal {
        if self.requested_quantity.is_zero() {
            return Decimal::ZERO;
        }
        (self.filled_quantity / self.requested_quantity) * Decimal::from(100)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub quantity_precision: u32,
    pub price_precision: u32,
    pub min_notional: Decimal,
}

/// Abstract boundary every exchange adapter implements; the rest of the
/// pipeline never depends on an exchange-specific type.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn initialize(&self) -> CoreResult<()>;
    async fn close(&self) -> CoreResult<()>;

    async fn execute_spot_buy(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult>;
    async fn execute_spot_sell(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult>;

    async fn execute_futures_long(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u8,
        client_order_id: &str,
    ) -> CoreResult<OrderResult>;
    async fn execute_futures_short(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u8,
        client_order_id: &str,
    ) -> CoreResult<OrderResult>;
    async fn close_futures_position(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult>;

    async fn get_balances(&self) -> CoreResult<Vec<Balance>>;
    async fn get_balance(&self, asset: &str) -> CoreResult<Balance>;
    async fn get_open_positions(&self) -> CoreResult<Vec<ExchangePosition>>;

    /// Observation op consumed by the scheduler: the public
    /// leaderboard position set for some other trader's `exchange_uid`, as
    /// distinct from `get_open_positions` (our own account). Implementations
    /// raise `CoreError::SharingDisabled`-shaped outcomes through the
    /// `CoreResult` err channel rather than a distinct exception type.
    async fn get_leaderboard_positions(&self, exchange_uid: &str) -> CoreResult<Vec<ExchangePosition>>;

    /// Look up an order placed earlier by client order id, used by the
    /// reconciliation loop to resolve ambiguous outcomes.
    async fn get_order_by_client_id(&self, client_order_id: &str) -> CoreResult<Option<OrderResult>>;

    async fn get_symbol_info(&self, symbol: &str) -> CoreResult<SymbolInfo>;
}

/// Normalize an exchange-native symbol: uppercase, strip separators.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.to_uppercase().replace(['/', '-', '_'], "")
}

/// Round a quantity down to `precision` decimal places; exchanges reject
/// orders with excess precision, so this truncates rather than rounds.
pub fn round_quantity(quantity: Decimal, precision: u32) -> Decimal {
    quantity.trunc_with_scale(precision)
}

pub fn round_price(price: Decimal, precision: u32) -> Decimal {
    price.round_dp(precision)
}

pub fn trade_type_for_leverage(leverage: u8) -> TradeType {
    if leverage > 1 {
        TradeType::Futures
    } else {
        TradeType::Spot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_symbol_strips_separators_and_upcases() {
        assert_eq!(normalize_symbol("btc-usdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("btc_usdt_swap"), "BTCUSDTSWAP");
    }

    #[test]
    fn round_quantity_truncates_not_rounds() {
        let q = Decimal::new(123456, 5); // 1.23456
        assert_eq!(round_quantity(q, 2), Decimal::new(123, 2));
    }
}
