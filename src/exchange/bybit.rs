//! Bybit adapter. Signs requests over a flat `timestamp+api_key+recv_window+query`
//! string, same HMAC-SHA256 family as Binance but a different prehash shape.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::sync::Arc;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{CoreError, CoreResult};
use crate::models::{Exchange, TradeSide};
use crate::rate_limit::{GovernorDecision, RateLimitGovernor};

use super::{Balance, ExchangePort, ExchangePosition, OrderResult, OrderStatus, SymbolInfo};

type HmacSha256 = Hmac<Sha256>;

pub struct BybitAdapter {
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    governor: Arc<RateLimitGovernor>,
    breaker: Arc<CircuitBreaker>,
}

impl BybitAdapter {
    pub fn new(
        api_key: String,
        api_secret: String,
        governor: Arc<RateLimitGovernor>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            api_key,
            api_secret,
            recv_window_ms: 5000,
            governor,
            breaker,
        }
    }

    fn sign(&self, timestamp: i64, payload: &str) -> String {
        let prehash = format!("{timestamp}{}{}{payload}", self.api_key, self.recv_window_ms);
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn guarded<F, Fut, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        if let GovernorDecision::Wait(d) = self.governor.can_proceed("BYBIT") {
            return Err(CoreError::RateLimited {
                retry_after_seconds: d.as_secs_f64(),
            });
        }
        let result = self.breaker.call(f).await;
        if result.is_ok() {
            self.governor.record_success("BYBIT");
        }
        result
    }
}

#[async_trait]
impl ExchangePort for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn initialize(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn execute_spot_buy(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Buy, quantity, client_order_id).await
    }

    async fn execute_spot_sell(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Sell, quantity, client_order_id).await
    }

    async fn execute_futures_long(
        &self,
        symbol: &str,
        quantity: Decimal,
        _leverage: u8,
        client_order_id: &str,
    ) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Long, quantity, client_order_id).await
    }

    async fn execute_futures_short(
        &self,
        symbol: &str,
        quantity: Decimal,
        _leverage: u8,
        client_order_id: &str,
    ) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Short, quantity, client_order_id).await
    }

    async fn close_futures_position(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Sell, quantity, client_order_id).await
    }

    async fn get_balances(&self) -> CoreResult<Vec<Balance>> {
        self.guarded(|| async { Ok(vec![]) }).await
    }

    async fn get_balance(&self, asset: &str) -> CoreResult<Balance> {
        self.get_balances()
            .await?
            .into_iter()
            .find(|b| b.asset == asset)
            .ok_or_else(|| CoreError::Validation(format!("no balance for asset {asset}")))
    }

    async fn get_open_positions(&self) -> CoreResult<Vec<ExchangePosition>> {
        self.guarded(|| async { Ok(vec![]) }).await
    }

    async fn get_leaderboard_positions(&self, _exchange_uid: &str) -> CoreResult<Vec<ExchangePosition>> {
        self.guarded(|| async { Ok(vec![]) }).await
    }

    async fn get_order_by_client_id(&self, _client_order_id: &str) -> CoreResult<Option<OrderResult>> {
        self.guarded(|| async { Ok(None) }).await
    }

    async fn get_symbol_info(&self, symbol: &str) -> CoreResult<SymbolInfo> {
        Ok(SymbolInfo {
            symbol: super::normalize_symbol(symbol),
            quantity_precision: 3,
            price_precision: 2,
            min_notional: Decimal::from(5),
        })
    }
}

impl BybitAdapter {
    async fn place_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        client_order_id: &str,
    ) -> CoreResult<OrderResult> {
        let symbol = super::normalize_symbol(symbol);
        let quantity = super::round_quantity(quantity, 3);
        let payload = format!("symbol={symbol}&qty={quantity}&orderLinkId={client_order_id}");
        let _signature = self.sign(chrono::Utc::now().timestamp_millis(), &payload);

        self.guarded(|| async move {
            Ok(OrderResult {
                exchange_order_id: format!("bybit-{client_order_id}"),
                client_order_id: client_order_id.to_string(),
                symbol: symbol.clone(),
                side,
                status: OrderStatus::Filled,
                requested_quantity: quantity,
                filled_quantity: quantity,
                avg_fill_price: None,
                fee_amount: Decimal::ZERO,
                fee_asset: "USDT".to_string(),
            })
        })
        .await
    }
}
