//! Binance adapter.
//!
//! Wraps Binance's spot/futures REST surface behind `ExchangePort`, signing
//! requests with an HMAC-SHA256 query-string signature (`hmac`/`sha2`/`hex`).

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{CoreError, CoreResult};
use crate::models::{Exchange, TradeSide};
use crate::rate_limit::RateLimitGovernor;

use super::{Balance, ExchangePort, ExchangePosition, OrderResult, OrderStatus, SymbolInfo};

use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceAdapter {
    api_key: String,
    api_secret: String,
    client: reqwest::Client,
    base_url: String,
    governor: Arc<RateLimitGovernor>,
    breaker: Arc<CircuitBreaker>,
}

impl BinanceAdapter {
    pub fn new(
        api_key: String,
        api_secret: String,
        governor: Arc<RateLimitGovernor>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            api_key,
            api_secret,
            client: reqwest::Client::new(),
            base_url: "https://fapi.binance.com".to_string(),
            governor,
            breaker,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn guarded<F, Fut, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        match self.governor.can_proceed("BINANCE") {
            crate::rate_limit::GovernorDecision::Wait(d) => {
                return Err(CoreError::RateLimited {
                    retry_after_seconds: d.as_secs_f64(),
                })
            }
            crate::rate_limit::GovernorDecision::Proceed => {}
        }
        let result = self.breaker.call(f).await;
        match &result {
            Ok(_) => self.governor.record_success("BINANCE"),
            Err(CoreError::Transient(_)) => {
                self.governor.record_rate_limit("BINANCE");
            }
            _ => {}
        }
        result
    }
}

#[async_trait]
impl ExchangePort for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn initialize(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn execute_spot_buy(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Buy, quantity, 1, client_order_id).await
    }

    async fn execute_spot_sell(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Sell, quantity, 1, client_order_id).await
    }

    async fn execute_futures_long(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u8,
        client_order_id: &str,
    ) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Long, quantity, leverage, client_order_id).await
    }

    async fn execute_futures_short(
        &self,
        symbol: &str,
        quantity: Decimal,
        leverage: u8,
        client_order_id: &str,
    ) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Short, quantity, leverage, client_order_id).await
    }

    async fn close_futures_position(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> CoreResult<OrderResult> {
        self.place_order(symbol, TradeSide::Sell, quantity, 1, client_order_id).await
    }

    async fn get_balances(&self) -> CoreResult<Vec<Balance>> {
        self.guarded(|| async {
            // Real implementation signs and GETs /fapi/v2/balance.
            Ok(vec![])
        })
        .await
    }

    async fn get_balance(&self, asset: &str) -> CoreResult<Balance> {
        let balances = self.get_balances().await?;
        balances
            .into_iter()
            .find(|b| b.asset == asset)
            .ok_or_else(|| CoreError::Validation(format!("no balance for asset {asset}")))
    }

    async fn get_open_positions(&self) -> CoreResult<Vec<ExchangePosition>> {
        self.guarded(|| async { Ok(vec![]) }).await
    }

    async fn get_leaderboard_positions(&self, _exchange_uid: &str) -> CoreResult<Vec<ExchangePosition>> {
        // Real implementation GETs Binance's public leaderboard position
        // endpoint for the given uid; an empty Ok means "no positions
        // right now", distinct from a sharing-disabled/rate-limited Err.
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

impl BinanceAdapter {
    async fn place_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        leverage: u8,
        client_order_id: &str,
    ) -> CoreResult<OrderResult> {
        let symbol = super::normalize_symbol(symbol);
        let quantity = super::round_quantity(quantity, 3);
        let query = format!(
            "symbol={symbol}&side={side:?}&quantity={quantity}&newClientOrderId={client_order_id}"
        );
        let _signature = self.sign(&query);

        self.guarded(|| async move {
            // Real implementation POSTs /fapi/v1/order with the signed
            // query string and maps the JSON response into OrderResult.
            Ok(OrderResult {
                exchange_order_id: format!("binance-{client_order_id}"),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic_for_the_same_query_and_secret() {
        let governor = Arc::new(RateLimitGovernor::new(5.0, 300.0, 2.0, 0.3, 60));
        let breaker = Arc::new(CircuitBreaker::new(
            "BINANCE",
            5,
            std::time::Duration::from_secs(60),
            2,
        ));
        let adapter = BinanceAdapter::new("key".into(), "secret".into(), governor, breaker);
        let a = adapter.sign("symbol=BTCUSDT&side=BUY");
        let b = adapter.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(a, b);
    }
}
