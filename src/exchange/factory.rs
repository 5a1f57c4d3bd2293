//! Breaker-and-governor-aware lookup from `Exchange` to its `ExchangePort`.
//!
//! Keeps the executor and scheduler from constructing adapters themselves;
//! one factory, built once in `AppState`, owns the shared circuit-breaker
//! registry and rate-limit governor every adapter is wired against.

use std::collections::HashMap;
use std::sync::Arc;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::models::Exchange;
use crate::rate_limit::RateLimitGovernor;

use super::ExchangePort;

pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

pub struct ExchangeFactory {
    adapters: HashMap<Exchange, Arc<dyn ExchangePort>>,
}

impl ExchangeFactory {
    pub fn build(
        credentials: HashMap<Exchange, ExchangeCredentials>,
        governor: Arc<RateLimitGovernor>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        let mut adapters: HashMap<Exchange, Arc<dyn ExchangePort>> = HashMap::new();

        for (exchange, creds) in credentials {
            let breaker = breakers.get_or_create(exchange.as_str());
            let adapter: Arc<dyn ExchangePort> = match exchange {
                Exchange::Binance => Arc::new(super::binance::BinanceAdapter::new(
                    creds.api_key,
                    creds.api_secret,
                    governor.clone(),
                    breaker,
                )),
                Exchange::Okx => Arc::new(super::okx::OkxAdapter::new(
                    creds.api_key,
                    creds.api_secret,
                    creds.passphrase.unwrap_or_default(),
                    governor.clone(),
                    breaker,
                )),
                Exchange::Bybit => Arc::new(super::bybit::BybitAdapter::new(
                    creds.api_key,
                    creds.api_secret,
                    governor.clone(),
                    breaker,
                )),
                Exchange::Bitget => Arc::new(super::bitget::BitgetAdapter::new(
                    creds.api_key,
                    creds.api_secret,
                    creds.passphrase.unwrap_or_default(),
                    governor.clone(),
                    breaker,
                )),
            };
            adapters.insert(exchange, adapter);
        }

        Self { adapters }
    }

    pub fn get(&self, exchange: Exchange) -> Option<Arc<dyn ExchangePort>> {
        self.adapters.get(&exchange).cloned()
    }
}
