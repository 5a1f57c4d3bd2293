//! Domain error taxonomy, one enum per component boundary rather than a
//! class-per-exception hierarchy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Network/exchange hiccup expected to clear on retry (timeouts,
    /// 5xx, connection resets). Callers should retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The observed trader's positions are not currently shareable (the
    /// adapter has no whale identity of its own, only the exchange_uid it
    /// was asked to observe); not a failure — the caller advances the
    /// whale state machine with no user-visible error.
    #[error("sharing disabled")]
    SharingDisabled,

    /// The follow relationship, signal, or trade is not in a state that
    /// allows the requested operation (e.g. expired signal, closed follow).
    #[error("ineligible: {0}")]
    Ineligible(String),

    /// Caller-supplied input failed a domain invariant check.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The exchange explicitly rejected the order (insufficient balance,
    /// invalid symbol, below minimum notional, etc).
    #[error("exchange rejected order: {0}")]
    ExchangeRejected(String),

    /// The outcome of a trade placement could not be determined (e.g. the
    /// connection dropped after submission); needs reconciliation.
    #[error("ambiguous outcome for client_order_id {client_order_id}")]
    Ambiguous { client_order_id: String },

    /// Circuit breaker is open for this exchange.
    #[error("circuit open for {exchange}")]
    CircuitOpen { exchange: String },

    /// Rate limit budget exhausted; retry after the given cooldown.
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: f64 },

    /// A repository-level optimistic concurrency conflict (version
    /// mismatch on write).
    #[error("version conflict on {entity} {id}")]
    VersionConflict { entity: &'static str, id: i64 },

    /// Operation exceeded its allotted time budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Anything else, wrapping the underlying cause for diagnostics.
    #[error("unexpected error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether this error represents a condition safe to retry against
    /// the same exchange without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_) | CoreError::RateLimited { .. } | CoreError::Timeout(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
