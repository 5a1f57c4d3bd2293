//! Application configuration, loaded from the environment.
//!
//! `dotenv` + `std::env::var(...).unwrap_or_else(...)` for every tunable,
//! consolidated into a single immutable `Settings` struct built once at
//! startup.

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,

    // Scheduler / polling
    pub poll_interval_default_seconds: u32,
    pub max_inflight_per_exchange: usize,
    pub max_global_inflight: usize,

    // Sharing validator
    pub empty_checks_duration_threshold_seconds: i64,
    pub recheck_interval_hours: i64,

    // Rate limit governor
    pub rate_limit_initial_backoff_seconds: f64,
    pub rate_limit_max_backoff_seconds: f64,
    pub rate_limit_backoff_multiplier: f64,
    pub rate_limit_jitter_factor: f64,
    pub rate_limit_cooldown_seconds: i64,

    // Circuit breaker
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_timeout_seconds: i64,
    pub circuit_breaker_success_threshold: u32,

    // Exchange adapter retry envelope
    pub exchange_max_retries: u32,
    pub exchange_retry_base_delay_seconds: f64,
    pub exchange_retry_max_delay_seconds: f64,

    // Signal queue
    pub signal_expiry_seconds: i64,
    pub processing_lock_ttl_seconds: i64,
    pub balance_cache_ttl_seconds: i64,
    pub max_signal_retry_count: u8,

    // Trade sizing bounds
    pub min_trade_size_usdt: f64,
    pub max_trade_size_usdt: f64,
    pub default_leverage: u8,
    pub max_leverage: u8,

    // Executor eligibility/sizing guards
    pub min_trading_balance_usdt: f64,
    pub trade_size_buffer_percent: f64,
    pub max_open_positions: usize,
    pub daily_loss_limit_usdt: f64,
    pub kelly_base_fraction: f64,
    pub max_signals_per_batch: usize,
    pub exchange_call_timeout_seconds: u64,

    // Proxy pool
    pub proxy_min_active: usize,
    pub proxy_max_to_test: usize,
    pub proxy_stale_unused_hours: i64,

    // Janitor
    pub janitor_interval_seconds: u64,

    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: "./copytrade.db".to_string(),
            poll_interval_default_seconds: 60,
            max_inflight_per_exchange: 8,
            max_global_inflight: 32,
            empty_checks_duration_threshold_seconds: 17 * 60,
            recheck_interval_hours: 24,
            rate_limit_initial_backoff_seconds: 5.0,
            rate_limit_max_backoff_seconds: 300.0,
            rate_limit_backoff_multiplier: 2.0,
            rate_limit_jitter_factor: 0.3,
            rate_limit_cooldown_seconds: 60,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout_seconds: 60,
            circuit_breaker_success_threshold: 2,
            exchange_max_retries: 3,
            exchange_retry_base_delay_seconds: 1.0,
            exchange_retry_max_delay_seconds: 30.0,
            signal_expiry_seconds: 60,
            processing_lock_ttl_seconds: 60,
            balance_cache_ttl_seconds: 30,
            max_signal_retry_count: 3,
            min_trade_size_usdt: 10.0,
            max_trade_size_usdt: 10_000.0,
            default_leverage: 5,
            max_leverage: 20,
            min_trading_balance_usdt: 25.0,
            trade_size_buffer_percent: 0.05,
            max_open_positions: 15,
            daily_loss_limit_usdt: 500.0,
            kelly_base_fraction: 0.25,
            max_signals_per_batch: 50,
            exchange_call_timeout_seconds: 10,
            proxy_min_active: 10,
            proxy_max_to_test: 500,
            proxy_stale_unused_hours: 1,
            janitor_interval_seconds: 30,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or(defaults.database_path),
            poll_interval_default_seconds: env_or(
                "POLL_INTERVAL_DEFAULT_SECONDS",
                defaults.poll_interval_default_seconds,
            ),
            max_inflight_per_exchange: env_or(
                "MAX_INFLIGHT_PER_EXCHANGE",
                defaults.max_inflight_per_exchange,
            ),
            max_global_inflight: env_or("MAX_GLOBAL_INFLIGHT", defaults.max_global_inflight),
            empty_checks_duration_threshold_seconds: env_or(
                "EMPTY_CHECKS_DURATION_THRESHOLD_SECONDS",
                defaults.empty_checks_duration_threshold_seconds,
            ),
            recheck_interval_hours: env_or(
                "RECHECK_INTERVAL_HOURS",
                defaults.recheck_interval_hours,
            ),
            rate_limit_initial_backoff_seconds: env_or(
                "RATE_LIMIT_INITIAL_BACKOFF_SECONDS",
                defaults.rate_limit_initial_backoff_seconds,
            ),
            rate_limit_max_backoff_seconds: env_or(
                "RATE_LIMIT_MAX_BACKOFF_SECONDS",
                defaults.rate_limit_max_backoff_seconds,
            ),
            rate_limit_backoff_multiplier: env_or(
                "RATE_LIMIT_BACKOFF_MULTIPLIER",
                defaults.rate_limit_backoff_multiplier,
            ),
            rate_limit_jitter_factor: env_or(
                "RATE_LIMIT_JITTER_FACTOR",
                defaults.rate_limit_jitter_factor,
            ),
            rate_limit_cooldown_seconds: env_or(
                "RATE_LIMIT_COOLDOWN_SECONDS",
                defaults.rate_limit_cooldown_seconds,
            ),
            circuit_breaker_failure_threshold: env_or(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                defaults.circuit_breaker_failure_threshold,
            ),
            circuit_breaker_timeout_seconds: env_or(
                "CIRCUIT_BREAKER_TIMEOUT_SECONDS",
                defaults.circuit_breaker_timeout_seconds,
            ),
            circuit_breaker_success_threshold: env_or(
                "CIRCUIT_BREAKER_SUCCESS_THRESHOLD",
                defaults.circuit_breaker_success_threshold,
            ),
            exchange_max_retries: env_or("EXCHANGE_MAX_RETRIES", defaults.exchange_max_retries),
            exchange_retry_base_delay_seconds: env_or(
                "EXCHANGE_RETRY_BASE_DELAY_SECONDS",
                defaults.exchange_retry_base_delay_seconds,
            ),
            exchange_retry_max_delay_seconds: env_or(
                "EXCHANGE_RETRY_MAX_DELAY_SECONDS",
                defaults.exchange_retry_max_delay_seconds,
            ),
            signal_expiry_seconds: env_or("SIGNAL_EXPIRY_SECONDS", defaults.signal_expiry_seconds),
            processing_lock_ttl_seconds: env_or(
                "PROCESSING_LOCK_TTL_SECONDS",
                defaults.processing_lock_ttl_seconds,
            ),
            balance_cache_ttl_seconds: env_or(
                "BALANCE_CACHE_TTL_SECONDS",
                defaults.balance_cache_ttl_seconds,
            ),
            max_signal_retry_count: env_or(
                "MAX_SIGNAL_RETRY_COUNT",
                defaults.max_signal_retry_count,
            ),
            min_trade_size_usdt: env_or("MIN_TRADE_SIZE_USDT", defaults.min_trade_size_usdt),
            max_trade_size_usdt: env_or("MAX_TRADE_SIZE_USDT", defaults.max_trade_size_usdt),
            default_leverage: env_or("DEFAULT_LEVERAGE", defaults.default_leverage),
            max_leverage: env_or("MAX_LEVERAGE", defaults.max_leverage),
            min_trading_balance_usdt: env_or(
                "MIN_TRADING_BALANCE_USDT",
                defaults.min_trading_balance_usdt,
            ),
            trade_size_buffer_percent: env_or(
                "TRADE_SIZE_BUFFER_PERCENT",
                defaults.trade_size_buffer_percent,
            ),
            max_open_positions: env_or("MAX_OPEN_POSITIONS", defaults.max_open_positions),
            daily_loss_limit_usdt: env_or(
                "DAILY_LOSS_LIMIT_USDT",
                defaults.daily_loss_limit_usdt,
            ),
            kelly_base_fraction: env_or("KELLY_BASE_FRACTION", defaults.kelly_base_fraction),
            max_signals_per_batch: env_or(
                "MAX_SIGNALS_PER_BATCH",
                defaults.max_signals_per_batch,
            ),
            exchange_call_timeout_seconds: env_or(
                "EXCHANGE_CALL_TIMEOUT_SECONDS",
                defaults.exchange_call_timeout_seconds,
            ),
            proxy_min_active: env_or("PROXY_MIN_ACTIVE", defaults.proxy_min_active),
            proxy_max_to_test: env_or("PROXY_MAX_TO_TEST", defaults.proxy_max_to_test),
            proxy_stale_unused_hours: env_or(
                "PROXY_STALE_UNUSED_HOURS",
                defaults.proxy_stale_unused_hours,
            ),
            janitor_interval_seconds: env_or(
                "JANITOR_INTERVAL_SECONDS",
                defaults.janitor_interval_seconds,
            ),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}
