//! Copy-trading execution platform — binary entry point.
//!
//! Boots the composition root (`AppState`), starts the five cooperative
//! background loops (scheduler, queue-drainer, janitor, reconciler, proxy
//! refresher), and serves the copy-trading command surface over HTTP
//! (`dotenv` + `tracing_subscriber` + `axum::serve`).

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use betterbot_backend::auth::api::AuthState;
use betterbot_backend::auth::{JwtHandler, UserStore};
use betterbot_backend::config::Settings;
use betterbot_backend::exchange::factory::ExchangeCredentials;
use betterbot_backend::models::Exchange;
use betterbot_backend::state::AppState;
use betterbot_backend::{api, auth};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("copy-trading execution platform starting");

    let settings = Settings::from_env();
    let credentials = load_exchange_credentials();
    if credentials.is_empty() {
        info!("no exchange API credentials configured; adapters will be registered lazily per-request");
    }

    let app_state = AppState::new(settings, credentials);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_handle = app_state.spawn_scheduler_loop(shutdown_rx.clone());
    let drainer_handle = app_state.spawn_queue_drainer_loop(shutdown_rx.clone());
    let janitor_handle = app_state.spawn_janitor_loop(shutdown_rx.clone());
    let reconciler_handle = app_state.spawn_reconciler_loop(shutdown_rx.clone());
    let proxy_refresher_handle = app_state.spawn_proxy_refresher_loop(shutdown_rx.clone());

    let auth_state = build_auth_state().await?;

    let app = Router::new()
        .merge(api::router(app_state.clone()))
        .nest("/auth", auth_router(auth_state))
        .layer(axum::middleware::from_fn(
            betterbot_backend::middleware::request_logging,
        ));

    let addr: SocketAddr = env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("invalid BIND_ADDR")?;
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await?;

    for handle in [
        scheduler_handle,
        drainer_handle,
        janitor_handle,
        reconciler_handle,
        proxy_refresher_handle,
    ] {
        let _ = handle.await;
    }

    Ok(())
}

fn auth_router(state: AuthState) -> Router {
    use axum::routing::{get, post};
    let protected = Router::new()
        .route("/me", get(auth::api::get_current_user))
        .layer(axum::middleware::from_fn_with_state(
            state.jwt_handler.clone(),
            auth::auth_middleware,
        ));
    Router::new()
        .route("/login", post(auth::api::login))
        .route("/privy", post(auth::api::privy_login))
        .merge(protected)
        .with_state(state)
}

async fn build_auth_state() -> Result<AuthState> {
    let auth_db_path = env::var("AUTH_DB_PATH").unwrap_or_else(|_| "copytrade_auth.db".to_string());
    let jwt_secret = env::var("JWT_SECRET")
        .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string());

    let user_store = Arc::new(UserStore::new(&auth_db_path)?);
    let jwt_handler = Arc::new(JwtHandler::new(jwt_secret));
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    Ok(AuthState::new(user_store, jwt_handler, http_client))
}

/// Reads `{EXCHANGE}_API_KEY`/`{EXCHANGE}_API_SECRET`(`/_PASSPHRASE`) for
/// each supported exchange; an exchange with no key configured gets no
/// adapter (the factory simply won't have an entry for it, and any signal
/// routed there surfaces as `CoreError::Ineligible` via the executor's
/// `self.exchanges.get(...)` lookups).
fn load_exchange_credentials() -> HashMap<Exchange, ExchangeCredentials> {
    let mut creds = HashMap::new();
    for (exchange, prefix) in [
        (Exchange::Binance, "BINANCE"),
        (Exchange::Okx, "OKX"),
        (Exchange::Bybit, "BYBIT"),
        (Exchange::Bitget, "BITGET"),
    ] {
        let api_key = env::var(format!("{prefix}_API_KEY")).ok();
        let api_secret = env::var(format!("{prefix}_API_SECRET")).ok();
        if let (Some(api_key), Some(api_secret)) = (api_key, api_secret) {
            creds.insert(
                exchange,
                ExchangeCredentials {
                    api_key,
                    api_secret,
                    passphrase: env::var(format!("{prefix}_API_PASSPHRASE")).ok(),
                },
            );
        }
    }
    creds
}

async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(true);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "betterbot_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();
}
