//! The copy-trading command surface: everything the HTTP/Telegram
//! presentation layer is expected to call into. The presentation layer
//! itself (auth, onboarding, billing, API-key storage) lives elsewhere;
//! this module only exposes the in-process entry points
//! `CopySignalCommand`, `SkipSignalCommand`, and `UpdateFollowCommand`
//! translate to, plus a health-check route.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{SignalStatus, SizingStrategy};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/signals/:signal_id/copy", post(copy_signal))
        .route("/signals/:signal_id/skip", post(skip_signal))
        .route("/follows/:follow_id", post(update_follow))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_whales: usize,
    proxies_active: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_whales: state.whales.all_for_scheduling().len(),
        proxies_active: state.proxies.active_count(),
    })
}

#[derive(Debug, Deserialize)]
struct CopySignalRequest {
    user_id: i64,
}

#[derive(Debug, Serialize)]
struct CopySignalResponse {
    accepted: bool,
}

/// `CopySignalCommand`: a follower manually chooses to copy a
/// specific signal right now, ahead of the background drain worker.
async fn copy_signal(
    State(state): State<AppState>,
    Path(signal_id): Path<i64>,
    Json(req): Json<CopySignalRequest>,
) -> Result<Json<CopySignalResponse>, StatusCode> {
    if state.signals.get(signal_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let accepted = state.executor.copy_now(signal_id, req.user_id).await;
    if !accepted {
        info!(signal_id, user_id = req.user_id, "copy_signal deferred: processing lock held");
    }
    Ok(Json(CopySignalResponse { accepted }))
}

#[derive(Debug, Serialize)]
struct SkipSignalResponse {
    skipped: bool,
}

/// `SkipSignalCommand`: a follower declines a pending signal; it is
/// transitioned straight to FAILED so it never reaches the queue drain
/// worker, the same silent-skip treatment applied to user-side
/// ineligibility, but here by explicit user choice instead.
async fn skip_signal(
    State(state): State<AppState>,
    Path(signal_id): Path<i64>,
) -> Result<Json<SkipSignalResponse>, StatusCode> {
    let Some(signal) = state.signals.get(signal_id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    if signal.status != SignalStatus::Pending {
        return Ok(Json(SkipSignalResponse { skipped: false }));
    }
    let result = state
        .signals
        .update_with_version(signal.id, signal.version, |s| {
            s.status = SignalStatus::Failed;
            s.error_message = Some("skipped_by_user".to_string());
        });
    match result {
        Ok(_) => Ok(Json(SkipSignalResponse { skipped: true })),
        Err(err) => {
            warn!(signal_id, %err, "skip_signal lost a race with another writer");
            Ok(Json(SkipSignalResponse { skipped: false }))
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdateFollowRequest {
    auto_copy_enabled: Option<bool>,
    sizing_strategy: Option<SizingStrategy>,
    trade_size_usdt: Option<f64>,
    trade_size_percent: Option<f64>,
    max_leverage: Option<u8>,
}

#[derive(Debug, Serialize)]
struct UpdateFollowResponse {
    updated: bool,
}

/// `UpdateFollowCommand`: enable/disable auto-copy or change
/// sizing strategy for an existing `WhaleFollow`.
async fn update_follow(
    State(state): State<AppState>,
    Path(follow_id): Path<i64>,
    Json(req): Json<UpdateFollowRequest>,
) -> Result<Json<UpdateFollowResponse>, StatusCode> {
    let result = state.follows.update(follow_id, |f| {
        if let Some(enabled) = req.auto_copy_enabled {
            f.auto_copy_enabled = enabled;
        }
        if let Some(strategy) = req.sizing_strategy {
            f.sizing_strategy = strategy;
        }
        if let Some(size) = req.trade_size_usdt.and_then(|v| rust_decimal::Decimal::try_from(v).ok()) {
            f.trade_size_usdt = Some(size);
        }
        if let Some(pct) = req.trade_size_percent.and_then(|v| rust_decimal::Decimal::try_from(v).ok()) {
            f.trade_size_percent = Some(pct);
        }
        if let Some(leverage) = req.max_leverage {
            f.max_leverage = leverage;
        }
    });
    match result {
        Ok(_) => Ok(Json(UpdateFollowResponse { updated: true })),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::{Exchange, WhaleFollow};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(Settings::default(), std::collections::HashMap::new())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn skip_signal_transitions_pending_to_failed() {
        let state = test_state();
        let signal = crate::models::Signal {
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
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(60),
            processed_at: None,
            version: 0,
        };
        let created = state.signals.create_if_new(signal).unwrap();
        let app = router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/signals/{}/skip", created.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.signals.get(created.id).unwrap().status, SignalStatus::Failed);
    }

    #[tokio::test]
    async fn update_follow_changes_sizing_strategy() {
        let state = test_state();
        let follow_id = state.follows.insert(WhaleFollow {
            id: 0,
            user_id: 1,
            whale_id: 1,
            auto_copy_enabled: true,
            sizing_strategy: SizingStrategy::Fixed,
            trade_size_usdt: Some(rust_decimal::Decimal::from(100)),
            trade_size_percent: None,
            max_leverage: 5,
            exchange: Exchange::Binance,
            trades_copied: 0,
            total_profit: rust_decimal::Decimal::ZERO,
            version: 0,
        });
        let app = router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/follows/{follow_id}"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"auto_copy_enabled": false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.follows.get(follow_id).unwrap().auto_copy_enabled);
    }
}
