// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface (§6): `/create-batches`, `/do-work`, `/health`. Mirrors the
//! teacher's `mysten-service::get_mysten_service` shape — a small `Router`
//! with JSON status bodies and a liveness probe that pings the database.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use export_config::Parameters;
use export_core::{Batcher, Worker};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub batcher: Arc<Batcher>,
    pub worker: Arc<Worker>,
    pub pool: Pool<AsyncPgConnection>,
    pub parameters: Parameters,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/create-batches", post(create_batches).get(create_batches))
        .route("/do-work", post(do_work).get(do_work))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs `fut` under a `CancellationToken` that's cancelled after `timeout`
/// elapses, so a long-running invocation cleanly aborts at its own nested
/// deadline rather than being killed mid-write by axum/hyper's own request
/// timeout.
async fn with_deadline<F, Fut, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let token = CancellationToken::new();
    let sleeper = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            token.cancel();
        })
    };
    let result = f(token).await;
    sleeper.abort();
    result
}

async fn create_batches(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    let timeout = state.parameters.create_batches_timeout;
    let result = with_deadline(timeout, |token| async move { state.batcher.create_batches(now, &token).await }).await;

    match result {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => {
            tracing::error!(error = %e, "create-batches failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error", "message": e.to_string()})))
        }
    }
}

async fn do_work(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timeout = state.parameters.worker_timeout;
    let result = with_deadline(timeout, |token| async move { state.worker.do_work(&token).await }).await;

    match result {
        Ok(processed) => (StatusCode::OK, Json(json!({"status": "ok", "batches_processed": processed}))),
        Err(e) => {
            tracing::error!(error = %e, "do-work failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error", "message": e.to_string()})))
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db = match state.pool.get().await {
        Ok(mut conn) => match diesel::sql_query("SELECT 1").execute(&mut conn).await {
            Ok(_) => "up",
            Err(_) => "down",
        },
        Err(_) => "down",
    };
    let status = if db == "up" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "name": "export-service",
            "version": env!("CARGO_PKG_VERSION"),
            "status": "up",
            "db": db,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_deadline_cancels_the_token_on_timeout() {
        let observed = with_deadline(Duration::from_millis(20), |token| async move {
            token.cancelled().await;
            "cancelled"
        })
        .await;
        assert_eq!(observed, "cancelled");
    }

    #[tokio::test]
    async fn with_deadline_returns_early_result_without_waiting_for_timeout() {
        let start = tokio::time::Instant::now();
        let observed = with_deadline(Duration::from_secs(30), |_token| async move { 42 }).await;
        assert_eq!(observed, 42);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
