use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = format!(
        "# HELP meshgate_up Whether the service is up\n\
         # TYPE meshgate_up gauge\n\
         meshgate_up 1\n\
         # HELP meshgate_info Service information\n\
         # TYPE meshgate_info gauge\n\
         meshgate_info{{version=\"{}\"}} 1\n\
         # HELP meshgate_active_sessions Nodes with a live session\n\
         # TYPE meshgate_active_sessions gauge\n\
         meshgate_active_sessions {}\n",
        env!("CARGO_PKG_VERSION"),
        state.reconciler.sessions().active_count()
    );
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
