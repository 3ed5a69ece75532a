//! Agent-facing endpoints.
//!
//! - `POST /machine/login`: verify an ID token and reconcile the login
//! - `POST /machine/logout`: end the session identified by machine and node key
//! - `GET /machine/:node_id/status`: live session state of a node

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use meshgate_common::{LoginRequest, LoginResponse, LogoutRequest, NodeId, SessionStatus};

use crate::error::{ReconcileError, Result};
use crate::reconcile::RawAuthentication;
use crate::AppState;

async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let claims = state.verifier.verify(&request.id_token).await.map_err(|e| {
        tracing::warn!("ID token verification failed: {}", e);
        ReconcileError::Unauthorized(e.to_string())
    })?;

    let auth = RawAuthentication {
        claims,
        pkce_used: request
            .code_verifier
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty()),
    };
    let login = state.reconciler.authenticate(&auth, &request.machine_key)?;

    Ok(Json(LoginResponse {
        user: login.user,
        node: login.node,
        node_created: login.node_created,
    }))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LogoutRequest>,
) -> Result<StatusCode> {
    state
        .reconciler
        .logout(&request.machine_key, &request.node_key)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<u64>,
) -> Result<Json<SessionStatus>> {
    Ok(Json(state.reconciler.session_status(NodeId(node_id))?))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/machine/login", post(login))
        .route("/machine/logout", post(logout))
        .route("/machine/:node_id/status", get(status))
        .with_state(state)
}
