//! Admin API routes.
//!
//! Provides:
//! - Users list and local user creation (`/admin/users`)
//! - Nodes list with live session state (`/admin/nodes`)
//! - Forced node expiry (`/admin/nodes/:id/expire`)
//! - SSE endpoint for session events (`/admin/events`)

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as TokioStreamExt;

use meshgate_common::{CreateUserRequest, Node, NodeId, SessionEventKind, SessionStatus, User};

use crate::auth::{bearer_token, AuthError, AuthUser};
use crate::error::{ReconcileError, Result};
use crate::AppState;

/// Verify a bearer token and check its claims against the login policy.
async fn authorize(state: &AppState, token: std::result::Result<&str, AuthError>) -> Result<AuthUser> {
    let token = token.map_err(|e| ReconcileError::Unauthorized(e.to_string()))?;
    let claims = state
        .verifier
        .verify(token)
        .await
        .map_err(|e| ReconcileError::Unauthorized(e.to_string()))?;
    state.reconciler.authorize_admin(claims)
}

/// Middleware that requires an authenticated admin user.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let outcome = authorize(&state, bearer_token(request.headers())).await;
    match outcome {
        Ok(_) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsersResponse {
    pub users: Vec<User>,
    pub total: usize,
}

/// Node row with its live session state.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    #[serde(flatten)]
    pub node: Node,
    pub session: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeInfo>,
    pub total: usize,
}

/// GET /admin/users
async fn list_users(State(state): State<Arc<AppState>>) -> Result<Json<UsersResponse>> {
    let users = state.reconciler.list_users()?;
    Ok(Json(UsersResponse {
        total: users.len(),
        users,
    }))
}

/// POST /admin/users - Create a local (non-OIDC) user
async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>)> {
    let user = state
        .reconciler
        .create_local_user(&request.name, request.email.as_deref())?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /admin/nodes
async fn list_nodes(State(state): State<Arc<AppState>>) -> Result<Json<NodesResponse>> {
    let sessions = state.reconciler.sessions();
    let nodes: Vec<NodeInfo> = state
        .reconciler
        .list_nodes()?
        .into_iter()
        .map(|node| NodeInfo {
            session: sessions.status(node.id),
            node,
        })
        .collect();
    Ok(Json(NodesResponse {
        total: nodes.len(),
        nodes,
    }))
}

/// POST /admin/nodes/:id/expire
async fn expire_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Node>> {
    Ok(Json(state.reconciler.expire_node(NodeId(id))?))
}

/// Query parameters for SSE authentication.
#[derive(Debug, Deserialize)]
pub struct SseAuthQuery {
    pub token: String,
}

/// GET /admin/events - SSE stream of session transitions.
///
/// EventSource cannot set headers, so the token travels in the query string.
async fn session_events(
    State(state): State<Arc<AppState>>,
    Query(auth): Query<SseAuthQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    authorize(&state, Ok(auth.token.as_str())).await?;

    let rx = state.reconciler.sessions().subscribe();
    let stream = TokioStreamExt::filter_map(BroadcastStream::new(rx), |result| {
        // Lagged receivers skip what they missed.
        let event = result.ok()?;
        let event_type = match event.kind {
            SessionEventKind::LoggedIn => "logged_in",
            SessionEventKind::Expired => "expired",
            SessionEventKind::LoggedOut => "logged_out",
        };
        serde_json::to_string(&event)
            .ok()
            .map(|data| Ok(Event::default().event(event_type).data(data)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Build the admin router.
pub fn router(state: Arc<AppState>) -> Router {
    let sse_routes = Router::new()
        .route("/events", get(session_events))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:id/expire", post(expire_node))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state);

    sse_routes.merge(admin_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meshgate_common::{MachineKey, NewNode, NodeKey, UserId};

    #[test]
    fn test_node_info_flattens_node() {
        let node = NewNode {
            machine_key: MachineKey::generate(),
            node_key: NodeKey::generate(),
            user_id: UserId(4),
            expiry: None,
        }
        .into_node(NodeId(2), Utc::now());
        let info = NodeInfo {
            node,
            session: SessionStatus::LoggedOut,
        };

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], 2);
        assert_eq!(json["user_id"], 4);
        assert_eq!(json["session"]["state"], "logged_out");
    }

    #[test]
    fn test_sse_auth_query_deserialize() {
        let query: SseAuthQuery = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(query.token, "abc");
    }
}
