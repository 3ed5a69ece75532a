//! JSON messages exchanged between device agents, admins and the server.
//!
//! ## Login flow
//!
//! 1. The agent completes the OIDC flow with the identity provider
//! 2. The agent posts `LoginRequest` with its machine key and the ID token
//! 3. The server answers with `LoginResponse` carrying the user and node rows
//! 4. Once the session expires or is expired by an admin, `status` reports
//!    `logged_out` and the agent must log in again

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeId};
use crate::user::{User, UserId};

/// Sent by an agent after completing the OIDC flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Machine key in text form (`mkey:...`).
    pub machine_key: String,
    /// Signed ID token returned by the identity provider.
    pub id_token: String,
    /// Present when the authorization code was exchanged with PKCE.
    #[serde(default)]
    pub code_verifier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: User,
    pub node: Node,
    /// Whether this login created the node row.
    pub node_created: bool,
}

/// Sent by an agent that logs out of its current session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub machine_key: String,
    pub node_key: String,
}

/// Body for the admin create-user endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Live session state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Active { expiry: Option<DateTime<Utc>> },
    LoggedOut,
    /// The node has never been seen by this server process.
    Unknown,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active { .. })
    }
}

/// Why a session changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    LoggedIn,
    Expired,
    LoggedOut,
}

/// Emitted on every session transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    pub kind: SessionEventKind,
    pub node_id: NodeId,
    pub user_id: UserId,
    pub machine_key: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_tagging() {
        let json = serde_json::to_value(SessionStatus::LoggedOut).unwrap();
        assert_eq!(json, serde_json::json!({"state": "logged_out"}));

        let active: SessionStatus =
            serde_json::from_str(r#"{"state":"active","expiry":null}"#).unwrap();
        assert_eq!(active, SessionStatus::Active { expiry: None });
        assert!(active.is_active());
    }

    #[test]
    fn test_login_request_without_verifier() {
        let json = r#"{"machine_key": "mkey:00", "id_token": "a.b.c"}"#;
        let request: LoginRequest = serde_json::from_str(json).unwrap();
        assert!(request.code_verifier.is_none());
        assert_eq!(request.id_token, "a.b.c");
    }
}
