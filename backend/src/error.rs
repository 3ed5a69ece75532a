//! Error types for login reconciliation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use meshgate_common::UserId;
use serde_json::json;

use crate::store::StoreError;

/// Every way a login or admin operation can fail.
///
/// Claim failures (`InvalidIssuer`, `ExpiredToken`, `ClaimsMalformed`) reject
/// the attempt; the caller may restart the OIDC flow. The race variants are
/// only returned when re-reading after a uniqueness conflict still finds no
/// row.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    #[error("Token expired at {0}")]
    ExpiredToken(DateTime<Utc>),

    #[error("Malformed claims: {0}")]
    ClaimsMalformed(String),

    #[error("Invalid machine identity: {0}")]
    InvalidMachineIdentity(String),

    #[error("Concurrent creation of user {0} could not be resolved")]
    DuplicateUserRace(String),

    #[error("Concurrent creation of node for machine {machine_key} and user {user_id} could not be resolved")]
    DuplicateNodeRace { machine_key: String, user_id: UserId },

    #[error("Invalid user: {0}")]
    InvalidUser(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Stable machine-readable name used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::InvalidIssuer(_) => "invalid_issuer",
            ReconcileError::ExpiredToken(_) => "expired_token",
            ReconcileError::ClaimsMalformed(_) => "claims_malformed",
            ReconcileError::InvalidMachineIdentity(_) => "invalid_machine_identity",
            ReconcileError::DuplicateUserRace(_) => "duplicate_user_race",
            ReconcileError::DuplicateNodeRace { .. } => "duplicate_node_race",
            ReconcileError::InvalidUser(_) => "invalid_user",
            ReconcileError::NodeNotFound(_) => "node_not_found",
            ReconcileError::Unauthorized(_) => "unauthorized",
            ReconcileError::Forbidden(_) => "forbidden",
            ReconcileError::Store(_) => "store_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ReconcileError::InvalidIssuer(_)
            | ReconcileError::ExpiredToken(_)
            | ReconcileError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ReconcileError::ClaimsMalformed(_)
            | ReconcileError::InvalidMachineIdentity(_)
            | ReconcileError::InvalidUser(_) => StatusCode::BAD_REQUEST,
            ReconcileError::DuplicateUserRace(_) | ReconcileError::DuplicateNodeRace { .. } => {
                StatusCode::CONFLICT
            }
            ReconcileError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            ReconcileError::Forbidden(_) => StatusCode::FORBIDDEN,
            ReconcileError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ReconcileError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
