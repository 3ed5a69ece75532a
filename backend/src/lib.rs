pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod reconcile;
pub mod routes;
pub mod session;
pub mod store;
pub mod test_util;

pub use auth::{AuthError, AuthUser, JwksClient, TokenVerifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::ReconcileError;
pub use reconcile::{Login, RawAuthentication, RawClaims, Reconciler};
pub use session::{ExpirySweeper, SessionManager};
pub use store::{MemoryStore, SqliteStore, Store, StoreError};

use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Verifies ID tokens from agents and admin bearer tokens.
    pub verifier: Arc<dyn TokenVerifier>,
    pub reconciler: Arc<Reconciler>,
}
