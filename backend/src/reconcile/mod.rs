//! Login reconciliation.
//!
//! [`Reconciler`] ties claims validation, user resolution, node resolution
//! and session tracking together. A successful login returns the user and node
//! rows it touched and leaves the node's session active until its expiry.

pub mod claims;
pub mod locks;
pub mod nodes;
pub mod users;

use std::sync::Arc;

use meshgate_common::{Node, NodeId, NodeKey, SessionEventKind, SessionStatus, User, UserId};

pub use claims::{ClaimsPolicy, NormalizedClaims, RawAuthentication, RawClaims, TokenFacts};
pub use nodes::{parse_machine_key, NodeResolution, NodeResolver};
pub use users::{MigrationPolicy, UserResolution, UserResolver};

use crate::auth::AuthUser;
use crate::clock::Clock;
use crate::config::OidcConfig;
use crate::error::{ReconcileError, Result};
use crate::session::SessionManager;
use crate::store::Store;

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct Login {
    pub user: User,
    pub node: Node,
    pub user_created: bool,
    pub node_created: bool,
    /// Local account that resembles the new OIDC user, if any.
    pub legacy_match: Option<UserId>,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    policy: ClaimsPolicy,
    users: UserResolver,
    nodes: NodeResolver,
    sessions: Arc<SessionManager>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, oidc: &OidcConfig) -> Self {
        Self {
            policy: ClaimsPolicy::from_config(oidc),
            users: UserResolver::new(store.clone(), clock.clone(), MigrationPolicy::from_config(oidc)),
            nodes: NodeResolver::new(store.clone(), clock.clone()),
            sessions: Arc::new(SessionManager::new()),
            store,
            clock,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn policy(&self) -> &ClaimsPolicy {
        &self.policy
    }

    /// Validate a completed authentication and reconcile it.
    pub fn authenticate(&self, auth: &RawAuthentication, machine_key: &str) -> Result<Login> {
        let claims = self
            .policy
            .validate(auth, self.clock.now())
            .inspect_err(|e| tracing::warn!("Rejected login claims: {}", e))?;
        self.reconcile(&claims, machine_key)
    }

    /// Check the claims of a bearer token for the admin surface.
    ///
    /// Issuer, expiry and audience follow the login rules; PKCE does not
    /// apply. The caller must carry the `admin` role.
    pub fn authorize_admin(&self, claims: RawClaims) -> Result<AuthUser> {
        let sub = self
            .policy
            .check_token(&claims, self.clock.now())
            .map_err(|e| match e {
                ReconcileError::ClaimsMalformed(reason) => ReconcileError::Unauthorized(reason),
                other => other,
            })
            .inspect_err(|e| tracing::warn!("Rejected admin token: {}", e))?
            .subject
            .to_string();

        let user = AuthUser {
            sub,
            email: claims.email,
            roles: claims.roles,
        };
        if !user.is_admin() {
            tracing::warn!("Admin access denied for {}", user.sub);
            return Err(ReconcileError::Forbidden("admin role required".to_string()));
        }
        Ok(user)
    }

    /// Resolve user and node for already validated claims.
    ///
    /// The machine key is checked before anything is written, so a malformed
    /// key never leaves a user row behind.
    pub fn reconcile(&self, claims: &NormalizedClaims, machine_key: &str) -> Result<Login> {
        let machine_key = parse_machine_key(machine_key)?;

        let users = self.users.resolve(claims)?;
        // Activated under the node lock so the session always mirrors the
        // last row written for this machine and user.
        let nodes = self
            .nodes
            .resolve_then(&users.user, machine_key, claims.session_expiry, |node| {
                self.sessions.activate(node, self.clock.now());
            })?;

        tracing::info!(
            user_id = %users.user.id,
            node_id = %nodes.node.id,
            machine = %machine_key.short(),
            user_created = users.created,
            node_created = nodes.created,
            expiry = %claims.session_expiry,
            "Login reconciled"
        );

        Ok(Login {
            user: users.user,
            node: nodes.node,
            user_created: users.created,
            node_created: nodes.created,
            legacy_match: users.legacy_match,
        })
    }

    pub fn create_local_user(&self, name: &str, email: Option<&str>) -> Result<User> {
        self.users.create_local(name, email)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.store.list_users()?)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.store.list_nodes()?)
    }

    /// Agent-initiated logout of the session identified by its keys.
    pub fn logout(&self, machine_key: &str, node_key: &str) -> Result<Node> {
        let machine_key = parse_machine_key(machine_key)?;
        let node_key: NodeKey = node_key
            .trim()
            .parse()
            .map_err(|e| ReconcileError::InvalidMachineIdentity(format!("node key: {}", e)))?;

        let node = self
            .store
            .nodes_for_machine(&machine_key)?
            .into_iter()
            .find(|n| n.node_key == node_key)
            .ok_or_else(|| ReconcileError::NodeNotFound(format!("machine {}", machine_key.short())))?;

        // A concurrent login may rotate the key first; the old key then
        // no longer names a session.
        self.end_session(node, SessionEventKind::LoggedOut, |current| {
            current.node_key == node_key
        })
    }

    /// Administrative expiry: the node must log in again.
    pub fn expire_node(&self, node_id: NodeId) -> Result<Node> {
        let node = self
            .store
            .node(node_id)?
            .ok_or_else(|| ReconcileError::NodeNotFound(node_id.to_string()))?;
        self.end_session(node, SessionEventKind::Expired, |_| true)
    }

    /// End `node`'s session under the same lock logins take, re-reading the
    /// row first so a login that got there earlier is not half undone.
    fn end_session(
        &self,
        node: Node,
        kind: SessionEventKind,
        still_current: impl FnOnce(&Node) -> bool,
    ) -> Result<Node> {
        self.nodes.with_lock(node.machine_key, node.user_id, || -> Result<Node> {
            let current = self
                .store
                .node(node.id)?
                .filter(|current| still_current(current))
                .ok_or_else(|| ReconcileError::NodeNotFound(node.id.to_string()))?;

            let now = self.clock.now();
            let node = self.store.set_node_expiry(current.id, Some(now), now)?;
            self.sessions.log_out(&node, kind, now);
            tracing::info!(node_id = %node.id, user_id = %node.user_id, ?kind, "Node session ended");
            Ok(node)
        })
    }

    pub fn session_status(&self, node_id: NodeId) -> Result<SessionStatus> {
        if self.store.node(node_id)?.is_none() {
            return Err(ReconcileError::NodeNotFound(node_id.to_string()));
        }
        Ok(self.sessions.status(node_id))
    }

    /// Log out every node whose expiry has passed. Returns the expired ids.
    pub fn sweep(&self) -> Result<Vec<NodeId>> {
        let now = self.clock.now();
        let due: Vec<Node> = self
            .store
            .list_nodes()?
            .into_iter()
            .filter(|n| n.is_expired(now))
            .collect();
        Ok(self.sessions.expire_due(&due, now))
    }

    /// Load session state for every persisted node. Returns the active count.
    pub fn restore_sessions(&self) -> Result<usize> {
        let nodes = self.store.list_nodes()?;
        let active = self.sessions.restore(&nodes, self.clock.now());
        tracing::info!("Restored {} active session(s) from {} node(s)", active, nodes.len());
        Ok(active)
    }
}
