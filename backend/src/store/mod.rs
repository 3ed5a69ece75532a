//! User and node tables.
//!
//! Two implementations share the [`Store`] trait: [`MemoryStore`], an arena
//! used for tests and ephemeral deployments, and [`SqliteStore`] for durable
//! storage. Both enforce the same uniqueness rules and report violations as
//! [`StoreError::DuplicateUser`] / [`StoreError::DuplicateNode`] so callers can
//! re-read and continue.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use meshgate_common::{MachineKey, NewNode, NewUser, Node, NodeId, NodeKey, User, UserId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("User already exists for provider id {0}")]
    DuplicateUser(String),
    #[error("Node already exists for machine {machine_key} and user {user_id}")]
    DuplicateNode {
        machine_key: String,
        user_id: UserId,
    },
    #[error("User not found: {0}")]
    UserNotFound(UserId),
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence for users and nodes.
///
/// Timestamps are supplied by the caller so that stores never read the clock.
pub trait Store: Send + Sync {
    /// Insert a user. Fails with `DuplicateUser` when a nonempty
    /// `provider_id` is already taken.
    fn insert_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<User, StoreError>;

    fn user_by_provider_id(&self, provider_id: &str) -> Result<Option<User>, StoreError>;

    /// Local (non-OIDC) users with exactly this name.
    fn local_users_named(&self, name: &str) -> Result<Vec<User>, StoreError>;

    /// All users ordered by id.
    fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Insert a node. Fails with `DuplicateNode` when the
    /// `(machine_key, user_id)` pair already has a row.
    fn insert_node(&self, node: NewNode, now: DateTime<Utc>) -> Result<Node, StoreError>;

    fn node(&self, id: NodeId) -> Result<Option<Node>, StoreError>;

    fn node_for(
        &self,
        machine_key: &MachineKey,
        user_id: UserId,
    ) -> Result<Option<Node>, StoreError>;

    /// Every node row sharing a machine key, ordered by id.
    fn nodes_for_machine(&self, machine_key: &MachineKey) -> Result<Vec<Node>, StoreError>;

    /// Replace the node key and expiry of an existing row.
    fn renew_node(
        &self,
        id: NodeId,
        node_key: NodeKey,
        expiry: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Node, StoreError>;

    fn set_node_expiry(
        &self,
        id: NodeId,
        expiry: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Node, StoreError>;

    /// All nodes ordered by id.
    fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;
}

/// Open the store named by a database URL.
///
/// `memory` (or `:memory:`) selects the in-process arena; anything else is
/// treated as a SQLite location with an optional `sqlite:` prefix.
pub fn open(database_url: &str) -> Result<Arc<dyn Store>, StoreError> {
    match database_url {
        "memory" | ":memory:" => Ok(Arc::new(MemoryStore::new())),
        url => Ok(Arc::new(SqliteStore::new(url)?)),
    }
}
