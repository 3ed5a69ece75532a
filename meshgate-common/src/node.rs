use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::{MachineKey, NodeKey};
use crate::user::UserId;

/// Stable node row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A device registered under one user.
///
/// Rows are keyed by the `(machine_key, user_id)` pair: a device that logs in
/// under a second account gets a second row sharing its machine key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub machine_key: MachineKey,
    pub node_key: NodeKey,
    pub user_id: UserId,
    /// End of the current session's validity window.
    pub expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Whether the session window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }
}

/// A node row that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub machine_key: MachineKey,
    pub node_key: NodeKey,
    pub user_id: UserId,
    pub expiry: Option<DateTime<Utc>>,
}

impl NewNode {
    pub fn into_node(self, id: NodeId, now: DateTime<Utc>) -> Node {
        Node {
            id,
            machine_key: self.machine_key,
            node_key: self.node_key,
            user_id: self.user_id,
            expiry: self.expiry,
            created_at: now,
            updated_at: now,
        }
    }
}
