//! Node identity resolution.
//!
//! A node row belongs to exactly one `(machine key, user)` pair. Logging in
//! again as the same user reuses the row and rotates its node key; logging in
//! as a different user creates a sibling row and leaves the old one dormant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use meshgate_common::{KeyError, MachineKey, NewNode, Node, NodeKey, User, UserId};

use super::locks::KeyedLocks;
use crate::clock::Clock;
use crate::error::{ReconcileError, Result};
use crate::store::{Store, StoreError};

/// Parse an agent-supplied machine key.
pub fn parse_machine_key(raw: &str) -> Result<MachineKey> {
    raw.trim()
        .parse()
        .map_err(|e: KeyError| ReconcileError::InvalidMachineIdentity(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct NodeResolution {
    pub node: Node,
    pub created: bool,
}

pub struct NodeResolver {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks<(MachineKey, UserId)>,
}

impl NodeResolver {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    /// Find or create the node for `machine_key` under `user`, giving it a
    /// fresh node key and the new session expiry.
    pub fn resolve(
        &self,
        user: &User,
        machine_key: MachineKey,
        expiry: DateTime<Utc>,
    ) -> Result<NodeResolution> {
        self.resolve_then(user, machine_key, expiry, |_| {})
    }

    /// Like [`resolve`](Self::resolve), running `then` on the written node
    /// before the `(machine key, user)` lock is released.
    pub fn resolve_then(
        &self,
        user: &User,
        machine_key: MachineKey,
        expiry: DateTime<Utc>,
        then: impl FnOnce(&Node),
    ) -> Result<NodeResolution> {
        self.with_lock(machine_key, user.id, || -> Result<NodeResolution> {
            let resolution = self.find_or_create(user.id, machine_key, expiry)?;
            then(&resolution.node);
            Ok(resolution)
        })
    }

    /// Run `f` while no login for the same `(machine key, user)` can write.
    pub fn with_lock<R>(&self, machine_key: MachineKey, user_id: UserId, f: impl FnOnce() -> R) -> R {
        self.locks.with_lock(&(machine_key, user_id), f)
    }

    fn find_or_create(
        &self,
        user_id: UserId,
        machine_key: MachineKey,
        expiry: DateTime<Utc>,
    ) -> Result<NodeResolution> {
        let now = self.clock.now();

        if let Some(existing) = self.store.node_for(&machine_key, user_id)? {
            return self.renew(existing, expiry, now);
        }

        let siblings = self.store.nodes_for_machine(&machine_key)?;
        if !siblings.is_empty() {
            let owners: Vec<String> = siblings.iter().map(|n| n.user_id.to_string()).collect();
            tracing::info!(
                machine = %machine_key.short(),
                previous_users = %owners.join(","),
                user_id = %user_id,
                "Machine logged in as a different user, registering new node"
            );
        }

        let new_node = NewNode {
            machine_key,
            node_key: NodeKey::generate(),
            user_id,
            expiry: Some(expiry),
        };

        match self.store.insert_node(new_node, now) {
            Ok(node) => {
                tracing::info!(
                    node_id = %node.id,
                    machine = %machine_key.short(),
                    user_id = %user_id,
                    "Registered node"
                );
                Ok(NodeResolution {
                    node,
                    created: true,
                })
            }
            Err(StoreError::DuplicateNode { .. }) => {
                tracing::debug!(
                    "Node for machine {} and user {} created concurrently, re-reading",
                    machine_key.short(),
                    user_id
                );
                match self.store.node_for(&machine_key, user_id)? {
                    Some(existing) => self.renew(existing, expiry, now),
                    None => Err(ReconcileError::DuplicateNodeRace {
                        machine_key: machine_key.to_string(),
                        user_id,
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn renew(&self, existing: Node, expiry: DateTime<Utc>, now: DateTime<Utc>) -> Result<NodeResolution> {
        let mut node_key = NodeKey::generate();
        while node_key == existing.node_key {
            node_key = NodeKey::generate();
        }

        let node = self
            .store
            .renew_node(existing.id, node_key, Some(expiry), now)?;
        tracing::debug!(node_id = %node.id, expiry = %expiry, "Renewed node");
        Ok(NodeResolution {
            node,
            created: false,
        })
    }
}
