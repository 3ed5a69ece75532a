//! In-process store.
//!
//! Users and nodes live in arenas indexed by `id - 1`. Nodes are additionally
//! indexed by machine key, since one device can own several rows (one per
//! user it has logged in as).

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use meshgate_common::{MachineKey, NewNode, NewUser, Node, NodeId, NodeKey, User, UserId};

use super::{Store, StoreError};

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    users_by_provider: HashMap<String, UserId>,
    nodes: Vec<Node>,
    nodes_by_machine: HashMap<MachineKey, BTreeSet<NodeId>>,
}

impl Tables {
    fn user(&self, id: UserId) -> Option<&User> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.users.get(index)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.nodes.get_mut(index)
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.nodes.get(index)
    }

    fn machine_nodes(&self, machine_key: &MachineKey) -> impl Iterator<Item = &Node> {
        self.nodes_by_machine
            .get(machine_key)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.node(*id))
    }
}

/// Arena-backed store guarded by a single reader/writer lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }
}

impl Store for MemoryStore {
    fn insert_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<User, StoreError> {
        let mut tables = self.write()?;

        if !user.provider_id.is_empty() && tables.users_by_provider.contains_key(&user.provider_id)
        {
            return Err(StoreError::DuplicateUser(user.provider_id));
        }

        let id = UserId(tables.users.len() as u64 + 1);
        let user = user.into_user(id, now);
        if !user.provider_id.is_empty() {
            tables.users_by_provider.insert(user.provider_id.clone(), id);
        }
        tables.users.push(user.clone());
        Ok(user)
    }

    fn user_by_provider_id(&self, provider_id: &str) -> Result<Option<User>, StoreError> {
        if provider_id.is_empty() {
            return Ok(None);
        }
        let tables = self.read()?;
        Ok(tables
            .users_by_provider
            .get(provider_id)
            .and_then(|id| tables.user(*id))
            .cloned())
    }

    fn local_users_named(&self, name: &str) -> Result<Vec<User>, StoreError> {
        Ok(self
            .read()?
            .users
            .iter()
            .filter(|u| u.is_local() && u.name == name)
            .cloned()
            .collect())
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.read()?.users.clone())
    }

    fn insert_node(&self, node: NewNode, now: DateTime<Utc>) -> Result<Node, StoreError> {
        let mut tables = self.write()?;

        if tables.user(node.user_id).is_none() {
            return Err(StoreError::UserNotFound(node.user_id));
        }
        if tables
            .machine_nodes(&node.machine_key)
            .any(|n| n.user_id == node.user_id)
        {
            return Err(StoreError::DuplicateNode {
                machine_key: node.machine_key.to_string(),
                user_id: node.user_id,
            });
        }

        let id = NodeId(tables.nodes.len() as u64 + 1);
        let node = node.into_node(id, now);
        tables
            .nodes_by_machine
            .entry(node.machine_key)
            .or_default()
            .insert(id);
        tables.nodes.push(node.clone());
        Ok(node)
    }

    fn node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.read()?.node(id).cloned())
    }

    fn node_for(
        &self,
        machine_key: &MachineKey,
        user_id: UserId,
    ) -> Result<Option<Node>, StoreError> {
        Ok(self
            .read()?
            .machine_nodes(machine_key)
            .find(|n| n.user_id == user_id)
            .cloned())
    }

    fn nodes_for_machine(&self, machine_key: &MachineKey) -> Result<Vec<Node>, StoreError> {
        Ok(self.read()?.machine_nodes(machine_key).cloned().collect())
    }

    fn renew_node(
        &self,
        id: NodeId,
        node_key: NodeKey,
        expiry: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Node, StoreError> {
        let mut tables = self.write()?;
        let node = tables.node_mut(id).ok_or(StoreError::NodeNotFound(id))?;
        node.node_key = node_key;
        node.expiry = expiry;
        node.updated_at = now;
        Ok(node.clone())
    }

    fn set_node_expiry(
        &self,
        id: NodeId,
        expiry: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Node, StoreError> {
        let mut tables = self.write()?;
        let node = tables.node_mut(id).ok_or(StoreError::NodeNotFound(id))?;
        node.expiry = expiry;
        node.updated_at = now;
        Ok(node.clone())
    }

    fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.read()?.nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_node(machine_key: MachineKey, user_id: UserId) -> NewNode {
        NewNode {
            machine_key,
            node_key: NodeKey::generate(),
            user_id,
            expiry: None,
        }
    }

    #[test]
    fn test_user_ids_are_sequential() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store.insert_user(NewUser::local("a", ""), now).unwrap();
        let b = store.insert_user(NewUser::local("b", ""), now).unwrap();
        assert_eq!(a.id, UserId(1));
        assert_eq!(b.id, UserId(2));
    }

    #[test]
    fn test_duplicate_provider_id_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_user(NewUser::oidc("u", "", "https://idp/u"), now)
            .unwrap();
        let err = store
            .insert_user(NewUser::oidc("u2", "", "https://idp/u"), now)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUser(p) if p == "https://idp/u"));
    }

    #[test]
    fn test_local_users_may_share_names() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_user(NewUser::local("dup", ""), now).unwrap();
        store.insert_user(NewUser::local("dup", ""), now).unwrap();
        store
            .insert_user(NewUser::oidc("dup", "", "https://idp/dup"), now)
            .unwrap();
        assert_eq!(store.local_users_named("dup").unwrap().len(), 2);
    }

    #[test]
    fn test_machine_index_tracks_sibling_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store.insert_user(NewUser::local("a", ""), now).unwrap();
        let b = store.insert_user(NewUser::local("b", ""), now).unwrap();
        let machine_key = MachineKey::generate();

        let na = store.insert_node(new_node(machine_key, a.id), now).unwrap();
        let nb = store.insert_node(new_node(machine_key, b.id), now).unwrap();

        let siblings = store.nodes_for_machine(&machine_key).unwrap();
        assert_eq!(
            siblings.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![na.id, nb.id]
        );
        assert_eq!(store.node_for(&machine_key, b.id).unwrap().unwrap().id, nb.id);
        assert!(store.nodes_for_machine(&MachineKey::generate()).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_node_pair_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store.insert_user(NewUser::local("a", ""), now).unwrap();
        let machine_key = MachineKey::generate();
        store.insert_node(new_node(machine_key, a.id), now).unwrap();

        let err = store.insert_node(new_node(machine_key, a.id), now).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateNode { user_id, .. } if user_id == a.id));
    }

    #[test]
    fn test_insert_node_requires_user() {
        let store = MemoryStore::new();
        let err = store
            .insert_node(new_node(MachineKey::generate(), UserId(42)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(UserId(42))));
    }

    #[test]
    fn test_renew_unknown_node() {
        let store = MemoryStore::new();
        let err = store
            .renew_node(NodeId(0), NodeKey::generate(), None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NodeNotFound(NodeId(0))));
    }
}
