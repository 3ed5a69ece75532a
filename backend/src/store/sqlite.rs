use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use meshgate_common::{MachineKey, NewNode, NewUser, Node, NodeId, NodeKey, User, UserId};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Store, StoreError};

const USER_COLUMNS: &str = "id, name, email, provider, provider_id, created_at";
const NODE_COLUMNS: &str =
    "id, machine_key, node_key, user_id, expiry, created_at, updated_at";

/// SQLite-backed user and node tables.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::DatabaseError(e.to_string())
}

/// UNIQUE or PRIMARY KEY conflicts only; foreign key and NOT NULL failures
/// are plain database errors.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {}: {}", raw, e)))
}

/// Raw column values, converted after the row borrow ends so that parse
/// failures surface as `StoreError::Corrupt`.
struct UserRow {
    id: i64,
    name: String,
    email: String,
    provider: String,
    provider_id: Option<String>,
    created_at: String,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            provider: row.get(3)?,
            provider_id: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_user(self) -> Result<User, StoreError> {
        Ok(User {
            id: UserId(self.id as u64),
            name: self.name,
            email: self.email,
            provider: self.provider,
            provider_id: self.provider_id.unwrap_or_default(),
            created_at: parse_time(&self.created_at)?,
        })
    }
}

struct NodeRow {
    id: i64,
    machine_key: String,
    node_key: String,
    user_id: i64,
    expiry: Option<String>,
    created_at: String,
    updated_at: String,
}

impl NodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            machine_key: row.get(1)?,
            node_key: row.get(2)?,
            user_id: row.get(3)?,
            expiry: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_node(self) -> Result<Node, StoreError> {
        let machine_key: MachineKey = self
            .machine_key
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("node {} machine key: {}", self.id, e)))?;
        let node_key: NodeKey = self
            .node_key
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("node {} node key: {}", self.id, e)))?;
        Ok(Node {
            id: NodeId(self.id as u64),
            machine_key,
            node_key,
            user_id: UserId(self.user_id as u64),
            expiry: self.expiry.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

impl SqliteStore {
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(db_err)?
        } else {
            // Create parent directories if needed
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::IoError(e.to_string()))?;
            }
            Connection::open(path).map_err(db_err)?
        };

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL DEFAULT '',
                provider TEXT NOT NULL DEFAULT '',
                provider_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_provider_id
                ON users(provider_id) WHERE provider_id IS NOT NULL;

            CREATE INDEX IF NOT EXISTS idx_users_name ON users(name);

            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_key TEXT NOT NULL,
                node_key TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                expiry TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (machine_key, user_id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_machine_key ON nodes(machine_key);",
        )
        .map_err(db_err)?;

        tracing::info!("Store initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    fn query_user(
        conn: &Connection,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<User>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, clause),
            params,
            UserRow::from_row,
        )
        .optional()
        .map_err(db_err)?
        .map(UserRow::into_user)
        .transpose()
    }

    fn query_users(
        conn: &Connection,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<User>, StoreError> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM users {} ORDER BY id ASC",
                USER_COLUMNS, clause
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params, UserRow::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(UserRow::into_user).collect()
    }

    fn query_node(
        conn: &Connection,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<Node>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM nodes WHERE {}", NODE_COLUMNS, clause),
            params,
            NodeRow::from_row,
        )
        .optional()
        .map_err(db_err)?
        .map(NodeRow::into_node)
        .transpose()
    }

    fn query_nodes(
        conn: &Connection,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Node>, StoreError> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM nodes {} ORDER BY id ASC",
                NODE_COLUMNS, clause
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params, NodeRow::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(NodeRow::into_node).collect()
    }

    fn node_by_id(conn: &Connection, id: NodeId) -> Result<Node, StoreError> {
        Self::query_node(conn, "id = ?1", &[&(id.0 as i64)])?.ok_or(StoreError::NodeNotFound(id))
    }
}

impl Store for SqliteStore {
    fn insert_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<User, StoreError> {
        let conn = self.conn()?;
        let provider_id = (!user.provider_id.is_empty()).then_some(user.provider_id.as_str());

        let inserted = conn.execute(
            "INSERT INTO users (name, email, provider, provider_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user.name, user.email, user.provider, provider_id, now.to_rfc3339()],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateUser(user.provider_id));
            }
            Err(e) => return Err(db_err(e)),
        }

        let id = UserId(conn.last_insert_rowid() as u64);
        tracing::debug!("Inserted user row {}", id);
        Ok(user.into_user(id, now))
    }

    fn user_by_provider_id(&self, provider_id: &str) -> Result<Option<User>, StoreError> {
        if provider_id.is_empty() {
            return Ok(None);
        }
        let conn = self.conn()?;
        Self::query_user(&conn, "provider_id = ?1", &[&provider_id])
    }

    fn local_users_named(&self, name: &str) -> Result<Vec<User>, StoreError> {
        let conn = self.conn()?;
        Self::query_users(
            &conn,
            "WHERE name = ?1 AND provider_id IS NULL",
            &[&name],
        )
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn()?;
        Self::query_users(&conn, "", &[])
    }

    fn insert_node(&self, node: NewNode, now: DateTime<Utc>) -> Result<Node, StoreError> {
        let conn = self.conn()?;

        if Self::query_user(&conn, "id = ?1", &[&(node.user_id.0 as i64)])?.is_none() {
            return Err(StoreError::UserNotFound(node.user_id));
        }

        let inserted = conn.execute(
            "INSERT INTO nodes (machine_key, node_key, user_id, expiry, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                node.machine_key.to_string(),
                node.node_key.to_string(),
                node.user_id.0 as i64,
                node.expiry.map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateNode {
                    machine_key: node.machine_key.to_string(),
                    user_id: node.user_id,
                });
            }
            Err(e) => return Err(db_err(e)),
        }

        let id = NodeId(conn.last_insert_rowid() as u64);
        tracing::debug!("Inserted node row {} for machine {}", id, node.machine_key.short());
        Ok(node.into_node(id, now))
    }

    fn node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        let conn = self.conn()?;
        Self::query_node(&conn, "id = ?1", &[&(id.0 as i64)])
    }

    fn node_for(
        &self,
        machine_key: &MachineKey,
        user_id: UserId,
    ) -> Result<Option<Node>, StoreError> {
        let conn = self.conn()?;
        Self::query_node(
            &conn,
            "machine_key = ?1 AND user_id = ?2",
            &[&machine_key.to_string(), &(user_id.0 as i64)],
        )
    }

    fn nodes_for_machine(&self, machine_key: &MachineKey) -> Result<Vec<Node>, StoreError> {
        let conn = self.conn()?;
        Self::query_nodes(&conn, "WHERE machine_key = ?1", &[&machine_key.to_string()])
    }

    fn renew_node(
        &self,
        id: NodeId,
        node_key: NodeKey,
        expiry: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Node, StoreError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE nodes SET node_key = ?1, expiry = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    node_key.to_string(),
                    expiry.map(|t| t.to_rfc3339()),
                    now.to_rfc3339(),
                    id.0 as i64,
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NodeNotFound(id));
        }
        Self::node_by_id(&conn, id)
    }

    fn set_node_expiry(
        &self,
        id: NodeId,
        expiry: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Node, StoreError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE nodes SET expiry = ?1, updated_at = ?2 WHERE id = ?3",
                params![expiry.map(|t| t.to_rfc3339()), now.to_rfc3339(), id.0 as i64],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NodeNotFound(id));
        }
        Self::node_by_id(&conn, id)
    }

    fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let conn = self.conn()?;
        Self::query_nodes(&conn, "", &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").unwrap()
    }

    #[test]
    fn test_insert_and_read_back_user() {
        let store = memory_store();
        let now = Utc::now();
        let user = store
            .insert_user(
                NewUser::oidc("user1", "user1@headscale.net", "https://idp/user1"),
                now,
            )
            .unwrap();
        assert_eq!(user.id, UserId(1));

        let found = store.user_by_provider_id("https://idp/user1").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.provider, "oidc");
        assert_eq!(found.email, "user1@headscale.net");
        assert_eq!(found.name, "user1");
    }

    #[test]
    fn test_local_users_have_empty_provider_id() {
        let store = memory_store();
        let now = Utc::now();
        store.insert_user(NewUser::local("user1", ""), now).unwrap();
        store.insert_user(NewUser::local("user2", ""), now).unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|u| u.provider_id.is_empty() && u.is_local()));
        assert_eq!(store.local_users_named("user2").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_provider_id_is_conflict() {
        let store = memory_store();
        let now = Utc::now();
        store
            .insert_user(NewUser::oidc("a", "", "https://idp/a"), now)
            .unwrap();
        let err = store
            .insert_user(NewUser::oidc("a", "", "https://idp/a"), now)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUser(_)));
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_node_round_trip_and_renew() {
        let store = memory_store();
        let now = Utc::now();
        let user = store.insert_user(NewUser::local("a", ""), now).unwrap();
        let machine_key = MachineKey::generate();
        let expiry = now + chrono::Duration::minutes(10);

        let node = store
            .insert_node(
                NewNode {
                    machine_key,
                    node_key: NodeKey::generate(),
                    user_id: user.id,
                    expiry: Some(expiry),
                },
                now,
            )
            .unwrap();
        let stored = store.node(node.id).unwrap().unwrap();
        assert_eq!(stored.machine_key, machine_key);
        assert_eq!(stored.node_key, node.node_key);

        let fresh_key = NodeKey::generate();
        let renewed = store.renew_node(node.id, fresh_key, None, now).unwrap();
        assert_eq!(renewed.id, node.id);
        assert_eq!(renewed.node_key, fresh_key);
        assert!(renewed.expiry.is_none());
    }

    #[test]
    fn test_duplicate_node_pair_is_conflict() {
        let store = memory_store();
        let now = Utc::now();
        let user = store.insert_user(NewUser::local("a", ""), now).unwrap();
        let machine_key = MachineKey::generate();
        let new_node = || NewNode {
            machine_key,
            node_key: NodeKey::generate(),
            user_id: user.id,
            expiry: None,
        };

        store.insert_node(new_node(), now).unwrap();
        let err = store.insert_node(new_node(), now).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateNode { .. }));
    }

    #[test]
    fn test_only_unique_constraints_are_conflicts() {
        let store = memory_store();
        let now = Utc::now();
        let user = store
            .insert_user(NewUser::oidc("a", "", "https://idp/a"), now)
            .unwrap();
        let conn = store.conn().unwrap();
        let insert_node = |user_id: i64| {
            conn.execute(
                "INSERT INTO nodes (machine_key, node_key, user_id, expiry, created_at, updated_at)
                 VALUES ('mkey:00', 'nodekey:00', ?1, NULL, 't', 't')",
                params![user_id],
            )
        };

        let orphan = insert_node(999).unwrap_err();
        assert!(matches!(
            &orphan,
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
        ));
        assert!(!is_unique_violation(&orphan));

        insert_node(user.id.0 as i64).unwrap();
        assert!(is_unique_violation(&insert_node(user.id.0 as i64).unwrap_err()));

        let taken = conn
            .execute(
                "INSERT INTO users (name, provider_id, created_at) VALUES ('b', 'https://idp/a', 't')",
                [],
            )
            .unwrap_err();
        assert!(is_unique_violation(&taken));

        let unnamed = conn
            .execute("INSERT INTO users (name, created_at) VALUES (NULL, 't')", [])
            .unwrap_err();
        assert!(!is_unique_violation(&unnamed));
    }

    #[test]
    fn test_set_expiry_unknown_node() {
        let store = memory_store();
        let err = store
            .set_node_expiry(NodeId(9), None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NodeNotFound(NodeId(9))));
    }

    #[test]
    fn test_ids_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshgate.db");
        let url = format!("sqlite:{}", path.display());
        let now = Utc::now();

        {
            let store = SqliteStore::new(&url).unwrap();
            store.insert_user(NewUser::local("a", ""), now).unwrap();
        }

        let store = SqliteStore::new(&url).unwrap();
        let b = store.insert_user(NewUser::local("b", ""), now).unwrap();
        assert_eq!(b.id, UserId(2));
    }
}
