//! Live node sessions and expiry enforcement.
//!
//! The store holds each node's expiry; this module tracks which nodes are
//! currently logged in, broadcasts transitions to admin listeners and runs the
//! periodic sweep that logs out nodes whose expiry has passed.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};

use meshgate_common::{
    MachineKey, Node, NodeId, SessionEvent, SessionEventKind, SessionStatus, UserId,
};

use crate::reconcile::Reconciler;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct LiveSession {
    user_id: UserId,
    machine_key: MachineKey,
    expiry: Option<DateTime<Utc>>,
    active: bool,
}

impl LiveSession {
    fn from_node(node: &Node, active: bool) -> Self {
        Self {
            user_id: node.user_id,
            machine_key: node.machine_key,
            expiry: node.expiry,
            active,
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && matches!(self.expiry, Some(expiry) if expiry <= now)
    }
}

/// In-memory session table keyed by node.
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<NodeId, LiveSession>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Rebuild the table from persisted nodes. Returns how many are active.
    pub fn restore(&self, nodes: &[Node], now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.clear();
        for node in nodes {
            sessions.insert(node.id, LiveSession::from_node(node, !node.is_expired(now)));
        }
        sessions.values().filter(|s| s.active).count()
    }

    /// Mark `node` logged in with its current key and expiry.
    pub fn activate(&self, node: &Node, now: DateTime<Utc>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id, LiveSession::from_node(node, true));
        self.emit(SessionEventKind::LoggedIn, node.id, node.user_id, &node.machine_key, now);
    }

    /// Log `node` out. Returns whether it had an active session.
    pub fn log_out(&self, node: &Node, kind: SessionEventKind, now: DateTime<Utc>) -> bool {
        let was_active = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let session = sessions
                .entry(node.id)
                .or_insert_with(|| LiveSession::from_node(node, false));
            let was_active = session.active;
            session.active = false;
            session.expiry = node.expiry;
            was_active
        };
        if was_active {
            self.emit(kind, node.id, node.user_id, &node.machine_key, now);
        }
        was_active
    }

    /// Expire the sessions among `candidates` that are still due at `now`.
    ///
    /// `candidates` may be stale: each one is re-checked against the live
    /// table under the write lock, so a login that renewed the node after the
    /// candidates were read keeps its session.
    pub fn expire_due(&self, candidates: &[Node], now: DateTime<Utc>) -> Vec<NodeId> {
        let mut expired = Vec::new();
        {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            for node in candidates.iter().filter(|n| n.is_expired(now)) {
                if let Some(session) = sessions.get_mut(&node.id) {
                    if session.is_due(now) {
                        session.active = false;
                        expired.push((node.id, session.user_id, session.machine_key));
                    }
                }
            }
        }

        for (node_id, user_id, machine_key) in &expired {
            tracing::info!(node_id = %node_id, user_id = %user_id, "Node session expired");
            self.emit(SessionEventKind::Expired, *node_id, *user_id, machine_key, now);
        }
        expired.into_iter().map(|(id, _, _)| id).collect()
    }

    pub fn status(&self, node_id: NodeId) -> SessionStatus {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&node_id) {
            Some(session) if session.active => SessionStatus::Active {
                expiry: session.expiry,
            },
            Some(_) => SessionStatus::LoggedOut,
            None => SessionStatus::Unknown,
        }
    }

    /// Node key of the live session, if the node is logged in.
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.active)
            .count()
    }

    fn emit(
        &self,
        kind: SessionEventKind,
        node_id: NodeId,
        user_id: UserId,
        machine_key: &MachineKey,
        timestamp: DateTime<Utc>,
    ) {
        let event = SessionEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            node_id,
            user_id,
            machine_key: machine_key.to_string(),
            timestamp,
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Background task that periodically sweeps expired sessions.
pub struct ExpirySweeper {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ExpirySweeper {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle that stops [`run`](Self::run) when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        tracing::info!("Expiry sweeper started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("Expiry sweeper stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.reconciler.sweep() {
                Ok(expired) if !expired.is_empty() => {
                    tracing::info!("Expired {} node session(s)", expired.len());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Expiry sweep failed: {}", e),
            }
        }
    }
}
