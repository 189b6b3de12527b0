//! Coordinator Client
//!
//! The coordinator is the external service that provides hierarchical
//! nodes with ephemeral semantics, one-shot watches, and session
//! expiration - the substrate under the distributed lock and the segment
//! metadata store.
//!
//! This module defines the `Coordinator` trait that the rest of the system
//! is written against, plus an in-memory implementation used by tests and
//! single-process deployments. The in-memory server supports multiple
//! client sessions so that ownership hand-off (one session expiring while
//! another takes over) can be exercised end to end.
//!
//! ## Watch semantics
//!
//! `watch_delete` returns a one-shot channel that fires when the node is
//! deleted; if the node is already gone the channel fires before the call
//! returns. Watchers that have been dropped are simply skipped at fire
//! time, so a watch never keeps its registrant alive.
//!
//! ## Session semantics
//!
//! Each client owns one session. Ephemeral nodes die with their session,
//! and expiry is broadcast to every subscriber of that client's
//! `session_events` channel. Dependents (locks, writers, readers) flip to
//! an errored state on expiry.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::error::{MetadataError, Result};

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives session loss.
    Persistent,
    /// Deleted when the creating session expires.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing sequence suffix appended
    /// to the node name.
    EphemeralSequential,
}

/// Node payload plus its modification version.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub data: Bytes,
    pub version: i64,
}

/// Events broadcast to observers of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Expired,
}

/// Hierarchical node store with ephemeral semantics and watches.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a node. Returns the full path of the created node (which
    /// differs from the requested path for sequential nodes).
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String>;

    async fn get(&self, path: &str) -> Result<Option<NodeData>>;

    /// Replace a node's data. `expected_version < 0` skips the version
    /// check. Returns the new version.
    async fn set(&self, path: &str, data: Bytes, expected_version: i64) -> Result<i64>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the direct children of `path`, unordered.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// One-shot watch on node deletion. Fires immediately if the node does
    /// not exist.
    async fn watch_delete(&self, path: &str) -> Result<oneshot::Receiver<()>>;

    /// Subscribe to this client's session events.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

struct NodeEntry {
    data: Bytes,
    version: i64,
    owner_session: Option<u64>,
    delete_watchers: Vec<oneshot::Sender<()>>,
}

struct ServerState {
    nodes: BTreeMap<String, NodeEntry>,
    next_sequence: u64,
    next_session: u64,
    live_sessions: HashMap<u64, broadcast::Sender<SessionEvent>>,
}

/// Shared in-memory coordinator backend. Clients connect to it to obtain
/// sessions; state is common across all of them.
pub struct MemCoordinatorServer {
    state: Mutex<ServerState>,
}

impl MemCoordinatorServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                nodes: BTreeMap::new(),
                next_sequence: 0,
                next_session: 1,
                live_sessions: HashMap::new(),
            }),
        })
    }

    /// Open a new client session against this server.
    pub fn connect(self: &Arc<Self>) -> Arc<MemCoordinator> {
        let (events, _) = broadcast::channel(16);
        let session_id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_session;
            state.next_session += 1;
            state.live_sessions.insert(id, events.clone());
            id
        };
        debug!(session_id, "coordinator session opened");
        Arc::new(MemCoordinator {
            server: Arc::clone(self),
            session_id,
            events,
            expired: AtomicBool::new(false),
        })
    }

    fn delete_node_locked(state: &mut ServerState, path: &str) -> Option<NodeEntry> {
        let mut entry = state.nodes.remove(path)?;
        for watcher in entry.delete_watchers.drain(..) {
            // Dropped receivers are fine; the watch was abandoned.
            let _ = watcher.send(());
        }
        Some(entry)
    }

    /// Expire one session: drop its ephemeral nodes (firing delete
    /// watches) and notify its subscribers.
    fn expire(&self, session_id: u64) {
        let notify = {
            let mut state = self.state.lock().unwrap();
            let ephemeral: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.owner_session == Some(session_id))
                .map(|(p, _)| p.clone())
                .collect();
            for path in ephemeral {
                debug!(session_id, path = %path, "dropping ephemeral node on session expiry");
                Self::delete_node_locked(&mut state, &path);
            }
            state.live_sessions.remove(&session_id)
        };
        if let Some(events) = notify {
            let _ = events.send(SessionEvent::Expired);
        }
    }
}

/// One client session against a `MemCoordinatorServer`.
pub struct MemCoordinator {
    server: Arc<MemCoordinatorServer>,
    session_id: u64,
    events: broadcast::Sender<SessionEvent>,
    expired: AtomicBool,
}

impl MemCoordinator {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Force-expire this session. Test hook standing in for a real
    /// coordinator deciding the client is gone.
    pub fn expire_session(&self) {
        if !self.expired.swap(true, Ordering::SeqCst) {
            self.server.expire(self.session_id);
        }
    }

    fn check_session(&self) -> Result<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(MetadataError::SessionExpired);
        }
        Ok(())
    }
}

#[async_trait]
impl Coordinator for MemCoordinator {
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String> {
        self.check_session()?;
        let mut state = self.server.state.lock().unwrap();
        let full_path = match mode {
            CreateMode::EphemeralSequential => {
                let seq = state.next_sequence;
                state.next_sequence += 1;
                format!("{}{:010}", path, seq)
            }
            _ => path.to_string(),
        };
        if state.nodes.contains_key(&full_path) {
            return Err(MetadataError::NodeExists(full_path));
        }
        let owner_session = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(self.session_id),
        };
        state.nodes.insert(
            full_path.clone(),
            NodeEntry {
                data,
                version: 0,
                owner_session,
                delete_watchers: Vec::new(),
            },
        );
        Ok(full_path)
    }

    async fn get(&self, path: &str) -> Result<Option<NodeData>> {
        self.check_session()?;
        let state = self.server.state.lock().unwrap();
        Ok(state.nodes.get(path).map(|n| NodeData {
            data: n.data.clone(),
            version: n.version,
        }))
    }

    async fn set(&self, path: &str, data: Bytes, expected_version: i64) -> Result<i64> {
        self.check_session()?;
        let mut state = self.server.state.lock().unwrap();
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| MetadataError::NodeNotFound(path.to_string()))?;
        if expected_version >= 0 && node.version != expected_version {
            return Err(MetadataError::BadVersion(path.to_string()));
        }
        node.data = data;
        node.version += 1;
        Ok(node.version)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_session()?;
        let mut state = self.server.state.lock().unwrap();
        MemCoordinatorServer::delete_node_locked(&mut state, path)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NodeNotFound(path.to_string()))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check_session()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let state = self.server.state.lock().unwrap();
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect())
    }

    async fn watch_delete(&self, path: &str) -> Result<oneshot::Receiver<()>> {
        self.check_session()?;
        let (tx, rx) = oneshot::channel();
        let mut state = self.server.state.lock().unwrap();
        match state.nodes.get_mut(path) {
            Some(node) => node.delete_watchers.push(tx),
            None => {
                // Already gone: fire before handing the receiver back.
                let _ = tx.send(());
            }
        }
        Ok(rx)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
