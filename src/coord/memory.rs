//! In-memory coordination store
//!
//! Implements the full [`Session`] contract (versioned nodes, one-shot
//! edge-triggered watches, ephemeral ownership, sequential names) in
//! process. Used by the test suites and by single-node development runs;
//! `expire` simulates session loss without tearing the store down, so
//! reconnect paths can be exercised deterministically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{Error, Result};

use super::{Connector, CreateMode, Event, Session, Watch, ANY_VERSION};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<u64>,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Data,
    Children,
    Exists,
}

struct WatchEntry {
    path: String,
    kind: WatchKind,
    session: u64,
    tx: oneshot::Sender<Event>,
}

#[derive(Default)]
struct Store {
    nodes: BTreeMap<String, Node>,
    watches: Vec<WatchEntry>,
    next_session: u64,
}

impl Store {
    fn fire(&mut self, path: &str, kind: WatchKind, event: Event) {
        let mut remaining = Vec::with_capacity(self.watches.len());
        for entry in self.watches.drain(..) {
            if entry.path == path && entry.kind == kind {
                let _ = entry.tx.send(event);
            } else {
                remaining.push(entry);
            }
        }
        self.watches = remaining;
    }

    fn node_created(&mut self, path: &str) {
        self.fire(path, WatchKind::Exists, Event::Created);
        if let Some(parent) = parent_of(path) {
            self.fire(parent, WatchKind::Children, Event::ChildrenChanged);
        }
    }

    fn node_deleted(&mut self, path: &str) {
        self.fire(path, WatchKind::Exists, Event::Deleted);
        self.fire(path, WatchKind::Data, Event::Deleted);
        self.fire(path, WatchKind::Children, Event::Deleted);
        if let Some(parent) = parent_of(path) {
            self.fire(parent, WatchKind::Children, Event::ChildrenChanged);
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                if rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(p, _)| p.starts_with(&prefix))
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Process-local coordination store
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    store: Arc<Mutex<Store>>,
    sessions: Arc<Mutex<BTreeMap<u64, Arc<AtomicBool>>>>,
}

impl MemoryCoordinator {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh session against the store
    pub fn session(&self) -> Arc<MemorySession> {
        let alive = Arc::new(AtomicBool::new(true));
        let id = {
            let mut store = self.store.lock().expect("store poisoned");
            store.next_session += 1;
            store.next_session
        };
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .insert(id, alive.clone());
        Arc::new(MemorySession {
            id,
            alive,
            store: self.store.clone(),
        })
    }

    /// Expire one session: its ephemerals vanish, its watches fire
    /// session-loss, and every further operation on it fails
    pub fn expire(&self, session: &MemorySession) {
        self.expire_id(session.id);
    }

    /// Expire every live session
    pub fn expire_all(&self) {
        let ids: Vec<u64> = self
            .sessions
            .lock()
            .expect("sessions poisoned")
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.expire_id(id);
        }
    }

    fn expire_id(&self, id: u64) {
        if let Some(alive) = self.sessions.lock().expect("sessions poisoned").remove(&id) {
            alive.store(false, Ordering::SeqCst);
        }
        let mut store = self.store.lock().expect("store poisoned");
        let ephemerals: Vec<String> = store
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(id))
            .map(|(p, _)| p.clone())
            .collect();
        for path in ephemerals {
            store.nodes.remove(&path);
            store.node_deleted(&path);
        }
        let mut remaining = Vec::with_capacity(store.watches.len());
        for entry in store.watches.drain(..) {
            if entry.session == id {
                let _ = entry.tx.send(Event::SessionLost);
            } else {
                remaining.push(entry);
            }
        }
        store.watches = remaining;
    }
}

#[async_trait]
impl Connector for MemoryCoordinator {
    async fn connect(&self) -> Result<Arc<dyn Session>> {
        Ok(self.session())
    }
}

/// One session against a [`MemoryCoordinator`]
pub struct MemorySession {
    id: u64,
    alive: Arc<AtomicBool>,
    store: Arc<Mutex<Store>>,
}

impl MemorySession {
    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::SessionLost)
        }
    }

    fn register_watch(store: &mut Store, path: &str, kind: WatchKind, session: u64) -> Watch {
        let (tx, rx) = oneshot::channel();
        store.watches.push(WatchEntry {
            path: path.to_string(),
            kind,
            session,
            tx,
        });
        rx
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i32)> {
        self.check_alive()?;
        let store = self.store.lock().expect("store poisoned");
        let node = store.nodes.get(path).ok_or_else(|| Error::not_found(path))?;
        Ok((node.data.clone(), node.version))
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, i32, Watch)> {
        self.check_alive()?;
        let mut store = self.store.lock().expect("store poisoned");
        let (data, version) = {
            let node = store.nodes.get(path).ok_or_else(|| Error::not_found(path))?;
            (node.data.clone(), node.version)
        };
        let watch = Self::register_watch(&mut store, path, WatchKind::Data, self.id);
        Ok((data, version, watch))
    }

    async fn set(&self, path: &str, payload: Vec<u8>, version: i32) -> Result<i32> {
        self.check_alive()?;
        let mut store = self.store.lock().expect("store poisoned");
        let node = store
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::not_found(path))?;
        if version != ANY_VERSION && node.version != version {
            return Err(Error::conflict(path));
        }
        node.data = payload;
        node.version += 1;
        let new_version = node.version;
        store.fire(path, WatchKind::Data, Event::DataChanged);
        trace!(path = %path, version = new_version, "node updated");
        Ok(new_version)
    }

    async fn create(&self, path: &str, payload: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.check_alive()?;
        let mut store = self.store.lock().expect("store poisoned");
        let final_path = if mode.sequential {
            let seq = match parent_of(path) {
                Some(parent) => {
                    let parent_node = store
                        .nodes
                        .get_mut(parent)
                        .ok_or_else(|| Error::not_found(parent))?;
                    parent_node.seq += 1;
                    parent_node.seq
                }
                None => return Err(Error::fatal("sequential node requires a parent")),
            };
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };
        if store.nodes.contains_key(&final_path) {
            return Err(Error::conflict(&final_path));
        }
        if let Some(parent) = parent_of(&final_path) {
            if !store.nodes.contains_key(parent) {
                return Err(Error::not_found(parent));
            }
        }
        store.nodes.insert(
            final_path.clone(),
            Node {
                data: payload,
                version: 0,
                ephemeral_owner: mode.ephemeral.then_some(self.id),
                seq: 0,
            },
        );
        store.node_created(&final_path);
        trace!(path = %final_path, ephemeral = mode.ephemeral, "node created");
        Ok(final_path)
    }

    async fn delete(&self, path: &str, version: i32) -> Result<()> {
        self.check_alive()?;
        let mut store = self.store.lock().expect("store poisoned");
        let node = store.nodes.get(path).ok_or_else(|| Error::not_found(path))?;
        if version != ANY_VERSION && node.version != version {
            return Err(Error::conflict(path));
        }
        if store.has_children(path) {
            return Err(Error::conflict(path));
        }
        store.nodes.remove(path);
        store.node_deleted(path);
        trace!(path = %path, "node deleted");
        Ok(())
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        self.check_alive()?;
        let mut store = self.store.lock().expect("store poisoned");
        if !store.nodes.contains_key(path) {
            return Err(Error::not_found(path));
        }
        let children = store.children_of(path);
        let watch = Self::register_watch(&mut store, path, WatchKind::Children, self.id);
        Ok((children, watch))
    }

    async fn exists_w(&self, path: &str) -> Result<(bool, Watch)> {
        self.check_alive()?;
        let mut store = self.store.lock().expect("store poisoned");
        let exists = store.nodes.contains_key(path);
        let watch = Self::register_watch(&mut store, path, WatchKind::Exists, self.id);
        Ok((exists, watch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{next_event, SessionExt};

    #[tokio::test]
    async fn set_enforces_optimistic_concurrency() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure("/services").await.unwrap();
        session
            .create("/services/s1", b"v0".to_vec(), CreateMode::PERSISTENT)
            .await
            .unwrap();

        let (_, version) = session.get("/services/s1").await.unwrap();
        assert_eq!(version, 0);
        session.set("/services/s1", b"v1".to_vec(), 0).await.unwrap();
        // stale version loses the race
        let err = session.set("/services/s1", b"v2".to_vec(), 0).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        // wildcard always wins
        session
            .set("/services/s1", b"v2".to_vec(), ANY_VERSION)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn children_watch_fires_once_per_registration() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure("/hosts/h1/instances").await.unwrap();

        let (children, mut watch) = session.children_w("/hosts/h1/instances").await.unwrap();
        assert!(children.is_empty());

        session
            .create("/hosts/h1/instances/i1", vec![], CreateMode::PERSISTENT)
            .await
            .unwrap();
        assert_eq!(next_event(&mut watch).await, Event::ChildrenChanged);

        // the watch is one-shot; a second create needs a fresh registration
        let (children, mut watch) = session.children_w("/hosts/h1/instances").await.unwrap();
        assert_eq!(children, vec!["i1".to_string()]);
        session
            .create("/hosts/h1/instances/i2", vec![], CreateMode::PERSISTENT)
            .await
            .unwrap();
        assert_eq!(next_event(&mut watch).await, Event::ChildrenChanged);
    }

    #[tokio::test]
    async fn data_watch_fires_on_change_and_deletion() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure("/hosts/h1/instances").await.unwrap();
        session
            .create("/hosts/h1/instances/i1", b"run".to_vec(), CreateMode::PERSISTENT)
            .await
            .unwrap();

        let (data, _, mut watch) = session.get_w("/hosts/h1/instances/i1").await.unwrap();
        assert_eq!(data, b"run");
        session
            .set("/hosts/h1/instances/i1", b"stop".to_vec(), ANY_VERSION)
            .await
            .unwrap();
        assert_eq!(next_event(&mut watch).await, Event::DataChanged);

        let (_, _, mut watch) = session.get_w("/hosts/h1/instances/i1").await.unwrap();
        session
            .delete("/hosts/h1/instances/i1", ANY_VERSION)
            .await
            .unwrap();
        assert_eq!(next_event(&mut watch).await, Event::Deleted);
    }

    #[tokio::test]
    async fn ephemerals_vanish_with_their_session() {
        let coordinator = MemoryCoordinator::new();
        let owner = coordinator.session();
        let observer = coordinator.session();
        owner.ensure("/virtual_ips/10.0.0.5/leader").await.unwrap();
        owner
            .create(
                "/virtual_ips/10.0.0.5/leader/candidate-",
                b"h1".to_vec(),
                CreateMode::EPHEMERAL_SEQUENTIAL,
            )
            .await
            .unwrap();

        let (children, mut watch) = observer
            .children_w("/virtual_ips/10.0.0.5/leader")
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].starts_with("candidate-"));

        coordinator.expire(&owner);
        // observer's watch sees the ephemeral disappear, not session loss
        assert_eq!(next_event(&mut watch).await, Event::ChildrenChanged);
        let (children, _) = observer
            .children_w("/virtual_ips/10.0.0.5/leader")
            .await
            .unwrap();
        assert!(children.is_empty());

        // the expired session is unusable
        let err = owner.get("/virtual_ips/10.0.0.5").await.unwrap_err();
        assert!(err.is_session_loss());
    }

    #[tokio::test]
    async fn expiry_invalidates_the_sessions_own_watches() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure("/hosts/h1/instances").await.unwrap();
        let (_, mut watch) = session.children_w("/hosts/h1/instances").await.unwrap();

        coordinator.expire(&session);
        assert_eq!(next_event(&mut watch).await, Event::SessionLost);
    }

    #[tokio::test]
    async fn delete_refuses_nodes_with_children() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure("/pools/default/ips").await.unwrap();
        let err = session.delete("/pools/default", ANY_VERSION).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn sequential_names_are_ordered() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure("/election").await.unwrap();
        let a = session
            .create("/election/candidate-", vec![], CreateMode::EPHEMERAL_SEQUENTIAL)
            .await
            .unwrap();
        let b = session
            .create("/election/candidate-", vec![], CreateMode::EPHEMERAL_SEQUENTIAL)
            .await
            .unwrap();
        assert!(a < b);
    }
}
