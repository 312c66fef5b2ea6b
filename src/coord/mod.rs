//! Coordination client facade
//!
//! Uniform access to the cluster metadata store: typed node reads and
//! writes with optimistic concurrency, one-shot watches, and
//! mutual-exclusion leadership. The store itself (ZooKeeper in
//! production) is an external collaborator reached through the
//! [`Session`] trait; [`memory::MemoryCoordinator`] provides the same
//! semantics in-process for tests and single-node development.
//!
//! # Watch semantics
//!
//! Watches are edge-triggered and one-shot: a watch fires at most once,
//! and the consumer re-registers by re-reading state. Session loss
//! invalidates every outstanding watch; consumers receive
//! [`Event::SessionLost`] (or a closed channel, equivalent) and must
//! treat it as a synthetic "changed" event for everything they were
//! watching, after reconnection succeeds.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

pub mod memory;
pub mod paths;

/// Version wildcard accepted by [`Session::set`] and [`Session::delete`]
pub const ANY_VERSION: i32 = -1;

/// A one-shot watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The watched node was created
    Created,
    /// The watched node was deleted
    Deleted,
    /// The watched node's payload changed
    DataChanged,
    /// A child of the watched node was added or removed
    ChildrenChanged,
    /// The session died; the watch is void and state must be re-read
    SessionLost,
}

/// Receiver half of a one-shot watch
///
/// A closed channel (sender dropped) is equivalent to
/// [`Event::SessionLost`].
pub type Watch = oneshot::Receiver<Event>;

/// Await a watch, folding channel closure into session loss
pub async fn next_event(watch: &mut Watch) -> Event {
    watch.await.unwrap_or(Event::SessionLost)
}

/// Node creation flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateMode {
    /// Delete the node automatically when the creating session expires
    pub ephemeral: bool,
    /// Append a monotonic, zero-padded counter to the node name
    pub sequential: bool,
}

impl CreateMode {
    /// Plain persistent node
    pub const PERSISTENT: CreateMode = CreateMode {
        ephemeral: false,
        sequential: false,
    };
    /// Session-bound node
    pub const EPHEMERAL: CreateMode = CreateMode {
        ephemeral: true,
        sequential: false,
    };
    /// Session-bound node with a sequence suffix
    pub const EPHEMERAL_SEQUENTIAL: CreateMode = CreateMode {
        ephemeral: true,
        sequential: true,
    };
}

/// A live coordination session
///
/// Shared read-mostly across all agent components; its lifetime equals
/// one iteration of the outer reconnect loop. Every operation can fail
/// with [`Error::SessionLost`] at any moment.
#[async_trait]
pub trait Session: Send + Sync {
    /// Read a node's payload and version
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i32)>;

    /// Read a node and register a data watch
    ///
    /// The watch fires once on payload change or node deletion.
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, i32, Watch)>;

    /// Write a node's payload if the stored version still matches
    ///
    /// Returns the new version. [`ANY_VERSION`] skips the check. Fails
    /// with [`Error::Conflict`] when the version differs.
    async fn set(&self, path: &str, payload: Vec<u8>, version: i32) -> Result<i32>;

    /// Create a node, returning its final name
    ///
    /// The name differs from the requested one only for sequential
    /// nodes. Fails with [`Error::Conflict`] if the node exists.
    async fn create(&self, path: &str, payload: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Delete a node if the stored version still matches
    async fn delete(&self, path: &str, version: i32) -> Result<()>;

    /// List a node's children and register a child watch
    ///
    /// The watch fires once on any child addition or removal, or on
    /// deletion of the node itself.
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Check node existence and register an existence watch
    ///
    /// The watch fires once on creation or deletion.
    async fn exists_w(&self, path: &str) -> Result<(bool, Watch)>;
}

/// Factory for coordination sessions, driven by the outer reconnect loop
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a fresh session
    async fn connect(&self) -> Result<Arc<dyn Session>>;
}

/// Typed helpers layered over the raw byte operations
#[async_trait]
pub trait SessionExt: Session {
    /// Read and deserialize a node's JSON payload
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<(T, i32)> {
        let (bytes, version) = self.get(path).await?;
        let value = serde_json::from_slice(&bytes).map_err(|e| Error::serialization(path, e))?;
        Ok((value, version))
    }

    /// Read and deserialize a node's JSON payload, registering a data watch
    async fn get_json_w<T: DeserializeOwned>(&self, path: &str) -> Result<(T, i32, Watch)> {
        let (bytes, version, watch) = self.get_w(path).await?;
        let value = serde_json::from_slice(&bytes).map_err(|e| Error::serialization(path, e))?;
        Ok((value, version, watch))
    }

    /// Serialize and write a node's JSON payload
    async fn set_json<T: Serialize + Sync>(
        &self,
        path: &str,
        value: &T,
        version: i32,
    ) -> Result<i32> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::serialization(path, e))?;
        self.set(path, bytes, version).await
    }

    /// Serialize and create a node with a JSON payload
    async fn create_json<T: Serialize + Sync>(
        &self,
        path: &str,
        value: &T,
        mode: CreateMode,
    ) -> Result<String> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::serialization(path, e))?;
        self.create(path, bytes, mode).await
    }

    /// Create a marker node and any missing parents, tolerating existing
    /// nodes
    async fn ensure(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self
                .create(&current, Vec::new(), CreateMode::PERSISTENT)
                .await
            {
                Ok(_) => debug!(path = %current, "created marker node"),
                Err(Error::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete a node regardless of version, treating absence as success
    async fn delete_quietly(&self, path: &str) {
        match self.delete(path, ANY_VERSION).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => debug!(path = %path, error = %e, "could not delete node"),
        }
    }

    /// Delete a node and its entire subtree
    async fn delete_recursive(&self, path: &str) -> Result<()> {
        let children = match self.children_w(path).await {
            Ok((children, _)) => children,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in children {
            self.delete_recursive(&format!("{}/{}", path, child)).await?;
        }
        match self.delete(path, ANY_VERSION).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: Session + ?Sized> SessionExt for S {}

/// Mutual-exclusion lease over an election node
///
/// Candidates enqueue as ephemeral sequential children; the lowest
/// sequence holds the lease. The handle closes when the session expires
/// (the candidate node disappears with it).
pub struct LeaseHandle {
    session: Arc<dyn Session>,
    path: String,
    payload: Vec<u8>,
    candidate: Option<String>,
}

/// Name prefix of election candidate nodes
const CANDIDATE_PREFIX: &str = "candidate-";

impl LeaseHandle {
    /// Create a lease candidate for the election node at `path`
    ///
    /// `payload` identifies the caller (typically `{host_id, ip}`); it is
    /// stored on the candidate node so observers can see the holder.
    pub fn new(session: Arc<dyn Session>, path: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            session,
            path: path.into(),
            payload,
            candidate: None,
        }
    }

    /// Block until the caller holds the lease
    ///
    /// Fails with [`Error::SessionLost`] when the session dies while
    /// waiting; the candidate node is gone with the session and a fresh
    /// handle must be built after reconnecting.
    pub async fn acquire(&mut self) -> Result<()> {
        self.session.ensure(&self.path).await?;
        if self.candidate.is_none() {
            let requested = format!("{}/{}", self.path, CANDIDATE_PREFIX);
            let name = self
                .session
                .create(&requested, self.payload.clone(), CreateMode::EPHEMERAL_SEQUENTIAL)
                .await?;
            self.candidate = Some(name);
        }
        let mine = self.candidate.clone().expect("candidate was just created");
        let my_name = mine.rsplit('/').next().unwrap_or(&mine).to_string();

        loop {
            let (mut children, _) = self.session.children_w(&self.path).await?;
            children.sort_by_key(|name| candidate_sequence(name));
            let Some(position) = children.iter().position(|c| *c == my_name) else {
                // our node vanished underneath us; the session is gone
                return Err(Error::SessionLost);
            };
            if position == 0 {
                debug!(path = %self.path, candidate = %my_name, "lease acquired");
                return Ok(());
            }
            // wait for the candidate directly ahead of us to go away
            let predecessor = format!("{}/{}", self.path, children[position - 1]);
            let (exists, mut watch) = self.session.exists_w(&predecessor).await?;
            if !exists {
                continue;
            }
            if next_event(&mut watch).await == Event::SessionLost {
                return Err(Error::SessionLost);
            }
        }
    }

    /// Drop the lease (or withdraw the candidacy)
    pub async fn release(&mut self) -> Result<()> {
        if let Some(candidate) = self.candidate.take() {
            self.session.delete_quietly(&candidate).await;
        }
        Ok(())
    }
}

fn candidate_sequence(name: &str) -> u64 {
    name.rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryCoordinator;
    use super::*;

    #[tokio::test]
    async fn ensure_creates_missing_parents() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure("/hosts/h1/instances").await.unwrap();
        let (children, _) = session.children_w("/hosts/h1").await.unwrap();
        assert_eq!(children, vec!["instances".to_string()]);
        // a second ensure is a no-op
        session.ensure("/hosts/h1/instances").await.unwrap();
    }

    #[tokio::test]
    async fn json_helpers_roundtrip() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure("/pools").await.unwrap();
        session
            .create_json("/pools/default", &vec!["10.0.0.5"], CreateMode::PERSISTENT)
            .await
            .unwrap();
        let (ips, version): (Vec<String>, i32) = session.get_json("/pools/default").await.unwrap();
        assert_eq!(ips, vec!["10.0.0.5".to_string()]);
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn lease_is_exclusive_and_ordered() {
        let coordinator = MemoryCoordinator::new();
        let first = coordinator.session();
        let second = coordinator.session();

        let mut lease_a = LeaseHandle::new(first.clone(), "/virtual_ips/10.0.0.5", b"h1".to_vec());
        lease_a.acquire().await.unwrap();

        let mut lease_b = LeaseHandle::new(second.clone(), "/virtual_ips/10.0.0.5", b"h2".to_vec());
        let contender = tokio::spawn(async move {
            lease_b.acquire().await.unwrap();
            lease_b
        });
        // the second candidate stays parked until the first releases
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        lease_a.release().await.unwrap();
        let mut lease_b = contender.await.unwrap();
        lease_b.release().await.unwrap();
    }

    #[tokio::test]
    async fn lease_acquire_fails_over_on_session_expiry() {
        let coordinator = MemoryCoordinator::new();
        let first = coordinator.session();
        let second = coordinator.session();

        let mut lease_a = LeaseHandle::new(first.clone(), "/virtual_ips/10.0.0.5", b"h1".to_vec());
        lease_a.acquire().await.unwrap();

        let mut lease_b = LeaseHandle::new(second.clone(), "/virtual_ips/10.0.0.5", b"h2".to_vec());
        let contender = tokio::spawn(async move {
            lease_b.acquire().await.map(|_| lease_b)
        });
        tokio::task::yield_now().await;

        // holder's session dies; its ephemeral candidate disappears
        coordinator.expire(&first);
        contender.await.unwrap().unwrap();
    }
}
