//! Virtual-IP leadership
//!
//! Watches `/virtual_ips` and runs one leader-candidate task per VIP.
//! The winning host binds the address as a local `:zvip<N>` alias and
//! holds it until the VIP disappears or the session is lost. Aliases are
//! torn down unconditionally on every exit path, panic included, so the
//! set of locally-bound aliases always equals the set of held leases.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coord::{paths, Event, LeaseHandle, Session, SessionExt};
use crate::error::{Error, Result};
use crate::model::Pool;

pub mod iface;
pub mod sync;

use iface::{alias_for, next_free_index, InterfaceManager};

/// Wait before a candidate retries after a failed bind
const BIND_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Identity payload stored on a VIP leader candidate node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VipLeader {
    /// Host proposing ownership
    pub host_id: String,
    /// Address being contested
    pub ip: String,
}

/// Alias guard: unbinds on drop
///
/// Holding one means the alias is bound on this host. All exit paths of
/// a candidate task, including panics, release the alias through this.
struct BoundAlias {
    interfaces: Arc<dyn InterfaceManager>,
    name: String,
}

impl Drop for BoundAlias {
    fn drop(&mut self) {
        if let Err(e) = self.interfaces.unbind(&self.name) {
            warn!(alias = %self.name, error = %e, "could not unbind virtual IP alias");
        }
    }
}

/// Watches the VIP tree and runs one candidate per address
pub struct VipWatcher {
    session: Arc<dyn Session>,
    interfaces: Arc<dyn InterfaceManager>,
    host_id: String,
    pool_id: String,
}

impl VipWatcher {
    /// Create a watcher over the given session
    pub fn new(
        session: Arc<dyn Session>,
        interfaces: Arc<dyn InterfaceManager>,
        host_id: impl Into<String>,
        pool_id: impl Into<String>,
    ) -> Self {
        Self {
            session,
            interfaces,
            host_id: host_id.into(),
            pool_id: pool_id.into(),
        }
    }

    /// Run until shutdown or session loss
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.session.ensure(paths::VIRTUAL_IPS).await?;
        let mut candidates: HashMap<String, CancellationToken> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::channel::<String>(16);

        let result = loop {
            let (children, mut watch) = match self.session.children_w(paths::VIRTUAL_IPS).await {
                Ok(listing) => listing,
                Err(e) => break Err(e),
            };
            for ip in children {
                if candidates.contains_key(&ip) {
                    continue;
                }
                debug!(ip = %ip, "starting virtual IP candidate");
                let token = CancellationToken::new();
                candidates.insert(ip.clone(), token.clone());
                let candidate = Candidate {
                    session: self.session.clone(),
                    interfaces: self.interfaces.clone(),
                    host_id: self.host_id.clone(),
                    pool_id: self.pool_id.clone(),
                    ip: ip.clone(),
                };
                let done = done_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = candidate.run(token).await {
                        if !e.is_session_loss() && !e.is_cancelled() {
                            warn!(ip = %candidate.ip, error = %e, "virtual IP candidate failed");
                        }
                    }
                    let _ = done.send(candidate.ip.clone()).await;
                });
            }

            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some(ip) = done_rx.recv() => {
                    debug!(ip = %ip, "virtual IP candidate finished");
                    candidates.remove(&ip);
                }
                evt = &mut watch => {
                    if evt.unwrap_or(Event::SessionLost) == Event::SessionLost {
                        break Err(Error::SessionLost);
                    }
                }
            }
        };

        for token in candidates.values() {
            token.cancel();
        }
        result
    }
}

/// One leader-candidate task for one VIP
struct Candidate {
    session: Arc<dyn Session>,
    interfaces: Arc<dyn InterfaceManager>,
    host_id: String,
    pool_id: String,
    ip: String,
}

impl Candidate {
    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let payload = serde_json::to_vec(&VipLeader {
            host_id: self.host_id.clone(),
            ip: self.ip.clone(),
        })
        .map_err(|e| Error::serialization("vip-leader", e))?;
        let mut lease = LeaseHandle::new(
            self.session.clone(),
            paths::virtual_ip_leader(&self.ip),
            payload,
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                lease.release().await.ok();
                return Ok(());
            }
            acquired = lease.acquire() => acquired?,
        }
        info!(ip = %self.ip, host = %self.host_id, "virtual IP lease acquired");

        let alias = match self.bind().await {
            Ok(alias) => alias,
            Err(e) => {
                // collision or missing spec: withdraw so another host can
                // try, and pace the next attempt
                lease.release().await.ok();
                if !e.is_session_loss() {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(BIND_RETRY_BACKOFF) => {}
                    }
                }
                return Err(e);
            }
        };

        // hold until the VIP disappears, shutdown, or session loss
        let vip_path = paths::virtual_ip(&self.ip);
        loop {
            let (exists, mut watch) = self.session.exists_w(&vip_path).await?;
            if !exists {
                info!(ip = %self.ip, "virtual IP removed, releasing");
                lease.release().await.ok();
                drop(alias);
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    lease.release().await.ok();
                    return Ok(());
                }
                evt = &mut watch => {
                    if evt.unwrap_or(Event::SessionLost) == Event::SessionLost {
                        // alias guard unbinds; the lease died with the session
                        return Err(Error::SessionLost);
                    }
                }
            }
        }
    }

    /// Resolve the VIP spec from the pool and bind a free alias
    async fn bind(&self) -> Result<BoundAlias> {
        let (pool, _): (Pool, i32) = self.session.get_json(&paths::pool(&self.pool_id)).await?;
        let Some(spec) = pool.virtual_ip(&self.ip).cloned() else {
            return Err(Error::not_found(format!(
                "virtual IP {} is not in pool {}",
                self.ip, self.pool_id
            )));
        };

        let interfaces = self.interfaces.clone();
        let existing = tokio::task::spawn_blocking(move || interfaces.scan())
            .await
            .map_err(|e| Error::fatal(format!("interface scan task failed: {}", e)))??;
        if existing.iter().any(|alias| alias.ip == self.ip) {
            return Err(Error::transient_in(
                "vip",
                format!("{} is already bound on this host", self.ip),
            ));
        }
        let index = next_free_index(&spec.bind_interface, &existing)?;
        let alias = alias_for(&spec, index);

        let interfaces = self.interfaces.clone();
        let to_bind = alias.clone();
        let netmask = spec.netmask.clone();
        tokio::task::spawn_blocking(move || interfaces.bind(&to_bind, &netmask))
            .await
            .map_err(|e| Error::fatal(format!("interface bind task failed: {}", e)))??;

        Ok(BoundAlias {
            interfaces: self.interfaces.clone(),
            name: alias.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::iface::FakeInterfaces;
    use super::*;
    use crate::coord::memory::MemoryCoordinator;
    use crate::coord::CreateMode;
    use crate::model::VirtualIp;
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn pool_with_vip(ip: &str) -> Pool {
        Pool {
            id: "default".into(),
            virtual_ips: vec![VirtualIp {
                pool_id: "default".into(),
                ip: ip.into(),
                netmask: "255.255.255.0".into(),
                bind_interface: "eth0".into(),
            }],
        }
    }

    async fn seed_store(coordinator: &MemoryCoordinator, ip: &str) {
        let session = coordinator.session();
        session.ensure("/pools").await.unwrap();
        session
            .create_json("/pools/default", &pool_with_vip(ip), CreateMode::PERSISTENT)
            .await
            .unwrap();
        session.ensure(&paths::virtual_ip(ip)).await.unwrap();
    }

    #[tokio::test]
    async fn winner_binds_and_unbinds_on_vip_removal() {
        let coordinator = MemoryCoordinator::new();
        seed_store(&coordinator, "10.0.0.5").await;
        let interfaces = Arc::new(FakeInterfaces::new());

        let session = coordinator.session();
        let watcher = VipWatcher::new(session.clone(), interfaces.clone(), "h1", "default");
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.run(shutdown).await })
        };

        let interfaces_probe = interfaces.clone();
        wait_until(move || interfaces_probe.bound_ips() == vec!["10.0.0.5".to_string()]).await;

        // removing the VIP releases the alias
        let admin = coordinator.session();
        admin
            .delete_recursive(&paths::virtual_ip("10.0.0.5"))
            .await
            .unwrap();
        let interfaces_probe = interfaces.clone();
        wait_until(move || interfaces_probe.bound_ips().is_empty()).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn only_one_host_holds_a_vip() {
        let coordinator = MemoryCoordinator::new();
        seed_store(&coordinator, "10.0.0.5").await;
        let ifaces_one = Arc::new(FakeInterfaces::new());
        let ifaces_two = Arc::new(FakeInterfaces::new());

        let shutdown = CancellationToken::new();
        let session_one = coordinator.session();
        let session_two = coordinator.session();
        let first = VipWatcher::new(session_one, ifaces_one.clone(), "h1", "default");
        let second = VipWatcher::new(session_two, ifaces_two.clone(), "h2", "default");
        let (s1, s2) = (shutdown.clone(), shutdown.clone());
        let t1 = tokio::spawn(async move { first.run(s1).await });
        let t2 = tokio::spawn(async move { second.run(s2).await });

        let (a, b) = (ifaces_one.clone(), ifaces_two.clone());
        wait_until(move || a.bound_ips().len() + b.bound_ips().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            ifaces_one.bound_ips().len() + ifaces_two.bound_ips().len(),
            1,
            "exactly one host may bind the VIP"
        );

        shutdown.cancel();
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn session_loss_unbinds_and_lets_the_peer_take_over() {
        let coordinator = MemoryCoordinator::new();
        seed_store(&coordinator, "10.0.0.5").await;
        let ifaces_one = Arc::new(FakeInterfaces::new());
        let ifaces_two = Arc::new(FakeInterfaces::new());

        let shutdown = CancellationToken::new();
        let session_one = coordinator.session();
        let session_two = coordinator.session();
        let first = VipWatcher::new(session_one.clone(), ifaces_one.clone(), "h1", "default");
        let second = VipWatcher::new(session_two.clone(), ifaces_two.clone(), "h2", "default");
        let (s1, s2) = (shutdown.clone(), shutdown.clone());
        let t1 = tokio::spawn(async move { first.run(s1).await });
        let t2 = tokio::spawn(async move { second.run(s2).await });

        let (a, b) = (ifaces_one.clone(), ifaces_two.clone());
        wait_until(move || a.bound_ips().len() + b.bound_ips().len() == 1).await;

        // expire whichever session won; the other host must take over
        let one_won = ifaces_one.bound_ips().len() == 1;
        let (winner_session, winner_ifaces, survivor_ifaces) = if one_won {
            (session_one, ifaces_one.clone(), ifaces_two.clone())
        } else {
            (session_two, ifaces_two.clone(), ifaces_one.clone())
        };
        coordinator.expire(&winner_session);
        let stale = winner_ifaces.clone();
        wait_until(move || stale.bound_ips().is_empty()).await;
        let survivor = survivor_ifaces.clone();
        wait_until(move || survivor.bound_ips() == vec!["10.0.0.5".to_string()]).await;

        let expired_task = if one_won { t1 } else { t2 };
        let err = expired_task.await.unwrap().unwrap_err();
        assert!(err.is_session_loss());

        shutdown.cancel();
    }
}
