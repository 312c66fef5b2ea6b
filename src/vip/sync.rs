//! Pool listener
//!
//! Mirrors the pool's virtual-IP list into the `/virtual_ips` tree so
//! that every VIP the pool declares has a node for the leader candidates
//! to contest, and nodes for VIPs removed from the pool are torn down
//! (which releases the leader, wherever it is). Re-syncs on every pool
//! or ip-assignment change; failed syncs retry after a minimum backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coord::{paths, Event, Session, SessionExt, Watch};
use crate::error::{Error, Result};
use crate::model::Pool;

/// Minimum wait before retrying a failed sync
pub const FAILED_SYNC_BACKOFF: Duration = Duration::from_secs(1);

/// Watches a pool and keeps the `/virtual_ips` tree in step with it
pub struct PoolListener {
    session: Arc<dyn Session>,
    pool_id: String,
}

impl PoolListener {
    /// Create a listener for one pool
    pub fn new(session: Arc<dyn Session>, pool_id: impl Into<String>) -> Self {
        Self {
            session,
            pool_id: pool_id.into(),
        }
    }

    /// Run until shutdown or session loss
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let pool_path = paths::pool(&self.pool_id);
        loop {
            // the pool node may not exist yet; wait for it
            let (exists, mut exists_watch) = self.session.exists_w(&pool_path).await?;
            if !exists {
                debug!(pool = %self.pool_id, "pool node absent, waiting");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    evt = &mut exists_watch => {
                        check_session(evt.unwrap_or(Event::SessionLost))?;
                        continue;
                    }
                }
            }

            let (pool, _, mut pool_watch): (Pool, i32, Watch) =
                match self.session.get_json_w(&pool_path).await {
                    Ok(read) => read,
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };

            self.session.ensure(&paths::pool_ips(&self.pool_id)).await?;
            let (ip_children, mut ips_watch) = self
                .session
                .children_w(&paths::pool_ips(&self.pool_id))
                .await?;
            let assignments = parse_assignments(&ip_children);
            debug!(
                pool = %self.pool_id,
                assignments = assignments.len(),
                vips = pool.virtual_ips.len(),
                "pool state read"
            );

            if let Err(e) = self.sync(&pool).await {
                if e.is_session_loss() {
                    return Err(e);
                }
                warn!(pool = %self.pool_id, error = %e, "virtual IP sync failed, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(FAILED_SYNC_BACKOFF) => continue,
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                evt = &mut pool_watch => check_session(evt.unwrap_or(Event::SessionLost))?,
                evt = &mut ips_watch => check_session(evt.unwrap_or(Event::SessionLost))?,
            }
        }
    }

    /// Bring `/virtual_ips` in line with the pool's declared addresses
    async fn sync(&self, pool: &Pool) -> Result<()> {
        self.session.ensure(paths::VIRTUAL_IPS).await?;
        for vip in &pool.virtual_ips {
            self.session.ensure(&paths::virtual_ip(&vip.ip)).await?;
        }
        let (children, _) = self.session.children_w(paths::VIRTUAL_IPS).await?;
        for child in children {
            if pool.virtual_ip(&child).is_none() {
                debug!(ip = %child, "virtual IP left the pool, removing its node");
                self.session
                    .delete_recursive(&paths::virtual_ip(&child))
                    .await?;
            }
        }
        Ok(())
    }
}

fn check_session(event: Event) -> Result<()> {
    if event == Event::SessionLost {
        Err(Error::SessionLost)
    } else {
        Ok(())
    }
}

/// Parse ip-assignment children (`<host_id>-<ip>`) into an ip → host map
pub fn parse_assignments(children: &[String]) -> BTreeMap<String, String> {
    let mut assignments = BTreeMap::new();
    for child in children {
        match paths::parse_ip_assignment(child) {
            Some((host, ip)) => {
                assignments.insert(ip.to_string(), host.to_string());
            }
            None => warn!(child = %child, "unparseable ip assignment node"),
        }
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::memory::MemoryCoordinator;
    use crate::coord::CreateMode;
    use crate::model::VirtualIp;

    fn pool(ips: &[&str]) -> Pool {
        Pool {
            id: "test".into(),
            virtual_ips: ips
                .iter()
                .map(|ip| VirtualIp {
                    pool_id: "test".into(),
                    ip: ip.to_string(),
                    netmask: "255.255.255.0".into(),
                    bind_interface: "eth0".into(),
                })
                .collect(),
        }
    }

    async fn wait_for_node(session: &dyn Session, path: &str, want: bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let exists = session
                    .exists_w(path)
                    .await
                    .map(|(exists, _)| exists)
                    .unwrap_or(false);
                if exists == want {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("node did not reach the wanted state in time");
    }

    #[test]
    fn assignment_children_parse_into_ip_to_host() {
        let children = vec!["host-1.2.3.4".to_string(), "host-7.7.7.7".to_string()];
        let assignments = parse_assignments(&children);
        assert_eq!(assignments.get("1.2.3.4").map(String::as_str), Some("host"));
        assert_eq!(assignments.get("7.7.7.7").map(String::as_str), Some("host"));
    }

    #[tokio::test]
    async fn listener_syncs_pool_vips_into_the_tree() {
        let coordinator = MemoryCoordinator::new();
        let admin = coordinator.session();
        admin.ensure("/pools").await.unwrap();
        admin
            .create_json("/pools/test", &pool(&["1.2.3.4"]), CreateMode::PERSISTENT)
            .await
            .unwrap();

        let session = coordinator.session();
        let listener = PoolListener::new(session, "test");
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(shutdown).await })
        };

        let probe = coordinator.session();
        wait_for_node(&*probe, "/virtual_ips/1.2.3.4", true).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn listener_removes_vips_dropped_from_the_pool() {
        let coordinator = MemoryCoordinator::new();
        let admin = coordinator.session();
        admin.ensure("/pools").await.unwrap();
        admin
            .create_json("/pools/test", &pool(&["1.2.3.4", "5.6.7.8"]), CreateMode::PERSISTENT)
            .await
            .unwrap();

        let session = coordinator.session();
        let listener = PoolListener::new(session, "test");
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(shutdown).await })
        };

        let probe = coordinator.session();
        wait_for_node(&*probe, "/virtual_ips/5.6.7.8", true).await;

        // shrink the pool; the listener's data watch fires and re-syncs
        admin
            .set_json("/pools/test", &pool(&["1.2.3.4"]), crate::coord::ANY_VERSION)
            .await
            .unwrap();
        wait_for_node(&*probe, "/virtual_ips/5.6.7.8", false).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn listener_waits_for_a_missing_pool() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        let listener = PoolListener::new(session, "test");
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(shutdown).await })
        };

        // nothing to sync yet; give it a moment to park on the exists watch
        tokio::time::sleep(Duration::from_millis(50)).await;
        let probe = coordinator.session();
        let (exists, _) = probe.exists_w(paths::VIRTUAL_IPS).await.unwrap();
        assert!(!exists, "no sync may happen before the pool node appears");

        // pool appears; sync follows
        let admin = coordinator.session();
        admin.ensure("/pools").await.unwrap();
        admin
            .create_json("/pools/test", &pool(&["1.2.3.4"]), CreateMode::PERSISTENT)
            .await
            .unwrap();
        wait_for_node(&*probe, "/virtual_ips/1.2.3.4", true).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
