//! Host agent
//!
//! The per-host reconciliation driver: connects a coordination session,
//! registers the host's presence, watches the host's instance list, and
//! keeps exactly one [`InstanceSupervisor`] alive per scheduled
//! instance. Session loss collapses to the outer reconnect loop here;
//! supervisors abandon in place and are re-spawned (re-attaching to
//! their containers) once a fresh session is up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::coord::{paths, Connector, Event, Session, SessionExt};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::master::MasterClient;
use crate::provision::VolumeDriver;
use crate::proxy::ProxyRegistry;
use crate::runtime::ContainerRuntime;

pub mod supervisor;

pub use supervisor::{InstanceResult, InstanceSupervisor};

/// Time allowed for a coordination connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait between reconnect attempts after session loss
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Shared capabilities every supervisor needs
///
/// Read-mostly; supervisors never own any of this, so no component can
/// hold up another's teardown.
pub struct AgentContext {
    /// Resolved agent settings
    pub config: AgentConfig,
    /// This host's identity
    pub host: Host,
    /// Container runtime the supervisors drive
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Master RPC surface
    pub master: Arc<dyn MasterClient>,
    /// Endpoint proxy registry
    pub proxies: Arc<ProxyRegistry>,
    /// Volume driver for tenant subvolumes
    pub volumes: Arc<dyn VolumeDriver>,
}

/// The per-host agent: one reconnect loop, one supervisor per instance
pub struct HostAgent {
    ctx: Arc<AgentContext>,
    connector: Arc<dyn Connector>,
}

impl HostAgent {
    /// Create an agent over the given coordination connector
    pub fn new(ctx: Arc<AgentContext>, connector: Arc<dyn Connector>) -> Self {
        Self { ctx, connector }
    }

    /// Shared context accessor
    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Run until shutdown
    ///
    /// Connection failures and session loss retry forever with a fixed
    /// backoff; only fatal errors (configuration, invariant violations)
    /// end the agent.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let session = match tokio::time::timeout(CONNECT_TIMEOUT, self.connector.connect())
                .await
            {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    warn!(error = %e, "coordination connect failed, retrying");
                    if wait_backoff(&shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(_) => {
                    warn!("coordination connect timed out, retrying");
                    if wait_backoff(&shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            info!(host = %self.ctx.host.id, "coordination session established");

            match self.watch_instances(session, &shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_session_loss() || e.is_retryable() => {
                    warn!(error = %e, "session interrupted, reconnecting");
                    if wait_backoff(&shutdown).await {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Watch the host's instance list and keep supervisors in step
    async fn watch_instances(
        &self,
        session: Arc<dyn Session>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        session.ensure(paths::SCHEDULER).await?;
        session.ensure(&paths::host(&self.ctx.host.id)).await?;
        let instances_path = paths::host_instances(&self.ctx.host.id);
        session.ensure(&instances_path).await?;
        info!(host = %self.ctx.host.id, "registered host presence");

        let mut supervisors: HashMap<String, CancellationToken> = HashMap::new();
        let (results_tx, mut results_rx) = mpsc::channel::<InstanceResult>(32);

        loop {
            let (children, mut watch) = session.children_w(&instances_path).await?;
            self.spawn_missing(&session, &children, &mut supervisors, &results_tx);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(host = %self.ctx.host.id, "shutting down supervisors");
                    for token in supervisors.values() {
                        token.cancel();
                    }
                    while !supervisors.is_empty() {
                        match results_rx.recv().await {
                            Some(result) => {
                                supervisors.remove(&result.state_id);
                                if let Some(e) = result.error {
                                    warn!(instance = %result.state_id, error = %e, "supervisor ended with error");
                                }
                            }
                            None => break,
                        }
                    }
                    info!(host = %self.ctx.host.id, "all supervisors stopped");
                    return Ok(());
                }
                Some(result) = results_rx.recv() => {
                    supervisors.remove(&result.state_id);
                    match result.error {
                        Some(e) if e.is_session_loss() => return Err(Error::SessionLost),
                        Some(e) => warn!(instance = %result.state_id, error = %e, "supervisor ended with error"),
                        None => debug!(instance = %result.state_id, "supervisor finished"),
                    }
                }
                evt = &mut watch => {
                    if evt.unwrap_or(Event::SessionLost) == Event::SessionLost {
                        return Err(Error::SessionLost);
                    }
                }
            }
        }
    }

    /// Spawn a supervisor for every child without one
    ///
    /// A child already in the map is left alone, so at most one live
    /// supervisor exists per instance id; removal happens only via the
    /// results channel. Returns how many supervisors were spawned.
    pub fn spawn_missing(
        &self,
        session: &Arc<dyn Session>,
        children: &[String],
        supervisors: &mut HashMap<String, CancellationToken>,
        results: &mpsc::Sender<InstanceResult>,
    ) -> usize {
        let mut spawned = 0;
        for child in children {
            if supervisors.contains_key(child) {
                continue;
            }
            debug!(instance = %child, "spawning supervisor");
            let token = CancellationToken::new();
            supervisors.insert(child.clone(), token.clone());
            let supervisor = InstanceSupervisor::new(
                self.ctx.clone(),
                session.clone(),
                child.clone(),
                token,
            );
            tokio::spawn(supervisor.run(results.clone()));
            spawned += 1;
        }
        spawned
    }
}

/// Sleep out the reconnect backoff; true when shutdown fired instead
async fn wait_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => false,
    }
}
