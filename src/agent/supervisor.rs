//! Instance supervisor
//!
//! One task, one instance, one state machine. A supervisor reads the
//! instance's desired state, drives the container runtime toward it,
//! mirrors what actually happened into the observed-state znode, and
//! lives until the instance is deleted or the host shuts down. Terminal
//! cleanup runs exactly once on every exit path except session loss,
//! where the supervisor abandons in place so its successor can re-attach
//! to the still-running container.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coord::{
    paths, CreateMode, Event, Session, SessionExt, Watch, ANY_VERSION,
};
use crate::error::{Error, Result};
use crate::model::{
    container_name, proxy_id, DesiredState, HostState, InstanceState, ServiceDefinition,
};
use crate::provision;
use crate::proxy::ProxyAddress;
use crate::runtime::{
    ContainerConfig, ContainerHandle, ContainerStatus, DieEvent, PortPublication, STOP_GRACE,
};

use super::AgentContext;

/// Attempts made waiting for a started container to report running
const START_POLL_ATTEMPTS: u32 = 30;

/// Delay between start polls
const START_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Bytes of output dumped when a container never reaches running
const START_DUMP_BYTES: usize = 1000;

/// Lines of output captured when a container dies unexpectedly
const DIE_LOG_LINES: u32 = 10_000;

/// Lifecycle phases of one supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Reading desired and observed state
    Loading,
    /// Pulling the service image
    Pulling,
    /// Container created, waiting for it to report running
    Starting,
    /// Container running, started by this supervisor
    Running,
    /// Container running, adopted from a previous agent process
    Attached,
    /// Executing the snapshot pause command
    Pausing,
    /// Instance quiesced
    Paused,
    /// Executing the snapshot resume command
    Resuming,
    /// Stopping the container
    Stopping,
    /// Terminal; reached exactly once
    Terminated,
}

/// Final report of a supervisor, sent on the host watcher's results
/// channel
#[derive(Debug)]
pub struct InstanceResult {
    /// Instance the supervisor owned
    pub state_id: String,
    /// Error the supervisor ended with, if any
    pub error: Option<Error>,
}

/// A live container owned by this supervisor
struct Attachment {
    handle: ContainerHandle,
    die: oneshot::Receiver<DieEvent>,
}

enum Waited {
    Shutdown,
    Died(Option<DieEvent>),
    Changed(Event),
}

/// Supervises a single scheduled instance
pub struct InstanceSupervisor {
    ctx: Arc<AgentContext>,
    session: Arc<dyn Session>,
    state_id: String,
    shutdown: CancellationToken,
    state: SupervisorState,
    attachment: Option<Attachment>,
    service_id: Option<String>,
}

impl InstanceSupervisor {
    /// Create a supervisor for one instance id
    pub fn new(
        ctx: Arc<AgentContext>,
        session: Arc<dyn Session>,
        state_id: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            session,
            state_id: state_id.into(),
            shutdown,
            state: SupervisorState::Loading,
            attachment: None,
            service_id: None,
        }
    }

    /// Drive the instance until it terminates, then report
    pub async fn run(mut self, results: mpsc::Sender<InstanceResult>) {
        info!(instance = %self.state_id, "supervisor started");
        let error = match self.supervise().await {
            Ok(()) => {
                self.terminate().await;
                None
            }
            Err(e) if e.is_session_loss() => {
                // abandon in place: the container keeps running and the
                // successor supervisor re-attaches after reconnect. The die
                // subscription is multiplexed per container, so it is only
                // dropped, never cancelled, to leave the successor's intact.
                self.attachment = None;
                debug!(instance = %self.state_id, "session lost, abandoning in place");
                Some(e)
            }
            Err(e) if e.is_cancelled() => {
                self.stop_instance().await;
                self.terminate().await;
                None
            }
            Err(e) => {
                warn!(instance = %self.state_id, error = %e, "supervisor failed");
                self.stop_instance().await;
                self.terminate().await;
                Some(e)
            }
        };
        let _ = results
            .send(InstanceResult {
                state_id: self.state_id.clone(),
                error,
            })
            .await;
    }

    fn set_state(&mut self, next: SupervisorState) {
        if self.state != next {
            debug!(instance = %self.state_id, from = ?self.state, to = ?next, "state transition");
            self.state = next;
        }
    }

    /// The reconciliation loop: read, act, wait, repeat
    async fn supervise(&mut self) -> Result<()> {
        let hss_path = paths::host_instance(&self.ctx.host.id, &self.state_id);
        loop {
            let (hss, hss_version, mut hss_watch): (HostState, i32, Watch) =
                match self.session.get_json_w(&hss_path).await {
                    Ok(read) => read,
                    Err(Error::NotFound(_)) => {
                        info!(instance = %self.state_id, "desired-state node gone, stopping");
                        self.stop_instance().await;
                        return Ok(());
                    }
                    Err(Error::Serialization { path, source }) => {
                        error!(instance = %self.state_id, "invalid desired-state record, discarding");
                        self.session.delete_quietly(&hss_path).await;
                        return Err(Error::Serialization { path, source });
                    }
                    Err(e) => return Err(e),
                };
            if !hss.is_valid() {
                error!(instance = %self.state_id, "desired-state record missing ids, discarding");
                self.session.delete_quietly(&hss_path).await;
                return Err(Error::fatal(format!(
                    "desired state for {} is invalid",
                    self.state_id
                )));
            }
            self.service_id = Some(hss.service_id.clone());

            let svc: ServiceDefinition = match self
                .session
                .get_json(&paths::service(&hss.service_id))
                .await
            {
                Ok((svc, _)) => svc,
                Err(Error::NotFound(_)) => {
                    return Err(Error::not_found(format!(
                        "service {} for instance {}",
                        hss.service_id, self.state_id
                    )));
                }
                Err(e) => return Err(e),
            };

            let observed: Option<InstanceState> = match self
                .session
                .get_json(&paths::service_state(&hss.service_id, &self.state_id))
                .await
            {
                Ok((state, _)) => Some(state),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

            match hss.desired_state {
                DesiredState::Stop => {
                    info!(instance = %self.state_id, service = %svc.name, "instance marked for stop");
                    self.stop_instance().await;
                    return Ok(());
                }
                DesiredState::Restart => {
                    info!(instance = %self.state_id, service = %svc.name, "restart requested");
                    self.stop_instance().await;
                    let relaunched = HostState {
                        desired_state: DesiredState::Run,
                        ..hss.clone()
                    };
                    match self.session.set_json(&hss_path, &relaunched, hss_version).await {
                        Ok(_) | Err(Error::Conflict { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    continue;
                }
                DesiredState::Pause => {
                    let paused = observed.as_ref().is_some_and(|o| o.paused);
                    if let (Some(att), false) = (&self.attachment, paused) {
                        let handle = att.handle.clone();
                        self.set_state(SupervisorState::Pausing);
                        match self.exec_snapshot(&handle, &svc.snapshot.pause, "pause").await {
                            Ok(()) => {
                                self.update_observed(&svc.id, |o| o.paused = true).await;
                                self.set_state(SupervisorState::Paused);
                            }
                            Err(e) => {
                                error!(instance = %self.state_id, error = %e, "pause failed");
                                self.set_state(SupervisorState::Running);
                            }
                        }
                    }
                }
                DesiredState::Resume => {
                    let paused = observed.as_ref().is_some_and(|o| o.paused);
                    if let (Some(att), true) = (&self.attachment, paused) {
                        let handle = att.handle.clone();
                        self.set_state(SupervisorState::Resuming);
                        match self.exec_snapshot(&handle, &svc.snapshot.resume, "resume").await {
                            Ok(()) => {
                                self.update_observed(&svc.id, |o| o.paused = false).await;
                                self.set_state(SupervisorState::Running);
                            }
                            Err(e) => {
                                error!(instance = %self.state_id, error = %e, "resume failed");
                            }
                        }
                    }
                }
                DesiredState::Run => {
                    if self.attachment.is_none() {
                        let mut attached = false;
                        if let Some(obs) = observed.as_ref().filter(|o| o.is_running()) {
                            attached = self.attach_instance(&svc, obs).await?;
                        }
                        if !attached {
                            self.start_instance(&svc).await?;
                        }
                    }
                }
            }

            let shutdown = self.shutdown.clone();
            let waited = match &mut self.attachment {
                Some(att) => tokio::select! {
                    _ = shutdown.cancelled() => Waited::Shutdown,
                    died = &mut att.die => Waited::Died(died.ok()),
                    evt = &mut hss_watch => Waited::Changed(evt.unwrap_or(Event::SessionLost)),
                },
                None => tokio::select! {
                    _ = shutdown.cancelled() => Waited::Shutdown,
                    evt = &mut hss_watch => Waited::Changed(evt.unwrap_or(Event::SessionLost)),
                },
            };
            match waited {
                Waited::Shutdown => {
                    info!(instance = %self.state_id, "shutdown requested");
                    self.stop_instance().await;
                    return Ok(());
                }
                Waited::Died(died) => {
                    if let Some(att) = self.attachment.take() {
                        match died {
                            Some(event) => self.handle_die(&svc, att.handle, event).await,
                            // channel closed without an event: the
                            // subscription was lost, not the container
                            None => self.recheck_container(&svc, att.handle).await,
                        }
                    }
                }
                Waited::Changed(Event::SessionLost) => return Err(Error::SessionLost),
                Waited::Changed(event) => {
                    debug!(instance = %self.state_id, event = ?event, "desired state changed");
                }
            }
        }
    }

    /// Pull, provision, create, start, verify, publish
    async fn start_instance(&mut self, svc: &ServiceDefinition) -> Result<()> {
        let name = container_name(&svc.id, &self.state_id);
        info!(
            instance = %self.state_id,
            service = %svc.name,
            image = %svc.image_id,
            "starting instance"
        );

        self.set_state(SupervisorState::Pulling);
        let pulled = self.ctx.runtime.pull(&svc.image_id, &self.shutdown).await?;

        let mut binds = Vec::new();
        if !svc.volumes.is_empty() {
            // without its data directory the service cannot safely run
            let tenant = self
                .ctx
                .master
                .tenant_id(&svc.id)
                .await
                .map_err(|e| Error::fatal(format!("cannot resolve tenant for {}: {}", svc.id, e)))?;
            if tenant.is_empty() {
                return Err(Error::fatal(format!(
                    "service {} declares volumes but has no tenant",
                    svc.id
                )));
            }
            let sub = provision::subvolume(
                &*self.ctx.volumes,
                &self.ctx.config.var_path,
                &svc.pool_id,
                &tenant,
            )
            .await?;
            for volume in &svc.volumes {
                let resource = provision::prepare_resource_path(&sub, volume)?;
                binds.push(format!("{}:{}", resource.display(), volume.container_path));
            }
        }
        for (container_path, config_file) in &svc.config_files {
            let host_path = provision::materialize_config(&svc.id, container_path, config_file)?;
            binds.push(format!("{}:{}", host_path.display(), container_path));
        }
        if !svc.log_configs.is_empty() {
            let (_, mut shipper_binds) =
                provision::write_log_shipper_config(&svc.id, &svc.log_configs)?;
            binds.append(&mut shipper_binds);
        }
        binds.extend(provision::assemble_bind_mounts(
            &self.ctx.config.bind_mounts,
            &svc.image_id,
        ));
        binds.push(self.ctx.config.agent_bind());

        let startup = self.ctx.master.evaluate_startup(svc).await?;
        if startup.contains("{{") {
            return Err(Error::fatal(format!(
                "unresolved placeholder in startup command for {}: {}",
                svc.id, startup
            )));
        }

        let user = match self.ctx.master.system_user().await {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "could not fetch system user");
                Default::default()
            }
        };
        let env = vec![
            "CONTROLPLANE=1".to_string(),
            format!("CONTROLPLANE_CONSUMER_URL={}", self.ctx.config.consumer_url),
            format!("CONTROLPLANE_SYSTEM_USER={}", user.name),
            format!("CONTROLPLANE_SYSTEM_PASSWORD={}", user.password),
        ];
        let ports = svc
            .exports()
            .map(|ep| PortPublication {
                port: ep.port_number,
                protocol: ep.protocol,
            })
            .collect();
        let command = vec![
            self.ctx.config.container_agent_path(),
            "proxy".to_string(),
            svc.id.clone(),
            startup,
        ];
        let config = ContainerConfig {
            name: name.clone(),
            image: pulled.name.clone(),
            command,
            env,
            binds,
            ports,
            dns: vec![self.ctx.config.bridge_ip.clone()],
        };

        // every attempt begins clean: kill and remove any residue under
        // the canonical name
        self.remove_residue(&name).await;

        self.set_state(SupervisorState::Starting);
        let handle = self.ctx.runtime.create(&config).await?;
        let die = self.ctx.runtime.on_die(&handle);
        if let Err(e) = self.ctx.runtime.start(&handle).await {
            self.ctx.runtime.cancel_on_die(&handle);
            return Err(e);
        }

        let status = match self.await_running(&handle).await {
            Ok(status) => status,
            Err(e) => {
                self.ctx.runtime.cancel_on_die(&handle);
                return Err(e);
            }
        };

        let mut observed = InstanceState {
            id: self.state_id.clone(),
            service_id: svc.id.clone(),
            host_id: self.ctx.host.id.clone(),
            container_id: status.id.clone(),
            image_uuid: pulled.uuid.clone(),
            private_ip: status.private_ip.clone().unwrap_or_default(),
            host_ip: self.ctx.host.ip.clone(),
            started: Some(status.started_at.unwrap_or_else(Utc::now)),
            port_mapping: status.port_mapping.clone(),
            ..Default::default()
        };
        observed.bind_endpoints(svc);
        self.write_observed(&observed).await?;

        self.register_proxies(svc, &observed.private_ip).await;
        self.attachment = Some(Attachment { handle, die });
        self.set_state(SupervisorState::Running);
        info!(instance = %self.state_id, container = %status.id, "instance running");
        Ok(())
    }

    /// Poll inspect until the container reports running
    async fn await_running(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        for attempt in 0..START_POLL_ATTEMPTS {
            match self.ctx.runtime.inspect(handle).await {
                Ok(status) if status.running => return Ok(status),
                Ok(_) => debug!(instance = %self.state_id, attempt, "container not yet running"),
                Err(e) => {
                    debug!(instance = %self.state_id, attempt, error = %e, "inspect failed while waiting")
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(START_POLL_INTERVAL) => {}
            }
        }
        if let Ok(output) = self.ctx.runtime.tail_logs(handle, 50).await {
            let start = output.len().saturating_sub(START_DUMP_BYTES);
            warn!(
                container = %handle.name,
                output = %String::from_utf8_lossy(&output[start..]),
                "container never reached running"
            );
        }
        let _ = self.ctx.runtime.stop(handle, Duration::ZERO).await;
        let _ = self.ctx.runtime.delete(handle, true).await;
        Err(Error::runtime(
            &handle.name,
            "container did not reach running state",
        ))
    }

    /// Adopt a container that survived an agent restart
    ///
    /// Returns `Ok(false)` when there is nothing (or the wrong thing) to
    /// adopt and a fresh start is needed; a mismatched container is
    /// killed and removed first.
    async fn attach_instance(
        &mut self,
        svc: &ServiceDefinition,
        observed: &InstanceState,
    ) -> Result<bool> {
        let name = container_name(&svc.id, &self.state_id);
        let handle = match self.ctx.runtime.find(&name).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if handle.id != observed.container_id {
            warn!(
                instance = %self.state_id,
                expected = %observed.container_id,
                found = %handle.id,
                "removing orphaned container"
            );
            let _ = self.ctx.runtime.stop(&handle, Duration::ZERO).await;
            match self.ctx.runtime.delete(&handle, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            return Ok(false);
        }
        let status = self.ctx.runtime.inspect(&handle).await?;
        if !status.running {
            return Ok(false);
        }
        let die = self.ctx.runtime.on_die(&handle);
        if let Err(e) = self.ctx.runtime.attach(&handle).await {
            self.ctx.runtime.cancel_on_die(&handle);
            warn!(instance = %self.state_id, error = %e, "could not attach");
            return Ok(false);
        }
        self.register_proxies(svc, &observed.private_ip).await;
        self.attachment = Some(Attachment { handle: handle.clone(), die });
        self.set_state(SupervisorState::Attached);
        info!(instance = %self.state_id, container = %handle.id, "attached to running container");
        Ok(true)
    }

    /// Decide what happened to a container whose die subscription closed
    /// without delivering an event
    ///
    /// The container may well still be running (a sibling cancelled the
    /// multiplexed subscription); only inspection can tell.
    async fn recheck_container(&mut self, svc: &ServiceDefinition, handle: ContainerHandle) {
        match self.ctx.runtime.inspect(&handle).await {
            Ok(status) if status.running => {
                debug!(instance = %self.state_id, "re-subscribing to a still-running container");
                let die = self.ctx.runtime.on_die(&handle);
                self.attachment = Some(Attachment { handle, die });
            }
            Ok(status) => {
                let event = DieEvent {
                    exit_code: status.exit_code.unwrap_or(-1),
                    finished_at: status.finished_at.unwrap_or_else(Utc::now),
                };
                self.handle_die(svc, handle, event).await;
            }
            Err(e) if e.is_not_found() => {
                let event = DieEvent {
                    exit_code: -1,
                    finished_at: Utc::now(),
                };
                self.handle_die(svc, handle, event).await;
            }
            Err(e) => {
                warn!(instance = %self.state_id, error = %e, "could not inspect container, detaching");
            }
        }
    }

    /// React to the container dying: record, clean, and let the loop
    /// decide whether to relaunch
    async fn handle_die(&mut self, svc: &ServiceDefinition, handle: ContainerHandle, event: DieEvent) {
        match event.exit_code {
            // SIGKILL, expected on stop
            137 => info!(instance = %self.state_id, container = %handle.id, "container killed"),
            // intentional graceful stop
            2 => info!(instance = %self.state_id, container = %handle.id, "container stopped"),
            0 => info!(instance = %self.state_id, container = %handle.id, "container finished"),
            code => {
                warn!(
                    instance = %self.state_id,
                    container = %handle.id,
                    exit_code = code,
                    "container exited unexpectedly"
                );
                self.dump_container_logs(&handle).await;
            }
        }
        match self.ctx.runtime.delete(&handle, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container = %handle.name, error = %e, "could not delete container"),
        }
        self.ctx.proxies.remove_prefix(&format!("{}:", svc.id));
        self.update_observed(&svc.id, |o| {
            o.terminated = Some(event.finished_at);
            o.exit_code = Some(event.exit_code);
        })
        .await;
        self.set_state(SupervisorState::Loading);
    }

    /// Emit the last lines of a dead container's output, each prefixed
    /// with a short container id
    async fn dump_container_logs(&self, handle: &ContainerHandle) {
        match self.ctx.runtime.tail_logs(handle, DIE_LOG_LINES).await {
            Ok(output) => {
                let short = &handle.id[..handle.id.len().min(5)];
                let prefix = format!("ctr-{}: ", short);
                let text = String::from_utf8_lossy(&output);
                for line in text.lines() {
                    info!("{}{}", prefix, line);
                }
            }
            Err(e) => warn!(container = %handle.name, error = %e, "could not fetch container logs"),
        }
    }

    /// Stop and remove the instance's container, tolerating absence
    ///
    /// Failures are logged, never propagated: a stuck container must not
    /// block the shutdown signal's acknowledgement.
    async fn stop_instance(&mut self) {
        self.set_state(SupervisorState::Stopping);
        let handle = match self.attachment.take() {
            Some(att) => {
                self.ctx.runtime.cancel_on_die(&att.handle);
                Some(att.handle)
            }
            None => match &self.service_id {
                Some(service_id) => self
                    .ctx
                    .runtime
                    .find(&container_name(service_id, &self.state_id))
                    .await
                    .ok(),
                None => None,
            },
        };
        let Some(handle) = handle else { return };
        if let Err(e) = self.ctx.runtime.stop(&handle, STOP_GRACE).await {
            if !e.is_not_found() {
                warn!(container = %handle.name, error = %e, "could not stop container");
            }
        }
        match self.ctx.runtime.delete(&handle, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container = %handle.name, error = %e, "could not remove container"),
        }
    }

    /// Terminal cleanup: proxies, observed znode, desired znode
    async fn terminate(&mut self) {
        if self.state == SupervisorState::Terminated {
            return;
        }
        self.set_state(SupervisorState::Terminated);
        if let Some(service_id) = self.service_id.clone() {
            let removed = self.ctx.proxies.remove_prefix(&format!("{}:", service_id));
            if removed > 0 {
                debug!(instance = %self.state_id, proxies = removed, "proxies deregistered");
            }
            self.session
                .delete_quietly(&paths::service_state(&service_id, &self.state_id))
                .await;
        }
        self.session
            .delete_quietly(&paths::host_instance(&self.ctx.host.id, &self.state_id))
            .await;
        info!(instance = %self.state_id, "supervisor terminated");
    }

    /// Start a forwarder for every endpoint with an address assignment
    ///
    /// Bind failures (including frontend IPs not present on this host)
    /// are logged and skipped; the instance itself keeps running.
    async fn register_proxies(&self, svc: &ServiceDefinition, private_ip: &str) {
        for ep in &svc.endpoints {
            let Some(assignment) = &ep.address_assignment else {
                continue;
            };
            let id = proxy_id(&svc.id, &ep.application);
            let frontend = ProxyAddress::new(assignment.ip.clone(), assignment.port);
            let backend = ProxyAddress::new(private_ip.to_string(), ep.port_number);
            if let Err(e) = self
                .ctx
                .proxies
                .create(&id, ep.protocol, frontend, backend)
                .await
            {
                warn!(proxy = %id, error = %e, "could not start endpoint proxy");
            }
        }
    }

    /// Run a snapshot command inside the container
    async fn exec_snapshot(
        &self,
        handle: &ContainerHandle,
        command: &str,
        action: &str,
    ) -> Result<()> {
        if command.is_empty() {
            debug!(instance = %self.state_id, action, "no snapshot command configured");
            return Ok(());
        }
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let output = self.ctx.runtime.exec(handle, &argv).await?;
        if output.exit_code != 0 {
            return Err(Error::runtime(
                &handle.name,
                format!("{} command exited with {}", action, output.exit_code),
            ));
        }
        Ok(())
    }

    /// Create or overwrite the observed-state znode
    async fn write_observed(&self, observed: &InstanceState) -> Result<()> {
        self.session
            .ensure(&paths::service_states(&observed.service_id))
            .await?;
        let path = paths::service_state(&observed.service_id, &observed.id);
        match self
            .session
            .create_json(&path, observed, CreateMode::PERSISTENT)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Conflict { .. }) => self
                .session
                .set_json(&path, observed, ANY_VERSION)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write the observed state
    ///
    /// The supervisor is the sole writer; a version conflict means
    /// external cleanup raced us and is only logged.
    async fn update_observed(&self, service_id: &str, mutate: impl FnOnce(&mut InstanceState)) {
        let path = paths::service_state(service_id, &self.state_id);
        match self.session.get_json::<InstanceState>(&path).await {
            Ok((mut state, version)) => {
                mutate(&mut state);
                match self.session.set_json(&path, &state, version).await {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(instance = %self.state_id, error = %e, "could not update observed state")
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(instance = %self.state_id, "observed state gone, nothing to update")
            }
            Err(e) => warn!(instance = %self.state_id, error = %e, "could not read observed state"),
        }
    }

    /// Kill and remove anything already squatting on a container name
    async fn remove_residue(&self, name: &str) {
        if let Ok(stale) = self.ctx.runtime.find(name).await {
            warn!(container = %name, id = %stale.id, "removing residue under canonical name");
            let _ = self.ctx.runtime.stop(&stale, Duration::ZERO).await;
            if let Err(e) = self.ctx.runtime.delete(&stale, true).await {
                if !e.is_not_found() {
                    warn!(container = %name, error = %e, "could not remove residue");
                }
            }
        }
    }
}
