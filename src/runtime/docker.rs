//! Docker-backed container runtime
//!
//! Talks to the local daemon through `bollard`. Container death is
//! observed on the daemon event stream (filtered to `type=container,
//! event=die`) and multiplexed to the one-shot subscribers registered
//! through [`ContainerRuntime::on_die`]; the pump reconnects if the
//! stream ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::PortMapping;

use super::{
    ContainerConfig, ContainerHandle, ContainerRuntime, ContainerStatus, DieEvent, ExecOutput,
    PulledImage,
};

type DieSubscribers = Arc<DashMap<String, Vec<oneshot::Sender<DieEvent>>>>;

/// [`ContainerRuntime`] backed by the local Docker daemon
pub struct DockerRuntime {
    docker: Docker,
    die_subs: DieSubscribers,
}

impl DockerRuntime {
    /// Connect to the local daemon and start the event pump
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::fatal(format!("cannot reach docker daemon: {}", e)))?;
        let die_subs: DieSubscribers = Arc::new(DashMap::new());
        tokio::spawn(event_pump(docker.clone(), die_subs.clone()));
        Ok(Self { docker, die_subs })
    }
}

/// Forward daemon die events to subscribers, reconnecting on stream end
async fn event_pump(docker: Docker, die_subs: DieSubscribers) {
    let mut filters: HashMap<String, Vec<String>> = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert("event".to_string(), vec!["die".to_string()]);

    loop {
        let opts = EventsOptions::<String> {
            filters: filters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        };
        let mut stream = docker.events(Some(opts));
        while let Some(message) = stream.next().await {
            let event = match message {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "docker event stream error");
                    break;
                }
            };
            let Some(actor) = event.actor else { continue };
            let Some(id) = actor.id else { continue };
            if !die_subs.contains_key(&id) {
                continue;
            }
            let exit_code = actor
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get("exitCode"))
                .and_then(|code| code.parse().ok())
                .unwrap_or(-1);
            debug!(container = %id, exit_code, "container died");
            if let Some((_, senders)) = die_subs.remove(&id) {
                for tx in senders {
                    let _ = tx.send(DieEvent {
                        exit_code,
                        finished_at: Utc::now(),
                    });
                }
            }
        }
        warn!("docker event stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Translate a daemon error for one container
fn daemon_error(container: &str, err: bollard::errors::Error) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::not_found(container),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => Error::runtime(container, format!("daemon returned {}: {}", status_code, message)),
        other => Error::runtime(container, other.to_string()),
    }
}

/// Parse a daemon timestamp, folding Docker's zero time into `None`
fn parse_daemon_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?;
    if parsed.year() <= 1 {
        return None;
    }
    Some(parsed.with_timezone(&Utc))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find(&self, name: &str) -> Result<ContainerHandle> {
        let inspect = self
            .docker
            .inspect_container(name, None)
            .await
            .map_err(|e| daemon_error(name, e))?;
        Ok(ContainerHandle {
            id: inspect.id.unwrap_or_default(),
            name: name.to_string(),
        })
    }

    async fn create(&self, config: &ContainerConfig) -> Result<ContainerHandle> {
        let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for publication in &config.ports {
            let key = format!("{}/{}", publication.port, publication.protocol);
            exposed.insert(key.clone(), HashMap::new());
            bindings.insert(key, Some(vec![PortBinding::default()]));
        }

        let host_config = HostConfig {
            binds: Some(config.binds.clone()),
            port_bindings: Some(bindings),
            dns: Some(config.dns.clone()),
            ..Default::default()
        };
        let create = Config {
            image: Some(config.image.clone()),
            cmd: Some(config.command.clone()),
            env: Some(config.env.clone()),
            exposed_ports: Some(exposed),
            host_config: Some(host_config),
            ..Default::default()
        };
        let opts = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(opts), create)
            .await
            .map_err(|e| daemon_error(&config.name, e))?;
        Ok(ContainerHandle {
            id: response.id,
            name: config.name.clone(),
        })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.docker
            .start_container(&handle.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| daemon_error(&handle.name, e))
    }

    async fn attach(&self, handle: &ContainerHandle) -> Result<()> {
        let status = self.inspect(handle).await?;
        if !status.running {
            return Err(Error::runtime(&handle.name, "container not running"));
        }
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        let inspect = self
            .docker
            .inspect_container(&handle.name, None)
            .await
            .map_err(|e| daemon_error(&handle.name, e))?;

        let state = inspect.state.unwrap_or_default();
        let mut port_mapping = PortMapping::new();
        let network = inspect.network_settings.unwrap_or_default();
        if let Some(ports) = &network.ports {
            for (key, value) in ports {
                let Some(bindings) = value else { continue };
                if let Some(host_port) = bindings.iter().find_map(|b| b.host_port.clone()) {
                    port_mapping.insert(key.clone(), host_port);
                }
            }
        }

        Ok(ContainerStatus {
            id: inspect.id.unwrap_or_default(),
            running: state.running.unwrap_or(false),
            started_at: parse_daemon_time(state.started_at.as_deref()),
            finished_at: parse_daemon_time(state.finished_at.as_deref()),
            exit_code: state.exit_code,
            private_ip: network.ip_address.filter(|ip| !ip.is_empty()),
            port_mapping,
        })
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        let opts = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(&handle.name, Some(opts)).await {
            Ok(()) => Ok(()),
            // 304: the container was not running to begin with
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(daemon_error(&handle.name, e)),
        }
    }

    async fn delete(&self, handle: &ContainerHandle, force: bool) -> Result<()> {
        let opts = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(&handle.name, Some(opts))
            .await
            .map_err(|e| daemon_error(&handle.name, e))
    }

    fn on_die(&self, handle: &ContainerHandle) -> oneshot::Receiver<DieEvent> {
        let (tx, rx) = oneshot::channel();
        self.die_subs.entry(handle.id.clone()).or_default().push(tx);
        rx
    }

    fn cancel_on_die(&self, handle: &ContainerHandle) {
        self.die_subs.remove(&handle.id);
    }

    async fn exec(&self, handle: &ContainerHandle, cmd: &[String]) -> Result<ExecOutput> {
        let create = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&handle.name, create)
            .await
            .map_err(|e| daemon_error(&handle.name, e))?;

        let mut output = ExecOutput::default();
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| daemon_error(&handle.name, e))?;
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = started
        {
            while let Some(chunk) = stream.next().await {
                match chunk.map_err(|e| daemon_error(&handle.name, e))? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        output.stdout.extend_from_slice(&message)
                    }
                    LogOutput::StdErr { message } => output.stderr.extend_from_slice(&message),
                    LogOutput::StdIn { .. } => {}
                }
            }
        }
        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| daemon_error(&handle.name, e))?;
        output.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(output)
    }

    async fn tail_logs(&self, handle: &ContainerHandle, lines: u32) -> Result<Vec<u8>> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: lines.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(&handle.name, Some(opts));
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| daemon_error(&handle.name, e))?;
            collected.extend_from_slice(&chunk.into_bytes());
        }
        Ok(collected)
    }

    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<PulledImage> {
        let opts = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                progress = stream.next() => match progress {
                    Some(Ok(info)) => {
                        if let Some(status) = info.status {
                            debug!(image = %image, status = %status, "pull progress");
                        }
                    }
                    Some(Err(e)) => return Err(daemon_error(image, e)),
                    None => break,
                },
            }
        }
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| daemon_error(image, e))?;
        Ok(PulledImage {
            name: image.to_string(),
            uuid: inspect.id.unwrap_or_default(),
        })
    }
}
