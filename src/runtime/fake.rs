//! Deterministic in-memory container runtime
//!
//! Backs the supervisor test suites: containers move through
//! created/running/exited states without a daemon, die events are
//! injectable, and every exec and pull is recorded for assertions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::{
    ContainerConfig, ContainerHandle, ContainerRuntime, ContainerStatus, DieEvent, ExecOutput,
    PulledImage,
};

#[derive(Debug)]
struct FakeContainer {
    id: String,
    config: ContainerConfig,
    status: ContainerStatus,
    logs: Vec<u8>,
}

/// In-memory [`ContainerRuntime`]
#[derive(Default)]
pub struct FakeRuntime {
    containers: DashMap<String, FakeContainer>,
    die_subs: DashMap<String, Vec<oneshot::Sender<DieEvent>>>,
    next_id: AtomicU64,
    exec_log: Mutex<Vec<(String, Vec<String>)>>,
    pull_log: Mutex<Vec<String>>,
    fail_pulls: Mutex<Option<String>>,
}

impl FakeRuntime {
    /// Create an empty runtime
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent pulls fail with the given message
    pub fn fail_pulls(&self, message: impl Into<String>) {
        *self.fail_pulls.lock().expect("poisoned") = Some(message.into());
    }

    /// Images pulled so far, in order
    pub fn pulled_images(&self) -> Vec<String> {
        self.pull_log.lock().expect("poisoned").clone()
    }

    /// Commands exec'd so far, as `(container_id, argv)` pairs
    pub fn exec_history(&self) -> Vec<(String, Vec<String>)> {
        self.exec_log.lock().expect("poisoned").clone()
    }

    /// Names of containers currently running
    pub fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .iter()
            .filter(|e| e.value().status.running)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Names of all containers the runtime knows, running or not
    pub fn all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Replace a container's log buffer
    pub fn set_logs(&self, name: &str, logs: impl Into<Vec<u8>>) {
        if let Some(mut entry) = self.containers.get_mut(name) {
            entry.logs = logs.into();
        }
    }

    /// Pre-seed a running container the agent did not create
    ///
    /// Used to model agent restarts (attach path) and orphans.
    pub fn seed_running(&self, name: &str, id: &str, ip: &str) {
        self.containers.insert(
            name.to_string(),
            FakeContainer {
                id: id.to_string(),
                config: ContainerConfig {
                    name: name.to_string(),
                    ..Default::default()
                },
                status: ContainerStatus {
                    id: id.to_string(),
                    running: true,
                    started_at: Some(Utc::now()),
                    private_ip: Some(ip.to_string()),
                    ..Default::default()
                },
                logs: Vec::new(),
            },
        );
    }

    /// Simulate the container dying underneath the agent
    ///
    /// Marks it exited and fires every die subscription, exactly as the
    /// daemon's event stream would.
    pub fn kill_from_outside(&self, name: &str, exit_code: i64) {
        let Some(mut entry) = self.containers.get_mut(name) else {
            return;
        };
        let finished_at = Utc::now();
        entry.status.running = false;
        entry.status.finished_at = Some(finished_at);
        entry.status.exit_code = Some(exit_code);
        let id = entry.id.clone();
        drop(entry);
        self.fire_die(&id, exit_code);
    }

    fn fire_die(&self, id: &str, exit_code: i64) {
        if let Some((_, senders)) = self.die_subs.remove(id) {
            for tx in senders {
                let _ = tx.send(DieEvent {
                    exit_code,
                    finished_at: Utc::now(),
                });
            }
        }
    }

    fn handle_of(entry: &FakeContainer) -> ContainerHandle {
        ContainerHandle {
            id: entry.id.clone(),
            name: entry.config.name.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn find(&self, name: &str) -> Result<ContainerHandle> {
        self.containers
            .get(name)
            .map(|e| Self::handle_of(e.value()))
            .ok_or_else(|| Error::not_found(name))
    }

    async fn create(&self, config: &ContainerConfig) -> Result<ContainerHandle> {
        if self.containers.contains_key(&config.name) {
            return Err(Error::runtime(&config.name, "container name already in use"));
        }
        let id = format!("ctr-{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let handle = ContainerHandle {
            id: id.clone(),
            name: config.name.clone(),
        };
        self.containers.insert(
            config.name.clone(),
            FakeContainer {
                id: id.clone(),
                config: config.clone(),
                status: ContainerStatus {
                    id,
                    ..Default::default()
                },
                logs: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        let mut entry = self
            .containers
            .get_mut(&handle.name)
            .ok_or_else(|| Error::not_found(&handle.name))?;
        if entry.status.running {
            return Err(Error::runtime(&handle.name, "already running"));
        }
        let octet = 2 + (self.next_id.load(Ordering::SeqCst) % 250);
        entry.status.running = true;
        entry.status.started_at = Some(Utc::now());
        entry.status.finished_at = None;
        entry.status.exit_code = None;
        entry.status.private_ip = Some(format!("172.17.0.{}", octet));
        Ok(())
    }

    async fn attach(&self, handle: &ContainerHandle) -> Result<()> {
        let entry = self
            .containers
            .get(&handle.name)
            .ok_or_else(|| Error::not_found(&handle.name))?;
        if !entry.status.running {
            return Err(Error::runtime(&handle.name, "container not running"));
        }
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        self.containers
            .get(&handle.name)
            .map(|e| e.status.clone())
            .ok_or_else(|| Error::not_found(&handle.name))
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<()> {
        let Some(mut entry) = self.containers.get_mut(&handle.name) else {
            return Err(Error::not_found(&handle.name));
        };
        if !entry.status.running {
            // already stopped is not an error
            return Ok(());
        }
        entry.status.running = false;
        entry.status.finished_at = Some(Utc::now());
        entry.status.exit_code = Some(137);
        let id = entry.id.clone();
        drop(entry);
        self.fire_die(&id, 137);
        Ok(())
    }

    async fn delete(&self, handle: &ContainerHandle, force: bool) -> Result<()> {
        let Some(entry) = self.containers.get(&handle.name) else {
            return Err(Error::not_found(&handle.name));
        };
        if entry.status.running && !force {
            return Err(Error::runtime(&handle.name, "container is running"));
        }
        drop(entry);
        self.containers.remove(&handle.name);
        self.die_subs.remove(&handle.id);
        Ok(())
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
        if !self.containers.contains_key(&handle.name) {
            return Err(Error::not_found(&handle.name));
        }
        self.exec_log
            .lock()
            .expect("poisoned")
            .push((handle.id.clone(), cmd.to_vec()));
        Ok(ExecOutput::default())
    }

    async fn tail_logs(&self, handle: &ContainerHandle, lines: u32) -> Result<Vec<u8>> {
        let entry = self
            .containers
            .get(&handle.name)
            .ok_or_else(|| Error::not_found(&handle.name))?;
        let text = String::from_utf8_lossy(&entry.logs);
        let kept: Vec<&str> = text.lines().rev().take(lines as usize).collect();
        let tail: Vec<&str> = kept.into_iter().rev().collect();
        Ok(tail.join("\n").into_bytes())
    }

    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<PulledImage> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(message) = self.fail_pulls.lock().expect("poisoned").clone() {
            return Err(Error::runtime(image, message));
        }
        self.pull_log.lock().expect("poisoned").push(image.to_string());
        Ok(PulledImage {
            name: image.to_string(),
            uuid: format!("uuid-{}", image),
        })
    }
}
