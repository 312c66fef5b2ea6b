//! Container driver
//!
//! The supervisor drives containers through the [`ContainerRuntime`]
//! capability set so it can be exercised against an in-memory fake. The
//! production implementation ([`docker::DockerRuntime`]) talks to the
//! local Docker daemon via `bollard`; lifecycle events arrive on the
//! daemon's event stream and are multiplexed to one-shot subscribers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{PortMapping, Protocol};

pub mod docker;
pub mod fake;

/// Grace period given to a container between SIGTERM and SIGKILL
pub const STOP_GRACE: Duration = Duration::from_secs(45);

/// A named container the runtime knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Runtime-assigned container id
    pub id: String,
    /// Stable human-readable name (`<service_id>-<instance_id>`)
    pub name: String,
}

/// Everything needed to create a container
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name; must be unused
    pub name: String,
    /// Image reference
    pub image: String,
    /// Command and arguments
    pub command: Vec<String>,
    /// Environment in `KEY=value` form
    pub env: Vec<String>,
    /// Bind mounts in `host:container` form
    pub binds: Vec<String>,
    /// Ports published on the host
    pub ports: Vec<PortPublication>,
    /// DNS servers handed to the container
    pub dns: Vec<String>,
}

/// One published port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPublication {
    /// Container port
    pub port: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

/// Point-in-time container state
#[derive(Debug, Clone, Default)]
pub struct ContainerStatus {
    /// Runtime-assigned container id
    pub id: String,
    /// Whether the container is currently running
    pub running: bool,
    /// When the container started
    pub started_at: Option<DateTime<Utc>>,
    /// When the container exited
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code of the last run
    pub exit_code: Option<i64>,
    /// Container-private IP
    pub private_ip: Option<String>,
    /// Host port bindings
    pub port_mapping: PortMapping,
}

/// Delivered once when the runtime reports a container exited
#[derive(Debug, Clone, Copy)]
pub struct DieEvent {
    /// Exit code reported by the runtime
    pub exit_code: i64,
    /// Termination timestamp reported by the runtime
    pub finished_at: DateTime<Utc>,
}

/// Captured output of an in-container exec
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Collected stdout
    pub stdout: Vec<u8>,
    /// Collected stderr
    pub stderr: Vec<u8>,
    /// Exit code of the command
    pub exit_code: i64,
}

/// Result of an image pull
#[derive(Debug, Clone)]
pub struct PulledImage {
    /// Canonical image name after registry resolution
    pub name: String,
    /// Content UUID of the image
    pub uuid: String,
}

/// Capability set the supervisor needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look a container up by name
    async fn find(&self, name: &str) -> Result<ContainerHandle>;

    /// Create a named container
    ///
    /// A prior name collision is an error; residue must be removed
    /// explicitly first.
    async fn create(&self, config: &ContainerConfig) -> Result<ContainerHandle>;

    /// Start a created container
    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// Re-join a container that is already running
    ///
    /// Used when the agent restarts and finds a container it owns. Fails
    /// if the container is not running.
    async fn attach(&self, handle: &ContainerHandle) -> Result<()>;

    /// Inspect current state
    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus>;

    /// Stop the container: SIGTERM, wait up to `grace`, then SIGKILL
    ///
    /// Returns `Ok` when the container is already stopped.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;

    /// Remove the container
    async fn delete(&self, handle: &ContainerHandle, force: bool) -> Result<()>;

    /// Subscribe to the container's death
    ///
    /// One-shot; multiple subscribers are multiplexed. The sender side is
    /// dropped (channel closes) if the subscription is cancelled.
    fn on_die(&self, handle: &ContainerHandle) -> oneshot::Receiver<DieEvent>;

    /// Drop all death subscriptions for the container
    fn cancel_on_die(&self, handle: &ContainerHandle);

    /// Run a command inside the container and collect its output
    async fn exec(&self, handle: &ContainerHandle, cmd: &[String]) -> Result<ExecOutput>;

    /// Fetch the last `lines` lines of the container's output
    async fn tail_logs(&self, handle: &ContainerHandle, lines: u32) -> Result<Vec<u8>>;

    /// Pull an image, cooperating with the supervisor's cancel signal
    ///
    /// Fails with [`crate::error::Error::Cancelled`] when `cancel` fires
    /// mid-pull.
    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<PulledImage>;
}
