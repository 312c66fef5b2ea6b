//! Quay node agent binary

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quay::agent::{AgentContext, HostAgent, RECONNECT_BACKOFF};
use quay::config::AgentConfig;
use quay::coord::memory::MemoryCoordinator;
use quay::coord::Connector;
use quay::error::Error;
use quay::host::Host;
use quay::master::{StaticMaster, SystemUser};
use quay::provision::LocalDriver;
use quay::proxy::ProxyRegistry;
use quay::runtime::docker::DockerRuntime;
use quay::vip::iface::{unbind_all, Ifconfig, InterfaceManager};
use quay::vip::sync::PoolListener;
use quay::vip::VipWatcher;

/// Quay node agent - runs scheduled service instances on this host
#[derive(Parser, Debug)]
#[command(name = "quay-agent", version, about, long_about = None)]
struct Cli {
    /// Pool this host belongs to
    #[arg(long, env = "QUAY_POOL_ID", default_value = "default")]
    pool_id: String,

    /// Coordination store to use (`memory` runs an in-process store for
    /// single-node development)
    #[arg(long, env = "QUAY_COORDINATOR", default_value = "memory")]
    coordinator: String,

    /// Directory for agent-managed state
    #[arg(long, env = "QUAY_VAR_PATH", default_value = "/var/quay")]
    var_path: PathBuf,

    /// IP of the container bridge, used as container DNS
    #[arg(long, env = "QUAY_BRIDGE_IP", default_value = "172.17.0.1")]
    bridge_ip: String,

    /// Metrics consumer URL injected into containers
    #[arg(
        long,
        env = "QUAY_CONSUMER_URL",
        default_value = "http://localhost:22350/api/metrics/store"
    )]
    consumer_url: String,

    /// Directory containing the agent binary, mounted at /serviced
    #[arg(long, env = "QUAY_AGENT_DIR", default_value = "/opt/quay")]
    agent_dir: PathBuf,

    /// Extra bind mounts, image:host_path:container_path (repeatable)
    #[arg(long = "mount")]
    mounts: Vec<String>,

    /// System user name handed to containers
    #[arg(long, env = "QUAY_SYSTEM_USER", default_value = "")]
    system_user: String,

    /// System user password handed to containers
    #[arg(long, env = "QUAY_SYSTEM_PASSWORD", default_value = "")]
    system_password: String,

    /// Skip virtual-IP management on this host
    #[arg(long)]
    no_virtual_ips: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let host = Host::detect(&cli.pool_id)?;
    info!(host = %host.id, ip = %host.ip, pool = %cli.pool_id, "host identity detected");

    let connector: Arc<dyn Connector> = match cli.coordinator.as_str() {
        "memory" => Arc::new(MemoryCoordinator::new()),
        other => {
            return Err(Error::fatal(format!(
                "unsupported coordinator '{}': only the in-process 'memory' store ships with this build",
                other
            )));
        }
    };

    let config = AgentConfig {
        pool_id: cli.pool_id.clone(),
        var_path: cli.var_path,
        bridge_ip: cli.bridge_ip,
        consumer_url: cli.consumer_url,
        agent_dir: cli.agent_dir,
        agent_binary: "quay-agent".to_string(),
        bind_mounts: cli.mounts,
        volume_driver: "local".to_string(),
    };
    let ctx = Arc::new(AgentContext {
        config,
        host: host.clone(),
        runtime: Arc::new(DockerRuntime::connect()?),
        master: Arc::new(StaticMaster::new(SystemUser {
            name: cli.system_user,
            password: cli.system_password,
        })),
        proxies: Arc::new(ProxyRegistry::new()),
        volumes: Arc::new(LocalDriver),
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    // virtual-IP stack: startup unbind, then leadership + pool sync under
    // their own reconnect loop
    let vip_task = if cli.no_virtual_ips {
        None
    } else {
        let interfaces: Arc<dyn InterfaceManager> = Arc::new(Ifconfig);
        {
            let interfaces = interfaces.clone();
            tokio::task::spawn_blocking(move || unbind_all(&*interfaces))
                .await
                .map_err(|e| Error::fatal(format!("startup alias sweep failed: {}", e)))??;
        }
        Some(tokio::spawn(run_vip_stack(
            connector.clone(),
            interfaces,
            host.id.clone(),
            cli.pool_id.clone(),
            shutdown.clone(),
        )))
    };

    let agent = HostAgent::new(ctx, connector);
    let result = agent.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(task) = vip_task {
        let _ = task.await;
    }
    if let Err(e) = &result {
        error!(error = %e, "agent exited with error");
    }
    result
}

/// Run the VIP watcher and pool listener, reconnecting on session loss
async fn run_vip_stack(
    connector: Arc<dyn Connector>,
    interfaces: Arc<dyn InterfaceManager>,
    host_id: String,
    pool_id: String,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let session = match connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "virtual-IP stack could not connect, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                }
            }
        };

        let watcher = VipWatcher::new(session.clone(), interfaces.clone(), &host_id, &pool_id);
        let listener = PoolListener::new(session, &pool_id);
        let inner = shutdown.child_token();
        let outcome = tokio::select! {
            outcome = watcher.run(inner.clone()) => outcome,
            outcome = listener.run(inner.clone()) => outcome,
        };
        inner.cancel();

        match outcome {
            Ok(()) => return,
            Err(e) if e.is_session_loss() => {
                warn!("virtual-IP session lost, reconnecting");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
            Err(e) => {
                error!(error = %e, "virtual-IP stack failed");
                return;
            }
        }
    }
}
