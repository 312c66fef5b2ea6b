//! Agent configuration
//!
//! The binary resolves CLI flags and environment into one [`AgentConfig`]
//! that rides along with every supervisor. Nothing here is re-read at
//! runtime; configuration is fixed for the process lifetime.

use std::path::PathBuf;

/// Resolved agent settings
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Pool this host belongs to
    pub pool_id: String,
    /// Directory for agent-managed state (subvolumes live under
    /// `<var_path>/volumes`)
    pub var_path: PathBuf,
    /// IP of the container bridge, handed to containers as their DNS
    pub bridge_ip: String,
    /// Metrics consumer URL injected into every container
    pub consumer_url: String,
    /// Host directory bind-mounted into containers at `/serviced`
    pub agent_dir: PathBuf,
    /// Name of the agent binary inside `agent_dir`
    pub agent_binary: String,
    /// Operator-requested bind mounts, `image:host_path:container_path`
    pub bind_mounts: Vec<String>,
    /// Volume driver name used for tenant subvolumes
    pub volume_driver: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            pool_id: "default".to_string(),
            var_path: PathBuf::from("/var/quay"),
            bridge_ip: "172.17.0.1".to_string(),
            consumer_url: "http://localhost:22350/api/metrics/store".to_string(),
            agent_dir: PathBuf::from("/opt/quay"),
            agent_binary: "quay-agent".to_string(),
            bind_mounts: Vec::new(),
            volume_driver: "local".to_string(),
        }
    }
}

impl AgentConfig {
    /// Container-side path of the agent binary
    pub fn container_agent_path(&self) -> String {
        format!("/serviced/{}", self.agent_binary)
    }

    /// Bind mount string exposing the agent directory to a container
    pub fn agent_bind(&self) -> String {
        format!("{}:/serviced", self.agent_dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_binary_paths_line_up() {
        let config = AgentConfig::default();
        assert_eq!(config.container_agent_path(), "/serviced/quay-agent");
        assert_eq!(config.agent_bind(), "/opt/quay:/serviced");
    }
}
