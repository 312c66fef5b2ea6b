//! Domain types shared across the agent
//!
//! Everything here is a coordination-store payload or a fragment of one,
//! serialized as JSON. The master writes service definitions and desired
//! state; the agent writes observed state; pools carry the virtual-IP
//! specifications.

mod pool;
mod service;
mod state;

pub use pool::{Pool, VirtualIp};
pub use service::{
    AddressAssignment, ConfigFile, Endpoint, EndpointPurpose, LogConfig, Protocol,
    ServiceDefinition, ServiceVolume, SnapshotCommands,
};
pub use state::{
    DesiredState, ExportBinding, HostState, ImportBinding, InstanceState, PortMapping,
};

/// Canonical container name for a service instance.
///
/// No other process may create containers with this prefix.
pub fn container_name(service_id: &str, instance_id: &str) -> String {
    format!("{}-{}", service_id, instance_id)
}

/// Proxy registration id for a service endpoint.
pub fn proxy_id(service_id: &str, endpoint_name: &str) -> String {
    format!("{}:{}", service_id, endpoint_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_join_service_and_instance() {
        assert_eq!(container_name("s1", "i1"), "s1-i1");
    }

    #[test]
    fn proxy_ids_join_service_and_endpoint() {
        assert_eq!(proxy_id("s1", "zenhub"), "s1:zenhub");
    }
}
