//! Service definitions as published by the master
//!
//! The agent treats these as read-only input: it never writes a service
//! definition back to the store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A service definition, read from `/services/<service_id>`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Unique service id
    pub id: String,
    /// Human-readable service name
    pub name: String,
    /// Pool the service is scheduled into
    pub pool_id: String,
    /// Image reference the instances run
    pub image_id: String,
    /// Startup command template, evaluated against the service context
    pub startup_template: String,
    /// Network endpoints this service exports or imports
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Persistent volumes the instances mount
    #[serde(default)]
    pub volumes: Vec<ServiceVolume>,
    /// Config files materialized on the host and bind-mounted in,
    /// keyed by container path
    #[serde(default)]
    pub config_files: BTreeMap<String, ConfigFile>,
    /// Commands used to quiesce and resume the service for snapshots
    #[serde(default)]
    pub snapshot: SnapshotCommands,
    /// Application log files to ship from inside the container
    #[serde(default)]
    pub log_configs: Vec<LogConfig>,
}

impl ServiceDefinition {
    /// Endpoints with `purpose = export`, the only ones published
    /// on the container
    pub fn exports(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints
            .iter()
            .filter(|ep| ep.purpose == EndpointPurpose::Export)
    }
}

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream endpoint
    Tcp,
    /// Datagram endpoint
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Whether an endpoint is offered by this service or consumed from another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointPurpose {
    /// The service listens on this port; publish it
    Export,
    /// The service dials this port on some other instance
    Import,
}

/// A single service endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Application name; doubles as the endpoint identity within a service
    pub application: String,
    /// Export or import
    pub purpose: EndpointPurpose,
    /// Transport protocol
    pub protocol: Protocol,
    /// Port the service binds (export) or dials (import)
    pub port_number: u16,
    /// Template the master evaluates into `port_number`
    #[serde(default)]
    pub port_template: String,
    /// Virtual address imports resolve through
    #[serde(default)]
    pub virtual_address: String,
    /// Host-side proxy frontend requested for this endpoint, if any
    #[serde(default)]
    pub address_assignment: Option<AddressAssignment>,
}

/// A requested host-side proxy frontend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressAssignment {
    /// Frontend IP the proxy binds
    pub ip: String,
    /// Frontend port the proxy binds
    pub port: u16,
}

/// A persistent volume declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceVolume {
    /// Path under the tenant subvolume
    pub resource_path: String,
    /// Mount point inside the container
    pub container_path: String,
    /// Owner spec (`user:group`) for container-owned content
    #[serde(default)]
    pub owner: String,
    /// Permission bits for container-owned content, octal string
    #[serde(default)]
    pub permission: String,
}

/// A config file materialized on the host for bind-mounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// File content, already templated by the master
    pub content: String,
    /// Owner spec in `user:group` form
    #[serde(default)]
    pub owner: String,
    /// Permission bits, octal string (e.g. `"0644"`)
    #[serde(default)]
    pub permissions: String,
}

/// Quiesce commands run inside the container via exec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotCommands {
    /// Command that pauses the service
    #[serde(default)]
    pub pause: String,
    /// Command that resumes the service
    #[serde(default)]
    pub resume: String,
}

/// An application log file shipped from the container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Path of the log file inside the container
    pub path: String,
    /// Logical type tag attached to shipped entries
    #[serde(default)]
    pub log_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(purpose: EndpointPurpose, port: u16) -> Endpoint {
        Endpoint {
            application: format!("app-{}", port),
            purpose,
            protocol: Protocol::Tcp,
            port_number: port,
            port_template: String::new(),
            virtual_address: String::new(),
            address_assignment: None,
        }
    }

    #[test]
    fn exports_filters_imports_out() {
        let svc = ServiceDefinition {
            endpoints: vec![
                endpoint(EndpointPurpose::Export, 8080),
                endpoint(EndpointPurpose::Import, 5432),
                endpoint(EndpointPurpose::Export, 9090),
            ],
            ..Default::default()
        };
        let ports: Vec<u16> = svc.exports().map(|ep| ep.port_number).collect();
        assert_eq!(ports, vec![8080, 9090]);
    }

    #[test]
    fn service_definition_roundtrips_missing_optional_fields() {
        let raw = r#"{
            "id": "s1",
            "name": "zenhub",
            "pool_id": "default",
            "image_id": "quay/zenhub:5",
            "startup_template": "/bin/zenhub {{.Port}}"
        }"#;
        let svc: ServiceDefinition = serde_json::from_str(raw).unwrap();
        assert_eq!(svc.name, "zenhub");
        assert!(svc.endpoints.is_empty());
        assert!(svc.config_files.is_empty());
        assert!(svc.snapshot.pause.is_empty());
    }

    #[test]
    fn protocol_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"udp\"");
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
    }
}
