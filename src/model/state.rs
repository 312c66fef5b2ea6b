//! Desired and observed instance state
//!
//! The master writes a [`HostState`] under
//! `/hosts/<host_id>/instances/<ssid>` to say what an instance should be
//! doing; the supervisor answers with an [`InstanceState`] under
//! `/services/<service_id>/states/<ssid>` reporting what it actually is
//! doing. Both are deleted by the supervisor on final termination.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Protocol, ServiceDefinition};

/// Host port bindings keyed by `"<port>/<protocol>"`
pub type PortMapping = BTreeMap<String, String>;

/// What the master wants an instance to be doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    /// The instance should be running
    Run,
    /// The instance should stop and be cleaned up
    Stop,
    /// The instance should quiesce via its snapshot pause command
    Pause,
    /// The instance should resume from a pause
    Resume,
    /// The instance should stop and immediately start again
    Restart,
}

/// Desired-state record, payload of the host-side instance znode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostState {
    /// Host the instance is scheduled to
    pub host_id: String,
    /// Service the instance belongs to
    pub service_id: String,
    /// Stable instance id, also the znode name
    pub service_state_id: String,
    /// What the instance should be doing
    pub desired_state: DesiredState,
}

impl HostState {
    /// Whether the record identifies a real instance
    ///
    /// A record missing either id cannot be acted on and its znode is
    /// removed by the supervisor.
    pub fn is_valid(&self) -> bool {
        !self.service_id.is_empty() && !self.service_state_id.is_empty()
    }
}

/// Observed-state record, authored exclusively by the instance supervisor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceState {
    /// Instance id (same as the desired-state znode name)
    pub id: String,
    /// Service the instance belongs to
    pub service_id: String,
    /// Host the instance runs on
    pub host_id: String,
    /// Id of the container backing the instance
    pub container_id: String,
    /// UUID of the image the container was created from
    pub image_uuid: String,
    /// Container-private IP address
    #[serde(default)]
    pub private_ip: String,
    /// IP of the host running the container
    pub host_ip: String,
    /// When the container started; absent until it has
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    /// When the container terminated; absent while it runs
    #[serde(default)]
    pub terminated: Option<DateTime<Utc>>,
    /// Exit code of the last termination
    #[serde(default)]
    pub exit_code: Option<i64>,
    /// Published host ports
    #[serde(default)]
    pub port_mapping: PortMapping,
    /// Exported endpoints at the time of start
    #[serde(default)]
    pub exports: Vec<ExportBinding>,
    /// Imported endpoints at the time of start
    #[serde(default)]
    pub imports: Vec<ImportBinding>,
    /// Whether the instance is currently paused for a snapshot
    #[serde(default)]
    pub paused: bool,
}

impl InstanceState {
    /// Whether the container behind this record is expected to be running
    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.terminated.is_none()
    }

    /// Fill the endpoint bindings from a service definition
    pub fn bind_endpoints(&mut self, svc: &ServiceDefinition) {
        self.exports.clear();
        self.imports.clear();
        for ep in &svc.endpoints {
            match ep.purpose {
                super::EndpointPurpose::Export => self.exports.push(ExportBinding {
                    application: ep.application.clone(),
                    protocol: ep.protocol,
                    port_number: ep.port_number,
                }),
                super::EndpointPurpose::Import => self.imports.push(ImportBinding {
                    application: ep.application.clone(),
                    port_number: ep.port_number,
                    port_template: ep.port_template.clone(),
                    virtual_address: ep.virtual_address.clone(),
                }),
            }
        }
    }
}

/// An endpoint the instance offers to the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportBinding {
    /// Application name of the endpoint
    pub application: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Port the container listens on
    pub port_number: u16,
}

/// An endpoint the instance consumes from the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBinding {
    /// Application name of the endpoint
    pub application: String,
    /// Port the instance dials
    pub port_number: u16,
    /// Template the master evaluates into `port_number`
    #[serde(default)]
    pub port_template: String,
    /// Virtual address the import resolves through
    #[serde(default)]
    pub virtual_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, EndpointPurpose};

    #[test]
    fn desired_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DesiredState::Restart).unwrap(),
            "\"restart\""
        );
        let parsed: DesiredState = serde_json::from_str("\"stop\"").unwrap();
        assert_eq!(parsed, DesiredState::Stop);
    }

    #[test]
    fn host_state_validity_requires_both_ids() {
        let mut hs = HostState {
            host_id: "h1".into(),
            service_id: "s1".into(),
            service_state_id: "i1".into(),
            desired_state: DesiredState::Run,
        };
        assert!(hs.is_valid());
        hs.service_id.clear();
        assert!(!hs.is_valid());
    }

    #[test]
    fn instance_is_running_between_start_and_termination() {
        let mut state = InstanceState::default();
        assert!(!state.is_running());
        state.started = Some(Utc::now());
        assert!(state.is_running());
        state.terminated = Some(Utc::now());
        assert!(!state.is_running());
    }

    #[test]
    fn bind_endpoints_splits_by_purpose() {
        let svc = ServiceDefinition {
            endpoints: vec![
                Endpoint {
                    application: "http".into(),
                    purpose: EndpointPurpose::Export,
                    protocol: Protocol::Tcp,
                    port_number: 8080,
                    port_template: String::new(),
                    virtual_address: String::new(),
                    address_assignment: None,
                },
                Endpoint {
                    application: "db".into(),
                    purpose: EndpointPurpose::Import,
                    protocol: Protocol::Tcp,
                    port_number: 5432,
                    port_template: String::new(),
                    virtual_address: "db.quay".into(),
                    address_assignment: None,
                },
            ],
            ..Default::default()
        };
        let mut state = InstanceState::default();
        state.bind_endpoints(&svc);
        assert_eq!(state.exports.len(), 1);
        assert_eq!(state.exports[0].application, "http");
        assert_eq!(state.imports.len(), 1);
        assert_eq!(state.imports[0].virtual_address, "db.quay");
    }
}
