//! Master RPC interface
//!
//! The master service owns tenant mappings, the system user, and template
//! evaluation. The agent consumes it through [`MasterClient`] so the
//! supervision engine can run against a canned implementation; the
//! production RPC transport lives outside this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::ServiceDefinition;

/// Credentials injected into every service container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemUser {
    /// Account name
    pub name: String,
    /// Account password
    pub password: String,
}

/// Master-side lookups the supervision engine depends on
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Resolve the tenant owning a service's persistent data
    async fn tenant_id(&self, service_id: &str) -> Result<String>;

    /// Fetch the cluster system user
    async fn system_user(&self) -> Result<SystemUser>;

    /// Evaluate a service's startup template against its context
    ///
    /// The returned command must contain no remaining placeholders; the
    /// supervisor treats any as fatal for the instance.
    async fn evaluate_startup(&self, service: &ServiceDefinition) -> Result<String>;
}

/// Canned [`MasterClient`] for tests and single-node development
///
/// Tenants default to the service's own id unless mapped explicitly;
/// startup templates are returned verbatim.
#[derive(Default)]
pub struct StaticMaster {
    tenants: Mutex<HashMap<String, String>>,
    user: SystemUser,
}

impl StaticMaster {
    /// Create a master with the given system user
    pub fn new(user: SystemUser) -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            user,
        }
    }

    /// Map a service to a tenant
    pub fn assign_tenant(&self, service_id: impl Into<String>, tenant_id: impl Into<String>) {
        self.tenants
            .lock()
            .expect("poisoned")
            .insert(service_id.into(), tenant_id.into());
    }
}

#[async_trait]
impl MasterClient for StaticMaster {
    async fn tenant_id(&self, service_id: &str) -> Result<String> {
        let tenants = self.tenants.lock().expect("poisoned");
        Ok(tenants
            .get(service_id)
            .cloned()
            .unwrap_or_else(|| service_id.to_string()))
    }

    async fn system_user(&self) -> Result<SystemUser> {
        Ok(self.user.clone())
    }

    async fn evaluate_startup(&self, service: &ServiceDefinition) -> Result<String> {
        if service.startup_template.is_empty() {
            return Err(Error::fatal(format!(
                "service {} has no startup command",
                service.id
            )));
        }
        Ok(service.startup_template.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tenant_defaults_to_the_service_itself() {
        let master = StaticMaster::default();
        assert_eq!(master.tenant_id("s1").await.unwrap(), "s1");
        master.assign_tenant("s1", "t9");
        assert_eq!(master.tenant_id("s1").await.unwrap(), "t9");
    }

    #[tokio::test]
    async fn empty_startup_templates_are_fatal() {
        let master = StaticMaster::default();
        let svc = ServiceDefinition {
            id: "s1".into(),
            ..Default::default()
        };
        let err = master.evaluate_startup(&svc).await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }
}
