//! Resource pools and their virtual IPs

use serde::{Deserialize, Serialize};

/// A resource pool, payload of `/pools/<pool_id>`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pool {
    /// Pool id
    pub id: String,
    /// Virtual IPs that float across the pool's hosts
    #[serde(default)]
    pub virtual_ips: Vec<VirtualIp>,
}

impl Pool {
    /// Look up the spec for a virtual IP address in this pool
    pub fn virtual_ip(&self, ip: &str) -> Option<&VirtualIp> {
        self.virtual_ips.iter().find(|vip| vip.ip == ip)
    }
}

/// A pool-scoped virtual IP
///
/// The host currently holding the lease binds the address as a
/// `<bind_interface>:zvip<index>` alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIp {
    /// Pool the address belongs to
    pub pool_id: String,
    /// The address itself
    pub ip: String,
    /// Netmask applied when binding
    pub netmask: String,
    /// Physical interface the alias hangs off
    pub bind_interface: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_ip_lookup_by_address() {
        let pool = Pool {
            id: "default".into(),
            virtual_ips: vec![VirtualIp {
                pool_id: "default".into(),
                ip: "10.0.0.5".into(),
                netmask: "255.255.255.0".into(),
                bind_interface: "eth0".into(),
            }],
        };
        assert!(pool.virtual_ip("10.0.0.5").is_some());
        assert!(pool.virtual_ip("10.0.0.6").is_none());
    }
}
