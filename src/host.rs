//! Host identity
//!
//! A host's id is a deterministic fingerprint of a stable NIC's MAC
//! address, computed once at agent startup and immutable for the process
//! lifetime. Interface enumeration also feeds the virtual-IP subsystem,
//! which needs to know which bind interfaces exist locally.

use nix::ifaddrs::getifaddrs;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of the hex host id derived from the MAC fingerprint
const HOST_ID_LEN: usize = 16;

/// One local network interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInterface {
    /// Interface name (e.g. `eth0`)
    pub name: String,
    /// First IPv4 address, if any
    pub ip: Option<String>,
    /// Hardware address, if any
    pub mac: Option<[u8; 6]>,
}

/// This host, as registered with the cluster
#[derive(Debug, Clone, Default)]
pub struct Host {
    /// Deterministic host id
    pub id: String,
    /// Pool the host belongs to
    pub pool_id: String,
    /// Primary IPv4 address
    pub ip: String,
    /// All local interfaces at startup
    pub interfaces: Vec<HostInterface>,
}

impl Host {
    /// Detect the local host's identity
    ///
    /// Picks the first stable non-loopback interface carrying a hardware
    /// address, fingerprints its MAC, and records the primary IP.
    pub fn detect(pool_id: &str) -> Result<Host> {
        let interfaces = enumerate_interfaces()?;
        Self::from_interfaces(pool_id, interfaces)
    }

    /// Build a host from an explicit interface list
    pub fn from_interfaces(pool_id: &str, interfaces: Vec<HostInterface>) -> Result<Host> {
        let stable = interfaces
            .iter()
            .filter(|iface| iface.name != "lo" && iface.mac.is_some_and(|mac| mac != [0u8; 6]))
            .min_by(|a, b| a.name.cmp(&b.name))
            .ok_or_else(|| {
                Error::fatal("no stable interface with a hardware address found")
            })?;
        let id = fingerprint(&stable.mac.expect("filtered on mac presence"));
        let ip = interfaces
            .iter()
            .filter(|iface| iface.name != "lo")
            .find_map(|iface| iface.ip.clone())
            .ok_or_else(|| Error::fatal("no usable IPv4 address on this host"))?;
        Ok(Host {
            id,
            pool_id: pool_id.to_string(),
            ip,
            interfaces,
        })
    }

    /// Whether an interface with the given name exists on this host
    pub fn has_interface(&self, name: &str) -> bool {
        self.interfaces.iter().any(|iface| iface.name == name)
    }
}

/// Fingerprint a MAC address into a short stable hex id
fn fingerprint(mac: &[u8; 6]) -> String {
    let digest = Sha256::digest(mac);
    let mut id = String::with_capacity(HOST_ID_LEN);
    for byte in digest.iter().take(HOST_ID_LEN / 2) {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

/// Enumerate local interfaces, merging the per-family entries the OS
/// reports into one record per name
fn enumerate_interfaces() -> Result<Vec<HostInterface>> {
    let addrs = getifaddrs().map_err(|e| Error::fatal(format!("getifaddrs failed: {}", e)))?;
    let mut interfaces: Vec<HostInterface> = Vec::new();
    for entry in addrs {
        let record = match interfaces
            .iter_mut()
            .find(|iface| iface.name == entry.interface_name)
        {
            Some(existing) => existing,
            None => {
                interfaces.push(HostInterface {
                    name: entry.interface_name.clone(),
                    ..Default::default()
                });
                interfaces.last_mut().expect("just pushed")
            }
        };
        let Some(address) = entry.address else {
            continue;
        };
        if let Some(link) = address.as_link_addr() {
            if let Some(mac) = link.addr() {
                record.mac = Some(mac);
            }
        }
        if let Some(inet) = address.as_sockaddr_in() {
            if record.ip.is_none() {
                record.ip = Some(inet.ip().to_string());
            }
        }
    }
    Ok(interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: Option<&str>, mac: Option<[u8; 6]>) -> HostInterface {
        HostInterface {
            name: name.to_string(),
            ip: ip.map(|s| s.to_string()),
            mac,
        }
    }

    #[test]
    fn identity_is_deterministic_for_a_mac() {
        let interfaces = vec![
            iface("lo", Some("127.0.0.1"), None),
            iface("eth0", Some("10.1.2.3"), Some([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01])),
        ];
        let a = Host::from_interfaces("default", interfaces.clone()).unwrap();
        let b = Host::from_interfaces("default", interfaces).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), HOST_ID_LEN);
        assert_eq!(a.ip, "10.1.2.3");
    }

    #[test]
    fn loopback_and_macless_interfaces_are_not_identity_candidates() {
        let err = Host::from_interfaces(
            "default",
            vec![
                iface("lo", Some("127.0.0.1"), None),
                iface("tun0", Some("10.8.0.2"), None),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn stable_interface_selection_is_name_ordered() {
        let first = Host::from_interfaces(
            "default",
            vec![
                iface("eth1", Some("10.0.0.2"), Some([2; 6])),
                iface("eth0", Some("10.0.0.1"), Some([1; 6])),
            ],
        )
        .unwrap();
        let second = Host::from_interfaces(
            "default",
            vec![
                iface("eth0", Some("10.0.0.1"), Some([1; 6])),
                iface("eth1", Some("10.0.0.2"), Some([2; 6])),
            ],
        )
        .unwrap();
        // enumeration order must not change identity
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn interface_lookup_by_name() {
        let host = Host::from_interfaces(
            "default",
            vec![iface("eth0", Some("10.0.0.1"), Some([1; 6]))],
        )
        .unwrap();
        assert!(host.has_interface("eth0"));
        assert!(!host.has_interface("eth9"));
    }
}
