//! Virtual interface aliases
//!
//! VIPs are bound as `<bind_interface>:zvip<index>` aliases via
//! `ifconfig`. This module owns alias naming, index allocation, and the
//! shell-outs; no other component may create `:zvip` aliases.

use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::VirtualIp;

/// Alias marker between the bind interface and the index
pub const VIRTUAL_INTERFACE_PREFIX: &str = ":zvip";

/// Indices run from 0 to this bound (exclusive) per base interface
pub const MAX_INTERFACE_INDEX: u32 = 100;

/// A bound (or proposed) virtual interface alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualInterface {
    /// Physical interface the alias hangs off
    pub bind_interface: String,
    /// Alias index
    pub index: u32,
    /// Address bound to the alias
    pub ip: String,
}

impl VirtualInterface {
    /// Full alias name, `<bind_interface>:zvip<index>`
    pub fn name(&self) -> String {
        format!("{}{}{}", self.bind_interface, VIRTUAL_INTERFACE_PREFIX, self.index)
    }

    /// Parse an alias name back into its parts
    pub fn parse(name: &str, ip: &str) -> Option<VirtualInterface> {
        let (bind_interface, index) = name.split_once(VIRTUAL_INTERFACE_PREFIX)?;
        let index = index.trim().parse().ok()?;
        if bind_interface.is_empty() {
            return None;
        }
        Some(VirtualInterface {
            bind_interface: bind_interface.to_string(),
            index,
            ip: ip.to_string(),
        })
    }
}

/// Pick the smallest free alias index on a bind interface
pub fn next_free_index(bind_interface: &str, existing: &[VirtualInterface]) -> Result<u32> {
    for index in 0..MAX_INTERFACE_INDEX {
        let taken = existing
            .iter()
            .any(|vi| vi.bind_interface == bind_interface && vi.index == index);
        if !taken {
            return Ok(index);
        }
    }
    Err(Error::fatal(format!(
        "no free virtual interface index on {} (limit {})",
        bind_interface, MAX_INTERFACE_INDEX
    )))
}

/// Local alias operations, separated for testability
pub trait InterfaceManager: Send + Sync {
    /// List the `:zvip` aliases currently bound on this host
    fn scan(&self) -> Result<Vec<VirtualInterface>>;

    /// Bind an alias with the given netmask
    fn bind(&self, alias: &VirtualInterface, netmask: &str) -> Result<()>;

    /// Tear an alias down
    fn unbind(&self, alias_name: &str) -> Result<()>;
}

/// Unbind every `:zvip` alias present on the host
///
/// Run at agent startup so locally-bound aliases always equal the set of
/// currently-held leases.
pub fn unbind_all(manager: &dyn InterfaceManager) -> Result<()> {
    for alias in manager.scan()? {
        info!(alias = %alias.name(), ip = %alias.ip, "removing stale virtual IP alias");
        manager.unbind(&alias.name())?;
    }
    Ok(())
}

/// `ifconfig`-backed [`InterfaceManager`]
#[derive(Debug, Default)]
pub struct Ifconfig;

impl InterfaceManager for Ifconfig {
    fn scan(&self) -> Result<Vec<VirtualInterface>> {
        let output = Command::new("ifconfig")
            .output()
            .map_err(|e| Error::io("ifconfig", e))?;
        if !output.status.success() {
            return Err(Error::transient_in("ifconfig", "interface scan failed"));
        }
        Ok(parse_ifconfig_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn bind(&self, alias: &VirtualInterface, netmask: &str) -> Result<()> {
        // the base interface must exist before an alias can hang off it
        let probe = Command::new("ifconfig")
            .arg(&alias.bind_interface)
            .output()
            .map_err(|e| Error::io("ifconfig", e))?;
        if !probe.status.success() {
            return Err(Error::fatal(format!(
                "bind interface {} not present on this host",
                alias.bind_interface
            )));
        }
        let status = Command::new("ifconfig")
            .args([&alias.name(), "inet", &alias.ip, "netmask", netmask])
            .status()
            .map_err(|e| Error::io("ifconfig", e))?;
        if !status.success() {
            return Err(Error::transient_in(
                "ifconfig",
                format!("could not create alias {}", alias.name()),
            ));
        }
        info!(alias = %alias.name(), ip = %alias.ip, netmask = %netmask, "virtual IP bound");
        Ok(())
    }

    fn unbind(&self, alias_name: &str) -> Result<()> {
        let status = Command::new("ifconfig")
            .args([alias_name, "down"])
            .status()
            .map_err(|e| Error::io("ifconfig", e))?;
        if !status.success() {
            return Err(Error::transient_in(
                "ifconfig",
                format!("could not remove alias {}", alias_name),
            ));
        }
        info!(alias = %alias_name, "virtual IP unbound");
        Ok(())
    }
}

/// Extract `:zvip` aliases and their addresses from `ifconfig` output
///
/// Understands both the net-tools layouts seen in the wild:
/// `inet 10.0.0.5  netmask …` and `inet addr:10.0.0.5  Bcast:…`.
fn parse_ifconfig_output(output: &str) -> Vec<VirtualInterface> {
    let mut aliases = Vec::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        if !line.starts_with(char::is_whitespace) {
            let name = line
                .split_whitespace()
                .next()
                .unwrap_or("")
                .trim_end_matches(':');
            current = name.contains(VIRTUAL_INTERFACE_PREFIX).then(|| name.to_string());
            continue;
        }
        let Some(name) = &current else { continue };
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "inet" {
                let Some(value) = tokens.next() else { break };
                let ip = value.strip_prefix("addr:").unwrap_or(value);
                if let Some(alias) = VirtualInterface::parse(name, ip) {
                    aliases.push(alias);
                } else {
                    warn!(alias = %name, "unparseable virtual interface name");
                }
                current = None;
                break;
            }
        }
    }
    debug!(count = aliases.len(), "scanned virtual interfaces");
    aliases
}

/// In-memory [`InterfaceManager`] for tests
///
/// Records binds and unbinds; `scan` reflects the current alias set.
#[derive(Debug, Default)]
pub struct FakeInterfaces {
    aliases: Mutex<Vec<VirtualInterface>>,
}

impl FakeInterfaces {
    /// Create an empty fake
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed an alias, as if bound before the agent started
    pub fn seed(&self, alias: VirtualInterface) {
        self.aliases.lock().expect("poisoned").push(alias);
    }

    /// Alias names currently bound, sorted
    pub fn bound_aliases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .aliases
            .lock()
            .expect("poisoned")
            .iter()
            .map(VirtualInterface::name)
            .collect();
        names.sort();
        names
    }

    /// Addresses currently bound, sorted
    pub fn bound_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .aliases
            .lock()
            .expect("poisoned")
            .iter()
            .map(|a| a.ip.clone())
            .collect();
        ips.sort();
        ips
    }
}

impl InterfaceManager for FakeInterfaces {
    fn scan(&self) -> Result<Vec<VirtualInterface>> {
        Ok(self.aliases.lock().expect("poisoned").clone())
    }

    fn bind(&self, alias: &VirtualInterface, _netmask: &str) -> Result<()> {
        let mut aliases = self.aliases.lock().expect("poisoned");
        if aliases.iter().any(|a| a.name() == alias.name()) {
            return Err(Error::transient_in(
                "ifconfig",
                format!("alias {} already bound", alias.name()),
            ));
        }
        aliases.push(alias.clone());
        Ok(())
    }

    fn unbind(&self, alias_name: &str) -> Result<()> {
        self.aliases
            .lock()
            .expect("poisoned")
            .retain(|a| a.name() != alias_name);
        Ok(())
    }
}

/// Build the alias for a VIP spec at a given index
pub fn alias_for(vip: &VirtualIp, index: u32) -> VirtualInterface {
    VirtualInterface {
        bind_interface: vip.bind_interface.clone(),
        index,
        ip: vip.ip.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_names_round_trip() {
        let alias = VirtualInterface {
            bind_interface: "eth0".into(),
            index: 3,
            ip: "10.0.0.5".into(),
        };
        assert_eq!(alias.name(), "eth0:zvip3");
        assert_eq!(VirtualInterface::parse("eth0:zvip3", "10.0.0.5"), Some(alias));
        assert!(VirtualInterface::parse("eth0", "10.0.0.5").is_none());
        assert!(VirtualInterface::parse(":zvip1", "10.0.0.5").is_none());
    }

    #[test]
    fn index_allocation_takes_the_smallest_gap() {
        let existing = vec![
            VirtualInterface { bind_interface: "eth0".into(), index: 0, ip: "10.0.0.1".into() },
            VirtualInterface { bind_interface: "eth0".into(), index: 2, ip: "10.0.0.2".into() },
            VirtualInterface { bind_interface: "eth1".into(), index: 1, ip: "10.0.0.3".into() },
        ];
        assert_eq!(next_free_index("eth0", &existing).unwrap(), 1);
        assert_eq!(next_free_index("eth1", &existing).unwrap(), 0);
        assert_eq!(next_free_index("eth2", &existing).unwrap(), 0);
    }

    #[test]
    fn index_allocation_respects_the_ceiling() {
        let existing: Vec<VirtualInterface> = (0..MAX_INTERFACE_INDEX)
            .map(|index| VirtualInterface {
                bind_interface: "eth0".into(),
                index,
                ip: format!("10.0.1.{}", index),
            })
            .collect();
        assert!(next_free_index("eth0", &existing).is_err());
    }

    #[test]
    fn modern_ifconfig_output_parses() {
        let output = "\
eth0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1500
        inet 10.87.110.12  netmask 255.255.255.0  broadcast 10.87.110.255
eth0:zvip0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1500
        inet 10.0.0.5  netmask 255.255.255.0  broadcast 10.0.0.255
lo: flags=73<UP,LOOPBACK,RUNNING>  mtu 65536
        inet 127.0.0.1  netmask 255.0.0.0
";
        let aliases = parse_ifconfig_output(output);
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].name(), "eth0:zvip0");
        assert_eq!(aliases[0].ip, "10.0.0.5");
    }

    #[test]
    fn legacy_ifconfig_output_parses() {
        let output = "\
eth0:zvip2 Link encap:Ethernet  HWaddr 00:16:3e:12:34:56
          inet addr:10.0.0.7  Bcast:10.0.0.255  Mask:255.255.255.0
          UP BROADCAST RUNNING MULTICAST  MTU:1500  Metric:1
";
        let aliases = parse_ifconfig_output(output);
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].bind_interface, "eth0");
        assert_eq!(aliases[0].index, 2);
        assert_eq!(aliases[0].ip, "10.0.0.7");
    }

    #[test]
    fn unbind_all_clears_every_alias() {
        let fake = FakeInterfaces::new();
        fake.seed(VirtualInterface { bind_interface: "eth0".into(), index: 0, ip: "10.0.0.5".into() });
        fake.seed(VirtualInterface { bind_interface: "eth0".into(), index: 1, ip: "10.0.0.6".into() });
        unbind_all(&fake).unwrap();
        assert!(fake.bound_ips().is_empty());
    }

    #[test]
    fn fake_rejects_alias_collisions() {
        let fake = FakeInterfaces::new();
        let alias = VirtualInterface { bind_interface: "eth0".into(), index: 0, ip: "10.0.0.5".into() };
        fake.bind(&alias, "255.255.255.0").unwrap();
        assert!(fake.bind(&alias, "255.255.255.0").is_err());
    }
}
