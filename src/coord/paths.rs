//! Coordination-store layout
//!
//! The single source of truth for node paths:
//!
//! ```text
//! /scheduler                        (marker)
//! /hosts/<host_id>                  (host presence)
//! /hosts/<host_id>/instances/<ssid> (desired state)
//! /services/<service_id>            (service definition)
//! /services/<service_id>/states/<ssid>   (observed state)
//! /pools/<pool_id>                  (pool; payload carries virtual_ips)
//! /pools/<pool_id>/ips/host-<ip>    (ip assignment child)
//! /virtual_ips/<ip>/leader          (ephemeral leader candidates)
//! ```

/// Scheduler marker node
pub const SCHEDULER: &str = "/scheduler";

/// Root of the virtual-IP tree
pub const VIRTUAL_IPS: &str = "/virtual_ips";


/// Presence node of a host
pub fn host(host_id: &str) -> String {
    format!("/hosts/{}", host_id)
}

/// Instance list of a host; children are desired-state znodes
pub fn host_instances(host_id: &str) -> String {
    format!("/hosts/{}/instances", host_id)
}

/// Desired-state znode of one instance
pub fn host_instance(host_id: &str, state_id: &str) -> String {
    format!("/hosts/{}/instances/{}", host_id, state_id)
}

/// Service definition node
pub fn service(service_id: &str) -> String {
    format!("/services/{}", service_id)
}

/// Observed-state container node of a service
pub fn service_states(service_id: &str) -> String {
    format!("/services/{}/states", service_id)
}

/// Observed-state znode of one instance
pub fn service_state(service_id: &str, state_id: &str) -> String {
    format!("/services/{}/states/{}", service_id, state_id)
}

/// Pool node; payload includes the pool's virtual IPs
pub fn pool(pool_id: &str) -> String {
    format!("/pools/{}", pool_id)
}

/// IP assignment children of a pool
pub fn pool_ips(pool_id: &str) -> String {
    format!("/pools/{}/ips", pool_id)
}

/// Node of one virtual IP
pub fn virtual_ip(ip: &str) -> String {
    format!("{}/{}", VIRTUAL_IPS, ip)
}

/// Election node whose ephemeral children identify the VIP's holder
pub fn virtual_ip_leader(ip: &str) -> String {
    format!("{}/{}/leader", VIRTUAL_IPS, ip)
}

/// Ip-assignment child name, `<host_id>-<ip>`
pub fn ip_assignment_child(host_id: &str, ip: &str) -> String {
    format!("{}-{}", host_id, ip)
}

/// Split an ip-assignment child name into `(host_id, ip)`
///
/// Host ids may themselves contain dashes; the IP never does, so the
/// split happens at the last one.
pub fn parse_ip_assignment(child: &str) -> Option<(&str, &str)> {
    child.rsplit_once('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_the_store_contract() {
        assert_eq!(host("h1"), "/hosts/h1");
        assert_eq!(host_instance("h1", "i1"), "/hosts/h1/instances/i1");
        assert_eq!(service_state("s1", "i1"), "/services/s1/states/i1");
        assert_eq!(pool_ips("default"), "/pools/default/ips");
        assert_eq!(virtual_ip_leader("10.0.0.5"), "/virtual_ips/10.0.0.5/leader");
    }

    #[test]
    fn ip_assignment_children_parse() {
        assert_eq!(parse_ip_assignment("host-1.2.3.4"), Some(("host", "1.2.3.4")));
        assert_eq!(parse_ip_assignment("h-1-7.7.7.7"), Some(("h-1", "7.7.7.7")));
        assert_eq!(parse_ip_assignment("bogus"), None);
        assert_eq!(ip_assignment_child("h1", "1.2.3.4"), "h1-1.2.3.4");
    }
}
