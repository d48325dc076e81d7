//! Pool-based overlay IP allocation.
//!
//! One pool, CIDR-bound. Allocation returns an existing assignment
//! unchanged, validates a preferred address for containment and
//! availability, and otherwise hands out the first free host in order.
//! Node metadata mirrors the assignment on every successful mutation
//! (handled inside the store).

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::info;

use crate::store::Store;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpamError {
    #[error("no overlay pool configured")]
    NoPool,
    #[error("overlay pool CIDR is invalid: {0}")]
    InvalidCidr(String),
    #[error("overlay pool exhausted")]
    PoolExhausted,
    #[error("preferred IP {0} is invalid or outside the pool")]
    InvalidPreferred(String),
    #[error("preferred IP {0} is already assigned")]
    PreferredTaken(String),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub pool_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub total_ips: usize,
    pub assigned_ips: usize,
    pub available_ips: usize,
    pub utilization: f64,
    pub exhausted: bool,
}

fn parse_pool_net(store: &Store) -> Result<Ipv4Net, IpamError> {
    let pool = store.pool().ok_or(IpamError::NoPool)?;
    pool.cidr
        .parse::<Ipv4Net>()
        .map_err(|_| IpamError::InvalidCidr(pool.cidr.clone()))
}

fn contains_usable(net: &Ipv4Net, ip: Ipv4Addr) -> bool {
    net.contains(&ip) && ip != net.network() && ip != net.broadcast()
}

/// Allocate an overlay IP for a node. Idempotent: a node that already has
/// an assignment gets it back unchanged, preferred or not.
pub fn allocate_ip(
    store: &mut Store,
    node_id: &str,
    preferred: Option<&str>,
    interface_name: &str,
) -> Result<String, IpamError> {
    let net = parse_pool_net(store)?;

    if let Some(existing) = store.assignment(node_id) {
        info!(node_id, overlay_ip = %existing.overlay_ip, "node already has an overlay IP");
        return Ok(existing.overlay_ip);
    }

    let allocated = match preferred {
        Some(preferred) => {
            let ip: Ipv4Addr = preferred
                .parse()
                .map_err(|_| IpamError::InvalidPreferred(preferred.to_string()))?;
            if !contains_usable(&net, ip) {
                return Err(IpamError::InvalidPreferred(preferred.to_string()));
            }
            if store.ip_taken_by_other(preferred, node_id) {
                return Err(IpamError::PreferredTaken(preferred.to_string()));
            }
            preferred.to_string()
        }
        None => first_free_ip(store, &net)?,
    };

    store.put_assignment(node_id, &allocated, interface_name);
    info!(node_id, overlay_ip = %allocated, "allocated overlay IP");
    Ok(allocated)
}

fn first_free_ip(store: &Store, net: &Ipv4Net) -> Result<String, IpamError> {
    let taken: HashSet<Ipv4Addr> = store
        .assignments()
        .iter()
        .filter_map(|a| a.overlay_ip.parse().ok())
        .collect();

    for host in net.hosts() {
        if !taken.contains(&host) {
            return Ok(host.to_string());
        }
    }
    Err(IpamError::PoolExhausted)
}

/// Manual override: re-point (or create) a node's assignment, with the same
/// containment and uniqueness checks.
pub fn update_node_ip(
    store: &mut Store,
    node_id: &str,
    new_ip: &str,
    interface_name: &str,
) -> Result<(), IpamError> {
    let net = parse_pool_net(store)?;

    let ip: Ipv4Addr = new_ip
        .parse()
        .map_err(|_| IpamError::InvalidPreferred(new_ip.to_string()))?;
    if !contains_usable(&net, ip) {
        return Err(IpamError::InvalidPreferred(new_ip.to_string()));
    }
    if store.ip_taken_by_other(new_ip, node_id) {
        return Err(IpamError::PreferredTaken(new_ip.to_string()));
    }

    store.put_assignment(node_id, new_ip, interface_name);
    info!(node_id, overlay_ip = new_ip, "updated overlay IP");
    Ok(())
}

pub fn release_ip(store: &mut Store, node_id: &str) -> bool {
    match store.remove_assignment(node_id) {
        Some(assignment) => {
            info!(node_id, overlay_ip = %assignment.overlay_ip, "released overlay IP");
            true
        }
        None => false,
    }
}

pub fn node_ip(store: &Store, node_id: &str) -> Option<String> {
    store.assignment(node_id).map(|a| a.overlay_ip)
}

pub fn pool_status(store: &Store) -> PoolStatus {
    let Some(pool) = store.pool() else {
        return PoolStatus {
            pool_exists: false,
            cidr: None,
            description: None,
            total_ips: 0,
            assigned_ips: 0,
            available_ips: 0,
            utilization: 0.0,
            exhausted: false,
        };
    };

    let Ok(net) = pool.cidr.parse::<Ipv4Net>() else {
        return PoolStatus {
            pool_exists: true,
            cidr: Some(pool.cidr),
            description: pool.description,
            total_ips: 0,
            assigned_ips: 0,
            available_ips: 0,
            utilization: 0.0,
            exhausted: false,
        };
    };

    // Usable hosts: network size minus network and broadcast addresses.
    let total_ips = net.hosts().count();
    let assigned_ips = store.assignments().len();
    let available_ips = total_ips.saturating_sub(assigned_ips);
    let utilization = if total_ips > 0 {
        (assigned_ips as f64 / total_ips as f64 * 100.0 * 100.0).round() / 100.0
    } else {
        0.0
    };

    PoolStatus {
        pool_exists: true,
        cidr: Some(pool.cidr),
        description: pool.description,
        total_ips,
        assigned_ips,
        available_ips,
        utilization,
        exhausted: available_ips == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_with_pool(cidr: &str) -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let mut store = Store::load(&dir.path().join("state.json"));
        store.set_pool(cidr, None);
        (dir, store)
    }

    #[test]
    fn allocates_hosts_in_order() {
        let (_dir, mut store) = store_with_pool("10.250.0.0/24");
        assert_eq!(allocate_ip(&mut store, "n1", None, "wg0").unwrap(), "10.250.0.1");
        assert_eq!(allocate_ip(&mut store, "n2", None, "wg0").unwrap(), "10.250.0.2");
        assert_eq!(allocate_ip(&mut store, "n3", None, "wg0").unwrap(), "10.250.0.3");
    }

    #[test]
    fn allocation_is_idempotent_per_node() {
        let (_dir, mut store) = store_with_pool("10.250.0.0/24");
        let first = allocate_ip(&mut store, "n1", None, "wg0").unwrap();
        let again = allocate_ip(&mut store, "n1", Some("10.250.0.77"), "wg0").unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn preferred_ip_is_validated() {
        let (_dir, mut store) = store_with_pool("10.250.0.0/24");

        let err = allocate_ip(&mut store, "n1", Some("192.168.1.5"), "wg0").unwrap_err();
        assert_eq!(err, IpamError::InvalidPreferred("192.168.1.5".into()));

        let err = allocate_ip(&mut store, "n1", Some("10.250.0.0"), "wg0").unwrap_err();
        assert_eq!(err, IpamError::InvalidPreferred("10.250.0.0".into()));

        allocate_ip(&mut store, "n1", Some("10.250.0.9"), "wg0").unwrap();
        let err = allocate_ip(&mut store, "n2", Some("10.250.0.9"), "wg0").unwrap_err();
        assert_eq!(err, IpamError::PreferredTaken("10.250.0.9".into()));
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let (_dir, mut store) = store_with_pool("10.250.0.0/30");
        allocate_ip(&mut store, "n1", None, "wg0").unwrap();
        allocate_ip(&mut store, "n2", None, "wg0").unwrap();
        let err = allocate_ip(&mut store, "n3", None, "wg0").unwrap_err();
        assert_eq!(err, IpamError::PoolExhausted);
    }

    #[test]
    fn no_two_nodes_share_an_ip() {
        let (_dir, mut store) = store_with_pool("10.250.0.0/28");
        let mut seen = std::collections::HashSet::new();
        for n in 0..14 {
            let ip = allocate_ip(&mut store, &format!("n{}", n), None, "wg0").unwrap();
            assert!(seen.insert(ip));
        }
    }

    #[test]
    fn status_counts_usable_hosts() {
        let (_dir, mut store) = store_with_pool("10.250.0.0/24");
        allocate_ip(&mut store, "n1", None, "wg0").unwrap();

        let status = pool_status(&store);
        assert!(status.pool_exists);
        assert_eq!(status.total_ips, 254);
        assert_eq!(status.assigned_ips, 1);
        assert_eq!(status.available_ips, 253);
        assert!(!status.exhausted);
    }

    #[test]
    fn update_can_repoint_an_existing_assignment() {
        let (_dir, mut store) = store_with_pool("10.250.0.0/24");
        allocate_ip(&mut store, "n1", None, "wg0").unwrap();
        update_node_ip(&mut store, "n1", "10.250.0.200", "wg0").unwrap();
        assert_eq!(node_ip(&store, "n1").unwrap(), "10.250.0.200");
    }
}
