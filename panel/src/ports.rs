//! Stable port derivation.
//!
//! Ports are derived from MD5 of stable identifiers so the same tunnel or
//! mesh always lands on the same port across panel restarts; collisions
//! between purposes are avoided by segregating ranges: 7000–7999 FRP
//! control, 17000–17999 shared WireGuard, 18000–18999 foreign-unique
//! remote ports.

/// First four bytes of the seed's MD5, mapped into `[base, base + range)`.
pub fn derive_port(seed: &str, base: u16, range: u32) -> u16 {
    let digest = md5::compute(seed.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    base + (n % range) as u16
}

/// FRP control port for a standalone reverse tunnel.
pub fn frp_bind_port(tunnel_id: &str) -> u16 {
    derive_port(tunnel_id, 7000, 1000)
}

/// FRP control port for a mesh relay on one iran node and transport.
pub fn mesh_bind_port(mesh_id: &str, iran_node_id: &str, transport: &str) -> u16 {
    derive_port(&format!("{}-{}-{}", mesh_id, iran_node_id, transport), 7000, 1000)
}

/// The single WireGuard listen port shared by every node of a mesh.
pub fn mesh_shared_wg_port(mesh_id: &str) -> u16 {
    derive_port(&format!("{}-wg-port", mesh_id), 17000, 1000)
}

/// Per-(foreign, iran, transport) remote port, so every foreign peer has a
/// distinct reachable endpoint on every iran relay.
pub fn mesh_foreign_remote_port(
    mesh_id: &str,
    foreign_node_id: &str,
    iran_node_id: &str,
    transport: &str,
) -> u16 {
    derive_port(
        &format!("{}-{}-{}-{}", mesh_id, foreign_node_id, iran_node_id, transport),
        18000,
        1000,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(frp_bind_port("tunnel-1"), frp_bind_port("tunnel-1"));
        assert_eq!(
            mesh_shared_wg_port("mesh-a"),
            mesh_shared_wg_port("mesh-a")
        );
    }

    #[test]
    fn ranges_are_respected() {
        for seed in ["a", "b", "c", "a-long-tunnel-identifier", "x-y-z"] {
            assert!((7000..8000).contains(&frp_bind_port(seed)));
            assert!((17000..18000).contains(&mesh_shared_wg_port(seed)));
            assert!((18000..19000).contains(&mesh_foreign_remote_port(seed, "f", "i", "udp")));
        }
    }

    #[test]
    fn distinct_foreign_peers_get_distinct_remote_ports() {
        // The invariant only needs to hold for distinct (foreign, iran,
        // transport) triples of one mesh, which the seed encodes.
        let a = mesh_foreign_remote_port("mesh-a", "foreign-1", "iran-1", "udp");
        let b = mesh_foreign_remote_port("mesh-a", "foreign-2", "iran-1", "udp");
        assert_ne!(a, b);
    }

    #[test]
    fn transports_on_one_relay_get_distinct_bind_ports() {
        let tcp = mesh_bind_port("mesh-a", "iran-1", "tcp");
        let udp = mesh_bind_port("mesh-a", "iran-1", "udp");
        assert_ne!(tcp, udp);
    }
}
