use crate::backend::Backend;
use std::net::IpAddr;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

const VIRTUAL_NODES_PER_BACKEND: u32 = 160;

/// A sorted ring of (hash, backend address) entries. Rebuilt only when
/// the backend *set* changes (`LoadBalancer::set_backends`) — not on a
/// health toggle, so that removing one backend from a pool of N only
/// remaps the ~1/N keys that landed in its arcs.
#[derive(Default)]
pub struct HashRing {
    entries: Vec<(u64, String)>,
}

impl HashRing {
    pub fn build(backends: &[Arc<Backend>]) -> Self {
        let mut entries = Vec::with_capacity(backends.len() * VIRTUAL_NODES_PER_BACKEND as usize);
        for backend in backends {
            for vnode in 0..VIRTUAL_NODES_PER_BACKEND {
                let key = format!("{}#{}", backend.address, vnode);
                entries.push((xxh3_64(key.as_bytes()), backend.address.clone()));
            }
        }
        entries.sort_unstable_by_key(|(hash, _)| *hash);
        Self { entries }
    }

    /// Hashes the client IP (not port, so a client's connections land
    /// on the same backend regardless of source port) and walks
    /// clockwise from that point until a healthy backend is found.
    pub fn select(&self, client_ip: IpAddr, healthy: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if self.entries.is_empty() || healthy.is_empty() {
            return None;
        }

        let key = match client_ip {
            IpAddr::V4(v4) => xxh3_64(&v4.octets()),
            IpAddr::V6(v6) => xxh3_64(&v6.octets()),
        };

        let start = self
            .entries
            .partition_point(|(hash, _)| *hash < key);

        for i in 0..self.entries.len() {
            let idx = (start + i) % self.entries.len();
            let addr = &self.entries[idx].1;
            if let Some(backend) = healthy.iter().find(|b| &b.address == addr) {
                return Some(backend.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn backend(addr: &str) -> Arc<Backend> {
        Arc::new(Backend::new(addr.to_string(), 100))
    }

    #[test]
    fn stable_for_same_client() {
        let backends = vec![backend("a"), backend("b"), backend("c")];
        let ring = HashRing::build(&backends);
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let first = ring.select(ip, &backends).unwrap().address.clone();
        for _ in 0..20 {
            assert_eq!(ring.select(ip, &backends).unwrap().address, first);
        }
    }

    #[test]
    fn removing_one_backend_remaps_only_its_share() {
        let backends: Vec<_> = (0..8).map(|i| backend(&format!("b{i}"))).collect();
        let ring_before = HashRing::build(&backends);

        let clients: Vec<IpAddr> = (0..1000u32)
            .map(|i| IpAddr::V4(Ipv4Addr::from(i.to_be_bytes())))
            .collect();
        let before: Vec<String> = clients
            .iter()
            .map(|ip| ring_before.select(*ip, &backends).unwrap().address.clone())
            .collect();

        let remaining: Vec<_> = backends[..7].to_vec();
        let ring_after = HashRing::build(&remaining);
        let after: Vec<String> = clients
            .iter()
            .map(|ip| ring_after.select(*ip, &remaining).unwrap().address.clone())
            .collect();

        let mut remapped = 0;
        let mut moved_off_removed = 0;
        for i in 0..clients.len() {
            if before[i] != after[i] {
                remapped += 1;
                if before[i] == "b7" {
                    moved_off_removed += 1;
                }
            }
        }
        // Only clients that were on the removed backend should move;
        // allow generous slack since this is a statistical property.
        assert!(
            moved_off_removed as f64 / remapped.max(1) as f64 > 0.9,
            "expected remapping to be dominated by the removed backend's keys"
        );
        assert!((remapped as f64) < (clients.len() as f64) * 0.35);
    }
}
