//! Domain maps: process-wide mapping from `(domain-name, source-peer)` to an index
//! translation table, grounded on `multio::domain::Mappings`.

use crate::error::DomainError;
use crate::peer::Peer;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One client's local-to-global index translation for a domain.
#[derive(Debug, Clone)]
pub struct DomainDescriptor {
    local_size: usize,
    global_size: usize,
    /// Global index for each local position: `indices[local_i] == global_i`.
    indices: Arc<Vec<usize>>,
}

impl DomainDescriptor {
    pub fn new(global_size: usize, indices: Vec<usize>) -> Self {
        Self {
            local_size: indices.len(),
            global_size,
            indices: Arc::new(indices),
        }
    }

    pub fn local_size(&self) -> usize {
        self.local_size
    }

    pub fn global_size(&self) -> usize {
        self.global_size
    }

    /// Scatters `local` values into `global` at their translated indices. `global` must hold
    /// `global_size` `f64`s already allocated by the caller (the aggregation accumulator).
    pub fn expand(&self, local: &[f64], global: &mut [f64]) -> Result<(), DomainError> {
        if local.len() != self.local_size {
            return Err(DomainError::GlobalSizeMismatch {
                domain: String::new(),
                expected: self.local_size,
                got: local.len(),
            });
        }
        for (local_value, &global_index) in local.iter().zip(self.indices.iter()) {
            global[global_index] = *local_value;
        }
        Ok(())
    }
}

/// For one named domain: every contributing client's descriptor, complete once every expected
/// peer has registered.
#[derive(Debug, Clone, Default)]
pub struct DomainMap {
    descriptors: HashMap<Peer, DomainDescriptor>,
    expected_peers: usize,
}

impl DomainMap {
    pub fn new(expected_peers: usize) -> Self {
        Self {
            descriptors: HashMap::new(),
            expected_peers,
        }
    }

    pub fn install(
        &mut self,
        domain_name: &str,
        peer: Peer,
        descriptor: DomainDescriptor,
    ) -> Result<(), DomainError> {
        if let Some(existing) = self.descriptors.values().next() {
            if existing.global_size() != descriptor.global_size() {
                return Err(DomainError::GlobalSizeMismatch {
                    domain: domain_name.to_string(),
                    expected: existing.global_size(),
                    got: descriptor.global_size(),
                });
            }
        }
        self.descriptors.insert(peer, descriptor);
        Ok(())
    }

    pub fn get(&self, peer: &Peer) -> Option<&DomainDescriptor> {
        self.descriptors.get(peer)
    }

    /// Number of peers that have registered a descriptor for this domain.
    pub fn size(&self) -> usize {
        self.descriptors.len()
    }

    /// True once every expected client peer in the participating group has contributed.
    pub fn is_complete(&self) -> bool {
        self.expected_peers > 0 && self.descriptors.len() >= self.expected_peers
    }

    pub fn global_size(&self) -> Option<usize> {
        self.descriptors.values().next().map(|d| d.global_size())
    }
}

/// Process-wide registry of [`DomainMap`]s, one per domain name. Installed on receipt of
/// `Domain`/`Mask` messages at server startup and read thereafter: a single `RwLock` around
/// the whole registry is sufficient given the low write frequency.
#[derive(Debug, Default)]
pub struct DomainMapRegistry {
    maps: RwLock<HashMap<String, DomainMap>>,
}

impl DomainMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(
        &self,
        domain_name: &str,
        peer: Peer,
        descriptor: DomainDescriptor,
        expected_peers: usize,
    ) -> Result<(), DomainError> {
        let mut maps = self.maps.write().await;
        let entry = maps
            .entry(domain_name.to_string())
            .or_insert_with(|| DomainMap::new(expected_peers));
        entry.install(domain_name, peer, descriptor)
    }

    /// Runs `f` against the named domain map, or fails with [`DomainError::UnknownDomain`].
    pub async fn with_domain<R>(
        &self,
        domain_name: &str,
        f: impl FnOnce(&DomainMap) -> R,
    ) -> Result<R, DomainError> {
        let maps = self.maps.read().await;
        let map = maps
            .get(domain_name)
            .ok_or_else(|| DomainError::UnknownDomain(domain_name.to_string()))?;
        Ok(f(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_scatters_local_into_global_positions() {
        let descriptor = DomainDescriptor::new(8, vec![0, 1, 2, 3]);
        let local = vec![10.0, 11.0, 12.0, 13.0];
        let mut global = vec![0.0; 8];
        descriptor.expand(&local, &mut global).unwrap();
        assert_eq!(global, vec![10.0, 11.0, 12.0, 13.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn two_clients_fill_disjoint_halves() {
        let global_size = 8;
        let d0 = DomainDescriptor::new(global_size, vec![0, 1, 2, 3]);
        let d1 = DomainDescriptor::new(global_size, vec![4, 5, 6, 7]);

        let mut global = vec![0.0; global_size];
        d0.expand(&[10.0, 11.0, 12.0, 13.0], &mut global).unwrap();
        d1.expand(&[20.0, 21.0, 22.0, 23.0], &mut global).unwrap();

        assert_eq!(
            global,
            vec![10.0, 11.0, 12.0, 13.0, 20.0, 21.0, 22.0, 23.0]
        );
    }

    #[test]
    fn domain_map_is_complete_once_every_peer_registered() {
        let mut map = DomainMap::new(2);
        assert!(!map.is_complete());
        map.install(
            "grid",
            Peer::new("client", 0),
            DomainDescriptor::new(8, vec![0, 1, 2, 3]),
        )
        .unwrap();
        assert!(!map.is_complete());
        map.install(
            "grid",
            Peer::new("client", 1),
            DomainDescriptor::new(8, vec![4, 5, 6, 7]),
        )
        .unwrap();
        assert!(map.is_complete());
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn inconsistent_global_size_is_rejected() {
        let mut map = DomainMap::new(2);
        map.install(
            "grid",
            Peer::new("client", 0),
            DomainDescriptor::new(8, vec![0, 1, 2, 3]),
        )
        .unwrap();
        let err = map
            .install(
                "grid",
                Peer::new("client", 1),
                DomainDescriptor::new(9, vec![4, 5, 6, 7]),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::GlobalSizeMismatch { .. }));
    }

    #[tokio::test]
    async fn registry_with_domain_fails_for_unknown_domain() {
        let registry = DomainMapRegistry::new();
        let err = registry.with_domain("missing", |_| ()).await.unwrap_err();
        assert!(matches!(err, DomainError::UnknownDomain(_)));
    }
}
