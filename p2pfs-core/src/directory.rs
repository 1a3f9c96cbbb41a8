//! Peer directory: flat id → address book. Add-only, no TTL, no liveness tracking.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Id under which `join_network` records the bootstrap address.
pub const BOOTSTRAP_PEER_ID: &str = "bootstrap";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub address: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("peer not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<String, String>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address` for `id`. Re-adding an id points it at the new address.
    pub fn add_peer(&self, id: impl Into<String>, address: impl Into<String>) {
        let (id, address) = (id.into(), address.into());
        tracing::debug!(peer = %id, address = %address, "added peer");
        self.peers.write().insert(id, address);
    }

    pub fn get_peer(&self, id: &str) -> Result<String, DirectoryError> {
        self.peers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(id.to_owned()))
    }

    /// Register the bootstrap address. Discovery beyond this is not done here.
    pub fn join_network(&self, bootstrap_address: &str) {
        self.add_peer(BOOTSTRAP_PEER_ID, bootstrap_address);
        tracing::info!(bootstrap = %bootstrap_address, "joined network");
    }

    /// Snapshot of every entry, sorted by id.
    pub fn peers(&self) -> Vec<Peer> {
        let mut out: Vec<Peer> = self
            .peers
            .read()
            .iter()
            .map(|(id, address)| Peer {
                id: id.clone(),
                address: address.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_then_get() {
        let dir = PeerDirectory::new();
        dir.add_peer("node-a", "10.0.0.1:7070");
        assert_eq!(dir.get_peer("node-a").unwrap(), "10.0.0.1:7070");
        assert!(matches!(
            dir.get_peer("node-b"),
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[test]
    fn join_network_registers_bootstrap() {
        let dir = PeerDirectory::new();
        assert!(dir.is_empty());
        dir.join_network("seed.example:7070");
        assert_eq!(dir.get_peer(BOOTSTRAP_PEER_ID).unwrap(), "seed.example:7070");
        assert_eq!(
            dir.peers(),
            vec![Peer {
                id: BOOTSTRAP_PEER_ID.into(),
                address: "seed.example:7070".into()
            }]
        );
    }

    #[test]
    fn concurrent_adds_are_all_visible() {
        let dir = Arc::new(PeerDirectory::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let dir = dir.clone();
                std::thread::spawn(move || dir.add_peer(format!("p{i}"), format!("10.0.0.{i}:1")))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(dir.len(), 16);
        assert_eq!(dir.get_peer("p7").unwrap(), "10.0.0.7:1");
    }
}
