//! Storage seams: the record datastore and the peer address book.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::common::{Multiaddr, PeerId, PeerInfo};
use crate::Result;

/// Datastore key of the record stored under `key`.
pub fn record_key(prefix: &str, key: &[u8]) -> Vec<u8> {
    format!("{prefix}/record/{}", URL_SAFE_NO_PAD.encode(key)).into_bytes()
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Bytes },
    Delete { key: Vec<u8> },
}

/// Persistent key-value storage for records.
pub trait Datastore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn put(&self, key: &[u8], value: Bytes) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Apply `ops` in order.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        for op in ops {
            match op {
                BatchOp::Put { key, value } => self.put(&key, value)?,
                BatchOp::Delete { key } => self.delete(&key)?,
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: RwLock<HashMap<Vec<u8>, Bytes>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Address book of known peers.
pub trait PeerStore: Send + Sync + 'static {
    fn get(&self, peer: &PeerId) -> Option<PeerInfo>;

    /// Add `info`'s addresses to those already known for the peer.
    fn merge(&self, info: &PeerInfo);
}

#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    peers: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerStore for MemoryPeerStore {
    fn get(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.peers
            .read()
            .get(peer)
            .map(|addrs| PeerInfo::new(peer.clone(), addrs.clone()))
    }

    fn merge(&self, info: &PeerInfo) {
        if info.multiaddrs.is_empty() {
            return;
        }

        let mut peers = self.peers.write();
        let known = peers.entry(info.id.clone()).or_default();

        for addr in &info.multiaddrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }
}
