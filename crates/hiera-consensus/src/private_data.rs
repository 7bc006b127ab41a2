//! Off-chain private data.
//!
//! A transaction may carry only a commitment hash in place of its payload.
//! Consensus orders the commitment and never dereferences it; the blob
//! itself lives in a [`PrivateDataStore`] keyed by that hash.

use crate::error::{ConsensusError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hiera_types::{Block, Hash};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Opaque blob store keyed by commitment hash.
#[async_trait]
pub trait PrivateDataStore: Send + Sync {
    /// Stores a blob and returns its commitment.
    async fn put(&self, data: Bytes) -> Result<Hash>;

    /// Stores a blob under a commitment, checking that it matches.
    async fn put_committed(&self, commitment: Hash, data: Bytes) -> Result<()> {
        if Hash::digest(&data) != commitment {
            return Err(ConsensusError::PrivateData(format!(
                "blob does not match commitment {}",
                commitment.short()
            )));
        }
        self.put(data).await.map(|_| ())
    }

    /// Fetches a blob.
    async fn get(&self, commitment: &Hash) -> Result<Option<Bytes>>;

    /// Checks whether a blob is held.
    async fn contains(&self, commitment: &Hash) -> Result<bool> {
        Ok(self.get(commitment).await?.is_some())
    }

    /// Commitments of `block` whose blobs are not held locally.
    async fn missing(&self, block: &Block) -> Result<Vec<Hash>> {
        let mut missing = Vec::new();
        for commitment in block.commitments() {
            if !self.contains(&commitment).await? {
                missing.push(commitment);
            }
        }
        Ok(missing)
    }
}

/// In-memory [`PrivateDataStore`].
#[derive(Debug, Default)]
pub struct MemoryPrivateDataStore {
    blobs: RwLock<HashMap<Hash, Bytes>>,
}

impl MemoryPrivateDataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs held.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Checks whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl PrivateDataStore for MemoryPrivateDataStore {
    async fn put(&self, data: Bytes) -> Result<Hash> {
        let commitment = Hash::digest(&data);
        self.blobs.write().insert(commitment, data);
        Ok(commitment)
    }

    async fn get(&self, commitment: &Hash) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().get(commitment).cloned())
    }

    async fn contains(&self, commitment: &Hash) -> Result<bool> {
        Ok(self.blobs.read().contains_key(commitment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Cluster;
    use hiera_types::Payload;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryPrivateDataStore::new();
        let commitment = store.put(Bytes::from_static(b"secret terms")).await.unwrap();
        assert_eq!(commitment, Hash::digest(b"secret terms"));
        assert_eq!(
            store.get(&commitment).await.unwrap(),
            Some(Bytes::from_static(b"secret terms"))
        );
        assert!(store.get(&Hash::digest(b"other")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_committed_checks_hash() {
        let store = MemoryPrivateDataStore::new();
        let err = store
            .put_committed(Hash::digest(b"a"), Bytes::from_static(b"b"))
            .await;
        assert!(matches!(err, Err(ConsensusError::PrivateData(_))));
        assert!(store.is_empty());

        store
            .put_committed(Hash::digest(b"a"), Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_commitments_of_block() {
        let cluster = Cluster::new(1);
        let held = Hash::digest(b"held");
        let absent = Hash::digest(b"absent");
        let block = Block::new(
            "main".into(),
            0,
            Hash::ZERO,
            cluster.keys[0].public_key(),
            1,
            vec![
                cluster.transaction_with(Payload::Commitment(held), 1),
                cluster.transaction_with(Payload::Commitment(absent), 2),
                cluster.transaction(3),
            ],
        );

        let store = MemoryPrivateDataStore::new();
        store.put(Bytes::from_static(b"held")).await.unwrap();
        assert_eq!(store.missing(&block).await.unwrap(), vec![absent]);
    }
}
