//! Block structure and quorum certificates.
//!
//! A block's hash covers its header only; the header commits to the
//! transaction list through the Merkle root. Endorsement signatures live in
//! the [`QuorumCertificate`] and are attached after the hash is fixed.

use crate::crypto::{Hash, PublicKey, Signature};
use crate::transaction::{ChannelId, Transaction, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Computes the Merkle root over an ordered list of transaction ids.
///
/// Pairs are hashed level by level; an odd node is paired with itself. The
/// empty list has the all-zero root.
pub fn merkle_root(ids: &[TransactionId]) -> Hash {
    if ids.is_empty() {
        return Hash::ZERO;
    }

    let mut level: Vec<Hash> = ids.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| Hash::combine(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level[0]
}

/// Block header. Everything that determines the block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Channel the block belongs to.
    pub channel: ChannelId,
    /// Height in the channel's chain (0 = genesis).
    pub sequence: u64,
    /// Hash of the block at `sequence - 1`, or the configured genesis
    /// previous hash for block 0.
    pub previous_hash: Hash,
    /// Merkle root of the transaction ids.
    pub merkle_root: Hash,
    /// Creation time (unix milliseconds).
    pub timestamp: u64,
    /// Proposer key.
    pub proposer: PublicKey,
    /// Number of transactions.
    pub tx_count: u32,
}

impl BlockHeader {
    /// Canonical bytes hashed into the block hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        let channel = self.channel.as_str().as_bytes();
        let mut out = Vec::with_capacity(4 + channel.len() + 8 + 32 + 32 + 8 + 32 + 4);
        out.extend_from_slice(&(channel.len() as u32).to_le_bytes());
        out.extend_from_slice(channel);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(self.previous_hash.as_bytes());
        out.extend_from_slice(self.merkle_root.as_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.proposer.as_bytes());
        out.extend_from_slice(&self.tx_count.to_le_bytes());
        out
    }

    /// Computes the block hash.
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.to_bytes())
    }
}

/// A block: header plus ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Ordered transactions.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Builds a block, computing the Merkle root.
    pub fn new(
        channel: ChannelId,
        sequence: u64,
        previous_hash: Hash,
        proposer: PublicKey,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let ids: Vec<_> = transactions.iter().map(|tx| tx.id).collect();
        let header = BlockHeader {
            channel,
            sequence,
            previous_hash,
            merkle_root: merkle_root(&ids),
            timestamp,
            proposer,
            tx_count: transactions.len() as u32,
        };
        Self {
            header,
            transactions,
        }
    }

    /// Returns the block hash.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Returns the sequence number.
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    /// Returns the number of transactions.
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Returns an iterator over transaction ids.
    pub fn transaction_ids(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.transactions.iter().map(|tx| tx.id)
    }

    /// Checks that the header's Merkle root and count cover the transactions.
    pub fn verify_merkle_root(&self) -> bool {
        let ids: Vec<_> = self.transaction_ids().collect();
        self.header.tx_count as usize == ids.len() && merkle_root(&ids) == self.header.merkle_root
    }

    /// Checks that no transaction id appears twice.
    pub fn has_unique_transactions(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.transactions.len());
        self.transactions.iter().all(|tx| seen.insert(tx.id))
    }

    /// Commitment hashes carried by private-data payloads.
    pub fn commitments(&self) -> Vec<Hash> {
        self.transactions
            .iter()
            .filter_map(|tx| tx.payload.commitment().copied())
            .collect()
    }
}

/// One voter's endorsement signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorsement {
    /// Voter key.
    pub voter: PublicKey,
    /// Signature over [`QuorumCertificate::signing_data`].
    pub signature: Signature,
}

/// Endorsements from a quorum of voters for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    /// Channel.
    pub channel: ChannelId,
    /// Sequence of the certified block.
    pub sequence: u64,
    /// Round in which the quorum formed.
    pub round: u64,
    /// Hash of the certified block.
    pub block_hash: Hash,
    /// Endorsements, one per voter.
    pub endorsements: Vec<Endorsement>,
}

impl QuorumCertificate {
    /// Bytes every endorser signs.
    pub fn signing_data(channel: &ChannelId, sequence: u64, round: u64, block_hash: &Hash) -> Vec<u8> {
        let mut data = Vec::with_capacity(64 + channel.as_str().len());
        data.extend_from_slice(b"ENDORSE:");
        data.extend_from_slice(&(channel.as_str().len() as u32).to_le_bytes());
        data.extend_from_slice(channel.as_str().as_bytes());
        data.extend_from_slice(&sequence.to_le_bytes());
        data.extend_from_slice(&round.to_le_bytes());
        data.extend_from_slice(block_hash.as_bytes());
        data
    }

    /// Signing data for this certificate.
    pub fn to_signing_data(&self) -> Vec<u8> {
        Self::signing_data(&self.channel, self.sequence, self.round, &self.block_hash)
    }

    /// Returns the voters.
    pub fn voters(&self) -> impl Iterator<Item = &PublicKey> {
        self.endorsements.iter().map(|e| &e.voter)
    }
}

/// A block together with the certificate that finalized it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedBlock {
    /// The block.
    pub block: Block,
    /// Its quorum certificate.
    pub certificate: QuorumCertificate,
}

impl CertifiedBlock {
    /// Returns the block hash.
    pub fn hash(&self) -> Hash {
        self.block.hash()
    }

    /// Returns the sequence.
    pub fn sequence(&self) -> u64 {
        self.block.sequence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(sequence: u64) -> BlockHeader {
        BlockHeader {
            channel: "main".into(),
            sequence,
            previous_hash: Hash::ZERO,
            merkle_root: Hash::ZERO,
            timestamp: 1,
            proposer: PublicKey([9u8; 32]),
            tx_count: 0,
        }
    }

    #[test]
    fn test_empty_merkle_root_is_zero() {
        assert_eq!(merkle_root(&[]), Hash::ZERO);
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let leaf = Hash::digest(b"a");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_odd_leaf_is_duplicated() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let c = Hash::digest(b"c");
        let expected = Hash::combine(&Hash::combine(&a, &b), &Hash::combine(&c, &c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_header_hash_changes_with_sequence() {
        assert_ne!(header(1).hash(), header(2).hash());
    }

    #[test]
    fn test_certificate_signing_data_is_domain_separated() {
        let data = QuorumCertificate::signing_data(&"main".into(), 1, 0, &Hash::ZERO);
        assert!(data.starts_with(b"ENDORSE:"));
    }

    proptest! {
        #[test]
        fn merkle_root_detects_reordering(seeds in proptest::collection::vec(any::<u64>(), 2..32)) {
            let ids: Vec<Hash> = seeds.iter().map(|s| Hash::digest(&s.to_le_bytes())).collect();
            let mut swapped = ids.clone();
            swapped.swap(0, 1);
            prop_assume!(ids[0] != ids[1]);
            prop_assert_ne!(merkle_root(&ids), merkle_root(&swapped));
        }
    }
}
