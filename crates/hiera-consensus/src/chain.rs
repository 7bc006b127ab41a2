//! Append-only chain of certified blocks for one channel.

use crate::error::ChainIntegrityError;
use crate::validator::ValidatorSet;
use hiera_msp::EffectiveMembership;
use hiera_types::{CertifiedBlock, ChannelId, Hash, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sequence and hash of the latest block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    /// Sequence of the latest block.
    pub sequence: u64,
    /// Hash of the latest block.
    pub hash: Hash,
}

/// The committed blocks of one channel.
///
/// `append` is the only mutation. Blocks are never edited or removed.
#[derive(Debug, Clone)]
pub struct Chain {
    channel: ChannelId,
    genesis_previous_hash: Hash,
    blocks: Vec<CertifiedBlock>,
    tx_index: HashMap<TransactionId, u64>,
}

impl Chain {
    /// Creates an empty chain.
    pub fn new(channel: ChannelId, genesis_previous_hash: Hash) -> Self {
        Self {
            channel,
            genesis_previous_hash,
            blocks: Vec::new(),
            tx_index: HashMap::new(),
        }
    }

    /// Channel id.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Latest block, or `None` for an empty chain.
    pub fn tip(&self) -> Option<ChainTip> {
        self.blocks.last().map(|b| ChainTip {
            sequence: b.sequence(),
            hash: b.hash(),
        })
    }

    /// Hash the next block must reference.
    pub fn tip_hash(&self) -> Hash {
        self.blocks
            .last()
            .map(|b| b.hash())
            .unwrap_or(self.genesis_previous_hash)
    }

    /// Sequence of the next block.
    pub fn next_sequence(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the chain has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block at `sequence`.
    pub fn get(&self, sequence: u64) -> Option<&CertifiedBlock> {
        self.blocks.get(usize::try_from(sequence).ok()?)
    }

    /// Up to `limit` blocks starting at `from`.
    pub fn range(&self, from: u64, limit: usize) -> Vec<CertifiedBlock> {
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(self.blocks.len());
        self.blocks[start..].iter().take(limit).cloned().collect()
    }

    /// Iterates over all blocks.
    pub fn iter(&self) -> impl Iterator<Item = &CertifiedBlock> {
        self.blocks.iter()
    }

    /// Checks whether a transaction is committed.
    pub fn contains_tx(&self, id: &TransactionId) -> bool {
        self.tx_index.contains_key(id)
    }

    /// Sequence of the block containing a transaction.
    pub fn tx_sequence(&self, id: &TransactionId) -> Option<u64> {
        self.tx_index.get(id).copied()
    }

    /// Checks that `block` links onto the tip, without checking its
    /// certificate.
    pub fn check_link(&self, block: &CertifiedBlock) -> Result<(), ChainIntegrityError> {
        let next = self.next_sequence();
        let sequence = block.sequence();
        if sequence < next {
            return Err(ChainIntegrityError::StaleSequence { sequence, next });
        }
        if sequence > next {
            return Err(ChainIntegrityError::SequenceGap {
                expected: next,
                sequence,
            });
        }
        if block.block.header.channel != self.channel {
            return Err(ChainIntegrityError::CertificateInvalid(format!(
                "block belongs to channel {}",
                block.block.header.channel
            )));
        }
        let expected = self.tip_hash();
        if block.block.header.previous_hash != expected {
            return Err(ChainIntegrityError::HashMismatch {
                expected,
                actual: block.block.header.previous_hash,
            });
        }
        if !block.block.verify_merkle_root() {
            return Err(ChainIntegrityError::MerkleRootMismatch(sequence));
        }
        Ok(())
    }

    /// Checks that `block` may be appended.
    pub fn validate(
        &self,
        block: &CertifiedBlock,
        membership: &EffectiveMembership,
        validators: &ValidatorSet,
    ) -> Result<(), ChainIntegrityError> {
        self.check_link(block)?;

        let certificate = &block.certificate;
        if certificate.sequence != block.sequence() || certificate.block_hash != block.hash() {
            return Err(ChainIntegrityError::CertificateInvalid(
                "certificate does not name this block".into(),
            ));
        }
        validators
            .verify_certificate(certificate, membership)
            .map_err(ChainIntegrityError::CertificateInvalid)
    }

    /// Appends a certified block.
    pub fn append(
        &mut self,
        block: CertifiedBlock,
        membership: &EffectiveMembership,
        validators: &ValidatorSet,
    ) -> Result<(), ChainIntegrityError> {
        self.validate(&block, membership, validators)?;
        self.push(block);
        Ok(())
    }

    /// Re-appends a block read back from the local commit log.
    ///
    /// Linkage and Merkle root are checked; the certificate was verified
    /// against the membership in force when the block was first appended.
    pub fn restore(&mut self, block: CertifiedBlock) -> Result<(), ChainIntegrityError> {
        self.check_link(&block)?;
        self.push(block);
        Ok(())
    }

    fn push(&mut self, block: CertifiedBlock) {
        let sequence = block.sequence();
        for id in block.block.transaction_ids() {
            self.tx_index.insert(id, sequence);
        }
        self.blocks.push(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuorumRule;
    use crate::test_support::{certify, Cluster};
    use hiera_types::Block;
    use proptest::prelude::*;

    fn next_block(chain: &Chain, cluster: &Cluster) -> Block {
        Block::new(
            chain.channel().clone(),
            chain.next_sequence(),
            chain.tip_hash(),
            cluster.keys[0].public_key(),
            1_000,
            vec![cluster.transaction(chain.next_sequence())],
        )
    }

    #[test]
    fn test_empty_chain() {
        let chain = Chain::new("main".into(), Hash::ZERO);
        assert!(chain.tip().is_none());
        assert_eq!(chain.tip_hash(), Hash::ZERO);
        assert_eq!(chain.next_sequence(), 0);
    }

    #[test]
    fn test_append_links_blocks() {
        let cluster = Cluster::new(4);
        let mut chain = Chain::new("main".into(), Hash::ZERO);
        for _ in 0..3 {
            let block = next_block(&chain, &cluster);
            let certified = certify(block, 0, &cluster.keys[..3]);
            chain
                .append(certified, &cluster.membership, &cluster.validators)
                .unwrap();
        }
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.tip().unwrap().sequence, 2);
        for i in 1..3u64 {
            assert_eq!(
                chain.get(i).unwrap().block.header.previous_hash,
                chain.get(i - 1).unwrap().hash()
            );
        }
        let first_tx = chain.get(0).unwrap().block.transactions[0].id;
        assert_eq!(chain.tx_sequence(&first_tx), Some(0));
    }

    #[test]
    fn test_rejects_stale_and_gap() {
        let cluster = Cluster::new(4);
        let mut chain = Chain::new("main".into(), Hash::ZERO);
        let first = certify(next_block(&chain, &cluster), 0, &cluster.keys[..3]);
        chain
            .append(first.clone(), &cluster.membership, &cluster.validators)
            .unwrap();

        assert!(matches!(
            chain.append(first, &cluster.membership, &cluster.validators),
            Err(ChainIntegrityError::StaleSequence { sequence: 0, next: 1 })
        ));

        let mut gap = next_block(&chain, &cluster);
        gap.header.sequence = 5;
        let gap = certify(gap, 0, &cluster.keys[..3]);
        assert!(matches!(
            chain.append(gap, &cluster.membership, &cluster.validators),
            Err(ChainIntegrityError::SequenceGap { expected: 1, sequence: 5 })
        ));
    }

    #[test]
    fn test_rejects_hash_mismatch() {
        let cluster = Cluster::new(4);
        let mut chain = Chain::new("main".into(), Hash::ZERO);
        let mut block = next_block(&chain, &cluster);
        block.header.previous_hash = Hash::digest(b"fork");
        let certified = certify(block, 0, &cluster.keys[..3]);
        assert!(matches!(
            chain.append(certified, &cluster.membership, &cluster.validators),
            Err(ChainIntegrityError::HashMismatch { .. })
        ));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_rejects_merkle_mismatch() {
        let cluster = Cluster::new(4);
        let mut chain = Chain::new("main".into(), Hash::ZERO);
        let mut block = next_block(&chain, &cluster);
        block.transactions.push(cluster.transaction(99));
        let certified = certify(block, 0, &cluster.keys[..3]);
        assert!(matches!(
            chain.append(certified, &cluster.membership, &cluster.validators),
            Err(ChainIntegrityError::MerkleRootMismatch(0))
        ));
    }

    #[test]
    fn test_rejects_weak_or_forged_certificates() {
        let cluster = Cluster::new(4);
        let mut chain = Chain::new("main".into(), Hash::ZERO);
        let block = next_block(&chain, &cluster);

        let short = certify(block.clone(), 0, &cluster.keys[..2]);
        assert!(matches!(
            chain.append(short, &cluster.membership, &cluster.validators),
            Err(ChainIntegrityError::CertificateInvalid(_))
        ));

        let mut doubled = certify(block.clone(), 0, &cluster.keys[..2]);
        let repeat = doubled.certificate.endorsements[0].clone();
        doubled.certificate.endorsements.push(repeat);
        assert!(matches!(
            chain.append(doubled, &cluster.membership, &cluster.validators),
            Err(ChainIntegrityError::CertificateInvalid(_))
        ));

        let outsider = hiera_types::Keypair::from_seed(12345);
        let mut foreign = certify(block.clone(), 0, &cluster.keys[..2]);
        let extra = certify(block.clone(), 0, std::slice::from_ref(&outsider));
        foreign
            .certificate
            .endorsements
            .extend(extra.certificate.endorsements);
        assert!(matches!(
            chain.append(foreign, &cluster.membership, &cluster.validators),
            Err(ChainIntegrityError::CertificateInvalid(_))
        ));

        let mut wrong_round = certify(block, 0, &cluster.keys[..3]);
        wrong_round.certificate.round = 7;
        assert!(matches!(
            chain.append(wrong_round, &cluster.membership, &cluster.validators),
            Err(ChainIntegrityError::CertificateInvalid(_))
        ));
    }

    #[test]
    fn test_custom_genesis_previous_hash() {
        let cluster = Cluster::new(1);
        let genesis = Hash::digest(b"network-genesis");
        let mut chain = Chain::new("main".into(), genesis);
        let block = next_block(&chain, &cluster);
        assert_eq!(block.header.previous_hash, genesis);
        let validators = ValidatorSet::new(vec![cluster.keys[0].public_key()], QuorumRule::default());
        chain
            .append(certify(block, 0, &cluster.keys[..1]), &cluster.membership, &validators)
            .unwrap();
    }

    proptest! {
        #[test]
        fn appended_chains_stay_hash_linked(n in 1usize..12) {
            let cluster = Cluster::new(4);
            let mut chain = Chain::new("main".into(), Hash::ZERO);
            for _ in 0..n {
                let block = next_block(&chain, &cluster);
                chain
                    .append(certify(block, 0, &cluster.keys[1..]), &cluster.membership, &cluster.validators)
                    .unwrap();
            }
            let blocks: Vec<_> = chain.iter().collect();
            prop_assert_eq!(blocks[0].block.header.previous_hash, Hash::ZERO);
            for pair in blocks.windows(2) {
                prop_assert_eq!(pair[1].block.header.previous_hash, pair[0].hash());
            }
        }
    }
}
