//! Consensus message types for peer-to-peer communication.
//!
//! Every vote carries its round. Signatures are domain-separated by a
//! phase prefix so a signature from one phase never verifies in another.

use crate::error::ConsensusError;
use bytes::Bytes;
use hiera_types::{
    Block, BlockHeader, CertifiedBlock, ChannelId, Endorsement, Hash, Keypair, PublicKey,
    QuorumCertificate, Signature, Transaction,
};
use serde::{Deserialize, Serialize};

fn vote_signing_data(
    prefix: &[u8],
    channel: &ChannelId,
    sequence: u64,
    round: u64,
    block_hash: Option<&Hash>,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(prefix.len() + 52 + channel.as_str().len());
    data.extend_from_slice(prefix);
    data.extend_from_slice(&(channel.as_str().len() as u32).to_le_bytes());
    data.extend_from_slice(channel.as_str().as_bytes());
    data.extend_from_slice(&sequence.to_le_bytes());
    data.extend_from_slice(&round.to_le_bytes());
    if let Some(hash) = block_hash {
        data.extend_from_slice(hash.as_bytes());
    }
    data
}

/// Consensus messages exchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsensusMessage {
    /// Block proposal from the round's proposer.
    Propose(ProposeMessage),

    /// First-phase vote for a proposal.
    Prepare(PrepareMessage),

    /// Second-phase vote, cast after a prepare quorum.
    Endorse(EndorseMessage),

    /// Vote to leave a stalled round.
    ViewChange(ViewChangeMessage),

    /// Quorum certificate for a committed block.
    Certificate(CertificateMessage),

    /// Transaction gossip.
    Transaction(TransactionMessage),

    /// Request for committed blocks.
    SyncRequest(SyncRequestMessage),

    /// Committed blocks.
    SyncResponse(SyncResponseMessage),
}

impl ConsensusMessage {
    /// Encodes the message to bytes.
    pub fn encode(&self) -> Result<Bytes, ConsensusError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a message from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ConsensusError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Channel the message belongs to.
    pub fn channel(&self) -> &ChannelId {
        match self {
            ConsensusMessage::Propose(m) => &m.channel,
            ConsensusMessage::Prepare(m) => &m.channel,
            ConsensusMessage::Endorse(m) => &m.channel,
            ConsensusMessage::ViewChange(m) => &m.channel,
            ConsensusMessage::Certificate(m) => &m.certificate.channel,
            ConsensusMessage::Transaction(m) => &m.transaction.channel,
            ConsensusMessage::SyncRequest(m) => &m.channel,
            ConsensusMessage::SyncResponse(m) => &m.channel,
        }
    }

    /// Sequence the message is about, for sequence-bound messages.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            ConsensusMessage::Propose(m) => Some(m.sequence),
            ConsensusMessage::Prepare(m) => Some(m.sequence),
            ConsensusMessage::Endorse(m) => Some(m.sequence),
            ConsensusMessage::ViewChange(m) => Some(m.sequence),
            ConsensusMessage::Certificate(m) => Some(m.certificate.sequence),
            _ => None,
        }
    }

    /// Returns the message type as a string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::Propose(_) => "propose",
            ConsensusMessage::Prepare(_) => "prepare",
            ConsensusMessage::Endorse(_) => "endorse",
            ConsensusMessage::ViewChange(_) => "view_change",
            ConsensusMessage::Certificate(_) => "certificate",
            ConsensusMessage::Transaction(_) => "transaction",
            ConsensusMessage::SyncRequest(_) => "sync_request",
            ConsensusMessage::SyncResponse(_) => "sync_response",
        }
    }
}

/// Prepare votes from a quorum for one block in one round.
///
/// Justifies locking on the block and re-proposing it in a later round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareCertificate {
    /// Round in which the quorum formed.
    pub round: u64,
    /// Prepared block.
    pub block_hash: Hash,
    /// Prepare signatures.
    pub votes: Vec<Endorsement>,
}

/// Block proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeMessage {
    /// Channel.
    pub channel: ChannelId,
    /// Sequence.
    pub sequence: u64,
    /// Round.
    pub round: u64,
    /// Proposed block header.
    pub header: BlockHeader,
    /// Ordered transactions.
    pub transactions: Vec<Transaction>,
    /// Prepare certificate from an earlier round when re-proposing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<PrepareCertificate>,
    /// Sender, the scheduled proposer of the round.
    pub proposer: PublicKey,
    /// Signature over [`ProposeMessage::signing_data`].
    pub signature: Signature,
}

impl ProposeMessage {
    /// Bytes the proposer signs.
    pub fn signing_data(channel: &ChannelId, sequence: u64, round: u64, block_hash: &Hash) -> Vec<u8> {
        vote_signing_data(b"PROPOSE:", channel, sequence, round, Some(block_hash))
    }

    /// Creates and signs a proposal.
    pub fn new(
        round: u64,
        block: Block,
        justification: Option<PrepareCertificate>,
        keypair: &Keypair,
    ) -> Self {
        let hash = block.hash();
        let channel = block.header.channel.clone();
        let sequence = block.sequence();
        let signature = keypair.sign(&Self::signing_data(&channel, sequence, round, &hash));
        Self {
            channel,
            sequence,
            round,
            header: block.header,
            transactions: block.transactions,
            justification,
            proposer: keypair.public_key(),
            signature,
        }
    }

    /// Returns the proposed block hash.
    pub fn block_hash(&self) -> Hash {
        self.header.hash()
    }

    /// Reassembles the block.
    pub fn block(&self) -> Block {
        Block {
            header: self.header.clone(),
            transactions: self.transactions.clone(),
        }
    }

    /// Verifies the proposer signature.
    pub fn verify_signature(&self) -> bool {
        let data = Self::signing_data(&self.channel, self.sequence, self.round, &self.block_hash());
        self.proposer.verify(&data, &self.signature).is_ok()
    }
}

macro_rules! vote_message {
    ($(#[$doc:meta])* $name:ident, $prefix:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            /// Channel.
            pub channel: ChannelId,
            /// Sequence.
            pub sequence: u64,
            /// Round.
            pub round: u64,
            /// Block voted for.
            pub block_hash: Hash,
            /// Voter key.
            pub voter: PublicKey,
            /// Voter signature over the phase signing data.
            pub signature: Signature,
        }

        impl $name {
            /// Bytes the voter signs.
            pub fn signing_data(
                channel: &ChannelId,
                sequence: u64,
                round: u64,
                block_hash: &Hash,
            ) -> Vec<u8> {
                vote_signing_data($prefix, channel, sequence, round, Some(block_hash))
            }

            /// Creates and signs a vote.
            pub fn new(
                channel: ChannelId,
                sequence: u64,
                round: u64,
                block_hash: Hash,
                keypair: &Keypair,
            ) -> Self {
                let signature =
                    keypair.sign(&Self::signing_data(&channel, sequence, round, &block_hash));
                Self {
                    channel,
                    sequence,
                    round,
                    block_hash,
                    voter: keypair.public_key(),
                    signature,
                }
            }

            /// Signing data of this vote.
            pub fn to_signing_data(&self) -> Vec<u8> {
                Self::signing_data(&self.channel, self.sequence, self.round, &self.block_hash)
            }

            /// The vote as a certificate entry.
            pub fn endorsement(&self) -> Endorsement {
                Endorsement {
                    voter: self.voter,
                    signature: self.signature,
                }
            }
        }
    };
}

vote_message!(
    /// First-phase vote.
    PrepareMessage,
    b"PREPARE:"
);

vote_message!(
    /// Second-phase vote. Its signature is the one collected into the
    /// block's quorum certificate.
    EndorseMessage,
    b"ENDORSE:"
);

/// Vote to abandon a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeMessage {
    /// Channel.
    pub channel: ChannelId,
    /// Sequence.
    pub sequence: u64,
    /// Round being abandoned.
    pub round: u64,
    /// Voter key.
    pub voter: PublicKey,
    /// Signature over [`ViewChangeMessage::signing_data`].
    pub signature: Signature,
}

impl ViewChangeMessage {
    /// Bytes the voter signs.
    pub fn signing_data(channel: &ChannelId, sequence: u64, round: u64) -> Vec<u8> {
        vote_signing_data(b"VIEW_CHANGE:", channel, sequence, round, None)
    }

    /// Creates and signs a view-change vote.
    pub fn new(channel: ChannelId, sequence: u64, round: u64, keypair: &Keypair) -> Self {
        let signature = keypair.sign(&Self::signing_data(&channel, sequence, round));
        Self {
            channel,
            sequence,
            round,
            voter: keypair.public_key(),
            signature,
        }
    }

    /// Signing data of this vote.
    pub fn to_signing_data(&self) -> Vec<u8> {
        Self::signing_data(&self.channel, self.sequence, self.round)
    }
}

/// Certificate gossip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateMessage {
    /// Certificate of the committed block.
    pub certificate: QuorumCertificate,
}

/// Transaction gossip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMessage {
    /// The transaction.
    pub transaction: Transaction,
}

/// Request for committed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestMessage {
    /// Channel.
    pub channel: ChannelId,
    /// First sequence wanted.
    pub from_sequence: u64,
    /// Last sequence wanted, inclusive; `None` for everything available.
    pub to_sequence: Option<u64>,
}

/// Committed blocks in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponseMessage {
    /// Channel.
    pub channel: ChannelId,
    /// Certified blocks.
    pub blocks: Vec<CertifiedBlock>,
}
