//! Consensus events for downstream consumers.

use crate::error::ConsensusFault;
use hiera_types::{CertifiedBlock, ChannelId, Hash};
use std::sync::Arc;

/// Event published on the node's broadcast channel.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// This node proposed a block.
    BlockProposed {
        /// Channel.
        channel: ChannelId,
        /// Sequence.
        sequence: u64,
        /// Round.
        round: u64,
        /// Block hash.
        block_hash: Hash,
        /// Number of transactions.
        tx_count: usize,
    },

    /// A block was durably committed.
    BlockCommitted {
        /// Channel.
        channel: ChannelId,
        /// The block with its certificate.
        block: Arc<CertifiedBlock>,
    },

    /// A round ended without a commit.
    RoundAbandoned {
        /// Channel.
        channel: ChannelId,
        /// Sequence.
        sequence: u64,
        /// Round that starts now.
        next_round: u64,
    },

    /// Misbehavior was observed.
    FaultDetected {
        /// Channel.
        channel: ChannelId,
        /// The fault.
        fault: ConsensusFault,
    },

    /// The channel stopped and accepts no more work.
    ChannelHalted {
        /// Channel.
        channel: ChannelId,
        /// What went wrong.
        reason: String,
    },
}

impl ConsensusEvent {
    /// Channel the event belongs to.
    pub fn channel(&self) -> &ChannelId {
        match self {
            ConsensusEvent::BlockProposed { channel, .. }
            | ConsensusEvent::BlockCommitted { channel, .. }
            | ConsensusEvent::RoundAbandoned { channel, .. }
            | ConsensusEvent::FaultDetected { channel, .. }
            | ConsensusEvent::ChannelHalted { channel, .. } => channel,
        }
    }
}
