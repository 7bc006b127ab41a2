//! On-disk record shapes.

use hiera_types::{Block, BlockHeader, CertifiedBlock, Hash, QuorumCertificate, Transaction};
use serde::{Deserialize, Serialize};

/// The last durably appended block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipPointer {
    /// Block sequence.
    pub sequence: u64,
    /// Block hash.
    pub hash: Hash,
}

impl TipPointer {
    /// Tip pointer for a certified block.
    pub fn of(block: &CertifiedBlock) -> Self {
        Self {
            sequence: block.sequence(),
            hash: block.hash(),
        }
    }
}

/// One entry of the block record stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Block sequence.
    pub sequence: u64,
    /// Block header.
    pub header: BlockHeader,
    /// Ordered transactions.
    pub transactions: Vec<Transaction>,
    /// Quorum certificate.
    pub certificate: QuorumCertificate,
}

impl From<&CertifiedBlock> for LogRecord {
    fn from(block: &CertifiedBlock) -> Self {
        Self {
            sequence: block.sequence(),
            header: block.block.header.clone(),
            transactions: block.block.transactions.clone(),
            certificate: block.certificate.clone(),
        }
    }
}

impl From<LogRecord> for CertifiedBlock {
    fn from(record: LogRecord) -> Self {
        CertifiedBlock {
            block: Block {
                header: record.header,
                transactions: record.transactions,
            },
            certificate: record.certificate,
        }
    }
}
