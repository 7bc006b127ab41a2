//! Commit log interface.

use crate::{Result, TipPointer};
use hiera_types::CertifiedBlock;
use std::sync::Arc;

/// Durable, append-only store of certified blocks for one channel.
///
/// `append` returns only after the block and the new tip are durable. Appends
/// must be strictly sequential by block sequence.
pub trait CommitLog: Send + Sync {
    /// Persists a block and advances the tip.
    fn append(&self, block: &CertifiedBlock) -> Result<()>;

    /// Reads back every block up to the tip, in sequence order.
    fn replay(&self) -> Result<Vec<CertifiedBlock>>;

    /// The last durable block, if any.
    fn tip(&self) -> Option<TipPointer>;
}

impl<T: CommitLog + ?Sized> CommitLog for Arc<T> {
    fn append(&self, block: &CertifiedBlock) -> Result<()> {
        (**self).append(block)
    }

    fn replay(&self) -> Result<Vec<CertifiedBlock>> {
        (**self).replay()
    }

    fn tip(&self) -> Option<TipPointer> {
        (**self).tip()
    }
}

impl<T: CommitLog + ?Sized> CommitLog for Box<T> {
    fn append(&self, block: &CertifiedBlock) -> Result<()> {
        (**self).append(block)
    }

    fn replay(&self) -> Result<Vec<CertifiedBlock>> {
        (**self).replay()
    }

    fn tip(&self) -> Option<TipPointer> {
        (**self).tip()
    }
}

/// Checks that `block` directly extends `tip`.
pub(crate) fn check_extends(tip: Option<&TipPointer>, block: &CertifiedBlock) -> Result<()> {
    let expected = tip.map(|t| t.sequence + 1).unwrap_or(0);
    if block.sequence() != expected {
        return Err(crate::PersistenceError::Corruption(format!(
            "non-contiguous append: expected sequence {expected}, got {}",
            block.sequence()
        )));
    }
    if let Some(tip) = tip {
        if block.block.header.previous_hash != tip.hash {
            return Err(crate::PersistenceError::Corruption(format!(
                "block {} does not link to tip {}",
                block.sequence(),
                tip.hash.short()
            )));
        }
    }
    Ok(())
}
