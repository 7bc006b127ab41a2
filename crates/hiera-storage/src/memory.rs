//! In-memory commit log.

use crate::traits::check_extends;
use crate::{CommitLog, PersistenceError, Result, TipPointer};
use hiera_types::CertifiedBlock;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Commit log kept in memory.
///
/// Shared behind an `Arc`, it survives a simulated node restart. Appends can
/// be made to fail to exercise the persistence-failure path.
#[derive(Debug, Default)]
pub struct MemoryCommitLog {
    blocks: RwLock<Vec<CertifiedBlock>>,
    fail_appends: AtomicBool,
}

impl MemoryCommitLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent appends fail with an I/O error.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Returns true if no blocks are stored.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl CommitLog for MemoryCommitLog {
    fn append(&self, block: &CertifiedBlock) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io(std::io::Error::other(
                "simulated write failure",
            )));
        }
        let mut blocks = self.blocks.write();
        let tip = blocks.last().map(TipPointer::of);
        check_extends(tip.as_ref(), block)?;
        blocks.push(block.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<CertifiedBlock>> {
        Ok(self.blocks.read().clone())
    }

    fn tip(&self) -> Option<TipPointer> {
        self.blocks.read().last().map(TipPointer::of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::chain_of;

    #[test]
    fn test_append_replay() {
        let log = MemoryCommitLog::new();
        let blocks = chain_of(3);
        for b in &blocks {
            log.append(b).unwrap();
        }
        assert_eq!(log.replay().unwrap(), blocks);
        assert_eq!(log.tip().map(|t| t.sequence), Some(2));
    }

    #[test]
    fn test_simulated_failure() {
        let log = MemoryCommitLog::new();
        log.set_fail_appends(true);
        assert!(matches!(
            log.append(&chain_of(1)[0]),
            Err(PersistenceError::Io(_))
        ));
        assert!(log.is_empty());
    }
}
