//! Durable commit log for Hiera.
//!
//! Each channel persists its certified blocks as an append-only record
//! stream plus a tip pointer. A block counts as committed only once the tip
//! names it; replay after a restart reconstructs the chain up to that tip.
//! Beside the log, a vote journal keeps the node's own signed messages for
//! the sequence in progress.

mod error;
mod file;
mod journal;
mod memory;
mod provider;
mod record;
mod traits;

pub use error::{PersistenceError, Result};
pub use file::FileCommitLog;
pub use journal::{FileVoteJournal, JournalEntry, MemoryVoteJournal, VoteJournal};
pub use memory::MemoryCommitLog;
pub use provider::{FileLogProvider, LogProvider, MemoryLogProvider};
pub use record::{LogRecord, TipPointer};
pub use traits::CommitLog;
