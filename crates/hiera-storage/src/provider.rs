//! Per-channel commit log factories.

use crate::{
    CommitLog, FileCommitLog, FileVoteJournal, MemoryCommitLog, MemoryVoteJournal, Result,
    VoteJournal,
};
use hiera_types::ChannelId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opens the commit log of a channel.
pub trait LogProvider: Send + Sync {
    /// Opens, creating if needed, the log of `channel`.
    fn open(&self, channel: &ChannelId) -> Result<Arc<dyn CommitLog>>;

    /// Opens, creating if needed, the vote journal of `channel`.
    fn open_journal(&self, channel: &ChannelId) -> Result<Arc<dyn VoteJournal>>;
}

/// One [`FileCommitLog`] directory per channel under a data root.
#[derive(Debug, Clone)]
pub struct FileLogProvider {
    root: PathBuf,
}

impl FileLogProvider {
    /// Creates a provider rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Data root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the log of `channel`.
    ///
    /// Names outside `[A-Za-z0-9._-]` are hex-encoded.
    pub fn channel_dir(&self, channel: &ChannelId) -> PathBuf {
        let name = channel.as_str();
        let safe = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if safe {
            self.root.join(name)
        } else {
            self.root.join(format!("x-{}", hex::encode(name.as_bytes())))
        }
    }
}

impl LogProvider for FileLogProvider {
    fn open(&self, channel: &ChannelId) -> Result<Arc<dyn CommitLog>> {
        Ok(Arc::new(FileCommitLog::open(self.channel_dir(channel))?))
    }

    fn open_journal(&self, channel: &ChannelId) -> Result<Arc<dyn VoteJournal>> {
        Ok(Arc::new(FileVoteJournal::open(self.channel_dir(channel))?))
    }
}

/// Shared in-memory logs, one per channel.
///
/// Opening a channel twice returns the same log and journal, so their
/// contents outlive the node that wrote them.
#[derive(Debug, Default)]
pub struct MemoryLogProvider {
    logs: Mutex<HashMap<ChannelId, Arc<MemoryCommitLog>>>,
    journals: Mutex<HashMap<ChannelId, Arc<MemoryVoteJournal>>>,
}

impl MemoryLogProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// The log of `channel`, created if needed.
    pub fn log(&self, channel: &ChannelId) -> Arc<MemoryCommitLog> {
        self.logs
            .lock()
            .entry(channel.clone())
            .or_default()
            .clone()
    }

    /// The vote journal of `channel`, created if needed.
    pub fn journal(&self, channel: &ChannelId) -> Arc<MemoryVoteJournal> {
        self.journals
            .lock()
            .entry(channel.clone())
            .or_default()
            .clone()
    }
}

impl LogProvider for MemoryLogProvider {
    fn open(&self, channel: &ChannelId) -> Result<Arc<dyn CommitLog>> {
        Ok(self.log(channel))
    }

    fn open_journal(&self, channel: &ChannelId) -> Result<Arc<dyn VoteJournal>> {
        Ok(self.journal(channel))
    }
}
