//! Journal of messages this node signed.
//!
//! A validator must not sign two different blocks for one sequence, round
//! and phase, across restarts included. Every proposal and vote is written
//! here before it leaves the node. Only the latest sequence is kept: the
//! first entry for a new sequence replaces the file.
//!
//! ```text
//! <dir>/votes.log    one JSON entry per line, fsync'd per record
//! ```

use crate::file::sync_dir;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const JOURNAL_FILE: &str = "votes.log";
const JOURNAL_TMP_FILE: &str = "votes.log.tmp";

/// One signed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequence the message is about.
    pub sequence: u64,
    /// The encoded message.
    pub message: serde_json::Value,
}

/// Durable record of a node's own proposals and votes for one channel.
pub trait VoteJournal: Send + Sync {
    /// Persists `entry` before returning.
    ///
    /// An entry for a later sequence discards every earlier one. Entries for
    /// an earlier sequence are ignored.
    fn record(&self, entry: &JournalEntry) -> Result<()>;

    /// Entries of the latest recorded sequence, in recording order.
    fn entries(&self) -> Vec<JournalEntry>;
}

#[derive(Debug)]
struct JournalState {
    file: File,
    entries: Vec<JournalEntry>,
}

/// Vote journal stored next to a channel's commit log.
#[derive(Debug)]
pub struct FileVoteJournal {
    dir: PathBuf,
    state: Mutex<JournalState>,
}

impl FileVoteJournal {
    /// Opens or creates the journal in `dir`, dropping a torn trailing line.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(JOURNAL_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let complete = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        if complete < bytes.len() {
            tracing::warn!(
                dir = %dir.display(),
                discarded_bytes = bytes.len() - complete,
                "truncating torn vote journal entry"
            );
            file.set_len(complete as u64)?;
            file.sync_all()?;
        }

        let mut entries = Vec::new();
        for line in bytes[..complete].split(|b| *b == b'\n') {
            if !line.is_empty() {
                entries.push(serde_json::from_slice::<JournalEntry>(line)?);
            }
        }
        if let Some(latest) = entries.iter().map(|e| e.sequence).max() {
            entries.retain(|e| e.sequence == latest);
        }

        Ok(Self {
            dir,
            state: Mutex::new(JournalState { file, entries }),
        })
    }

    /// Directory holding the journal.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replaces the journal with a single entry.
    fn rewrite(&self, line: &[u8]) -> Result<File> {
        let tmp = self.dir.join(JOURNAL_TMP_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(line)?;
            file.sync_all()?;
        }
        let path = self.dir.join(JOURNAL_FILE);
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir)?;
        Ok(OpenOptions::new().read(true).append(true).open(path)?)
    }
}

impl VoteJournal for FileVoteJournal {
    fn record(&self, entry: &JournalEntry) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.entries.first().map(|e| e.sequence);
        if current.is_some_and(|s| entry.sequence < s) {
            return Ok(());
        }

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        if current == Some(entry.sequence) {
            state.file.write_all(&line)?;
            state.file.sync_data()?;
        } else {
            state.file = self.rewrite(&line)?;
            state.entries.clear();
        }
        state.entries.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Vec<JournalEntry> {
        self.state.lock().entries.clone()
    }
}

/// Vote journal kept in memory. Shared behind an `Arc`, it survives a
/// simulated restart.
#[derive(Debug, Default)]
pub struct MemoryVoteJournal {
    entries: RwLock<Vec<JournalEntry>>,
}

impl MemoryVoteJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl VoteJournal for MemoryVoteJournal {
    fn record(&self, entry: &JournalEntry) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.first().map(|e| e.sequence) {
            Some(s) if entry.sequence < s => return Ok(()),
            Some(s) if entry.sequence > s => entries.clear(),
            _ => {}
        }
        entries.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Vec<JournalEntry> {
        self.entries.read().clone()
    }
}
