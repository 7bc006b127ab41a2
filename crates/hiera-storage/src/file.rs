//! File-backed commit log.
//!
//! Layout of a channel directory:
//!
//! ```text
//! <dir>/blocks.log   one JSON record per line, fsync'd per append
//! <dir>/TIP          {"sequence":..,"hash":..}, replaced atomically
//! ```
//!
//! A block is acknowledged once `TIP` names it. Records past the tip were
//! never acknowledged and are truncated on open, as is a torn trailing line.

use crate::traits::check_extends;
use crate::{CommitLog, LogRecord, PersistenceError, Result, TipPointer};
use hiera_types::CertifiedBlock;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "blocks.log";
const TIP_FILE: &str = "TIP";
const TIP_TMP_FILE: &str = "TIP.tmp";

#[derive(Debug)]
struct FileState {
    log: File,
    tip: Option<TipPointer>,
}

/// Append-only commit log stored in a directory.
#[derive(Debug)]
pub struct FileCommitLog {
    dir: PathBuf,
    state: Mutex<FileState>,
}

impl FileCommitLog {
    /// Opens or creates the log in `dir`, discarding unacknowledged records.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let tip = read_tip(&dir)?;
        let mut log = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;

        let scan = scan(&mut log, tip.as_ref())?;
        if scan.valid_len < scan.file_len {
            tracing::warn!(
                dir = %dir.display(),
                discarded_bytes = scan.file_len - scan.valid_len,
                "truncating unacknowledged commit log tail"
            );
            log.set_len(scan.valid_len)?;
            log.sync_all()?;
        }

        tracing::debug!(
            dir = %dir.display(),
            tip = ?tip.map(|t| t.sequence),
            "commit log opened"
        );

        Ok(Self {
            dir,
            state: Mutex::new(FileState { log, tip }),
        })
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_tip(&self, tip: &TipPointer) -> Result<()> {
        let tmp = self.dir.join(TIP_TMP_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(tip)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(TIP_FILE))?;
        sync_dir(&self.dir)
    }
}

impl CommitLog for FileCommitLog {
    fn append(&self, block: &CertifiedBlock) -> Result<()> {
        let mut state = self.state.lock();
        check_extends(state.tip.as_ref(), block)?;

        let mut line = serde_json::to_vec(&LogRecord::from(block))?;
        line.push(b'\n');
        state.log.write_all(&line)?;
        state.log.sync_data()?;

        let tip = TipPointer::of(block);
        self.write_tip(&tip)?;
        state.tip = Some(tip);
        Ok(())
    }

    fn replay(&self) -> Result<Vec<CertifiedBlock>> {
        let mut state = self.state.lock();
        let tip = state.tip;
        let scan = scan(&mut state.log, tip.as_ref())?;
        Ok(scan.blocks)
    }

    fn tip(&self) -> Option<TipPointer> {
        self.state.lock().tip
    }
}

/// Persists renames within `dir`.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn read_tip(dir: &Path) -> Result<Option<TipPointer>> {
    match fs::read(dir.join(TIP_FILE)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct Scan {
    blocks: Vec<CertifiedBlock>,
    /// Byte length of the records up to and including the tip.
    valid_len: u64,
    file_len: u64,
}

/// Reads records up to `tip`, checking contiguity and linkage.
///
/// Anything after the tip record is ignored.
fn scan(log: &mut File, tip: Option<&TipPointer>) -> Result<Scan> {
    let mut bytes = Vec::new();
    {
        use std::io::Seek;
        log.seek(std::io::SeekFrom::Start(0))?;
        log.read_to_end(&mut bytes)?;
    }
    let file_len = bytes.len() as u64;

    let Some(tip) = tip else {
        return Ok(Scan {
            blocks: Vec::new(),
            valid_len: 0,
            file_len,
        });
    };

    let mut blocks: Vec<CertifiedBlock> = Vec::new();
    let mut offset = 0usize;
    while blocks.last().map(|b| b.sequence()) != Some(tip.sequence) {
        let Some(end) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            return Err(PersistenceError::Corruption(format!(
                "log ends before tip sequence {}",
                tip.sequence
            )));
        };
        let record: LogRecord = serde_json::from_slice(&bytes[offset..offset + end])?;
        offset += end + 1;

        let expected = blocks.last().map(|b| b.sequence() + 1).unwrap_or(0);
        if record.sequence != expected || record.header.sequence != expected {
            return Err(PersistenceError::Corruption(format!(
                "expected record {expected}, found {}",
                record.sequence
            )));
        }
        let block = CertifiedBlock::from(record);
        if let Some(prev) = blocks.last() {
            if block.block.header.previous_hash != prev.hash() {
                return Err(PersistenceError::Corruption(format!(
                    "record {} does not link to its predecessor",
                    block.sequence()
                )));
            }
        }
        blocks.push(block);
    }

    let last_hash = blocks.last().map(|b| b.hash());
    if last_hash != Some(tip.hash) {
        return Err(PersistenceError::Corruption(format!(
            "tip hash mismatch at sequence {}",
            tip.sequence
        )));
    }

    Ok(Scan {
        blocks,
        valid_len: offset as u64,
        file_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::chain_of;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let blocks = chain_of(3);
        {
            let log = FileCommitLog::open(dir.path()).unwrap();
            for b in &blocks {
                log.append(b).unwrap();
            }
            assert_eq!(log.tip(), Some(TipPointer::of(&blocks[2])));
        }

        let log = FileCommitLog::open(dir.path()).unwrap();
        assert_eq!(log.tip(), Some(TipPointer::of(&blocks[2])));
        assert_eq!(log.replay().unwrap(), blocks);
    }

    #[test]
    fn test_empty_log_replays_nothing() {
        let dir = TempDir::new().unwrap();
        let log = FileCommitLog::open(dir.path()).unwrap();
        assert!(log.tip().is_none());
        assert!(log.replay().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_non_contiguous_append() {
        let dir = TempDir::new().unwrap();
        let blocks = chain_of(3);
        let log = FileCommitLog::open(dir.path()).unwrap();
        log.append(&blocks[0]).unwrap();
        assert!(matches!(
            log.append(&blocks[2]),
            Err(PersistenceError::Corruption(_))
        ));
        assert_eq!(log.tip().map(|t| t.sequence), Some(0));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let blocks = chain_of(2);
        {
            let log = FileCommitLog::open(dir.path()).unwrap();
            log.append(&blocks[0]).unwrap();
            log.append(&blocks[1]).unwrap();
        }
        let path = dir.path().join(LOG_FILE);
        let clean_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"sequence\":2,\"hea").unwrap();
        drop(file);

        let log = FileCommitLog::open(dir.path()).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
        assert_eq!(log.replay().unwrap().len(), 2);
        log.append(&chain_of(3)[2]).unwrap();
    }

    #[test]
    fn test_record_past_tip_is_discarded() {
        let dir = TempDir::new().unwrap();
        let blocks = chain_of(2);
        {
            let log = FileCommitLog::open(dir.path()).unwrap();
            log.append(&blocks[0]).unwrap();
        }
        // Simulate a crash after the record was written but before the tip moved.
        let path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let mut line = serde_json::to_vec(&LogRecord::from(&blocks[1])).unwrap();
        line.push(b'\n');
        file.write_all(&line).unwrap();
        drop(file);

        let log = FileCommitLog::open(dir.path()).unwrap();
        assert_eq!(log.tip().map(|t| t.sequence), Some(0));
        assert_eq!(log.replay().unwrap(), blocks[..1].to_vec());
        log.append(&blocks[1]).unwrap();
        assert_eq!(log.replay().unwrap(), blocks);
    }

    #[test]
    fn test_tip_hash_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let blocks = chain_of(1);
        {
            let log = FileCommitLog::open(dir.path()).unwrap();
            log.append(&blocks[0]).unwrap();
        }
        let bogus = TipPointer {
            sequence: 0,
            hash: hiera_types::Hash::digest(b"elsewhere"),
        };
        fs::write(dir.path().join(TIP_FILE), serde_json::to_vec(&bogus).unwrap()).unwrap();

        assert!(matches!(
            FileCommitLog::open(dir.path()),
            Err(PersistenceError::Corruption(_))
        ));
    }

    #[test]
    fn test_dir_sync_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        assert!(matches!(sync_dir(&missing), Err(PersistenceError::Io(_))));
        assert!(sync_dir(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_records_is_corruption() {
        let dir = TempDir::new().unwrap();
        let blocks = chain_of(2);
        {
            let log = FileCommitLog::open(dir.path()).unwrap();
            log.append(&blocks[0]).unwrap();
            log.append(&blocks[1]).unwrap();
        }
        fs::write(dir.path().join(LOG_FILE), b"").unwrap();
        assert!(matches!(
            FileCommitLog::open(dir.path()),
            Err(PersistenceError::Corruption(_))
        ));
    }
}
