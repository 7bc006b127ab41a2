//! Fuzz target for commit log recovery.
//!
//! Opening a log over arbitrary file contents must either succeed or report
//! an error, never panic.

#![no_main]

use hiera_storage::{CommitLog, FileCommitLog};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };

    // First byte picks which file the rest lands in.
    let (target, contents) = match data.split_first() {
        Some((b, rest)) if b % 2 == 0 => ("blocks.log", rest),
        Some((_, rest)) => ("TIP", rest),
        None => return,
    };
    if std::fs::write(dir.path().join(target), contents).is_err() {
        return;
    }

    if let Ok(log) = FileCommitLog::open(dir.path()) {
        let _ = log.tip();
        let _ = log.replay();
    }
});
