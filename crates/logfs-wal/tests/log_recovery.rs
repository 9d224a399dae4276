//! Crash and restart behaviour of the log over a file-backed device.

use std::sync::Arc;

use logfs_storage::{FileDevice, Region};
use logfs_wal::{
    CopyDecision, KeepAll, LogConfig, LogEntry, LogFile, LogOp, SegmentKind, SweepPolicy,
    WalError, WalResult,
};

const BSIZE: u64 = 1024;

fn config() -> LogConfig {
    LogConfig {
        block_size: BSIZE as u32,
        reserve_blocks: 3,
    }
}

fn open_region(path: &std::path::Path) -> Region {
    Region::whole(Arc::new(FileDevice::open(path).unwrap()))
}

fn trunc(seq: u64, path: u32) -> LogEntry {
    LogEntry::new(
        seq,
        path,
        LogOp::Trunc {
            mtime: seq as u32,
            cvers: 1,
            muid: "adm".to_string(),
        },
    )
}

/// Keeps only entries for even paths.
struct EvenPaths;

impl SweepPolicy for EvenPaths {
    fn decide(&mut self, entry: &LogEntry) -> WalResult<CopyDecision> {
        Ok(if entry.path % 2 == 0 {
            CopyDecision::Keep
        } else {
            CopyDecision::Discard
        })
    }
}

#[test]
fn test_flushed_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.img");
    FileDevice::create(&path, 32 * BSIZE).unwrap();

    let mut log = LogFile::format(open_region(&path), config()).unwrap();
    for seq in 1..=100 {
        log.append(&trunc(seq, seq as u32), &mut KeepAll).unwrap();
    }
    log.flush().unwrap();
    drop(log);

    let log = LogFile::open(open_region(&path), config()).unwrap();
    let mut seqs = Vec::new();
    log.replay(SegmentKind::Active, |e: &LogEntry| -> Result<(), WalError> {
        seqs.push(e.seq);
        Ok(())
    })
    .unwrap();
    assert_eq!(seqs, (1..=100).collect::<Vec<_>>());
}

#[test]
fn test_sweep_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.img");
    FileDevice::create(&path, 32 * BSIZE).unwrap();

    let mut log = LogFile::format(open_region(&path), config()).unwrap();
    for seq in 1..=100 {
        log.append(&trunc(seq, seq as u32), &mut KeepAll).unwrap();
    }
    let blocks_before = log.segment_blocks(SegmentKind::Active);
    log.sweep(&mut EvenPaths).unwrap();
    assert!(log.segment_blocks(SegmentKind::Active) < blocks_before);
    assert_eq!(log.stats().entries_discarded, 50);
    drop(log);

    let mut log = LogFile::open(open_region(&path), config()).unwrap();
    let paths: Vec<u32> = log
        .entries(SegmentKind::Active)
        .unwrap()
        .iter()
        .map(|e| e.path)
        .collect();
    assert_eq!(paths, (1..=50).map(|p| p * 2).collect::<Vec<_>>());
    assert_eq!(log.segment_blocks(SegmentKind::Swept), 0);
}

#[test]
fn test_replay_error_propagates() {
    #[derive(Debug)]
    enum ApplyError {
        Wal(WalError),
        Rejected(u64),
    }

    impl From<WalError> for ApplyError {
        fn from(e: WalError) -> Self {
            ApplyError::Wal(e)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.img");
    FileDevice::create(&path, 8 * BSIZE).unwrap();
    let mut log = LogFile::format(open_region(&path), config()).unwrap();
    for seq in 1..=3 {
        log.append(&trunc(seq, 1), &mut KeepAll).unwrap();
    }
    log.flush().unwrap();

    let mut applied = 0;
    let err = log
        .replay(SegmentKind::Active, |e: &LogEntry| {
            if e.seq == 2 {
                return Err(ApplyError::Rejected(e.seq));
            }
            applied += 1;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, ApplyError::Rejected(2)));
    assert_eq!(applied, 1);
}
