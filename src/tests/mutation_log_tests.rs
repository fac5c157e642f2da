use std::io::Write;
use tempfile::tempdir;

use crate::constants::{DEFAULT_KLOG_BLOCK_SIZE, SYNC_FULL};
use crate::error::DriftError;
use crate::storage::mutation_log::{LogEntryType, MutationLog, MutationLogHarvester};

fn new_log(path: &std::path::Path) -> MutationLog {
    MutationLog::new(Some(path.to_path_buf()), DEFAULT_KLOG_BLOCK_SIZE, SYNC_FULL)
}

#[test]
fn test_roundtrip_entries() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    let log = new_log(&path);
    log.open().unwrap();

    log.new_item(3, b"alpha", 11).unwrap();
    log.del_item(3, b"beta").unwrap();
    log.delete_all(7).unwrap();
    log.commit1().unwrap();
    log.commit2().unwrap();

    let entries = log.read_entries().unwrap();
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[0].kind, LogEntryType::New);
    assert_eq!(entries[0].vbucket, 3);
    assert_eq!(entries[0].rowid, 11);
    assert_eq!(entries[0].key, b"alpha".to_vec());
    assert_eq!(entries[1].kind, LogEntryType::Del);
    assert_eq!(entries[2].kind, LogEntryType::DelAll);
    assert_eq!(entries[3].kind, LogEntryType::Commit1);
    assert_eq!(entries[4].kind, LogEntryType::Commit2);
}

#[test]
fn test_reopen_appends() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    {
        let log = new_log(&path);
        log.open().unwrap();
        log.new_item(0, b"a", 1).unwrap();
        log.commit1().unwrap();
        log.commit2().unwrap();
    }
    {
        let log = new_log(&path);
        log.open().unwrap();
        log.new_item(0, b"b", 2).unwrap();
        log.commit1().unwrap();
        log.commit2().unwrap();
        let entries = log.read_entries().unwrap();
        let news: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == LogEntryType::New)
            .collect();
        assert_eq!(news.len(), 2);
    }
}

#[test]
fn test_harvester_commit_bracketing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    let log = new_log(&path);
    log.open().unwrap();

    // a and b are bracketed by both commit markers; c is not.
    log.new_item(0, b"a", 1).unwrap();
    log.new_item(0, b"b", 2).unwrap();
    log.commit1().unwrap();
    log.commit2().unwrap();
    log.new_item(0, b"c", 3).unwrap();
    log.commit1().unwrap();

    let mut harvester = MutationLogHarvester::new();
    harvester.load(&log).unwrap();
    assert_eq!(harvester.total(), 2);

    let mut committed = Vec::new();
    harvester.apply(&mut |vb, key, rowid| committed.push((vb, key.to_vec(), rowid)));
    committed.sort();
    assert_eq!(
        committed,
        vec![(0, b"a".to_vec(), 1), (0, b"b".to_vec(), 2)]
    );

    let uncommitted = harvester.uncommitted();
    assert_eq!(uncommitted.len(), 1);
    assert_eq!(uncommitted[0].key, b"c".to_vec());
    assert_eq!(uncommitted[0].rowid, 3);
}

#[test]
fn test_harvester_del_and_delall() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    let log = new_log(&path);
    log.open().unwrap();

    log.new_item(0, b"a", 1).unwrap();
    log.new_item(1, b"b", 2).unwrap();
    log.del_item(0, b"a").unwrap();
    log.delete_all(1).unwrap();
    log.new_item(1, b"c", 3).unwrap();
    log.commit1().unwrap();
    log.commit2().unwrap();

    let mut harvester = MutationLogHarvester::new();
    harvester.load(&log).unwrap();
    let mut committed = Vec::new();
    harvester.apply(&mut |vb, key, rowid| committed.push((vb, key.to_vec(), rowid)));
    // a deleted, vb1 wiped then c re-added after the wipe.
    assert_eq!(committed, vec![(1, b"c".to_vec(), 3)]);
}

#[test]
fn test_harvester_vbucket_filter() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    let log = new_log(&path);
    log.open().unwrap();
    log.new_item(0, b"a", 1).unwrap();
    log.new_item(5, b"b", 2).unwrap();
    log.commit1().unwrap();
    log.commit2().unwrap();

    let mut harvester = MutationLogHarvester::new();
    harvester.set_vbucket_version(0, 1);
    harvester.load(&log).unwrap();
    assert_eq!(harvester.total(), 1);
}

#[test]
fn test_truncated_tail_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    {
        let log = new_log(&path);
        log.open().unwrap();
        log.new_item(0, b"a", 1).unwrap();
        log.commit1().unwrap();
        log.commit2().unwrap();
    }
    // Simulate a torn write at the end of the file.
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap();
    file.write_all(&[0xAB; 100]).unwrap();
    drop(file);

    let log = new_log(&path);
    assert!(matches!(
        log.read_entries(),
        Err(DriftError::CorruptedLog(_))
    ));
}

#[test]
fn test_checksum_mismatch_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    {
        let log = new_log(&path);
        log.open().unwrap();
        log.new_item(0, b"a", 1).unwrap();
        log.commit1().unwrap();
        log.commit2().unwrap();
    }
    // Flip a byte inside the first data block.
    let mut bytes = std::fs::read(&path).unwrap();
    let offset = DEFAULT_KLOG_BLOCK_SIZE + 10;
    bytes[offset] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let log = new_log(&path);
    assert!(matches!(
        log.read_entries(),
        Err(DriftError::CorruptedLog(_))
    ));
}

#[test]
fn test_compaction_keeps_latest_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    let log = new_log(&path);
    log.open().unwrap();

    // The same key rewritten many times compacts to one record.
    for round in 0..50 {
        log.new_item(0, b"hot", 100 + round).unwrap();
        log.commit1().unwrap();
        log.commit2().unwrap();
    }
    log.del_item(0, b"gone").unwrap();
    log.commit1().unwrap();
    log.commit2().unwrap();

    let before = log.file_size();
    log.compact().unwrap();
    assert!(log.file_size() < before);

    let mut harvester = MutationLogHarvester::new();
    harvester.load(&log).unwrap();
    assert_eq!(harvester.total(), 1);
    let mut committed = Vec::new();
    harvester.apply(&mut |_, key, rowid| committed.push((key.to_vec(), rowid)));
    assert_eq!(committed, vec![(b"hot".to_vec(), 149)]);

    // The compacted log keeps accepting appends.
    log.new_item(0, b"post", 500).unwrap();
    log.commit1().unwrap();
    log.commit2().unwrap();
    let mut harvester = MutationLogHarvester::new();
    harvester.load(&log).unwrap();
    assert_eq!(harvester.total(), 2);
}

#[test]
fn test_reset_truncates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mutation.log");
    let log = new_log(&path);
    log.open().unwrap();
    log.new_item(0, b"a", 1).unwrap();
    log.commit1().unwrap();
    log.commit2().unwrap();

    assert!(log.reset().unwrap());
    assert!(log.read_entries().unwrap().is_empty());
    assert_eq!(log.item_entries(), 0);
}

#[test]
fn test_disabled_log_is_inert() {
    let log = MutationLog::new(None, DEFAULT_KLOG_BLOCK_SIZE, SYNC_FULL);
    assert!(!log.is_enabled());
    assert!(!log.exists());
    log.open().unwrap();
    log.new_item(0, b"a", 1).unwrap();
    log.commit1().unwrap();
    log.commit2().unwrap();
    assert!(log.read_entries().unwrap().is_empty());
    assert!(!log.reset().unwrap());
}
