use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use super::{wait_until, ChannelNotifier};
use crate::config::Config;
use crate::constants::{DEFAULT_KLOG_BLOCK_SIZE, SYNC_FULL};
use crate::core::item::{Item, VBucketState};
use crate::core::store::DriftStore;
use crate::core::warmup::WarmupState;
use crate::error::DriftError;
use crate::storage::kvstore::{KVStore, VbStateSnapshot};
use crate::storage::memory::MemoryKVStore;
use crate::storage::mutation_log::MutationLog;

#[test]
fn test_legal_transitions_only() {
    use WarmupState::*;
    let legal = [
        (Initialize, LoadingMutationLog),
        (LoadingMutationLog, LoadingAccessLog),
        (LoadingMutationLog, EstimateDatabaseItemCount),
        (EstimateDatabaseItemCount, KeyDump),
        (KeyDump, LoadingKVPairs),
        (KeyDump, LoadingAccessLog),
        (LoadingAccessLog, Done),
        (LoadingAccessLog, LoadingData),
        (LoadingKVPairs, Done),
        (LoadingData, Done),
    ];
    let all = [
        Initialize,
        LoadingMutationLog,
        EstimateDatabaseItemCount,
        KeyDump,
        LoadingAccessLog,
        LoadingKVPairs,
        LoadingData,
        Done,
    ];
    for from in all {
        for to in all {
            let expected = legal.contains(&(from, to));
            assert_eq!(
                from.legal_transition(to),
                expected,
                "transition {:?} -> {:?}",
                from,
                to
            );
        }
    }
}

#[test]
fn test_warmup_against_empty_store_completes() {
    let store = DriftStore::builder().start_vb0(true).build().unwrap();
    assert!(store.wait_for_warmup(Duration::from_secs(10)));
    assert!(!store.is_degraded());
    assert!(store.stats().warmup_complete.load(std::sync::atomic::Ordering::Relaxed));
}

#[test]
fn test_restart_rehydrates_from_mutation_log() {
    let dir = tempdir().unwrap();
    let klog = dir.path().join("mutation.log");
    let kv = Arc::new(MemoryKVStore::new());

    // First life: write a couple of keys and drain to disk.
    {
        let store = DriftStore::builder()
            .config(Config::new().with_mutation_log(klog.clone()))
            .kvstore(Arc::clone(&kv) as Arc<dyn KVStore>)
            .start_vb0(true)
            .build()
            .unwrap();
        assert!(store.wait_for_warmup(Duration::from_secs(10)));

        store
            .set(&Item::new(b"k1".to_vec(), 0, b"v1".to_vec()), 0, false)
            .unwrap();
        store
            .set(&Item::new(b"k2".to_vec(), 0, b"v2".to_vec()), 0, false)
            .unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            store.wake_flusher();
            kv.rowid_of(0, 1, b"k1").is_some() && kv.rowid_of(0, 1, b"k2").is_some()
        }));
        assert!(wait_until(Duration::from_secs(10), || {
            kv.list_persisted_vbuckets().contains_key(&(0, 1))
        }));
        store.shutdown(false);
    }

    // An access log naming only k1: the hot set for the second life.
    let alog_path = dir.path().join("access.log");
    {
        let alog = MutationLog::new(Some(alog_path.clone()), DEFAULT_KLOG_BLOCK_SIZE, 0);
        alog.open().unwrap();
        alog.new_item(0, b"k1", kv.rowid_of(0, 1, b"k1").unwrap())
            .unwrap();
        alog.commit1().unwrap();
        alog.commit2().unwrap();
    }

    // Second life: the log replay seeds rowids for both keys, the access
    // log brings only k1's value back resident.
    let (notifier, rx) = ChannelNotifier::new();
    let store = DriftStore::builder()
        .config(
            Config::new()
                .with_mutation_log(klog)
                .with_access_log(alog_path),
        )
        .kvstore(Arc::clone(&kv) as Arc<dyn KVStore>)
        .notifier(notifier)
        .build()
        .unwrap();
    assert!(store.wait_for_warmup(Duration::from_secs(10)));

    // Recovered vbuckets come back dead with their recorded initial state.
    let vb = store.get_vbucket(0).expect("vb0 should be recreated");
    assert_eq!(vb.state(), VBucketState::Dead);
    assert_eq!(vb.initial_state(), VBucketState::Active);
    assert_eq!(store.vbucket_version(0), 1);
    assert_eq!(vb.ht.num_items(), 2);
    assert_eq!(vb.ht.num_non_resident(), 1);
    vb.ht.with_bucket(b"k1", |b| {
        let v = b.find(b"k1", false).unwrap();
        assert!(v.is_resident());
        assert_eq!(Some(v.id()), kv.rowid_of(0, 1, b"k1"));
    });

    store.set_vbucket_state(0, VBucketState::Active);
    let hot = store.get(b"k1", 0, 7).unwrap();
    assert_eq!(hot.value().map(|v| &v[..]), Some(&b"v1"[..]));

    // The cold key rehydrates through a background fetch.
    match store.get(b"k2", 0, 7) {
        Err(DriftError::WouldBlock) => {}
        other => panic!("expected WouldBlock, got {:?}", other.map(|_| ())),
    }
    let (cookie, status) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(cookie, 7);
    assert!(status.is_ok());
    let fetched = store.get(b"k2", 0, 7).unwrap();
    assert_eq!(fetched.value().map(|v| &v[..]), Some(&b"v2"[..]));
}

fn seed_row(kv: &MemoryKVStore, key: &[u8], value: &[u8]) -> i64 {
    let mut rowid = None;
    kv.set(
        &Item::new(key.to_vec(), 0, value.to_vec()),
        1,
        &mut |(rows, id)| {
            assert_eq!(rows, 1);
            rowid = Some(id);
        },
    );
    rowid.unwrap()
}

fn seed_states(kv: &MemoryKVStore) {
    let mut states = HashMap::new();
    states.insert(
        (0u16, 1u16),
        VbStateSnapshot {
            state: VBucketState::Active,
            checkpoint_id: 2,
            max_deleted_seqno: 0,
        },
    );
    assert!(kv.snapshot_vbuckets(&states));
}

#[test]
fn test_unbracketed_log_records_are_not_visible() {
    let dir = tempdir().unwrap();
    let klog = dir.path().join("mutation.log");
    let kv = Arc::new(MemoryKVStore::new());

    let rid_a = seed_row(&kv, b"a", b"va");
    let rid_b = seed_row(&kv, b"b", b"vb");
    let rid_c = seed_row(&kv, b"c", b"vc");
    seed_states(&kv);

    // a and b are committed; c's NEW never saw COMMIT2.
    {
        let log = MutationLog::new(Some(klog.clone()), DEFAULT_KLOG_BLOCK_SIZE, SYNC_FULL);
        log.open().unwrap();
        log.new_item(0, b"a", rid_a).unwrap();
        log.new_item(0, b"b", rid_b).unwrap();
        log.commit1().unwrap();
        log.commit2().unwrap();
        log.new_item(0, b"c", rid_c).unwrap();
        log.commit1().unwrap();
    }

    let store = DriftStore::builder()
        .config(Config::new().with_mutation_log(klog))
        .kvstore(Arc::clone(&kv) as Arc<dyn KVStore>)
        .build()
        .unwrap();
    assert!(store.wait_for_warmup(Duration::from_secs(10)));

    let vb = store.get_vbucket(0).unwrap();
    store.set_vbucket_state(0, VBucketState::Active);

    // a and b are known on disk, with rowids.
    vb.ht.with_bucket(b"a", |b| {
        let v = b.find(b"a", false).expect("a must be warm");
        assert_eq!(v.id(), rid_a);
    });
    vb.ht.with_bucket(b"b", |b| {
        let v = b.find(b"b", false).expect("b must be warm");
        assert_eq!(v.id(), rid_b);
    });

    // c is not visible, and its orphaned row is scrubbed from disk.
    assert!(matches!(store.get(b"c", 0, 0), Err(DriftError::KeyNotFound)));
    assert!(wait_until(Duration::from_secs(10), || {
        store.wake_flusher();
        kv.rowid_of(0, 1, b"c").is_none()
    }));
}

#[test]
fn test_corrupt_log_falls_back_to_key_dump() {
    let dir = tempdir().unwrap();
    let klog = dir.path().join("mutation.log");
    let kv = Arc::new(MemoryKVStore::new());

    seed_row(&kv, b"a", b"va");
    seed_states(&kv);

    // A corrupted block must not abort warmup. The junk spans a whole
    // block so it survives the torn-tail truncation at open.
    {
        let log = MutationLog::new(Some(klog.clone()), DEFAULT_KLOG_BLOCK_SIZE, SYNC_FULL);
        log.open().unwrap();
        log.new_item(0, b"a", 1).unwrap();
        log.commit1().unwrap();
        log.commit2().unwrap();
    }
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&klog)
        .unwrap();
    file.write_all(&[0x55; DEFAULT_KLOG_BLOCK_SIZE]).unwrap();
    drop(file);

    let store = DriftStore::builder()
        .config(Config::new().with_mutation_log(klog))
        .kvstore(Arc::clone(&kv) as Arc<dyn KVStore>)
        .build()
        .unwrap();
    assert!(store.wait_for_warmup(Duration::from_secs(10)));

    // The key-dump fallback still found the data.
    let vb = store.get_vbucket(0).unwrap();
    assert_eq!(vb.ht.num_items(), 1);
    assert!(
        store
            .stats()
            .warmed_up_meta
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
}

#[test]
fn test_full_dump_when_key_dump_unsupported() {
    let kv = Arc::new(MemoryKVStore::new().with_key_dump_supported(false));
    seed_row(&kv, b"a", b"va");
    seed_states(&kv);

    let store = DriftStore::builder()
        .kvstore(Arc::clone(&kv) as Arc<dyn KVStore>)
        .build()
        .unwrap();
    assert!(store.wait_for_warmup(Duration::from_secs(10)));

    // LoadingKVPairs loaded full values: the item is resident.
    let vb = store.get_vbucket(0).unwrap();
    vb.ht.with_bucket(b"a", |b| {
        assert!(b.find(b"a", false).unwrap().is_resident());
    });
    store.set_vbucket_state(0, VBucketState::Active);
    let fetched = store.get(b"a", 0, 0).unwrap();
    assert_eq!(fetched.value().map(|v| &v[..]), Some(&b"va"[..]));
}
