use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{wait_until, ChannelNotifier};
use crate::core::item::{Item, VBucketState};
use crate::core::store::DriftStore;
use crate::error::DriftError;
use crate::storage::flusher::FlusherState;
use crate::storage::kvstore::KVStore;
use crate::storage::memory::MemoryKVStore;

fn make_store() -> (
    Arc<DriftStore>,
    Arc<MemoryKVStore>,
    crossbeam_channel::Receiver<(u64, crate::error::Result<()>)>,
) {
    let kv = Arc::new(MemoryKVStore::new());
    let (notifier, rx) = ChannelNotifier::new();
    let store = DriftStore::builder()
        .kvstore(Arc::clone(&kv) as Arc<dyn crate::storage::kvstore::KVStore>)
        .notifier(notifier)
        .start_vb0(true)
        .build()
        .unwrap();
    assert!(store.wait_for_warmup(Duration::from_secs(10)));
    (store, kv, rx)
}

fn item(key: &[u8], vbid: u16, value: &[u8]) -> Item {
    Item::new(key.to_vec(), vbid, value.to_vec())
}

#[test]
fn test_state_transitions_are_observable() {
    let (store, _, _) = make_store();
    assert_eq!(store.vbucket_state(0), Some(VBucketState::Active));

    store.set_vbucket_state(0, VBucketState::Replica);
    assert_eq!(store.vbucket_state(0), Some(VBucketState::Replica));

    store.set_vbucket_state(0, VBucketState::Dead);
    assert!(matches!(
        store.get(b"x", 0, 0),
        Err(DriftError::NotMyVbucket)
    ));
}

#[test]
fn test_pending_vbucket_parks_and_notifies() {
    let (store, _, rx) = make_store();
    store.set_vbucket_state(3, VBucketState::Pending);

    // Operations suspend, registering their cookies.
    assert!(matches!(
        store.set(&item(b"x", 3, b"1"), 21, false),
        Err(DriftError::WouldBlock)
    ));
    assert!(matches!(
        store.get(b"x", 3, 22),
        Err(DriftError::WouldBlock)
    ));
    assert!(rx.try_recv().is_err());
    assert_eq!(store.stats().pending_ops.load(Ordering::Relaxed), 2);

    // Activation fires every parked cookie exactly once.
    store.set_vbucket_state(3, VBucketState::Active);
    let mut cookies = vec![
        rx.recv_timeout(Duration::from_secs(5)).unwrap().0,
        rx.recv_timeout(Duration::from_secs(5)).unwrap().0,
    ];
    cookies.sort_unstable();
    assert_eq!(cookies, vec![21, 22]);
    assert!(rx.try_recv().is_err());
    assert_eq!(store.stats().pending_ops.load(Ordering::Relaxed), 0);

    store.set(&item(b"x", 3, b"1"), 21, false).unwrap();
}

#[test]
fn test_vbucket_version_bump_drops_stale_writes() {
    let (store, kv, _) = make_store();
    assert!(wait_until(Duration::from_secs(10), || {
        store.flusher().state() == FlusherState::Running
    }));
    store.flusher().pause();
    std::thread::sleep(Duration::from_millis(100));

    // Queue a backfill write against version 1, then reset: the write
    // must be silently dropped by the flusher.
    store
        .add_tap_backfill_item(&item(b"stale", 0, b"v"), false)
        .unwrap();
    let vb = store.get_vbucket(0).unwrap();
    assert_eq!(vb.backfill_size(), 1);

    assert!(store.reset_vbucket(0));
    assert_eq!(store.vbucket_version(0), 2);

    store.flusher().resume();
    store.wake_flusher();
    // Give the flusher time to run the (dropped) write.
    std::thread::sleep(Duration::from_millis(500));
    store.wake_flusher();
    assert!(wait_until(Duration::from_secs(5), || vb.backfill_size() == 0));
    assert_eq!(kv.rowid_of(0, 1, b"stale"), None);
    assert_eq!(kv.rowid_of(0, 2, b"stale"), None);
}

#[test]
fn test_delete_vbucket_requires_dead_state() {
    let (store, kv, _) = make_store();
    store.set(&item(b"a", 0, b"1"), 0, false).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        store.wake_flusher();
        kv.rowid_of(0, 1, b"a").is_some()
    }));

    assert!(!store.delete_vbucket(0), "active vbucket must not delete");

    store.set_vbucket_state(0, VBucketState::Dead);
    assert!(store.delete_vbucket(0));
    assert!(store.get_vbucket(0).is_none());

    // The deletion task scrubs the rows and releases the vbid.
    assert!(wait_until(Duration::from_secs(10), || {
        kv.rowid_of(0, 1, b"a").is_none()
    }));
    assert!(wait_until(Duration::from_secs(10), || {
        !store.is_vbucket_deletion_scheduled(0)
    }));
}

#[test]
fn test_reset_vbucket_clears_memory() {
    let (store, _, _) = make_store();
    store.set(&item(b"a", 0, b"1"), 0, false).unwrap();
    assert!(store.reset_vbucket(0));

    let vb = store.get_vbucket(0).unwrap();
    assert_eq!(vb.ht.num_items(), 0);
    assert!(matches!(store.get(b"a", 0, 0), Err(DriftError::KeyNotFound)));

    // An empty vbucket reset is a no-op success.
    assert!(store.reset_vbucket(0));
}

#[test]
fn test_state_snapshot_reaches_backing_store() {
    let (store, kv, _) = make_store();
    assert!(wait_until(Duration::from_secs(10), || {
        kv.list_persisted_vbuckets()
            .get(&(0, 1))
            .map(|s| s.state == VBucketState::Active)
            .unwrap_or(false)
    }));

    store.set_vbucket_state(0, VBucketState::Replica);
    assert!(wait_until(Duration::from_secs(10), || {
        kv.list_persisted_vbuckets()
            .get(&(0, 1))
            .map(|s| s.state == VBucketState::Replica)
            .unwrap_or(false)
    }));
}

#[test]
fn test_tap_throttle_tracks_memory_pressure() {
    let (store, _, _) = make_store();
    assert!(!store.should_throttle_tap());
}
