use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::constants::GB;
use crate::core::hash_table::{AddStatus, HashTable, InsertStatus, Reaped, SetStatus};
use crate::core::item::Item;
use crate::stats::Statistics;
use crate::utils::unix_now;

fn make_ht() -> HashTable {
    HashTable::new(
        64,
        Arc::new(Statistics::new(GB)),
        Arc::new(AtomicU64::new(1)),
    )
}

fn item(key: &[u8], value: &[u8]) -> Item {
    Item::new(key.to_vec(), 0, value.to_vec())
}

#[test]
fn test_set_inserts_and_finds() {
    let ht = make_ht();
    let now = unix_now();
    let (status, rowid) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"1"), 0, true, false, now));
    assert_eq!(status, SetStatus::NotFound);
    assert_eq!(rowid, -1);
    assert_eq!(ht.num_items(), 1);

    ht.with_bucket(b"a", |b| {
        let v = b.find(b"a", false).expect("value should exist");
        assert!(v.is_dirty());
        assert!(v.is_resident());
        assert_eq!(v.value().map(|v| &v[..]), Some(&b"1"[..]));
    });
}

#[test]
fn test_set_update_reports_prior_dirtiness() {
    let ht = make_ht();
    let now = unix_now();
    ht.with_bucket(b"a", |b| b.set(&item(b"a", b"1"), 0, true, false, now));

    let (status, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"2"), 0, true, false, now));
    assert_eq!(status, SetStatus::WasDirty);

    ht.with_bucket(b"a", |b| b.find(b"a", false).unwrap().mark_clean());
    let (status, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"3"), 0, true, false, now));
    assert_eq!(status, SetStatus::WasClean);
}

#[test]
fn test_cas_discipline() {
    let ht = make_ht();
    let now = unix_now();
    ht.with_bucket(b"a", |b| b.set(&item(b"a", b"1"), 0, true, false, now));
    let cas = ht.with_bucket(b"a", |b| b.find(b"a", false).unwrap().cas());

    // Exact match succeeds, stale fails, missing key with CAS fails.
    let (status, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"2"), cas, true, false, now));
    assert!(matches!(status, SetStatus::WasDirty | SetStatus::WasClean));
    let (status, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"3"), cas, true, false, now));
    assert_eq!(status, SetStatus::InvalidCas);
    let (status, _) = ht.with_bucket(b"x", |b| b.set(&item(b"x", b"1"), 99, true, false, now));
    assert_eq!(status, SetStatus::NotFound);
}

#[test]
fn test_cas_is_monotonic() {
    let ht = make_ht();
    let now = unix_now();
    let mut last = 0;
    for i in 0..50 {
        let key = format!("key{}", i);
        ht.with_bucket(key.as_bytes(), |b| {
            b.set(&item(key.as_bytes(), b"v"), 0, true, false, now)
        });
        let cas = ht.with_bucket(key.as_bytes(), |b| b.find(key.as_bytes(), false).unwrap().cas());
        assert!(cas > last, "cas must increase monotonically");
        last = cas;
    }
}

#[test]
fn test_locked_value_rejects_mutations() {
    let ht = make_ht();
    let now = unix_now();
    ht.with_bucket(b"a", |b| b.set(&item(b"a", b"1"), 0, true, false, now));
    let cas = ht.with_bucket(b"a", |b| {
        let v = b.find(b"a", false).unwrap();
        v.lock(now + 100);
        v.cas()
    });

    let (status, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"2"), 0, true, false, now));
    assert_eq!(status, SetStatus::IsLocked);
    assert_eq!(
        ht.with_bucket(b"a", |b| b.soft_delete(b"a", 0, None, now)),
        SetStatus::IsLocked
    );

    // Presenting the exact CAS unlocks and applies.
    let (status, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"2"), cas, true, false, now));
    assert!(matches!(status, SetStatus::WasClean | SetStatus::WasDirty));
    ht.with_bucket(b"a", |b| {
        assert!(!b.find(b"a", false).unwrap().is_locked(now));
    });
}

#[test]
fn test_add_exists_and_undel() {
    let ht = make_ht();
    let now = unix_now();
    assert_eq!(
        ht.with_bucket(b"a", |b| b.add(&item(b"a", b"1"), now)),
        AddStatus::Success
    );
    assert_eq!(
        ht.with_bucket(b"a", |b| b.add(&item(b"a", b"2"), now)),
        AddStatus::Exists
    );

    ht.with_bucket(b"a", |b| b.soft_delete(b"a", 0, None, now));
    assert_eq!(
        ht.with_bucket(b"a", |b| b.add(&item(b"a", b"3"), now)),
        AddStatus::UnDel
    );
    ht.with_bucket(b"a", |b| {
        let v = b.find(b"a", false).unwrap();
        assert!(!v.is_deleted());
        assert_eq!(v.value().map(|v| &v[..]), Some(&b"3"[..]));
    });
}

#[test]
fn test_soft_delete_preserves_metadata() {
    let ht = make_ht();
    let now = unix_now();
    ht.with_bucket(b"a", |b| b.set(&item(b"a", b"12345"), 0, true, false, now));
    let status = ht.with_bucket(b"a", |b| b.soft_delete(b"a", 0, None, now));
    assert_eq!(status, SetStatus::WasDirty);

    assert_eq!(ht.num_items(), 0);
    assert_eq!(ht.num_deleted(), 1);
    ht.with_bucket(b"a", |b| {
        assert!(b.find(b"a", false).is_none());
        let v = b.find(b"a", true).unwrap();
        assert!(v.is_deleted());
        assert!(v.value().is_none());
        assert!(v.seqno() > 0);
    });
    assert!(ht.max_deleted_seqno() > 0);

    assert_eq!(
        ht.with_bucket(b"a", |b| b.soft_delete(b"a", 0, None, now)),
        SetStatus::NotFound
    );
    assert_eq!(
        ht.with_bucket(b"zz", |b| b.soft_delete(b"zz", 0, None, now)),
        SetStatus::NotFound
    );
}

#[test]
fn test_soft_delete_with_meta_seqno() {
    let ht = make_ht();
    let now = unix_now();
    ht.with_bucket(b"a", |b| b.set(&item(b"a", b"1"), 0, true, false, now));
    ht.with_bucket(b"a", |b| b.soft_delete(b"a", 0, Some(42), now));
    ht.with_bucket(b"a", |b| {
        assert_eq!(b.find(b"a", true).unwrap().seqno(), 42);
    });
    assert_eq!(ht.max_deleted_seqno(), 42);
}

#[test]
fn test_temp_deleted_item_lifecycle() {
    let ht = make_ht();
    let now = unix_now();
    assert_eq!(
        ht.with_bucket(b"t", |b| b.add_temp_deleted_item(b"t", now + 10)),
        AddStatus::Success
    );
    assert_eq!(ht.num_temp_items(), 1);
    assert_eq!(ht.num_items(), 0);

    // A second temp insert for the same key is refused.
    assert_eq!(
        ht.with_bucket(b"t", |b| b.add_temp_deleted_item(b"t", now + 10)),
        AddStatus::Exists
    );

    // Metadata fetch found nothing: the placeholder turns non-existent.
    ht.with_bucket(b"t", |b| {
        assert!(b.restore_meta(b"t", None, 10, now));
        assert!(b.find(b"t", true).unwrap().is_temp_non_existent());
    });

    // An expired temp item is reaped outright, without queueing a delete.
    assert_eq!(
        ht.with_bucket(b"t", |b| b.reap_expired(b"t", now + 100)),
        Reaped::TempReaped
    );
    assert_eq!(ht.num_temp_items(), 0);
}

#[test]
fn test_restore_meta_promotes_to_non_resident_value() {
    let ht = make_ht();
    let now = unix_now();
    ht.with_bucket(b"t", |b| b.add_temp_deleted_item(b"t", now + 10));

    let disk = Item::with_meta(b"t".to_vec(), 0, None, 7, 0, 123, 5, 99);
    ht.with_bucket(b"t", |b| {
        assert!(b.restore_meta(b"t", Some(&disk), 10, now));
        let v = b.find(b"t", false).unwrap();
        assert!(!v.is_temp());
        assert!(!v.is_resident());
        assert_eq!(v.id(), 99);
        assert_eq!(v.cas(), 123);
        assert_eq!(v.seqno(), 5);
    });
    assert_eq!(ht.num_non_resident(), 1);
    assert_eq!(ht.num_items(), 1);
}

#[test]
fn test_eject_and_restore_value() {
    let ht = make_ht();
    let now = unix_now();
    ht.with_bucket(b"a", |b| b.set(&item(b"a", b"payload"), 0, true, false, now));

    // Dirty values must not leave memory.
    assert!(!ht.with_bucket(b"a", |b| b.eject_value(b"a")));

    ht.with_bucket(b"a", |b| {
        let v = b.find(b"a", false).unwrap();
        v.mark_clean();
        v.id = 17;
    });
    assert!(ht.with_bucket(b"a", |b| b.eject_value(b"a")));
    assert_eq!(ht.num_non_resident(), 1);
    ht.with_bucket(b"a", |b| {
        let v = b.find(b"a", false).unwrap();
        assert!(!v.is_resident());
        assert_eq!(v.id(), 17);
    });

    assert!(ht.with_bucket(b"a", |b| b.restore_value(b"a", b"payload".to_vec().into())));
    assert_eq!(ht.num_non_resident(), 0);
    ht.with_bucket(b"a", |b| {
        assert!(b.find(b"a", false).unwrap().is_resident());
    });
}

#[test]
fn test_warm_insert_and_dup() {
    let ht = make_ht();
    let mut disk_item = item(b"a", b"v");
    disk_item.set_rowid(3);
    assert_eq!(
        ht.with_bucket(b"a", |b| b.warm_insert(&disk_item, false, false)),
        InsertStatus::Ok
    );
    ht.with_bucket(b"a", |b| {
        let v = b.find(b"a", false).unwrap();
        assert!(!v.is_dirty());
        assert_eq!(v.id(), 3);
    });

    assert_eq!(
        ht.with_bucket(b"a", |b| b.warm_insert(&disk_item, false, false)),
        InsertStatus::Dup
    );
}

#[test]
fn test_warm_insert_partial_is_non_resident() {
    let ht = make_ht();
    let mut disk_item = item(b"a", b"v");
    disk_item.set_rowid(5);
    assert_eq!(
        ht.with_bucket(b"a", |b| b.warm_insert(&disk_item, false, true)),
        InsertStatus::Ok
    );
    assert_eq!(ht.num_non_resident(), 1);
    ht.with_bucket(b"a", |b| {
        let v = b.find(b"a", false).unwrap();
        assert!(!v.is_resident());
        assert_eq!(v.id(), 5);
    });
}

#[test]
fn test_nomem_when_over_quota() {
    let ht = HashTable::new(
        64,
        Arc::new(Statistics::new(16)),
        Arc::new(AtomicU64::new(1)),
    );
    let now = unix_now();
    let (status, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"1"), 0, true, false, now));
    assert_eq!(status, SetStatus::NoMem);
    assert_eq!(
        ht.with_bucket(b"a", |b| b.add(&item(b"a", b"1"), now)),
        AddStatus::NoMem
    );
}

#[test]
fn test_lazy_expiry_soft_deletes() {
    let ht = make_ht();
    let now = unix_now();
    let mut itm = item(b"a", b"1");
    itm.set_exptime(now.saturating_sub(5));
    ht.with_bucket(b"a", |b| b.set(&itm, 0, true, false, now));

    let reaped = ht.with_bucket(b"a", |b| b.reap_expired(b"a", now));
    match reaped {
        Reaped::Expired { seqno, rowid } => {
            assert!(seqno > 0);
            assert_eq!(rowid, -1);
        }
        other => panic!("expected Expired, got {:?}", other),
    }
    ht.with_bucket(b"a", |b| {
        assert!(b.find(b"a", false).is_none());
        assert!(b.find(b"a", true).unwrap().is_deleted());
    });

    // Tombstones do not re-expire.
    assert_eq!(
        ht.with_bucket(b"a", |b| b.reap_expired(b"a", now)),
        Reaped::NotExpired
    );
}

#[test]
fn test_resize_preserves_contents() {
    let ht = make_ht();
    let now = unix_now();
    for i in 0..500 {
        let key = format!("key{}", i);
        ht.with_bucket(key.as_bytes(), |b| {
            b.set(&item(key.as_bytes(), b"v"), 0, true, false, now)
        });
    }
    let before = ht.num_buckets();
    ht.resize();
    assert!(ht.num_buckets() > before);
    assert_eq!(ht.num_items(), 500);
    for i in 0..500 {
        let key = format!("key{}", i);
        ht.with_bucket(key.as_bytes(), |b| {
            assert!(b.find(key.as_bytes(), false).is_some());
        });
    }
}

#[test]
fn test_clear_releases_everything() {
    let stats = Arc::new(Statistics::new(GB));
    let ht = HashTable::new(64, Arc::clone(&stats), Arc::new(AtomicU64::new(1)));
    let now = unix_now();
    for i in 0..20 {
        let key = format!("key{}", i);
        ht.with_bucket(key.as_bytes(), |b| {
            b.set(&item(key.as_bytes(), b"value"), 0, true, false, now)
        });
    }
    assert!(ht.mem_size() > 0);
    let freed = ht.clear();
    assert!(freed > 0);
    assert_eq!(ht.num_items(), 0);
    assert_eq!(ht.mem_size(), 0);
    assert_eq!(stats.mem_used(), 0);
}

#[test]
fn test_concurrent_same_key_operations_serialize() {
    use std::thread;
    let ht = Arc::new(make_ht());
    let mut handles = vec![];
    for _ in 0..8 {
        let ht = Arc::clone(&ht);
        handles.push(thread::spawn(move || {
            let now = unix_now();
            for i in 0..200 {
                let value = format!("v{}", i);
                ht.with_bucket(b"shared", |b| {
                    b.set(&item(b"shared", value.as_bytes()), 0, true, false, now)
                });
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(ht.num_items(), 1);
    ht.with_bucket(b"shared", |b| {
        assert!(b.find(b"shared", false).is_some());
    });
}
