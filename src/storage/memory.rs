use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::item::{Item, QueuedItem, VBucketState};
use crate::error::{DriftError, Result};
use crate::storage::kvstore::{
    DumpItem, GetValue, KVStore, MutationResult, RowRange, StorageProperties, VbStateSnapshot,
};
use crate::storage::mutation_log::{MutationLog, MutationLogHarvester};
use crate::utils::hash::hash_key;

#[derive(Debug, Clone)]
struct Row {
    key: Vec<u8>,
    vbid: u16,
    vbver: u16,
    value: Bytes,
    flags: u32,
    exptime: u32,
    cas: u64,
    seqno: u32,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<i64, Row>,
    index: HashMap<(u16, u16, Vec<u8>), i64>,
    states: HashMap<(u16, u16), VbStateSnapshot>,
    in_txn: bool,
}

/// In-process `KVStore` with rowid assignment and full enumeration
/// support: the reference backend for tests and memory-only deployments.
///
/// Failure injection (`fail_sets`, `fail_commits`, ...) drives the
/// flusher's requeue/retry paths in tests.
pub struct MemoryKVStore {
    inner: Mutex<Inner>,
    next_rowid: AtomicI64,
    shards: usize,
    efficient_vb_deletion: bool,
    key_dump_supported: bool,
    batch_count: AtomicUsize,
    fail_sets: AtomicUsize,
    fail_deletes: AtomicUsize,
    fail_commits: AtomicUsize,
    fail_vb_deletions: AtomicUsize,
}

impl Default for MemoryKVStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKVStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_rowid: AtomicI64::new(1),
            shards: num_cpus::get().clamp(1, 4),
            efficient_vb_deletion: false,
            key_dump_supported: true,
            batch_count: AtomicUsize::new(0),
            fail_sets: AtomicUsize::new(0),
            fail_deletes: AtomicUsize::new(0),
            fail_commits: AtomicUsize::new(0),
            fail_vb_deletions: AtomicUsize::new(0),
        }
    }

    pub fn with_efficient_vb_deletion(mut self, efficient: bool) -> Self {
        self.efficient_vb_deletion = efficient;
        self
    }

    pub fn with_key_dump_supported(mut self, supported: bool) -> Self {
        self.key_dump_supported = supported;
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    /// Make the next `n` set operations report zero rows updated.
    pub fn fail_next_sets(&self, n: usize) {
        self.fail_sets.store(n, Ordering::Release);
    }

    /// Make the next `n` delete operations report a storage failure.
    pub fn fail_next_deletes(&self, n: usize) {
        self.fail_deletes.store(n, Ordering::Release);
    }

    /// Make the next `n` commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::Release);
    }

    pub fn fail_next_vb_deletions(&self, n: usize) {
        self.fail_vb_deletions.store(n, Ordering::Release);
    }

    pub fn num_rows(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn vb_batch_count(&self) -> usize {
        self.batch_count.load(Ordering::Acquire)
    }

    /// Direct row lookup for assertions: rowid of a live (vbid, vbver, key).
    pub fn rowid_of(&self, vbid: u16, vbver: u16, key: &[u8]) -> Option<i64> {
        self.inner
            .lock()
            .index
            .get(&(vbid, vbver, key.to_vec()))
            .copied()
    }

    fn consume(counter: &AtomicUsize) -> bool {
        let mut current = counter.load(Ordering::Acquire);
        while current > 0 {
            match counter.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    fn row_to_item(row: &Row, rowid: i64, partial: bool) -> Item {
        Item::with_meta(
            row.key.clone(),
            row.vbid,
            if partial { None } else { Some(row.value.clone()) },
            row.flags,
            row.exptime,
            row.cas,
            row.seqno,
            rowid,
        )
    }
}

impl KVStore for MemoryKVStore {
    fn storage_properties(&self) -> StorageProperties {
        StorageProperties {
            max_concurrency: 2,
            max_readers: 1,
            max_writers: 1,
            efficient_vb_deletion: self.efficient_vb_deletion,
            key_dump_supported: self.key_dump_supported,
        }
    }

    fn get(
        &self,
        key: &[u8],
        rowid: i64,
        vbid: u16,
        vbver: u16,
        partial: bool,
    ) -> Result<GetValue> {
        let inner = self.inner.lock();
        let resolved = if rowid >= 0 {
            Some(rowid)
        } else {
            inner.index.get(&(vbid, vbver, key.to_vec())).copied()
        };
        let rowid = resolved.ok_or(DriftError::KeyNotFound)?;
        let row = inner.rows.get(&rowid).ok_or(DriftError::KeyNotFound)?;
        if row.vbid != vbid || row.vbver != vbver || row.key != key {
            return Err(DriftError::KeyNotFound);
        }
        Ok(GetValue {
            item: Self::row_to_item(row, rowid, partial),
            partial,
        })
    }

    fn set(&self, itm: &Item, vbver: u16, cb: &mut dyn FnMut(MutationResult)) {
        if Self::consume(&self.fail_sets) {
            cb((0, 0));
            return;
        }
        let mut inner = self.inner.lock();
        let idx_key = (itm.vbucket(), vbver, itm.key().to_vec());
        let value = itm.value().cloned().unwrap_or_else(Bytes::new);
        match inner.index.get(&idx_key).copied() {
            Some(rowid) => {
                let row = inner.rows.get_mut(&rowid).expect("index points at live row");
                row.value = value;
                row.flags = itm.flags();
                row.exptime = itm.exptime();
                row.cas = itm.cas();
                row.seqno = itm.seqno();
                cb((1, 0));
            }
            None => {
                let rowid = self.next_rowid.fetch_add(1, Ordering::AcqRel);
                inner.rows.insert(
                    rowid,
                    Row {
                        key: itm.key().to_vec(),
                        vbid: itm.vbucket(),
                        vbver,
                        value,
                        flags: itm.flags(),
                        exptime: itm.exptime(),
                        cas: itm.cas(),
                        seqno: itm.seqno(),
                    },
                );
                inner.index.insert(idx_key, rowid);
                cb((1, rowid));
            }
        }
    }

    fn del(&self, itm: &Item, rowid: i64, vbver: u16, cb: &mut dyn FnMut(i32)) {
        if Self::consume(&self.fail_deletes) {
            cb(-1);
            return;
        }
        let mut inner = self.inner.lock();
        let idx_key = (itm.vbucket(), vbver, itm.key().to_vec());
        let resolved = if rowid >= 0 {
            Some(rowid)
        } else {
            inner.index.get(&idx_key).copied()
        };
        match resolved {
            Some(rowid) if inner.rows.remove(&rowid).is_some() => {
                inner.index.remove(&idx_key);
                cb(1);
            }
            _ => cb(0),
        }
    }

    fn del_vbucket(&self, vbid: u16, vbver: u16, range: Option<RowRange>) -> bool {
        if Self::consume(&self.fail_vb_deletions) {
            return false;
        }
        let mut inner = self.inner.lock();
        let doomed: Vec<i64> = inner
            .rows
            .iter()
            .filter(|(rowid, row)| {
                row.vbid == vbid
                    && row.vbver == vbver
                    && range.map(|(lo, hi)| **rowid >= lo && **rowid <= hi).unwrap_or(true)
            })
            .map(|(rowid, _)| *rowid)
            .collect();
        for rowid in doomed {
            if let Some(row) = inner.rows.remove(&rowid) {
                inner.index.remove(&(row.vbid, row.vbver, row.key));
            }
        }
        true
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.rows.clear();
        inner.index.clear();
    }

    fn snapshot_vbuckets(&self, states: &HashMap<(u16, u16), VbStateSnapshot>) -> bool {
        let mut inner = self.inner.lock();
        for (key, snapshot) in states {
            inner.states.insert(*key, snapshot.clone());
        }
        true
    }

    fn list_persisted_vbuckets(&self) -> HashMap<(u16, u16), VbStateSnapshot> {
        self.inner.lock().states.clone()
    }

    fn dump(&self, cb: &mut dyn FnMut(DumpItem)) {
        let snapshot: Vec<(i64, Row)> = {
            let inner = self.inner.lock();
            inner.rows.iter().map(|(id, row)| (*id, row.clone())).collect()
        };
        for (rowid, row) in snapshot {
            let vbver = row.vbver;
            cb(DumpItem {
                item: Self::row_to_item(&row, rowid, false),
                vb_version: vbver,
            });
        }
    }

    fn dump_keys(&self, vbids: &[u16], cb: &mut dyn FnMut(DumpItem)) {
        let snapshot: Vec<(i64, Row)> = {
            let inner = self.inner.lock();
            inner
                .rows
                .iter()
                .filter(|(_, row)| vbids.contains(&row.vbid))
                .map(|(id, row)| (*id, row.clone()))
                .collect()
        };
        for (rowid, row) in snapshot {
            let vbver = row.vbver;
            cb(DumpItem {
                item: Self::row_to_item(&row, rowid, true),
                vb_version: vbver,
            });
        }
    }

    fn warmup(
        &self,
        access_log: &MutationLog,
        states: &HashMap<(u16, u16), VbStateSnapshot>,
        cb: &mut dyn FnMut(DumpItem),
        estimate: &mut dyn FnMut(usize),
    ) -> Result<usize> {
        let mut harvester = MutationLogHarvester::new();
        for (vbid, vbver) in states.keys() {
            harvester.set_vbucket_version(*vbid, *vbver);
        }
        harvester.load(access_log)?;
        estimate(harvester.total());

        let versions: HashMap<u16, u16> =
            states.keys().map(|(vbid, vbver)| (*vbid, *vbver)).collect();
        let mut loaded = 0;
        let mut hot: Vec<(u16, Vec<u8>)> = Vec::new();
        harvester.apply(&mut |vbid, key, _rowid| {
            hot.push((vbid, key.to_vec()));
        });
        for (vbid, key) in hot {
            let Some(&vbver) = versions.get(&vbid) else {
                continue;
            };
            let found = {
                let inner = self.inner.lock();
                inner
                    .index
                    .get(&(vbid, vbver, key.clone()))
                    .copied()
                    .and_then(|rowid| {
                        inner
                            .rows
                            .get(&rowid)
                            .map(|row| (rowid, row.clone()))
                    })
            };
            if let Some((rowid, row)) = found {
                cb(DumpItem {
                    item: Self::row_to_item(&row, rowid, false),
                    vb_version: row.vbver,
                });
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    fn estimated_item_count(&self) -> usize {
        self.inner.lock().rows.len()
    }

    fn num_shards(&self) -> usize {
        self.shards
    }

    fn shard_id(&self, qi: &QueuedItem) -> usize {
        hash_key(&qi.key) as usize % self.shards
    }

    fn optimize_writes(&self, items: &mut [Arc<QueuedItem>]) {
        // Locality ordering: group by key, older rows first.
        items.sort_by(|a, b| a.key.cmp(&b.key).then(a.rowid.cmp(&b.rowid)));
    }

    fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.in_txn = true;
        true
    }

    fn commit(&self) -> bool {
        if Self::consume(&self.fail_commits) {
            return false;
        }
        let mut inner = self.inner.lock();
        inner.in_txn = false;
        true
    }

    fn vb_state_changed(&self, vbid: u16, state: VBucketState) {
        let mut inner = self.inner.lock();
        // Refresh the state for whichever version of this vbid we know.
        let keys: Vec<(u16, u16)> = inner
            .states
            .keys()
            .filter(|(id, _)| *id == vbid)
            .copied()
            .collect();
        for key in keys {
            if let Some(snapshot) = inner.states.get_mut(&key) {
                snapshot.state = state;
            }
        }
    }

    fn set_vb_batch_count(&self, n: usize) {
        self.batch_count.store(n, Ordering::Release);
    }
}
