use bytes::Bytes;
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::{MAX_HT_BUCKETS, MIN_HT_BUCKETS};
use crate::core::item::{Item, StoredValue};
use crate::stats::Statistics;
use crate::utils::hash::hash_key;

/// Outcome of a mutating hash-table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatus {
    /// No such key. For a CAS=0 set this doubles as "inserted".
    NotFound,
    WasClean,
    WasDirty,
    InvalidCas,
    IsLocked,
    NoMem,
    /// Caller supplied metadata that cannot be merged while only a temp
    /// placeholder exists; a metadata fetch must complete first.
    NeedMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    Success,
    Exists,
    /// Revived a deleted tombstone.
    UnDel,
    NoMem,
}

/// Outcome of a warmup-path insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    Ok,
    /// The key is already in memory; the disk copy was ignored.
    Dup,
    NoMem,
}

/// Result of the lazy-expiry sweep performed before most lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    NotExpired,
    /// An expired temp placeholder was dropped outright.
    TempReaped,
    /// A live value expired and was soft-deleted; the caller must queue
    /// the deletion.
    Expired { seqno: u32, rowid: i64 },
}

/// Striped-bucket chained hash table of `StoredValue`s.
///
/// Every bucket carries its own mutex; all operations on a key lock exactly
/// one bucket. Resizing is a stop-the-table operation behind the outer
/// `RwLock` write lock, while normal operations share the read lock.
pub struct HashTable {
    inner: RwLock<Vec<CachePadded<Mutex<Vec<StoredValue>>>>>,
    stats: Arc<Statistics>,
    cas_counter: Arc<AtomicU64>,
    num_items: AtomicUsize,
    num_deleted: AtomicUsize,
    num_temp: AtomicUsize,
    num_non_resident: AtomicUsize,
    mem_size: AtomicUsize,
    max_deleted_seqno: AtomicU32,
}

impl HashTable {
    pub fn new(
        initial_buckets: usize,
        stats: Arc<Statistics>,
        cas_counter: Arc<AtomicU64>,
    ) -> Self {
        let size = initial_buckets
            .next_power_of_two()
            .clamp(MIN_HT_BUCKETS, MAX_HT_BUCKETS);
        let buckets = (0..size)
            .map(|_| CachePadded::new(Mutex::new(Vec::new())))
            .collect();
        Self {
            inner: RwLock::new(buckets),
            stats,
            cas_counter,
            num_items: AtomicUsize::new(0),
            num_deleted: AtomicUsize::new(0),
            num_temp: AtomicUsize::new(0),
            num_non_resident: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            max_deleted_seqno: AtomicU32::new(0),
        }
    }

    /// Run `f` with the key's bucket locked. This is the only way to touch
    /// stored values, so any two operations on the same key serialize here.
    pub fn with_bucket<R>(&self, key: &[u8], f: impl FnOnce(&mut Bucket<'_>) -> R) -> R {
        let inner = self.inner.read();
        let idx = hash_key(key) as usize & (inner.len() - 1);
        let mut guard = inner[idx].lock();
        let mut bucket = Bucket {
            values: &mut guard,
            ht: self,
        };
        f(&mut bucket)
    }

    /// Visit every stored value, one bucket lock at a time.
    pub fn visit<F: FnMut(&mut StoredValue)>(&self, mut f: F) {
        let inner = self.inner.read();
        for bucket in inner.iter() {
            let mut guard = bucket.lock();
            for v in guard.iter_mut() {
                f(v);
            }
        }
    }

    /// Visiting variant with bucket-level mutation access, for visitors
    /// that eject or collect under the same lock they inspect under.
    pub fn visit_buckets<F: FnMut(&mut Bucket<'_>)>(&self, mut f: F) {
        let inner = self.inner.read();
        for bucket in inner.iter() {
            let mut guard = bucket.lock();
            let mut b = Bucket {
                values: &mut guard,
                ht: self,
            };
            f(&mut b);
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.read().len()
    }

    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::Acquire)
    }

    pub fn num_deleted(&self) -> usize {
        self.num_deleted.load(Ordering::Acquire)
    }

    pub fn num_temp_items(&self) -> usize {
        self.num_temp.load(Ordering::Acquire)
    }

    pub fn num_non_resident(&self) -> usize {
        self.num_non_resident.load(Ordering::Acquire)
    }

    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Acquire)
    }

    pub fn max_deleted_seqno(&self) -> u32 {
        self.max_deleted_seqno.load(Ordering::Acquire)
    }

    pub fn set_max_deleted_seqno(&self, seqno: u32) {
        self.max_deleted_seqno.store(seqno, Ordering::Release);
    }

    fn note_deleted_seqno(&self, seqno: u32) {
        let mut current = self.max_deleted_seqno.load(Ordering::Relaxed);
        while seqno > current {
            match self.max_deleted_seqno.compare_exchange_weak(
                current,
                seqno,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Mint a fresh CAS outside the normal mutation paths (getLocked).
    pub(crate) fn mint_cas(&self) -> u64 {
        self.next_cas()
    }

    fn account_add(&self, size: usize) {
        self.mem_size.fetch_add(size, Ordering::AcqRel);
        self.stats.add_mem(size);
    }

    fn account_sub(&self, size: usize) {
        self.mem_size.fetch_sub(size, Ordering::AcqRel);
        self.stats.sub_mem(size);
    }

    /// Grow or shrink the bucket array to fit the current population.
    /// Stop-the-table: takes the outer write lock.
    pub fn resize(&self) {
        let total = self.num_items() + self.num_deleted() + self.num_temp_items();
        let target = (total * 2)
            .next_power_of_two()
            .clamp(MIN_HT_BUCKETS, MAX_HT_BUCKETS);

        let mut inner = self.inner.write();
        if inner.len() == target {
            return;
        }

        let mut all: Vec<StoredValue> = Vec::with_capacity(total);
        for bucket in inner.iter() {
            all.append(&mut bucket.lock());
        }

        let mut buckets: Vec<CachePadded<Mutex<Vec<StoredValue>>>> = (0..target)
            .map(|_| CachePadded::new(Mutex::new(Vec::new())))
            .collect();
        for v in all {
            let idx = hash_key(&v.key) as usize & (target - 1);
            buckets[idx].get_mut().push(v);
        }
        *inner = buckets;
    }

    /// Eject every clean resident value in the table. Emergency relief
    /// valve for warmup loads that outrun the memory quota.
    pub fn eject_resident_values(&self) {
        let inner = self.inner.read();
        for bucket in inner.iter() {
            let mut guard = bucket.lock();
            for v in guard.iter_mut() {
                if v.dirty || !v.resident || v.temp || v.id < 0 {
                    continue;
                }
                let len = v.value_len();
                v.value = None;
                v.resident = false;
                self.account_sub(len);
                self.num_non_resident.fetch_add(1, Ordering::AcqRel);
                self.stats.num_non_resident.fetch_add(1, Ordering::AcqRel);
                self.stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop everything and return the number of bytes released.
    pub fn clear(&self) -> usize {
        let inner = self.inner.write();
        let mut freed = 0;
        for bucket in inner.iter() {
            let mut guard = bucket.lock();
            for v in guard.iter() {
                freed += v.size();
            }
            guard.clear();
        }
        let items = self.num_items.swap(0, Ordering::AcqRel);
        let temps = self.num_temp.swap(0, Ordering::AcqRel);
        let non_resident = self.num_non_resident.swap(0, Ordering::AcqRel);
        self.num_deleted.store(0, Ordering::Release);
        self.mem_size.fetch_sub(freed, Ordering::AcqRel);
        self.stats.sub_mem(freed);
        self.stats.curr_items.fetch_sub(items, Ordering::AcqRel);
        self.stats.num_temp_items.fetch_sub(temps, Ordering::AcqRel);
        self.stats
            .num_non_resident
            .fetch_sub(non_resident, Ordering::AcqRel);
        freed
    }
}

/// A locked bucket; the guard for all per-key operations.
pub struct Bucket<'a> {
    values: &'a mut Vec<StoredValue>,
    ht: &'a HashTable,
}

impl Bucket<'_> {
    fn position(&self, key: &[u8], want_deleted: bool) -> Option<usize> {
        self.values
            .iter()
            .position(|v| v.key == key && (want_deleted || !v.deleted))
    }

    pub fn find(&mut self, key: &[u8], want_deleted: bool) -> Option<&mut StoredValue> {
        let idx = self.position(key, want_deleted)?;
        Some(&mut self.values[idx])
    }

    /// Lazy expiry: soft-delete an expired live value (returning what the
    /// caller must queue) or drop an expired temp placeholder.
    pub fn reap_expired(&mut self, key: &[u8], now: u32) -> Reaped {
        let Some(idx) = self.position(key, true) else {
            return Reaped::NotExpired;
        };
        let v = &self.values[idx];
        if v.deleted && !v.temp {
            // Tombstones do not expire; they wait for the flusher.
            return Reaped::NotExpired;
        }
        if !v.is_expired(now) {
            return Reaped::NotExpired;
        }
        if v.temp {
            self.remove_at(idx);
            return Reaped::TempReaped;
        }
        let seqno = self.ht.next_seqno_for(&self.values[idx]);
        let rowid = self.values[idx].id;
        self.soft_delete_at(idx, seqno, now);
        Reaped::Expired { seqno, rowid }
    }

    /// Store an item, honoring CAS discipline and lock state.
    ///
    /// Returns the status and the rowid the caller should queue with.
    /// `has_meta` means the item carries externally supplied cas/seqno that
    /// must be preserved rather than minted.
    pub fn set(
        &mut self,
        itm: &Item,
        req_cas: u64,
        allow_existing: bool,
        has_meta: bool,
        now: u32,
    ) -> (SetStatus, i64) {
        if let Some(idx) = self.position(itm.key(), true) {
            let old_size = self.values[idx].size();
            let v = &mut self.values[idx];

            if v.is_locked(now) {
                if req_cas == v.cas {
                    v.unlock();
                } else {
                    return (SetStatus::IsLocked, -1);
                }
            }

            if has_meta && v.temp && !v.non_existent {
                return (SetStatus::NeedMetadata, -1);
            }

            if req_cas != 0 {
                if v.deleted || v.temp {
                    return (SetStatus::NotFound, -1);
                }
                if req_cas != v.cas {
                    return (SetStatus::InvalidCas, -1);
                }
            } else if !allow_existing && !v.deleted && !v.temp && !v.is_expired(now) {
                return (SetStatus::InvalidCas, -1);
            }

            let new_value_len = itm.value_len();
            let old_value_len = v.value_len();
            if new_value_len > old_value_len
                && !self.ht.stats.has_memory_for(new_value_len - old_value_len)
            {
                return (SetStatus::NoMem, -1);
            }

            let was_dirty = v.dirty;
            let was_deleted = v.deleted;
            let was_temp = v.temp;
            let was_resident = v.resident;

            v.value = itm.value().cloned();
            v.flags = itm.flags();
            v.exptime = itm.exptime();
            if has_meta {
                v.cas = itm.cas();
                v.seqno = itm.seqno();
            } else {
                v.cas = self.ht.next_cas();
                v.seqno = v.seqno.wrapping_add(1);
            }
            v.deleted = false;
            v.temp = false;
            v.non_existent = false;
            // Only live values participate in the non-resident count;
            // tombstones and temp placeholders never did.
            if !was_resident && !was_deleted && !was_temp {
                self.ht.num_non_resident.fetch_sub(1, Ordering::AcqRel);
                self.ht.stats.num_non_resident.fetch_sub(1, Ordering::AcqRel);
            }
            v.resident = v.value.is_some();
            v.mark_dirty(now);

            let rowid = v.id;
            let new_size = v.size();
            if new_size > old_size {
                self.ht.account_add(new_size - old_size);
            } else {
                self.ht.account_sub(old_size - new_size);
            }

            if was_temp {
                self.ht.num_temp.fetch_sub(1, Ordering::AcqRel);
                self.ht.stats.num_temp_items.fetch_sub(1, Ordering::AcqRel);
                self.count_live_insert();
            } else if was_deleted {
                self.ht.num_deleted.fetch_sub(1, Ordering::AcqRel);
                self.count_live_insert();
            }

            let status = if was_dirty && !was_deleted && !was_temp {
                SetStatus::WasDirty
            } else {
                SetStatus::WasClean
            };
            (status, rowid)
        } else {
            if req_cas != 0 {
                return (SetStatus::NotFound, -1);
            }
            let mut v = StoredValue::from_item(itm, true, now);
            if !self.ht.stats.has_memory_for(v.size()) {
                return (SetStatus::NoMem, -1);
            }
            if has_meta {
                v.cas = itm.cas();
                v.seqno = itm.seqno();
            } else {
                v.cas = self.ht.next_cas();
                v.seqno = 1;
            }
            v.id = -1;
            self.ht.account_add(v.size());
            self.count_live_insert();
            self.values.push(v);
            // NotFound with CAS=0 is the insert path; the caller treats it
            // like WasClean.
            (SetStatus::NotFound, -1)
        }
    }

    pub fn add(&mut self, itm: &Item, now: u32) -> AddStatus {
        if let Some(idx) = self.position(itm.key(), true) {
            let v = &self.values[idx];
            if v.is_locked(now) {
                return AddStatus::Exists;
            }
            if !v.deleted && !v.temp && !v.is_expired(now) {
                return AddStatus::Exists;
            }
            let (status, _) = self.set(itm, 0, true, false, now);
            match status {
                SetStatus::NoMem => AddStatus::NoMem,
                _ => AddStatus::UnDel,
            }
        } else {
            match self.set(itm, 0, true, false, now) {
                (SetStatus::NoMem, _) => AddStatus::NoMem,
                _ => AddStatus::Success,
            }
        }
    }

    /// Mark a value deleted, clearing its bytes but preserving metadata for
    /// the tombstone. `meta_seqno` carries an externally supplied revision
    /// (delete-with-meta).
    pub fn soft_delete(
        &mut self,
        key: &[u8],
        req_cas: u64,
        meta_seqno: Option<u32>,
        now: u32,
    ) -> SetStatus {
        let Some(idx) = self.position(key, true) else {
            return SetStatus::NotFound;
        };
        {
            let v = &self.values[idx];
            if v.deleted && !v.temp {
                return SetStatus::NotFound;
            }
            if v.is_locked(now) {
                return SetStatus::IsLocked;
            }
            if req_cas != 0 && req_cas != v.cas {
                return SetStatus::InvalidCas;
            }
        }
        let was_dirty = self.values[idx].dirty;
        let was_temp = self.values[idx].temp;
        let seqno =
            meta_seqno.unwrap_or_else(|| self.ht.next_seqno_for(&self.values[idx]));
        self.soft_delete_at(idx, seqno, now);
        if was_temp {
            // A soft-deleted temp item graduates to a real queued tombstone.
            self.ht.num_temp.fetch_sub(1, Ordering::AcqRel);
            self.ht.stats.num_temp_items.fetch_sub(1, Ordering::AcqRel);
            self.ht.num_deleted.fetch_add(1, Ordering::AcqRel);
            self.values[idx].temp = false;
            self.values[idx].non_existent = false;
            return SetStatus::WasClean;
        }
        if was_dirty {
            SetStatus::WasDirty
        } else {
            SetStatus::WasClean
        }
    }

    fn soft_delete_at(&mut self, idx: usize, seqno: u32, now: u32) {
        let v = &mut self.values[idx];
        let value_len = v.value_len();
        let was_deleted = v.deleted;
        let was_resident = v.resident;
        v.value = None;
        v.resident = false;
        v.deleted = true;
        v.cas = self.ht.next_cas();
        v.seqno = seqno;
        v.mark_dirty(now);
        if !was_resident && !v.temp {
            self.ht.num_non_resident.fetch_sub(1, Ordering::AcqRel);
            self.ht.stats.num_non_resident.fetch_sub(1, Ordering::AcqRel);
        }
        self.ht.note_deleted_seqno(seqno);
        if value_len > 0 {
            self.ht.account_sub(value_len);
        }
        if !was_deleted && !v.temp {
            self.ht.num_items.fetch_sub(1, Ordering::AcqRel);
            self.ht.stats.curr_items.fetch_sub(1, Ordering::AcqRel);
            self.ht.num_deleted.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Physically remove an entry, deleted or not.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.position(key, true) {
            Some(idx) => {
                self.remove_at(idx);
                true
            }
            None => false,
        }
    }

    fn remove_at(&mut self, idx: usize) {
        let v = self.values.swap_remove(idx);
        self.ht.account_sub(v.size());
        if v.temp {
            self.ht.num_temp.fetch_sub(1, Ordering::AcqRel);
            self.ht.stats.num_temp_items.fetch_sub(1, Ordering::AcqRel);
        } else if v.deleted {
            self.ht.num_deleted.fetch_sub(1, Ordering::AcqRel);
        } else {
            self.ht.num_items.fetch_sub(1, Ordering::AcqRel);
            self.ht.stats.curr_items.fetch_sub(1, Ordering::AcqRel);
            if !v.resident {
                self.ht.num_non_resident.fetch_sub(1, Ordering::AcqRel);
                self.ht.stats.num_non_resident.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Insert a metadata-only placeholder standing in for an unknown or
    /// previously deleted key, expiring at `expiry`.
    pub fn add_temp_deleted_item(&mut self, key: &[u8], expiry: u32) -> AddStatus {
        if self.position(key, true).is_some() {
            return AddStatus::Exists;
        }
        let v = StoredValue {
            key: key.to_vec(),
            value: None,
            flags: 0,
            exptime: expiry,
            cas: 0,
            seqno: 0,
            id: -1,
            dirty: false,
            deleted: true,
            temp: true,
            non_existent: false,
            pending_id: false,
            resident: false,
            lock_expiry: 0,
            data_age: 0,
        };
        if !self.ht.stats.has_memory_for(v.size()) {
            return AddStatus::NoMem;
        }
        self.ht.account_add(v.size());
        self.ht.num_temp.fetch_add(1, Ordering::AcqRel);
        self.ht.stats.num_temp_items.fetch_add(1, Ordering::AcqRel);
        self.values.push(v);
        AddStatus::Success
    }

    /// Warmup-path insert of a clean value straight from the backing store.
    /// `partial` loads metadata only; `eject` drops the value bytes right
    /// after insert when memory pressure demands it.
    pub fn warm_insert(&mut self, itm: &Item, eject: bool, partial: bool) -> InsertStatus {
        if let Some(idx) = self.position(itm.key(), true) {
            if partial || self.values[idx].resident || self.values[idx].deleted {
                return InsertStatus::Dup;
            }
            // A full load against a key whose metadata is already in memory
            // brings the value bytes back in.
            let Some(value) = itm.value().cloned() else {
                return InsertStatus::Dup;
            };
            if !self.ht.stats.has_memory_for(value.len()) {
                return InsertStatus::NoMem;
            }
            self.restore_value(itm.key(), value);
            if eject {
                self.eject_value(itm.key());
            }
            return InsertStatus::Ok;
        }
        let mut v = StoredValue::from_item(itm, false, 0);
        if partial {
            v.value = None;
            v.resident = false;
        }
        if !self.ht.stats.has_memory_for(v.size()) {
            return InsertStatus::NoMem;
        }
        self.ht.account_add(v.size());
        self.count_live_insert();
        if !v.resident {
            self.ht.num_non_resident.fetch_add(1, Ordering::AcqRel);
            self.ht.stats.num_non_resident.fetch_add(1, Ordering::AcqRel);
        }
        self.values.push(v);
        if eject && !partial {
            self.eject_value(itm.key());
        }
        InsertStatus::Ok
    }

    /// Complete a background value fetch.
    pub fn restore_value(&mut self, key: &[u8], value: Bytes) -> bool {
        let Some(idx) = self.position(key, true) else {
            return false;
        };
        let v = &mut self.values[idx];
        if v.resident || v.deleted {
            return false;
        }
        let len = value.len();
        v.value = Some(value);
        v.resident = true;
        self.ht.account_add(len);
        self.ht.num_non_resident.fetch_sub(1, Ordering::AcqRel);
        self.ht.stats.num_non_resident.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Complete a background metadata fetch against a temp placeholder.
    /// `fetched` is the on-disk item when one exists.
    pub fn restore_meta(
        &mut self,
        key: &[u8],
        fetched: Option<&Item>,
        expiry_window: u32,
        now: u32,
    ) -> bool {
        let Some(idx) = self.position(key, true) else {
            return false;
        };
        let v = &mut self.values[idx];
        if !v.temp {
            return false;
        }
        match fetched {
            Some(itm) => {
                v.cas = itm.cas();
                v.seqno = itm.seqno();
                v.flags = itm.flags();
                v.exptime = itm.exptime();
                v.id = itm.rowid();
                v.non_existent = false;
                if v.id >= 0 {
                    // Now a real non-resident value backed by a disk row.
                    v.temp = false;
                    v.deleted = false;
                    self.ht.num_temp.fetch_sub(1, Ordering::AcqRel);
                    self.ht.stats.num_temp_items.fetch_sub(1, Ordering::AcqRel);
                    self.count_live_insert();
                    self.ht.num_non_resident.fetch_add(1, Ordering::AcqRel);
                    self.ht.stats.num_non_resident.fetch_add(1, Ordering::AcqRel);
                }
            }
            None => {
                v.non_existent = true;
                v.exptime = now + expiry_window;
            }
        }
        true
    }

    /// Eject a clean resident value, leaving the metadata behind.
    pub fn eject_value(&mut self, key: &[u8]) -> bool {
        let Some(idx) = self.position(key, false) else {
            self.ht.stats.num_eject_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let v = &mut self.values[idx];
        if v.dirty || !v.resident || v.temp || v.id < 0 {
            self.ht.stats.num_eject_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let len = v.value_len();
        v.value = None;
        v.resident = false;
        self.ht.account_sub(len);
        self.ht.num_non_resident.fetch_add(1, Ordering::AcqRel);
        self.ht.stats.num_non_resident.fetch_add(1, Ordering::AcqRel);
        self.ht.stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn count_live_insert(&self) {
        self.ht.num_items.fetch_add(1, Ordering::AcqRel);
        self.ht.stats.curr_items.fetch_add(1, Ordering::AcqRel);
    }
}

impl HashTable {
    fn next_seqno_for(&self, v: &StoredValue) -> u32 {
        v.seqno.wrapping_add(1).max(1)
    }
}
