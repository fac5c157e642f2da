use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::checkpoint::CheckpointManager;
use crate::core::hash_table::HashTable;
use crate::core::item::{Cookie, QueuedItem, VBucketState};
use crate::stats::Statistics;

/// A shard of the keyspace: its own hash table, checkpoint log, backfill
/// queue, pending-op waitlist, and lifecycle state.
pub struct VBucket {
    id: u16,
    state: RwLock<VBucketState>,
    initial_state: RwLock<VBucketState>,
    pub ht: HashTable,
    pub checkpoint: CheckpointManager,
    backfill: Mutex<Vec<Arc<QueuedItem>>>,
    pending_ops: Mutex<Vec<Cookie>>,

    // Per-vbucket flush accounting
    pub ops_create: AtomicU64,
    pub ops_update: AtomicU64,
    pub ops_delete: AtomicU64,
    pub ops_reject: AtomicU64,
    pub dirty_queue_size: AtomicU64,
    pub dirty_queue_mem: AtomicU64,
    pub dirty_queue_drain: AtomicU64,
}

impl VBucket {
    pub fn new(
        id: u16,
        state: VBucketState,
        ht_buckets: usize,
        stats: Arc<Statistics>,
        cas_counter: Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(state),
            initial_state: RwLock::new(state),
            ht: HashTable::new(ht_buckets, stats, cas_counter),
            checkpoint: CheckpointManager::new(1),
            backfill: Mutex::new(Vec::new()),
            pending_ops: Mutex::new(Vec::new()),
            ops_create: AtomicU64::new(0),
            ops_update: AtomicU64::new(0),
            ops_delete: AtomicU64::new(0),
            ops_reject: AtomicU64::new(0),
            dirty_queue_size: AtomicU64::new(0),
            dirty_queue_mem: AtomicU64::new(0),
            dirty_queue_drain: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    pub fn set_state(&self, to: VBucketState) {
        *self.state.write() = to;
    }

    pub fn initial_state(&self) -> VBucketState {
        *self.initial_state.read()
    }

    pub fn set_initial_state(&self, state: VBucketState) {
        *self.initial_state.write() = state;
    }

    /// Register a suspended operation against a pending vbucket. Returns
    /// false (caller must re-check) if the vbucket left the pending state
    /// between the caller's state check and this registration.
    pub fn add_pending_op(&self, cookie: Cookie) -> bool {
        let mut ops = self.pending_ops.lock();
        if self.state() != VBucketState::Pending {
            return false;
        }
        ops.push(cookie);
        true
    }

    /// Drain the waitlist; each cookie is handed out exactly once.
    pub fn take_pending_ops(&self) -> Vec<Cookie> {
        std::mem::take(&mut *self.pending_ops.lock())
    }

    pub fn queue_backfill(&self, qi: Arc<QueuedItem>) {
        self.backfill.lock().push(qi);
    }

    pub fn drain_backfill(&self, out: &mut Vec<Arc<QueuedItem>>) {
        out.append(&mut self.backfill.lock());
    }

    pub fn backfill_size(&self) -> usize {
        self.backfill.lock().len()
    }

    pub fn reset_flush_stats(&self) {
        self.dirty_queue_size.store(0, Ordering::Relaxed);
        self.dirty_queue_mem.store(0, Ordering::Relaxed);
        self.dirty_queue_drain.store(0, Ordering::Relaxed);
    }
}

/// Concurrent vbid → VBucket mapping with per-vbid versioning, deletion
/// flags, persisted checkpoint ids, and the snapshot-priority flags.
pub struct VBucketMap {
    slots: Vec<RwLock<Option<Arc<VBucket>>>>,
    versions: Vec<AtomicU16>,
    deletion_flags: Vec<AtomicBool>,
    persistence_checkpoint_ids: Vec<AtomicU64>,
    high_priority_snapshot: AtomicBool,
    low_priority_snapshot: AtomicBool,
}

impl VBucketMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| RwLock::new(None)).collect(),
            versions: (0..capacity).map(|_| AtomicU16::new(0)).collect(),
            deletion_flags: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            persistence_checkpoint_ids: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            high_priority_snapshot: AtomicBool::new(false),
            low_priority_snapshot: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.slots.get(vbid as usize)?.read().clone()
    }

    pub fn add(&self, vb: Arc<VBucket>) {
        let idx = vb.id() as usize;
        *self.slots[idx].write() = Some(vb);
    }

    pub fn remove(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.slots.get(vbid as usize)?.write().take()
    }

    /// Occupied vbucket ids, in id order.
    pub fn ids(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.read().is_some())
            .map(|(i, _)| i as u16)
            .collect()
    }

    pub fn version(&self, vbid: u16) -> u16 {
        self.versions[vbid as usize].load(Ordering::Acquire)
    }

    pub fn set_version(&self, vbid: u16, version: u16) {
        self.versions[vbid as usize].store(version, Ordering::Release);
    }

    /// The 16-bit version wraps just before the sentinel max value.
    pub fn next_version(&self, vbid: u16) -> u16 {
        let current = self.version(vbid);
        if current == u16::MAX - 1 {
            0
        } else {
            current + 1
        }
    }

    /// Flip the per-vbid deletion flag. Setting it returns false if a
    /// deletion task already owns the vbid.
    pub fn set_bucket_deletion(&self, vbid: u16, value: bool) -> bool {
        self.deletion_flags[vbid as usize]
            .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_bucket_deletion(&self, vbid: u16) -> bool {
        self.deletion_flags[vbid as usize].load(Ordering::Acquire)
    }

    pub fn persistence_checkpoint_id(&self, vbid: u16) -> u64 {
        self.persistence_checkpoint_ids[vbid as usize].load(Ordering::Acquire)
    }

    pub fn set_persistence_checkpoint_id(&self, vbid: u16, id: u64) {
        self.persistence_checkpoint_ids[vbid as usize].store(id, Ordering::Release);
    }

    /// Returns false when the flag was already in the requested state, so
    /// snapshot scheduling dedupes naturally.
    pub fn set_high_priority_vb_snapshot(&self, value: bool) -> bool {
        self.high_priority_snapshot
            .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_low_priority_vb_snapshot(&self, value: bool) -> bool {
        self.low_priority_snapshot
            .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_high_priority_vb_snapshot_scheduled(&self) -> bool {
        self.high_priority_snapshot.load(Ordering::Acquire)
    }

    pub fn is_low_priority_vb_snapshot_scheduled(&self) -> bool {
        self.low_priority_snapshot.load(Ordering::Acquire)
    }
}
