use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::{Config, ValueChangedListener};
use crate::constants::EP_NO_PERSISTENCE_ENV;
use crate::core::bgfetch::BgFetchKind;
use crate::core::dispatcher::{priority, Dispatcher, Task, TaskId};
use crate::core::hash_table::{AddStatus, Reaped, SetStatus};
use crate::core::item::{Cookie, Item, ItemMetaData, QueueOp, QueuedItem, VBucketState};
use crate::core::vbucket::{VBucket, VBucketMap};
use crate::core::vbdelete::schedule_vb_deletion;
use crate::core::warmup::Warmup;
use crate::error::{DriftError, Result};
use crate::stats::Statistics;
use crate::storage::flusher::Flusher;
use crate::storage::kvstore::{KVStore, StorageProperties, VbStateSnapshot};
use crate::storage::memory::MemoryKVStore;
use crate::storage::mutation_log::MutationLog;
use crate::utils::unix_now;

/// Delivery hook for I/O completions. Suspended operations (EWOULDBLOCK)
/// resolve through `notify_io_complete` exactly once per cookie.
pub trait EngineNotifier: Send + Sync {
    fn notify_io_complete(&self, cookie: Cookie, status: Result<()>);
}

/// Default notifier that drops completions on the floor.
pub struct NullNotifier;

impl EngineNotifier for NullNotifier {
    fn notify_io_complete(&self, _cookie: Cookie, _status: Result<()>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPriority {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictResult {
    Ejected,
    AlreadyEjected,
    /// Dirty, temp, or never persisted; the value cannot leave memory.
    CannotEject,
}

/// Per-key stats surfaced to the front end.
#[derive(Debug, Clone)]
pub struct KeyStats {
    pub dirty: bool,
    pub exptime: u32,
    pub flags: u32,
    pub cas: u64,
    pub data_age: u32,
}

pub(crate) struct RestoreState {
    pub items: HashMap<u16, Vec<Arc<QueuedItem>>>,
    pub items_deleted: HashSet<Vec<u8>>,
}

/// The engine façade: an eventually-persistent key/value store partitioned
/// into vbuckets.
///
/// Mutations apply synchronously to the owning vbucket's hash table and are
/// persisted asynchronously by the flusher. Cache misses on non-resident
/// values suspend the caller (`WouldBlock`) and complete through the
/// `EngineNotifier`.
pub struct DriftStore {
    pub(crate) config: Arc<Config>,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) vbuckets: VBucketMap,
    pub(crate) rw: Arc<dyn KVStore>,
    pub(crate) ro: Arc<dyn KVStore>,
    pub(crate) storage_props: StorageProperties,
    pub(crate) rw_dispatcher: Arc<Dispatcher>,
    pub(crate) ro_dispatcher: Arc<Dispatcher>,
    pub(crate) nonio_dispatcher: Arc<Dispatcher>,
    pub(crate) flusher: Flusher,
    pub(crate) mutation_log: Arc<MutationLog>,
    pub(crate) access_log_path: Option<PathBuf>,
    pub(crate) warmup: Mutex<Option<Arc<Warmup>>>,
    pub(crate) restore: Mutex<RestoreState>,
    pub(crate) vbset_mutex: Mutex<()>,
    pub(crate) disk_flush_all: AtomicBool,
    pub(crate) invalid_vb_versions: Mutex<Vec<(u16, u16)>>,
    bg_fetch_queue: AtomicUsize,
    cas_counter: Arc<AtomicU64>,
    notifier: Arc<dyn EngineNotifier>,
    degraded: AtomicBool,
    do_persistence: bool,
    expiry_pager_task: Mutex<Option<TaskId>>,
    self_ref: Mutex<Weak<DriftStore>>,
}

pub struct DriftStoreBuilder {
    config: Config,
    kvstore: Option<Arc<dyn KVStore>>,
    notifier: Option<Arc<dyn EngineNotifier>>,
    start_vb0: bool,
}

impl Default for DriftStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DriftStoreBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::new(),
            kvstore: None,
            notifier: None,
            start_vb0: false,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn kvstore(mut self, kvstore: Arc<dyn KVStore>) -> Self {
        self.kvstore = Some(kvstore);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn EngineNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Create vbucket 0 in the active state at startup.
    pub fn start_vb0(mut self, start: bool) -> Self {
        self.start_vb0 = start;
        self
    }

    pub fn build(self) -> Result<Arc<DriftStore>> {
        let config = Arc::new(self.config);
        let stats = Arc::new(Statistics::new(config.max_data_size));
        let rw: Arc<dyn KVStore> = self
            .kvstore
            .unwrap_or_else(|| Arc::new(MemoryKVStore::new()));
        let ro = Arc::clone(&rw);
        let storage_props = rw.storage_properties();
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(NullNotifier));

        let mutation_log = Arc::new(MutationLog::new(
            config.klog_path.clone(),
            config.klog_block_size,
            config.klog_sync_policy,
        ));
        if let Err(e) = mutation_log.open() {
            warn!("could not open mutation log, resetting it: {e}");
            let _ = mutation_log.reset();
        }

        let rw_dispatcher = Dispatcher::start("rw");
        // The read-only dispatcher collapses onto the writer when the
        // backing store cannot serve concurrent readers.
        let ro_dispatcher = if storage_props.max_concurrency > 1 {
            Dispatcher::start("ro")
        } else {
            Arc::clone(&rw_dispatcher)
        };
        let nonio_dispatcher = Dispatcher::start("nonio");

        let do_persistence = std::env::var_os(EP_NO_PERSISTENCE_ENV).is_none();
        rw.set_vb_batch_count(config.couch_vbucket_batch_count.load(Ordering::Acquire));

        let run_warmup = config.warmup && do_persistence;

        let store = Arc::new(DriftStore {
            vbuckets: VBucketMap::new(config.max_vbuckets),
            access_log_path: config.alog_path.clone(),
            config,
            stats,
            rw,
            ro,
            storage_props,
            rw_dispatcher,
            ro_dispatcher,
            nonio_dispatcher,
            flusher: Flusher::new(),
            mutation_log,
            warmup: Mutex::new(None),
            restore: Mutex::new(RestoreState {
                items: HashMap::new(),
                items_deleted: HashSet::new(),
            }),
            vbset_mutex: Mutex::new(()),
            disk_flush_all: AtomicBool::new(false),
            invalid_vb_versions: Mutex::new(Vec::new()),
            bg_fetch_queue: AtomicUsize::new(0),
            cas_counter: Arc::new(AtomicU64::new(1)),
            notifier,
            degraded: AtomicBool::new(run_warmup),
            do_persistence,
            expiry_pager_task: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        });

        store.register_config_listeners();

        if self.start_vb0 {
            store.set_vbucket_state(0, VBucketState::Active);
        }

        if run_warmup {
            Warmup::start(&store);
        } else {
            store.stats.warmup_complete.store(true, Ordering::Release);
            store.degraded.store(false, Ordering::Release);
            store.schedule_periodic_workers();
        }

        if do_persistence {
            Flusher::start(&store);
        }

        Ok(store)
    }
}

impl DriftStore {
    pub fn builder() -> DriftStoreBuilder {
        DriftStoreBuilder::new()
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    /// Pull the flusher's next pass forward instead of waiting out its
    /// idle snooze.
    pub fn wake_flusher(&self) {
        self.flusher.wake(&self.rw_dispatcher);
    }

    pub fn storage_properties(&self) -> StorageProperties {
        self.storage_props
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Release);
    }

    pub fn is_warmed(&self) -> bool {
        self.stats.warmup_complete.load(Ordering::Acquire)
    }

    /// Block until warmup finishes (or the timeout lapses).
    pub fn wait_for_warmup(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while !self.is_warmed() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn bg_fetch_queue_depth(&self) -> usize {
        self.bg_fetch_queue.load(Ordering::Acquire)
    }

    pub(crate) fn cas_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.cas_counter)
    }

    pub fn get_vbucket(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.vbuckets.get(vbid)
    }

    pub fn vbucket_state(&self, vbid: u16) -> Option<VBucketState> {
        self.vbuckets.get(vbid).map(|vb| vb.state())
    }

    /// Current version of a vbid; bumped whenever the vbucket is reset or
    /// recreated so stale queued work can be recognized.
    pub fn vbucket_version(&self, vbid: u16) -> u16 {
        self.vbuckets.version(vbid)
    }

    /// Whether a disk deletion task currently owns this vbid.
    pub fn is_vbucket_deletion_scheduled(&self, vbid: u16) -> bool {
        self.vbuckets.is_bucket_deletion(vbid)
    }

    pub fn visit_vbuckets(&self, mut f: impl FnMut(&Arc<VBucket>)) {
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                f(&vb);
            }
        }
    }

    // ============ Front-end operations ============

    /// Store an item. `force` lets replication push onto replica vbuckets.
    pub fn set(&self, itm: &Item, cookie: Cookie, force: bool) -> Result<()> {
        let Some(vb) = self.vbuckets.get(itm.vbucket()) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead => return self.not_my_vbucket(),
            VBucketState::Replica if !force => return self.not_my_vbucket(),
            VBucketState::Pending if !force => {
                if vb.add_pending_op(cookie) {
                    self.stats.record_pending_op();
                    return Err(DriftError::WouldBlock);
                }
            }
            _ => {}
        }

        let cas_op = itm.cas() != 0;
        let now = unix_now();
        let (status, rowid) = vb.ht.with_bucket(itm.key(), |b| {
            self.reap_in_bucket(&vb, b, itm.key(), now);
            b.set(itm, itm.cas(), true, false, now)
        });

        match status {
            SetStatus::NoMem => Err(DriftError::OutOfMemory),
            SetStatus::InvalidCas | SetStatus::IsLocked => Err(DriftError::KeyExists),
            SetStatus::NotFound if cas_op => Err(DriftError::KeyNotFound),
            SetStatus::NotFound | SetStatus::WasClean | SetStatus::WasDirty => {
                self.queue_dirty(&vb, itm.key(), QueueOp::Set, itm.seqno(), rowid, false);
                Ok(())
            }
            SetStatus::NeedMetadata => Err(DriftError::TempFail),
        }
    }

    /// Store only if absent. CAS on add is meaningless and refused.
    pub fn add(&self, itm: &Item, cookie: Cookie) -> Result<()> {
        let Some(vb) = self.vbuckets.get(itm.vbucket()) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            VBucketState::Pending => {
                if vb.add_pending_op(cookie) {
                    self.stats.record_pending_op();
                    return Err(DriftError::WouldBlock);
                }
            }
            _ => {}
        }
        if itm.cas() != 0 {
            return Err(DriftError::NotStored);
        }

        let now = unix_now();
        let status = vb.ht.with_bucket(itm.key(), |b| {
            self.reap_in_bucket(&vb, b, itm.key(), now);
            b.add(itm, now)
        });
        match status {
            AddStatus::NoMem => Err(DriftError::OutOfMemory),
            AddStatus::Exists => Err(DriftError::NotStored),
            AddStatus::Success | AddStatus::UnDel => {
                self.queue_dirty(&vb, itm.key(), QueueOp::Set, itm.seqno(), -1, false);
                Ok(())
            }
        }
    }

    /// Replication backfill write: bypasses the checkpoint on the writer
    /// side and dedupes against already-dirty same-key items.
    pub fn add_tap_backfill_item(&self, itm: &Item, meta: bool) -> Result<()> {
        let Some(vb) = self.vbuckets.get(itm.vbucket()) else {
            return self.not_my_vbucket();
        };
        if vb.state() == VBucketState::Dead {
            return self.not_my_vbucket();
        }

        let now = unix_now();
        let (status, rowid) = vb
            .ht
            .with_bucket(itm.key(), |b| b.set(itm, 0, true, meta, now));
        match status {
            SetStatus::NoMem => Err(DriftError::OutOfMemory),
            SetStatus::InvalidCas | SetStatus::IsLocked => Err(DriftError::KeyExists),
            SetStatus::WasDirty => {
                // Already queued; don't push the same item twice.
                Ok(())
            }
            SetStatus::NotFound | SetStatus::WasClean => {
                self.queue_dirty(&vb, itm.key(), QueueOp::Set, itm.seqno(), rowid, true);
                Ok(())
            }
            SetStatus::NeedMetadata => Err(DriftError::TempFail),
        }
    }

    pub fn get(&self, key: &[u8], vbid: u16, cookie: Cookie) -> Result<Item> {
        self.get_with_options(key, vbid, cookie, true, true)
    }

    /// `queue_bg` controls whether a miss on a non-resident value schedules
    /// a background fetch; `honor_states` lets internal callers read
    /// through regardless of vbucket state.
    pub fn get_with_options(
        &self,
        key: &[u8],
        vbid: u16,
        cookie: Cookie,
        queue_bg: bool,
        honor_states: bool,
    ) -> Result<Item> {
        let Some(vb) = self.vbuckets.get(vbid) else {
            return self.not_my_vbucket();
        };
        if honor_states {
            match vb.state() {
                VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
                VBucketState::Pending => {
                    if vb.add_pending_op(cookie) {
                        self.stats.record_pending_op();
                        return Err(DriftError::WouldBlock);
                    }
                }
                _ => {}
            }
        }

        let now = unix_now();
        let vbver = self.vbuckets.version(vbid);
        vb.ht.with_bucket(key, |b| {
            self.reap_in_bucket(&vb, b, key, now);
            match b.find(key, false) {
                Some(v) => {
                    if !v.is_resident() {
                        let rowid = v.id();
                        if queue_bg {
                            self.bg_fetch(key, vbid, vbver, rowid, cookie, BgFetchKind::Value);
                        }
                        return Err(DriftError::WouldBlock);
                    }
                    Ok(v.to_item(vbid))
                }
                None => {
                    if self.is_degraded() {
                        Err(DriftError::TempFail)
                    } else {
                        Err(DriftError::KeyNotFound)
                    }
                }
            }
        })
    }

    /// Fetch item metadata. A miss inserts a temp placeholder and kicks a
    /// metadata-only background fetch.
    pub fn get_metadata(&self, key: &[u8], vbid: u16, cookie: Cookie) -> Result<ItemMetaData> {
        let Some(vb) = self.vbuckets.get(vbid) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            _ => {}
        }

        let now = unix_now();
        let vbver = self.vbuckets.version(vbid);
        let window = self.config.tmp_item_expiry_window.load(Ordering::Acquire);
        vb.ht.with_bucket(key, |b| {
            self.reap_in_bucket(&vb, b, key, now);
            if let Some(v) = b.find(key, true) {
                if v.is_temp_non_existent() {
                    return Err(DriftError::KeyNotFound);
                }
                if v.is_temp() && v.cas() == 0 {
                    // Metadata fetch still in flight.
                    return Err(DriftError::WouldBlock);
                }
                return Ok(v.metadata());
            }
            // Unknown key: it may have lived and died before. Park a temp
            // item and go find its last known metadata.
            match b.add_temp_deleted_item(key, now + window) {
                AddStatus::NoMem => Err(DriftError::OutOfMemory),
                AddStatus::Success => {
                    self.bg_fetch(key, vbid, vbver, -1, cookie, BgFetchKind::Meta);
                    Err(DriftError::WouldBlock)
                }
                // The bucket is locked; a racing insert is impossible.
                AddStatus::Exists | AddStatus::UnDel => Err(DriftError::TempFail),
            }
        })
    }

    /// Store an item carrying externally supplied cas/seqno (replication
    /// and restore paths).
    pub fn set_with_meta(
        &self,
        itm: &Item,
        req_cas: u64,
        cookie: Cookie,
        force: bool,
        allow_existing: bool,
    ) -> Result<()> {
        let Some(vb) = self.vbuckets.get(itm.vbucket()) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead => return self.not_my_vbucket(),
            VBucketState::Replica if !force => return self.not_my_vbucket(),
            VBucketState::Pending if !force => {
                if vb.add_pending_op(cookie) {
                    self.stats.record_pending_op();
                    return Err(DriftError::WouldBlock);
                }
            }
            _ => {}
        }

        let now = unix_now();
        let (status, rowid) = vb
            .ht
            .with_bucket(itm.key(), |b| b.set(itm, req_cas, allow_existing, true, now));
        match status {
            SetStatus::NoMem => Err(DriftError::OutOfMemory),
            SetStatus::InvalidCas | SetStatus::IsLocked => Err(DriftError::KeyExists),
            SetStatus::NotFound | SetStatus::WasClean | SetStatus::WasDirty => {
                self.queue_dirty(&vb, itm.key(), QueueOp::Set, itm.seqno(), rowid, false);
                Ok(())
            }
            SetStatus::NeedMetadata => self.process_need_metadata(&vb, itm, cookie),
        }
    }

    fn process_need_metadata(&self, vb: &Arc<VBucket>, itm: &Item, cookie: Cookie) -> Result<()> {
        let now = unix_now();
        let vbver = self.vbuckets.version(itm.vbucket());
        vb.ht.with_bucket(itm.key(), |b| {
            self.reap_in_bucket(vb, b, itm.key(), now);
            match b.find(itm.key(), true) {
                Some(v) if !v.is_resident() => {
                    let rowid = v.id();
                    self.bg_fetch(itm.key(), itm.vbucket(), vbver, rowid, cookie, BgFetchKind::Meta);
                    Err(DriftError::WouldBlock)
                }
                _ => Err(DriftError::TempFail),
            }
        })
    }

    /// Read an item and replace its TTL in one step.
    pub fn get_and_update_ttl(
        &self,
        key: &[u8],
        vbid: u16,
        cookie: Cookie,
        queue_bg: bool,
        exptime: u32,
    ) -> Result<Item> {
        let Some(vb) = self.vbuckets.get(vbid) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            VBucketState::Pending => {
                if vb.add_pending_op(cookie) {
                    self.stats.record_pending_op();
                    return Err(DriftError::WouldBlock);
                }
            }
            _ => {}
        }

        let now = unix_now();
        let vbver = self.vbuckets.version(vbid);
        vb.ht.with_bucket(key, |b| {
            self.reap_in_bucket(&vb, b, key, now);
            match b.find(key, false) {
                Some(v) => {
                    v.exptime = exptime;
                    if !v.is_resident() {
                        let rowid = v.id();
                        if queue_bg {
                            self.bg_fetch(key, vbid, vbver, rowid, cookie, BgFetchKind::Value);
                            return Err(DriftError::WouldBlock);
                        }
                        // Caller didn't want the value anyway.
                        return Ok(Item::with_meta(
                            key,
                            vbid,
                            None,
                            v.flags(),
                            v.exptime(),
                            v.cas(),
                            v.seqno(),
                            rowid,
                        ));
                    }
                    Ok(v.to_item(vbid))
                }
                None => {
                    if self.is_degraded() {
                        Err(DriftError::TempFail)
                    } else {
                        Err(DriftError::KeyNotFound)
                    }
                }
            }
        })
    }

    /// Acquire a per-key lock for `timeout` seconds, minting a fresh CAS
    /// the caller must present to unlock.
    pub fn get_locked(
        &self,
        key: &[u8],
        vbid: u16,
        now: u32,
        timeout: u32,
        cookie: Cookie,
    ) -> Result<Item> {
        let Some(vb) = self.active_vbucket(vbid) else {
            return self.not_my_vbucket();
        };

        let vbver = self.vbuckets.version(vbid);
        vb.ht.with_bucket(key, |b| {
            self.reap_in_bucket(&vb, b, key, now);
            match b.find(key, false) {
                Some(v) => {
                    if v.is_locked(now) {
                        return Err(DriftError::TempFail);
                    }
                    if !v.is_resident() {
                        let rowid = v.id();
                        self.bg_fetch(key, vbid, vbver, rowid, cookie, BgFetchKind::Value);
                        return Err(DriftError::WouldBlock);
                    }
                    v.lock(now + timeout);
                    v.cas = vb.ht.mint_cas();
                    Ok(v.to_item(vbid))
                }
                None => {
                    if self.is_degraded() {
                        Err(DriftError::TempFail)
                    } else {
                        Err(DriftError::KeyNotFound)
                    }
                }
            }
        })
    }

    pub fn unlock_key(&self, key: &[u8], vbid: u16, cas: u64, now: u32) -> Result<()> {
        let Some(vb) = self.active_vbucket(vbid) else {
            return self.not_my_vbucket();
        };

        vb.ht.with_bucket(key, |b| {
            self.reap_in_bucket(&vb, b, key, now);
            match b.find(key, false) {
                Some(v) => {
                    if v.is_locked(now) && v.cas() == cas {
                        v.unlock();
                        Ok(())
                    } else {
                        Err(DriftError::TempFail)
                    }
                }
                None => {
                    if self.is_degraded() {
                        Err(DriftError::TempFail)
                    } else {
                        Err(DriftError::KeyNotFound)
                    }
                }
            }
        })
    }

    pub fn get_key_stats(&self, key: &[u8], vbid: u16) -> Result<KeyStats> {
        let Some(vb) = self.active_vbucket(vbid) else {
            return self.not_my_vbucket();
        };
        let now = unix_now();
        vb.ht.with_bucket(key, |b| {
            self.reap_in_bucket(&vb, b, key, now);
            match b.find(key, false) {
                Some(v) => Ok(KeyStats {
                    dirty: v.is_dirty(),
                    exptime: v.exptime(),
                    flags: v.flags(),
                    cas: v.cas(),
                    data_age: v.data_age(),
                }),
                None => Err(DriftError::KeyNotFound),
            }
        })
    }

    /// Soft-delete a key. `use_meta` carries an externally supplied seqno
    /// and looks through temp placeholders (delete-with-meta).
    #[allow(clippy::too_many_arguments)]
    pub fn delete_item(
        &self,
        key: &[u8],
        seqno: u32,
        cas: u64,
        vbid: u16,
        cookie: Cookie,
        force: bool,
        use_meta: bool,
    ) -> Result<()> {
        let Some(vb) = self.vbuckets.get(vbid) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead if !force => return self.not_my_vbucket(),
            VBucketState::Replica if !force => return self.not_my_vbucket(),
            VBucketState::Pending if !force => {
                if vb.add_pending_op(cookie) {
                    self.stats.record_pending_op();
                    return Err(DriftError::WouldBlock);
                }
            }
            _ => {}
        }

        let now = unix_now();
        let degraded = self.is_degraded();
        // Restore bookkeeping locks ahead of the hash bucket.
        let mut restore = degraded.then(|| self.restore.lock());

        let (delrv, should_queue, queued_seqno, rowid) = vb.ht.with_bucket(key, |b| {
            let prior = b
                .find(key, use_meta)
                .map(|v| v.is_expired(now));
            if prior.is_none() {
                if let Some(restore) = restore.as_mut() {
                    // Suppress future restore-stream resurrections.
                    restore.items_deleted.insert(key.to_vec());
                }
            }

            let delrv = b.soft_delete(key, cas, use_meta.then_some(seqno), now);
            let (queued_seqno, rowid) = match b.find(key, true) {
                Some(v) => (v.seqno(), v.id()),
                None => (0, -1),
            };
            let expired = prior.unwrap_or(false);
            let should_queue = matches!(delrv, SetStatus::WasClean | SetStatus::WasDirty)
                || (delrv == SetStatus::NotFound && (expired || degraded));
            (delrv, should_queue, queued_seqno, rowid)
        });
        drop(restore);

        if should_queue {
            self.queue_dirty(&vb, key, QueueOp::Del, queued_seqno, rowid, false);
        }

        match delrv {
            SetStatus::WasClean | SetStatus::WasDirty => Ok(()),
            SetStatus::InvalidCas => Err(DriftError::KeyExists),
            SetStatus::IsLocked => Err(DriftError::TempFail),
            _ => Err(DriftError::KeyNotFound),
        }
    }

    /// Eject a clean resident value from memory. `force` first marks the
    /// value clean, so even dirty data can be pushed out.
    pub fn evict_key(&self, key: &[u8], vbid: u16, force: bool) -> Result<EvictResult> {
        let Some(vb) = self.vbuckets.get(vbid) else {
            return self.not_my_vbucket();
        };
        if vb.state() != VBucketState::Active && !force {
            return self.not_my_vbucket();
        }

        let now = unix_now();
        vb.ht.with_bucket(key, |b| {
            self.reap_in_bucket(&vb, b, key, now);
            match b.find(key, force) {
                Some(v) => {
                    if force {
                        v.mark_clean();
                    }
                    if !v.is_resident() {
                        return Ok(EvictResult::AlreadyEjected);
                    }
                    if b.eject_value(key) {
                        Ok(EvictResult::Ejected)
                    } else {
                        Ok(EvictResult::CannotEject)
                    }
                }
                None => Err(DriftError::KeyNotFound),
            }
        })
    }

    /// Online-restore insert of a streamed backup record. Returns true when
    /// the record was taken, false when it was suppressed (already
    /// overridden in memory, or deleted during the restore).
    pub fn restore_item(&self, itm: &Item, op: QueueOp) -> Result<bool> {
        let Some(vb) = self.vbuckets.get(itm.vbucket()) else {
            return self.not_my_vbucket();
        };

        let now = unix_now();
        let vbver = self.vbuckets.version(itm.vbucket());
        let mut restore = self.restore.lock();
        if restore.items_deleted.contains(itm.key()) {
            return Ok(false);
        }

        let inserted = vb.ht.with_bucket(itm.key(), |b| {
            if b.find(itm.key(), true).is_some() {
                return false;
            }
            matches!(
                b.set(itm, 0, true, true, now),
                (SetStatus::NotFound, _)
            )
        });
        if !inserted {
            return Ok(false);
        }

        let qi = Arc::new(QueuedItem::new(
            itm.key().to_vec(),
            itm.vbucket(),
            op,
            vbver,
            itm.rowid(),
            itm.seqno(),
            now,
        ));
        restore.items.entry(itm.vbucket()).or_default().push(qi);
        self.stats.tot_enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Leaving degraded mode clears the restore suppression set.
    pub fn complete_degraded_mode(&self) {
        self.restore.lock().items_deleted.clear();
        self.set_degraded(false);
    }

    /// TAP throttle gate: memory pressure plus a deep write queue.
    pub fn should_throttle_tap(&self) -> bool {
        let threshold = self.config.tap_throttle_threshold.load(Ordering::Acquire) as usize;
        let max = self.stats.max_data_size.load(Ordering::Acquire);
        if self.stats.mem_used() * 100 <= max * threshold {
            return false;
        }
        let cap = self.config.tap_throttle_queue_cap.load(Ordering::Acquire);
        cap < 0 || self.write_queue_size() as i64 > cap
    }

    // ============ VBucket lifecycle ============

    pub fn set_vbucket_state(&self, vbid: u16, to: VBucketState) {
        let lh = self.vbset_mutex.lock();
        if let Some(vb) = self.vbuckets.get(vbid) {
            let from = vb.state();
            vb.set_state(to);
            drop(lh);
            if from == VBucketState::Pending && to == VBucketState::Active {
                self.fire_pending_vbucket_ops(&vb);
            }
            self.schedule_vb_snapshot(SnapshotPriority::Low);
        } else {
            let vb = Arc::new(VBucket::new(
                vbid,
                to,
                self.config.ht_initial_buckets,
                Arc::clone(&self.stats),
                self.cas_counter(),
            ));
            if to != VBucketState::Active {
                vb.checkpoint.set_open_checkpoint_id(0);
            }
            let new_version = self.vbuckets.next_version(vbid);
            self.vbuckets.add(vb);
            self.vbuckets.set_version(vbid, new_version);
            drop(lh);
            self.schedule_vb_snapshot(SnapshotPriority::High);
        }
    }

    /// All cookies parked on a pending vbucket resolve exactly once when
    /// it activates.
    fn fire_pending_vbucket_ops(&self, vb: &Arc<VBucket>) {
        let cookies = vb.take_pending_ops();
        let fired = cookies.len() as u64;
        for cookie in cookies {
            self.notifier.notify_io_complete(cookie, Ok(()));
        }
        if fired > 0 {
            self.stats.record_pending_ops_fired(fired);
        }
    }

    /// Remove a dead vbucket from memory and schedule its disk cleanup.
    pub fn delete_vbucket(&self, vbid: u16) -> bool {
        let lh = self.vbset_mutex.lock();
        let Some(vb) = self.vbuckets.get(vbid) else {
            return false;
        };
        if vb.state() != VBucketState::Dead {
            return false;
        }
        let vb_version = self.vbuckets.version(vbid);
        drop(lh);

        vb.ht.clear();
        self.vbuckets.remove(vbid);
        self.schedule_vb_snapshot(SnapshotPriority::High);
        self.schedule_vb_deletion_task(vb, vb_version, Duration::ZERO);
        true
    }

    /// Clear a vbucket in place, bumping its version so queued work against
    /// the old incarnation is dropped by the flusher.
    pub fn reset_vbucket(&self, vbid: u16) -> bool {
        let lh = self.vbset_mutex.lock();
        let Some(vb) = self.vbuckets.get(vbid) else {
            return false;
        };
        if vb.ht.num_items() == 0 && vb.ht.num_deleted() == 0 {
            return true;
        }
        let vb_version = self.vbuckets.version(vbid);
        let new_version = self.vbuckets.next_version(vbid);
        self.vbuckets.set_version(vbid, new_version);
        self.vbuckets.set_persistence_checkpoint_id(vbid, 0);
        drop(lh);

        // Clear the rows on disk first: the chunked deletion's range list
        // is walked out of the still-live hash table.
        self.schedule_vb_deletion_task(Arc::clone(&vb), vb_version, Duration::ZERO);

        vb.ht.clear();
        vb.checkpoint.clear();
        vb.reset_flush_stats();

        self.schedule_vb_snapshot(SnapshotPriority::High);
        true
    }

    /// Clear every vbucket and schedule a disk flush-all through a
    /// synthetic queued marker.
    pub fn reset(&self) {
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                vb.ht.clear();
                vb.checkpoint.clear();
                vb.reset_flush_stats();
            }
        }
        if self
            .disk_flush_all
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.stats
                .queue_size
                .store(self.write_queue_size() as u64 + 1, Ordering::Relaxed);
            self.flusher.wake(&self.rw_dispatcher);
        }
    }

    pub(crate) fn schedule_vb_deletion_task(
        &self,
        vb: Arc<VBucket>,
        vb_version: u16,
        delay: Duration,
    ) {
        schedule_vb_deletion(self, vb, vb_version, delay);
    }

    // ============ Snapshots ============

    pub(crate) fn schedule_vb_snapshot(&self, priority: SnapshotPriority) {
        let fresh = match priority {
            SnapshotPriority::High => self.vbuckets.set_high_priority_vb_snapshot(true),
            SnapshotPriority::Low => self.vbuckets.set_low_priority_vb_snapshot(true),
        };
        if !fresh {
            return;
        }
        let task = Arc::new(SnapshotTask {
            store: self.weak_self(),
            priority,
        });
        let task_priority = match priority {
            SnapshotPriority::High => priority::VB_SNAPSHOT_HIGH,
            SnapshotPriority::Low => priority::VB_SNAPSHOT_LOW,
        };
        self.rw_dispatcher.schedule(task, task_priority, Duration::ZERO);
    }

    pub(crate) fn snapshot_vbucket_states(&self, priority: SnapshotPriority) {
        match priority {
            SnapshotPriority::High => {
                self.vbuckets.set_high_priority_vb_snapshot(false);
            }
            SnapshotPriority::Low => {
                self.vbuckets.set_low_priority_vb_snapshot(false);
            }
        }

        let mut states = HashMap::new();
        for vbid in self.vbuckets.ids() {
            let Some(vb) = self.vbuckets.get(vbid) else {
                continue;
            };
            states.insert(
                (vbid, self.vbuckets.version(vbid)),
                VbStateSnapshot {
                    state: vb.state(),
                    checkpoint_id: self.vbuckets.persistence_checkpoint_id(vbid),
                    max_deleted_seqno: vb.ht.max_deleted_seqno(),
                },
            );
        }
        if !self.rw.snapshot_vbuckets(&states) {
            debug!("rescheduling vbucket state snapshot");
            self.schedule_vb_snapshot(priority);
        }
    }

    // ============ Internals shared with the flusher and warmup ============

    fn not_my_vbucket<T>(&self) -> Result<T> {
        self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
        Err(DriftError::NotMyVbucket)
    }

    fn active_vbucket(&self, vbid: u16) -> Option<Arc<VBucket>> {
        let vb = self.vbuckets.get(vbid)?;
        (vb.state() == VBucketState::Active).then_some(vb)
    }

    /// Lazy expiry inside an already-locked bucket; queues the deletion a
    /// live expiry produces.
    pub(crate) fn reap_in_bucket(
        &self,
        vb: &Arc<VBucket>,
        b: &mut crate::core::hash_table::Bucket<'_>,
        key: &[u8],
        now: u32,
    ) {
        match b.reap_expired(key, now) {
            Reaped::NotExpired => {}
            Reaped::TempReaped => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
            }
            Reaped::Expired { seqno, rowid } => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                self.queue_dirty(vb, key, QueueOp::Del, seqno, rowid, false);
            }
        }
    }

    pub(crate) fn queue_dirty(
        &self,
        vb: &Arc<VBucket>,
        key: &[u8],
        op: QueueOp,
        seqno: u32,
        rowid: i64,
        tap_backfill: bool,
    ) {
        if !self.do_persistence {
            return;
        }
        let qi = Arc::new(QueuedItem::new(
            key.to_vec(),
            vb.id(),
            op,
            self.vbuckets.version(vb.id()),
            rowid,
            seqno,
            unix_now(),
        ));
        if tap_backfill {
            vb.queue_backfill(qi);
            self.stats.tot_enqueued.fetch_add(1, Ordering::Relaxed);
        } else if vb.checkpoint.queue_dirty(qi) {
            self.stats.tot_enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn has_items_for_persistence(&self) -> bool {
        for vbid in self.vbuckets.ids() {
            let Some(vb) = self.vbuckets.get(vbid) else {
                continue;
            };
            if vb.state() == VBucketState::Dead {
                continue;
            }
            if vb.checkpoint.has_items_for_persistence() || vb.backfill_size() > 0 {
                return true;
            }
            let restore = self.restore.lock();
            if restore
                .items
                .get(&vbid)
                .map(|items| !items.is_empty())
                .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }

    pub(crate) fn write_queue_size(&self) -> usize {
        let mut size = 0;
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                if vb.state() != VBucketState::Dead {
                    size += vb.checkpoint.num_items_for_persistence() + vb.backfill_size();
                }
            }
        }
        size
    }

    pub(crate) fn restore_take_items(&self, vbid: u16, out: &mut Vec<Arc<QueuedItem>>) {
        let mut restore = self.restore.lock();
        if let Some(items) = restore.items.get_mut(&vbid) {
            out.append(items);
        }
    }

    pub(crate) fn bg_fetch(
        &self,
        key: &[u8],
        vbid: u16,
        vbver: u16,
        rowid: i64,
        cookie: Cookie,
        kind: BgFetchKind,
    ) {
        self.bg_fetch_queue.fetch_add(1, Ordering::AcqRel);
        let delay = self.config.bg_fetch_delay.load(Ordering::Acquire);
        let task = Arc::new(crate::core::bgfetch::BgFetchTask::new(
            self.weak_self(),
            key.to_vec(),
            vbid,
            vbver,
            rowid,
            cookie,
            kind,
        ));
        debug!(
            "queued a background fetch, now at {}",
            self.bg_fetch_queue.load(Ordering::Acquire)
        );
        self.ro_dispatcher
            .schedule(task, priority::BG_FETCHER, Duration::from_secs(delay as u64));
    }

    pub(crate) fn bg_fetch_done(&self) {
        self.bg_fetch_queue.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn notify_io_complete(&self, cookie: Cookie, status: Result<()>) {
        self.notifier.notify_io_complete(cookie, status);
    }

    /// Enable traffic early once enough of the working set is resident.
    pub(crate) fn maybe_enable_traffic(&self) {
        if !self.is_degraded() {
            return;
        }
        let mem_used = self.stats.mem_used() as f64;
        let max_size = self.stats.max_data_size.load(Ordering::Acquire) as f64;
        let mem_cap = self
            .config
            .warmup_min_memory_threshold
            .load(Ordering::Acquire) as f64
            / 100.0;
        let items_cap = self
            .config
            .warmup_min_items_threshold
            .load(Ordering::Acquire) as f64
            / 100.0;
        let warmed_up = self.stats.warmed_up.load(Ordering::Relaxed) as f64;
        let warmed_up_meta = self.stats.warmed_up_meta.load(Ordering::Relaxed) as f64;

        if mem_used > max_size * mem_cap {
            info!("enough data loaded to enable traffic");
            self.complete_degraded_mode();
        } else if warmed_up_meta > 0.0 && warmed_up > warmed_up_meta * items_cap {
            info!("enough items loaded to enable traffic");
            self.complete_degraded_mode();
        }
    }

    /// Post-warmup hookup: snapshot states and launch the periodic workers.
    pub(crate) fn warmup_completed(&self) {
        if !self.is_degraded() {
            self.restore.lock().items_deleted.clear();
        } else {
            self.complete_degraded_mode();
        }
        self.stats.warmup_complete.store(true, Ordering::Release);
        self.schedule_vb_snapshot(SnapshotPriority::High);
        self.schedule_periodic_workers();
    }

    fn schedule_periodic_workers(&self) {
        crate::core::pagers::schedule_all(self);
    }

    pub(crate) fn set_expiry_pager_sleeptime(&self, secs: u64) {
        let mut task = self.expiry_pager_task.lock();
        if let Some(id) = task.take() {
            self.nonio_dispatcher.cancel(id);
        }
        if secs != 0 {
            let id = crate::core::pagers::schedule_expiry_pager(self, Duration::from_secs(secs));
            *task = Some(id);
        }
    }

    pub(crate) fn weak_self(&self) -> Weak<DriftStore> {
        // Registered at build time; never empty afterwards.
        self.self_ref.lock().clone()
    }

    fn register_config_listeners(self: &Arc<Self>) {
        *self.self_ref.lock() = Arc::downgrade(self);

        struct PagerListener(Weak<DriftStore>);
        impl ValueChangedListener for PagerListener {
            fn value_changed(&self, _key: &str, value: u64) {
                if let Some(store) = self.0.upgrade() {
                    store.set_expiry_pager_sleeptime(value);
                }
            }
        }
        self.config.add_value_changed_listener(
            "exp_pager_stime",
            Box::new(PagerListener(Arc::downgrade(self))),
        );

        struct BatchCountListener(Weak<DriftStore>);
        impl ValueChangedListener for BatchCountListener {
            fn value_changed(&self, _key: &str, value: u64) {
                if let Some(store) = self.0.upgrade() {
                    store.rw.set_vb_batch_count(value as usize);
                }
            }
        }
        self.config.add_value_changed_listener(
            "couch_vbucket_batch_count",
            Box::new(BatchCountListener(Arc::downgrade(self))),
        );
    }

    /// Orderly shutdown: drain the flusher (unless `force`), then stop the
    /// dispatchers.
    pub fn shutdown(&self, force: bool) {
        if self.do_persistence && !force {
            self.flusher.stop(&self.rw_dispatcher);
            self.flusher.wait_for_state(
                crate::storage::flusher::FlusherState::Stopped,
                Duration::from_secs(60),
            );
        }
        self.rw_dispatcher.stop(force);
        if !Arc::ptr_eq(&self.ro_dispatcher, &self.rw_dispatcher) {
            self.ro_dispatcher.stop(force);
        }
        self.nonio_dispatcher.stop(force);
    }
}

impl Drop for DriftStore {
    fn drop(&mut self) {
        // Backstop for callers that never invoked shutdown(); tasks hold
        // weak references, so a forced stop is all that is still possible.
        self.rw_dispatcher.stop(true);
        if !Arc::ptr_eq(&self.ro_dispatcher, &self.rw_dispatcher) {
            self.ro_dispatcher.stop(true);
        }
        self.nonio_dispatcher.stop(true);
    }
}

struct SnapshotTask {
    store: Weak<DriftStore>,
    priority: SnapshotPriority,
}

impl Task for SnapshotTask {
    fn run(&self, _dispatcher: &Dispatcher, _id: TaskId) -> bool {
        if let Some(store) = self.store.upgrade() {
            store.snapshot_vbucket_states(self.priority);
        }
        false
    }

    fn description(&self) -> String {
        format!("Snapshotting vbucket states ({:?} priority)", self.priority)
    }
}
