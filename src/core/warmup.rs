use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::core::dispatcher::{priority, Dispatcher, Task, TaskId};
use crate::core::hash_table::InsertStatus;
use crate::core::item::{Item, VBucketState};
use crate::core::store::DriftStore;
use crate::core::vbucket::VBucket;
use crate::storage::kvstore::{DumpItem, VbStateSnapshot};
use crate::storage::mutation_log::{LogEntryType, MutationLog, MutationLogHarvester};
use crate::utils::unix_now;

/// Stages of the warmup state machine, in the only orders they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupState {
    Initialize,
    LoadingMutationLog,
    EstimateDatabaseItemCount,
    KeyDump,
    LoadingAccessLog,
    LoadingKVPairs,
    LoadingData,
    Done,
}

impl WarmupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarmupState::Initialize => "initialize",
            WarmupState::LoadingMutationLog => "loading mutation log",
            WarmupState::EstimateDatabaseItemCount => "estimating database item count",
            WarmupState::KeyDump => "loading keys",
            WarmupState::LoadingAccessLog => "loading access log",
            WarmupState::LoadingKVPairs => "loading k/v pairs",
            WarmupState::LoadingData => "loading data",
            WarmupState::Done => "done",
        }
    }

    pub(crate) fn legal_transition(self, to: WarmupState) -> bool {
        use WarmupState::*;
        matches!(
            (self, to),
            (Initialize, LoadingMutationLog)
                | (LoadingMutationLog, LoadingAccessLog)
                | (LoadingMutationLog, EstimateDatabaseItemCount)
                | (EstimateDatabaseItemCount, KeyDump)
                | (KeyDump, LoadingKVPairs)
                | (KeyDump, LoadingAccessLog)
                | (LoadingAccessLog, Done)
                | (LoadingAccessLog, LoadingData)
                | (LoadingKVPairs, Done)
                | (LoadingData, Done)
        )
    }
}

/// Multi-stage reconstruction of in-memory state from the mutation log,
/// the access log, and the backing store, with fallbacks at each stage.
pub struct Warmup {
    store: Weak<DriftStore>,
    state: Mutex<WarmupState>,
    initial_states: Mutex<HashMap<(u16, u16), VbStateSnapshot>>,
    start_wall_time: Mutex<Option<Instant>>,
    start_unix: AtomicU32,
    estimated_item_count: AtomicUsize,
    estimated_warmup_count: AtomicUsize,
    reconstruct_log: AtomicBool,
    corrupt_mutation_log: AtomicBool,
    corrupt_access_log: AtomicBool,
    has_purged: AtomicBool,
}

impl Warmup {
    pub(crate) fn start(store: &Arc<DriftStore>) {
        let warmup = Arc::new(Warmup {
            store: Arc::downgrade(store),
            state: Mutex::new(WarmupState::Initialize),
            initial_states: Mutex::new(HashMap::new()),
            start_wall_time: Mutex::new(None),
            start_unix: AtomicU32::new(0),
            estimated_item_count: AtomicUsize::new(usize::MAX),
            estimated_warmup_count: AtomicUsize::new(usize::MAX),
            reconstruct_log: AtomicBool::new(false),
            corrupt_mutation_log: AtomicBool::new(false),
            corrupt_access_log: AtomicBool::new(false),
            has_purged: AtomicBool::new(false),
        });
        *store.warmup.lock() = Some(Arc::clone(&warmup));
        let stepper = Arc::new(WarmupStepper { warmup });
        store
            .rw_dispatcher
            .schedule(stepper, priority::WARMUP, Duration::ZERO);
    }

    pub fn state(&self) -> WarmupState {
        *self.state.lock()
    }

    pub fn estimated_item_count(&self) -> usize {
        self.estimated_item_count.load(Ordering::Acquire)
    }

    pub fn estimated_warmup_count(&self) -> usize {
        self.estimated_warmup_count.load(Ordering::Acquire)
    }

    pub fn corrupt_mutation_log(&self) -> bool {
        self.corrupt_mutation_log.load(Ordering::Acquire)
    }

    pub fn corrupt_access_log(&self) -> bool {
        self.corrupt_access_log.load(Ordering::Acquire)
    }

    /// Move the state machine; anything not in the transition table is a
    /// bug and fails loudly.
    fn transition(&self, to: WarmupState) {
        let mut state = self.state.lock();
        assert!(
            state.legal_transition(to),
            "illegal warmup transition from \"{}\" to \"{}\"",
            state.as_str(),
            to.as_str()
        );
        info!(
            "warmup transition from \"{}\" to \"{}\"",
            state.as_str(),
            to.as_str()
        );
        *state = to;
    }

    fn step(&self, store: &Arc<DriftStore>) -> bool {
        match self.state() {
            WarmupState::Initialize => self.initialize(store),
            WarmupState::LoadingMutationLog => self.loading_mutation_log(store),
            WarmupState::EstimateDatabaseItemCount => self.estimate_item_count(store),
            WarmupState::KeyDump => self.key_dump(store),
            WarmupState::LoadingAccessLog => self.loading_access_log(store),
            WarmupState::LoadingKVPairs => self.loading_kv_pairs(store),
            WarmupState::LoadingData => self.loading_data(store),
            WarmupState::Done => self.done(store),
        }
    }

    /// Load persisted vbucket states and seed one dead VBucket per
    /// (vbid, vbver), carrying its checkpoint id and max-deleted-seqno.
    fn initialize(&self, store: &Arc<DriftStore>) -> bool {
        *self.start_wall_time.lock() = Some(Instant::now());
        self.start_unix.store(unix_now(), Ordering::Release);

        let states = store.ro.list_persisted_vbuckets();
        for ((vbid, vbver), vbs) in &states {
            let vb = self.ensure_vbucket(store, *vbid);
            vb.set_initial_state(vbs.state);
            vb.checkpoint.set_open_checkpoint_id(vbs.checkpoint_id);
            vb.ht.set_max_deleted_seqno(vbs.max_deleted_seqno);
            store.vbuckets.set_version(*vbid, *vbver);
            store
                .vbuckets
                .set_persistence_checkpoint_id(*vbid, vbs.checkpoint_id.saturating_sub(1));
        }
        *self.initial_states.lock() = states;

        self.transition(WarmupState::LoadingMutationLog);
        true
    }

    /// Replay the mutation log into the hash tables: committed NEW records
    /// rehydrate rowids; uncommitted leftovers are purged from disk.
    fn loading_mutation_log(&self, store: &Arc<DriftStore>) -> bool {
        let success = match self.warmup_from_log(store) {
            Ok(success) => success,
            Err(e) => {
                self.corrupt_mutation_log.store(true, Ordering::Release);
                warn!("error reading warmup log: {e}");
                false
            }
        };

        if success {
            self.transition(WarmupState::LoadingAccessLog);
        } else {
            match store.mutation_log.reset() {
                Ok(true) => self.reconstruct_log.store(true, Ordering::Release),
                Ok(false) => {}
                Err(e) => warn!("failed to reset mutation log: {e}"),
            }
            warn!("failed to load mutation log, falling back to key dump");
            self.transition(WarmupState::EstimateDatabaseItemCount);
        }
        true
    }

    fn warmup_from_log(&self, store: &Arc<DriftStore>) -> crate::error::Result<bool> {
        if !store.mutation_log.exists() {
            return Ok(false);
        }
        let mut harvester = MutationLogHarvester::new();
        for (vbid, vbver) in self.initial_states.lock().keys() {
            harvester.set_vbucket_version(*vbid, *vbver);
        }
        harvester.load(&store.mutation_log)?;
        if harvester.total() == 0 {
            return Ok(false);
        }

        self.estimated_item_count
            .store(harvester.total(), Ordering::Release);

        harvester.apply(&mut |vbid, key, rowid| {
            let current = store.vbuckets.version(vbid);
            let itm = Item::with_meta(key, vbid, None, 0, 0, 0, 1, rowid);
            self.load_item(
                store,
                DumpItem {
                    item: itm,
                    vb_version: current,
                },
                true,
                false,
            );
        });
        store
            .mutation_log
            .reset_counts(harvester.items_seen(), harvester.total() as u64);

        // Whatever never made it through both commit markers must not be
        // visible after recovery; scrub the rows.
        let uncommitted = harvester.uncommitted();
        if !uncommitted.is_empty() {
            warn!(
                "{} uncommitted mutation log records; deleting them from the backing store",
                uncommitted.len()
            );
            for record in uncommitted {
                let Some(vb) = store.vbuckets.get(record.vbucket) else {
                    continue;
                };
                if record.kind != LogEntryType::New {
                    continue;
                }
                // Park a tombstone so the flusher scrubs the row; a key the
                // committed replay already knows is left alone.
                let itm = Item::with_meta(
                    record.key.clone(),
                    record.vbucket,
                    None,
                    0,
                    0,
                    0,
                    1,
                    record.rowid,
                );
                let now = unix_now();
                let queued = vb.ht.with_bucket(&record.key, |b| {
                    if !matches!(b.warm_insert(&itm, false, true), InsertStatus::Ok) {
                        return None;
                    }
                    b.soft_delete(&record.key, 0, None, now);
                    b.find(&record.key, true).map(|v| (v.seqno(), v.id()))
                });
                if let Some((seqno, rowid)) = queued {
                    store.queue_dirty(
                        &vb,
                        &record.key,
                        crate::core::item::QueueOp::Del,
                        seqno,
                        rowid,
                        false,
                    );
                }
            }
        }
        Ok(true)
    }

    fn estimate_item_count(&self, store: &Arc<DriftStore>) -> bool {
        self.estimated_item_count
            .store(store.ro.estimated_item_count(), Ordering::Release);
        self.transition(WarmupState::KeyDump);
        true
    }

    /// Load keys (no values) for active/replica vbuckets, when the store
    /// can enumerate them.
    fn key_dump(&self, store: &Arc<DriftStore>) -> bool {
        let mut success = false;
        if store.storage_props.key_dump_supported {
            let vbids: Vec<u16> = self
                .initial_states
                .lock()
                .iter()
                .filter(|(_, vbs)| {
                    matches!(vbs.state, VBucketState::Active | VBucketState::Replica)
                })
                .map(|((vbid, _), _)| *vbid)
                .collect();
            store.ro.dump_keys(&vbids, &mut |di| {
                self.load_item(store, di, true, false);
            });
            success = true;
        }

        if success {
            self.transition(WarmupState::LoadingAccessLog);
        } else {
            warn!("key dump unsupported, falling back to full dump");
            self.transition(WarmupState::LoadingKVPairs);
        }
        true
    }

    /// Replay the predicted working set from the access log, falling back
    /// to the `.old` sibling when the current file fails.
    fn loading_access_log(&self, store: &Arc<DriftStore>) -> bool {
        let states = self.initial_states.lock().clone();
        let mut success = false;

        if let Some(path) = &store.access_log_path {
            for candidate in [path.clone(), path.with_extension("old")] {
                if success || !candidate.exists() {
                    continue;
                }
                let alog = MutationLog::new(
                    Some(candidate),
                    store.config.klog_block_size,
                    0,
                );
                let mut estimate = |count: usize| {
                    self.estimated_warmup_count.store(count, Ordering::Release);
                };
                match store.ro.warmup(
                    &alog,
                    &states,
                    &mut |di| self.load_item(store, di, false, true),
                    &mut estimate,
                ) {
                    Ok(loaded) => {
                        info!("access log warmup loaded {loaded} items");
                        success = true;
                    }
                    Err(e) => {
                        self.corrupt_access_log.store(true, Ordering::Release);
                        warn!("failed to load access log: {e}");
                    }
                }
            }
        }

        if success {
            self.finish_log_reconstruction(store);
            self.transition(WarmupState::Done);
        } else {
            self.transition(WarmupState::LoadingData);
        }
        true
    }

    /// Full enumeration, metadata and values, used when neither the
    /// mutation log nor the access log could seed memory.
    fn loading_kv_pairs(&self, store: &Arc<DriftStore>) -> bool {
        store.ro.dump(&mut |di| {
            self.load_item(store, di, false, false);
        });
        self.finish_log_reconstruction(store);
        self.transition(WarmupState::Done);
        true
    }

    /// Full enumeration after access-log failure; traffic may enable
    /// mid-load.
    fn loading_data(&self, store: &Arc<DriftStore>) -> bool {
        store.ro.dump(&mut |di| {
            self.load_item(store, di, false, true);
        });
        self.finish_log_reconstruction(store);
        self.transition(WarmupState::Done);
        true
    }

    fn done(&self, store: &Arc<DriftStore>) -> bool {
        if store.config.fail_on_partial_warmup
            && store.stats.warm_oom.load(Ordering::Relaxed) > 0
        {
            error!("partial warmup (warmOOM > 0) with fail_on_partial_warmup set; exiting");
            std::process::exit(1);
        }
        if let Some(start) = *self.start_wall_time.lock() {
            info!("warmup completed in {:?}", start.elapsed());
        }
        store.warmup_completed();
        false
    }

    fn finish_log_reconstruction(&self, store: &Arc<DriftStore>) {
        if self.reconstruct_log.swap(false, Ordering::AcqRel) {
            let _ = store.mutation_log.commit1();
            let _ = store.mutation_log.commit2();
        }
    }

    /// One loaded record: route stale-version rows to the invalid-item
    /// pager, insert the rest, purging once and counting warmOOM on the
    /// second failure.
    fn load_item(&self, store: &Arc<DriftStore>, di: DumpItem, keys_only: bool, maybe_enable: bool) {
        let itm = di.item;
        let vbid = itm.vbucket();
        let current_version = store.vbuckets.version(vbid);
        if di.vb_version != current_version {
            warn!(
                "ignoring item with stale vbucket version ({} != {})",
                di.vb_version, current_version
            );
            let mut invalid = store.invalid_vb_versions.lock();
            if !invalid.contains(&(vbid, di.vb_version)) {
                invalid.push((vbid, di.vb_version));
            }
            return;
        }

        let vb = self.ensure_vbucket(store, vbid);
        let mut succeeded = false;
        for attempt in 0..2 {
            let should_eject = store.stats.mem_used()
                >= store.stats.mem_low_wat.load(Ordering::Acquire);
            let status = vb
                .ht
                .with_bucket(itm.key(), |b| b.warm_insert(&itm, should_eject, keys_only));
            match status {
                InsertStatus::Ok => {
                    succeeded = true;
                    break;
                }
                InsertStatus::Dup => {
                    // Memory already has a newer view of this key.
                    store.stats.warm_dups.fetch_add(1, Ordering::Relaxed);
                    succeeded = true;
                    break;
                }
                InsertStatus::NoMem => {
                    if attempt == 0 && !self.has_purged.load(Ordering::Acquire) {
                        warn!("emergency startup purge to free space for load");
                        self.purge(store);
                    } else {
                        if store.stats.warm_oom.fetch_add(1, Ordering::Relaxed) == 0 {
                            warn!("warmup dataload failure: max data size too low");
                        }
                        break;
                    }
                }
            }
        }

        if succeeded {
            let start = self.start_unix.load(Ordering::Acquire);
            if itm.is_expired(start) {
                let _ = store.delete_item(itm.key(), 0, 0, vbid, 0, true, false);
            } else if self.reconstruct_log.load(Ordering::Acquire) && itm.rowid() >= 0 {
                let _ = store
                    .mutation_log
                    .new_item(vbid, itm.key(), itm.rowid());
            }
        }

        if keys_only {
            store.stats.warmed_up_meta.fetch_add(1, Ordering::Relaxed);
        } else {
            store.stats.warmed_up.fetch_add(1, Ordering::Relaxed);
        }
        if maybe_enable {
            store.maybe_enable_traffic();
        }
    }

    /// Store-wide value ejection, used at most once per warmup.
    fn purge(&self, store: &Arc<DriftStore>) {
        store.visit_vbuckets(|vb| vb.ht.eject_resident_values());
        self.has_purged.store(true, Ordering::Release);
    }

    fn ensure_vbucket(&self, store: &Arc<DriftStore>, vbid: u16) -> Arc<VBucket> {
        if let Some(vb) = store.vbuckets.get(vbid) {
            return vb;
        }
        let _lh = store.vbset_mutex.lock();
        if let Some(vb) = store.vbuckets.get(vbid) {
            return vb;
        }
        let vb = Arc::new(VBucket::new(
            vbid,
            VBucketState::Dead,
            store.config.ht_initial_buckets,
            Arc::clone(&store.stats),
            store.cas_counter(),
        ));
        store.vbuckets.add(Arc::clone(&vb));
        vb
    }
}

struct WarmupStepper {
    warmup: Arc<Warmup>,
}

impl Task for WarmupStepper {
    fn run(&self, _dispatcher: &Dispatcher, _id: TaskId) -> bool {
        let Some(store) = self.warmup.store.upgrade() else {
            return false;
        };
        self.warmup.step(&store)
    }

    fn description(&self) -> String {
        format!("Warmup: {}", self.warmup.state().as_str())
    }
}
