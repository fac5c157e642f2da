use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::constants::{COMMIT_RETRY_BACKOFF, FLUSHER_IDLE_SNOOZE};
use crate::core::dispatcher::{priority, Dispatcher, Task, TaskId};
use crate::core::item::{QueueOp, QueuedItem, VBucketState};
use crate::core::store::{DriftStore, SnapshotPriority};
use crate::utils::unix_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlusherState {
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
}

/// Mutable flusher context: the outgoing `writing` queue, the rejection
/// queue, and the flusher's cached view of persisted vbucket states.
pub(crate) struct FlushCtx {
    pub writing: VecDeque<Arc<QueuedItem>>,
    pub reject: VecDeque<Arc<QueuedItem>>,
    cached_vb_states: HashMap<u16, VBucketState>,
    /// Checkpoint id per vbucket covered by the current `writing` batch.
    checkpoint_ids: HashMap<u16, u64>,
}

/// Groups backing-store submissions into transactions of up to
/// `max_txn_size` items, bracketing each commit with the mutation log's
/// COMMIT1/COMMIT2 markers. Commit is retried forever: losing a commit
/// would break the log protocol.
pub(crate) struct TransactionContext {
    intxn: bool,
    num_uncommitted: usize,
}

impl TransactionContext {
    fn new() -> Self {
        Self {
            intxn: false,
            num_uncommitted: 0,
        }
    }

    fn enter(&mut self, store: &DriftStore) -> bool {
        if !self.intxn {
            self.intxn = store.rw.begin();
        }
        self.intxn
    }

    fn remaining(&self, txn_size: usize) -> usize {
        txn_size.saturating_sub(self.num_uncommitted)
    }

    fn add_uncommitted(&mut self) {
        self.num_uncommitted += 1;
    }

    fn commit(&mut self, store: &DriftStore) {
        if !self.intxn {
            return;
        }
        if let Err(e) = store.mutation_log.commit1() {
            warn!("mutation log commit1 failed: {e}");
        }
        while !store.rw.commit() {
            store.stats.commit_failed.fetch_add(1, Ordering::Relaxed);
            warn!("backing store commit failed, retrying");
            let jitter = {
                use rand::Rng;
                rand::rng().random_range(0..=100)
            };
            std::thread::sleep(COMMIT_RETRY_BACKOFF + Duration::from_millis(jitter));
        }
        if let Err(e) = store.mutation_log.commit2() {
            warn!("mutation log commit2 failed: {e}");
        }
        store.stats.flusher_commits.fetch_add(1, Ordering::Relaxed);
        self.intxn = false;
        self.num_uncommitted = 0;
    }

    fn leave(&mut self) {
        if !self.intxn {
            self.num_uncommitted = 0;
        }
    }
}

/// Single-threaded drain of every vbucket's checkpoint, backfill, and
/// restore queues into shard-partitioned batches against the backing store.
pub struct Flusher {
    state: Mutex<FlusherState>,
    state_cond: Condvar,
    pub(crate) ctx: Mutex<FlushCtx>,
    pub(crate) tctx: Mutex<TransactionContext>,
    task_id: Mutex<Option<TaskId>>,
}

impl Flusher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlusherState::Initializing),
            state_cond: Condvar::new(),
            ctx: Mutex::new(FlushCtx {
                writing: VecDeque::new(),
                reject: VecDeque::new(),
                cached_vb_states: HashMap::new(),
                checkpoint_ids: HashMap::new(),
            }),
            tctx: Mutex::new(TransactionContext::new()),
            task_id: Mutex::new(None),
        }
    }

    pub fn state(&self) -> FlusherState {
        *self.state.lock()
    }

    fn transition(&self, to: FlusherState) {
        *self.state.lock() = to;
        self.state_cond.notify_all();
    }

    pub fn wait_for_state(&self, target: FlusherState, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while *state != target {
            if self
                .state_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return *state == target;
            }
        }
        true
    }

    pub(crate) fn start(store: &Arc<DriftStore>) {
        let task = Arc::new(FlusherTask {
            store: Arc::downgrade(store),
        });
        let id = store
            .rw_dispatcher
            .schedule(task, priority::FLUSHER, Duration::ZERO);
        *store.flusher.task_id.lock() = Some(id);
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state == FlusherState::Running {
            *state = FlusherState::Paused;
            self.state_cond.notify_all();
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == FlusherState::Paused {
            *state = FlusherState::Running;
            self.state_cond.notify_all();
        }
    }

    /// Ask the flusher to drain and stop. `wait_for_state(Stopped)` blocks
    /// until the final pass completes.
    pub fn stop(&self, dispatcher: &Dispatcher) {
        {
            let mut state = self.state.lock();
            match *state {
                FlusherState::Stopped => return,
                _ => *state = FlusherState::Stopping,
            }
            self.state_cond.notify_all();
        }
        if let Some(id) = *self.task_id.lock() {
            dispatcher.wake(id);
        }
    }

    /// Pull the flusher's next run forward; used after enqueuing work that
    /// should hit disk promptly.
    pub fn wake(&self, dispatcher: &Dispatcher) {
        if let Some(id) = *self.task_id.lock() {
            dispatcher.wake(id);
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        matches!(
            *self.state.lock(),
            FlusherState::Stopping | FlusherState::Stopped
        )
    }
}

impl Default for Flusher {
    fn default() -> Self {
        Self::new()
    }
}

struct FlusherTask {
    store: Weak<DriftStore>,
}

impl Task for FlusherTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let flusher = &store.flusher;
        let state = flusher.state();
        match state {
            FlusherState::Initializing => {
                if store.is_warmed() {
                    flusher.transition(FlusherState::Running);
                    true
                } else {
                    dispatcher.snooze(id, FLUSHER_IDLE_SNOOZE);
                    true
                }
            }
            FlusherState::Running => {
                let hint = store.do_flush();
                if flusher.is_stopping() {
                    return true;
                }
                dispatcher.snooze(id, hint);
                true
            }
            FlusherState::Paused => {
                dispatcher.snooze(id, FLUSHER_IDLE_SNOOZE);
                true
            }
            FlusherState::Stopping => {
                // Final drain: keep flushing until nothing remains.
                loop {
                    let _ = store.do_flush();
                    let ctx = store.flusher.ctx.lock();
                    let drained = ctx.writing.is_empty() && ctx.reject.is_empty();
                    drop(ctx);
                    if drained && !store.has_items_for_persistence() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                info!("flusher stopped after draining persistence queues");
                flusher.transition(FlusherState::Stopped);
                false
            }
            FlusherState::Stopped => false,
        }
    }

    fn description(&self) -> String {
        "Running a flusher loop".to_string()
    }
}

enum FlushAction {
    /// Item vanished or was deduplicated away; nothing to do.
    Skip,
    /// Requeued for a later pass (too young, snapshot pending, in flight).
    Requeued(u32),
    Set {
        item: crate::core::item::Item,
        cas_snapshot: u64,
    },
    Del {
        item: crate::core::item::Item,
        rowid: i64,
        temp: bool,
    },
}

impl DriftStore {
    /// One flusher pass: requeue rejects, build the writing queue, drain it
    /// in transactions, reconcile checkpoint ids. Returns the snooze hint.
    pub(crate) fn do_flush(&self) -> Duration {
        let mut ctx = self.flusher.ctx.lock();

        if !ctx.reject.is_empty() {
            let rejected: Vec<_> = ctx.reject.drain(..).collect();
            for qi in rejected {
                ctx.writing.push_back(qi);
            }
        }
        if ctx.writing.is_empty() {
            self.begin_flush(&mut ctx);
        }
        if ctx.writing.is_empty() {
            for vbid in self.vbuckets.ids() {
                if let Some(vb) = self.vbuckets.get(vbid) {
                    vb.reset_flush_stats();
                }
            }
            return FLUSHER_IDLE_SNOOZE;
        }

        let flush_start = unix_now();
        self.stats
            .flusher_todo
            .store(ctx.writing.len() as u64, Ordering::Relaxed);

        let mut oldest: u32 = 0;
        while !ctx.writing.is_empty() {
            let hint = self.flush_some(&mut ctx);
            if hint > 0 && (oldest == 0 || hint < oldest) {
                oldest = hint;
            }
            if self.should_preempt_flush() {
                break;
            }
        }

        // Checkpoint ids only become durable once the whole batch has been
        // pushed; a preempted pass resumes before reconciling.
        if ctx.writing.is_empty() {
            self.complete_flush(&mut ctx, flush_start);
        }
        Duration::from_secs(oldest as u64)
    }

    fn should_preempt_flush(&self) -> bool {
        self.vbuckets.is_high_priority_vb_snapshot_scheduled() || self.flusher.is_stopping()
    }

    /// Build one `writing` queue from every non-dead vbucket: restore
    /// batches, backfill, then all dirty checkpoint items, partitioned by
    /// shard and reordered for locality.
    fn begin_flush(&self, ctx: &mut FlushCtx) {
        let flush_all = self.disk_flush_all.load(Ordering::Acquire);
        if !self.has_items_for_persistence() && !flush_all {
            return;
        }

        if flush_all {
            ctx.writing
                .push_back(Arc::new(QueuedItem::marker(0xffff, QueueOp::Flush)));
        }

        let num_shards = self.rw.num_shards();
        let mut shard_queues: Vec<Vec<Arc<QueuedItem>>> = vec![Vec::new(); num_shards];
        let mut item_list: Vec<Arc<QueuedItem>> = Vec::new();

        for vbid in self.vbuckets.ids() {
            let Some(vb) = self.vbuckets.get(vbid) else {
                continue;
            };
            let state = vb.state();
            if state == VBucketState::Dead {
                continue;
            }

            // Refresh the persisted state record when our cached view is
            // stale.
            let stale = ctx.cached_vb_states.get(&vbid) != Some(&state);
            if stale {
                ctx.cached_vb_states.insert(vbid, state);
                self.rw.vb_state_changed(vbid, state);
            }

            self.restore_take_items(vbid, &mut item_list);
            vb.drain_backfill(&mut item_list);
            let checkpoint_id = vb.checkpoint.drain_for_persistence(&mut item_list);
            ctx.checkpoint_ids.insert(vbid, checkpoint_id);

            for qi in item_list.drain(..) {
                if matches!(qi.op, QueueOp::Set | QueueOp::Del) {
                    shard_queues[self.rw.shard_id(&qi)].push(qi);
                }
            }
        }

        for shard in shard_queues.iter_mut() {
            if shard.is_empty() {
                continue;
            }
            self.rw.optimize_writes(shard);
            for qi in shard.drain(..) {
                ctx.writing.push_back(qi);
            }
        }

        self.stats
            .queue_size
            .store(self.write_queue_size() as u64, Ordering::Relaxed);
    }

    /// Drain up to one transaction's worth of items from `writing`.
    /// Returns the min-data-age hint in seconds (0 = no constraint seen).
    fn flush_some(&self, ctx: &mut FlushCtx) -> u32 {
        let mut tctx = self.tctx_guard();
        if !tctx.enter(self) {
            self.stats.begin_failed.fetch_add(1, Ordering::Relaxed);
            warn!("failed to start a backing-store transaction");
            while let Some(qi) = ctx.writing.pop_front() {
                ctx.reject.push_back(qi);
            }
            return 1;
        }

        let txn_size = self.config.max_txn_size.load(Ordering::Acquire);
        let batch = tctx.remaining(txn_size);
        let mut completed = 0;
        let mut oldest: u32 = 0;
        while completed < batch && !ctx.writing.is_empty() {
            if completed > 0 && self.should_preempt_flush() {
                break;
            }
            let hint = self.flush_one(ctx, &mut tctx);
            if hint > 0 && (oldest == 0 || hint < oldest) {
                oldest = hint;
            }
            completed += 1;
        }

        if completed < batch && self.should_preempt_flush() && !ctx.writing.is_empty() {
            self.stats.flusher_preempts.fetch_add(1, Ordering::Relaxed);
        } else {
            tctx.commit(self);
        }
        tctx.leave();
        self.stats
            .flusher_todo
            .store(ctx.writing.len() as u64, Ordering::Relaxed);
        oldest
    }

    fn tctx_guard(&self) -> parking_lot::MutexGuard<'_, TransactionContext> {
        self.flusher.tctx.lock()
    }

    fn flush_one(&self, ctx: &mut FlushCtx, tctx: &mut TransactionContext) -> u32 {
        let Some(qi) = ctx.writing.pop_front() else {
            return 0;
        };
        match qi.op {
            QueueOp::Flush => {
                self.flush_one_delete_all();
                0
            }
            QueueOp::Set => {
                // A version mismatch means the vbucket was reset or
                // recreated after this intent was queued; drop it.
                if qi.vb_version != self.vbuckets.version(qi.vbucket) {
                    return 0;
                }
                let rejects_before = ctx.reject.len();
                let hint = self.flush_one_del_or_set(&qi, ctx);
                if ctx.reject.len() == rejects_before {
                    tctx.add_uncommitted();
                }
                hint
            }
            QueueOp::Del => self.flush_one_del_or_set(&qi, ctx),
            QueueOp::Commit => {
                tctx.commit(self);
                tctx.enter(self);
                0
            }
            QueueOp::Empty => 0,
        }
    }

    /// Wipe the backing store and record a DEL_ALL per known vbucket in
    /// the mutation log, as its own mini-transaction.
    fn flush_one_delete_all(&self) {
        self.rw.reset();
        for vbid in self.vbuckets.ids() {
            let _ = self.mutation_log.delete_all(vbid);
        }
        let _ = self.mutation_log.commit1();
        let _ = self.mutation_log.commit2();
        self.disk_flush_all.store(false, Ordering::Release);
    }

    /// Re-read the current stored value and decide what, if anything, to
    /// push at the backing store for this intent.
    fn flush_one_del_or_set(&self, qi: &Arc<QueuedItem>, ctx: &mut FlushCtx) -> u32 {
        let Some(vb) = self.vbuckets.get(qi.vbucket) else {
            return 0;
        };
        let now = unix_now();
        let expiry_window = self.config.expiry_window.load(Ordering::Acquire);
        let min_data_age = self.config.min_data_age.load(Ordering::Acquire);
        let queue_age_cap = self.config.queue_age_cap.load(Ordering::Acquire);
        let snapshot_pending = self.vbuckets.is_high_priority_vb_snapshot_scheduled();

        let action = vb.ht.with_bucket(&qi.key, |b| {
            let Some(v) = b.find(&qi.key, true) else {
                return FlushAction::Skip;
            };

            let mut deleted = v.is_deleted();
            let mut dirty = v.is_dirty();

            // Anything expiring within the window is persisted as a delete
            // rather than written and immediately reaped.
            if !deleted && dirty && v.is_expired(now + expiry_window) {
                self.stats.flush_expired.fetch_add(1, Ordering::Relaxed);
                v.mark_clean();
                v.id = -1;
                dirty = false;
                deleted = true;
            }

            if dirty {
                let data_age = now.saturating_sub(v.data_age());
                let dirty_age = now.saturating_sub(qi.queued_at);
                let mut eligible = true;
                let mut hint = 0;

                if v.is_pending_id() {
                    eligible = false;
                } else if dirty_age > queue_age_cap {
                    self.stats.too_old.fetch_add(1, Ordering::Relaxed);
                } else if data_age < min_data_age {
                    // Too young; let writes coalesce before persisting.
                    eligible = false;
                    hint = min_data_age - data_age;
                    self.stats.too_young.fetch_add(1, Ordering::Relaxed);
                }

                if !eligible {
                    let age = v.data_age();
                    v.redirty(age);
                    vb.ops_reject.fetch_add(1, Ordering::Relaxed);
                    return FlushAction::Requeued(hint);
                }
                self.stats
                    .record_item_ages(dirty_age as u64, data_age as u64);
            } else if !deleted {
                return FlushAction::Skip;
            }

            if dirty && !deleted {
                if snapshot_pending {
                    // State must be durable before data referencing it.
                    v.pending_id = false;
                    vb.ops_reject.fetch_add(1, Ordering::Relaxed);
                    return FlushAction::Requeued(0);
                }
                if v.id() < 0 {
                    v.pending_id = true;
                }
                FlushAction::Set {
                    item: v.to_item(qi.vbucket),
                    cas_snapshot: v.cas(),
                }
            } else {
                FlushAction::Del {
                    item: v.to_item(qi.vbucket),
                    rowid: v.id(),
                    temp: v.is_temp(),
                }
            }
        });

        match action {
            FlushAction::Skip => 0,
            FlushAction::Requeued(hint) => {
                ctx.reject.push_back(Arc::clone(qi));
                hint
            }
            FlushAction::Set { item, cas_snapshot } => {
                let vbver = self.vbuckets.version(qi.vbucket);
                let mut result = None;
                self.rw.set(&item, vbver, &mut |r| result = Some(r));
                if let Some((rows, new_rowid)) = result {
                    let created = item.rowid() < 0;
                    self.on_set_persisted(qi, cas_snapshot, rows, new_rowid, ctx);
                    if rows == 1 {
                        if created {
                            vb.ops_create.fetch_add(1, Ordering::Relaxed);
                        } else {
                            vb.ops_update.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                0
            }
            FlushAction::Del { item, rowid, temp } => {
                if rowid > 0 || temp {
                    // Temp items have no row, but the store still sees the
                    // delete so it can record the winning revision of a
                    // delete-with-meta.
                    let vbver = self.vbuckets.version(qi.vbucket);
                    let mut affected = None;
                    self.rw.del(&item, rowid, vbver, &mut |r| affected = Some(r));
                    if let Some(affected) = affected {
                        self.on_del_persisted(qi, affected, ctx);
                    }
                } else {
                    // No row to remove; run the bookkeeping only.
                    self.on_del_persisted(qi, 0, ctx);
                }
                0
            }
        }
    }

    /// Persist-set bookkeeping, mirroring what the backing store reported.
    fn on_set_persisted(
        &self,
        qi: &Arc<QueuedItem>,
        cas_snapshot: u64,
        rows: i32,
        new_rowid: i64,
        ctx: &mut FlushCtx,
    ) {
        let Some(vb) = self.vbuckets.get(qi.vbucket) else {
            return;
        };
        if rows == 1 {
            self.stats.total_persisted.fetch_add(1, Ordering::Relaxed);
            if new_rowid > 0 {
                if let Err(e) = self.mutation_log.new_item(qi.vbucket, &qi.key, new_rowid) {
                    warn!("failed to log NEW for key on vb{}: {e}", qi.vbucket);
                }
                self.stats.new_items.fetch_add(1, Ordering::Relaxed);
            }
            let low_wat = self.stats.mem_low_wat.load(Ordering::Acquire);
            let mem_used = self.stats.mem_used();
            let vb_state = vb.state();
            vb.ht.with_bucket(&qi.key, |b| {
                let Some(v) = b.find(&qi.key, true) else {
                    warn!(
                        "persisted key on vb{} is now missing from memory",
                        qi.vbucket
                    );
                    return;
                };
                if new_rowid > 0 {
                    if v.cas() != cas_snapshot {
                        warn!(
                            "cas moved while persisting key on vb{}; keeping rowid {}",
                            qi.vbucket, new_rowid
                        );
                    }
                    v.id = new_rowid;
                    v.pending_id = false;
                }
                if v.cas() == cas_snapshot {
                    v.mark_clean();
                    if vb_state != VBucketState::Active
                        && vb_state != VBucketState::Pending
                        && mem_used > low_wat
                        && vb.checkpoint.eligible_for_eviction(&qi.key)
                        && b.eject_value(&qi.key)
                        && vb_state == VBucketState::Replica
                    {
                        self.stats.num_replica_ejects.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        } else if rows == 0 {
            let found = vb.ht.with_bucket(&qi.key, |b| b.find(&qi.key, true).is_some());
            if found {
                warn!(
                    "persisting key on vb{} returned 0 updates",
                    qi.vbucket
                );
            } else {
                warn!(
                    "error persisting now-missing key on vb{}",
                    qi.vbucket
                );
                self.redirty(qi, ctx);
            }
        } else {
            self.redirty(qi, ctx);
        }
    }

    /// Persist-delete bookkeeping. `affected` is the store's rows-affected
    /// report: 1 deleted, 0 no row, -1 failure.
    fn on_del_persisted(&self, qi: &Arc<QueuedItem>, affected: i32, ctx: &mut FlushCtx) {
        let Some(vb) = self.vbuckets.get(qi.vbucket) else {
            return;
        };
        if affected >= 0 {
            if affected > 0 {
                self.stats.total_persisted.fetch_add(1, Ordering::Relaxed);
                self.stats.del_items.fetch_add(1, Ordering::Relaxed);
                vb.ops_delete.fetch_add(1, Ordering::Relaxed);
            }
            if let Err(e) = self.mutation_log.del_item(qi.vbucket, &qi.key) {
                warn!("failed to log DEL for key on vb{}: {e}", qi.vbucket);
            }

            // The row is gone from disk; the tombstone may go too. Taking
            // the restore lock first honors the restore -> bucket order.
            let degraded = self.is_degraded();
            let mut restore = degraded.then(|| self.restore.lock());
            vb.ht.with_bucket(&qi.key, |b| {
                let Some(v) = b.find(&qi.key, true) else {
                    return;
                };
                if v.is_deleted() {
                    if let Some(restore) = restore.as_mut() {
                        restore.items_deleted.insert(qi.key.clone());
                    }
                    b.remove(&qi.key);
                } else {
                    v.id = -1;
                }
            });
        } else {
            self.redirty(qi, ctx);
        }
    }

    fn redirty(&self, qi: &Arc<QueuedItem>, ctx: &mut FlushCtx) {
        self.stats.flush_failed.fetch_add(1, Ordering::Relaxed);
        if let Some(vb) = self.vbuckets.get(qi.vbucket) {
            vb.ht.with_bucket(&qi.key, |b| {
                if let Some(v) = b.find(&qi.key, true) {
                    let age = v.data_age();
                    v.redirty(age);
                }
            });
            vb.ops_reject.fetch_add(1, Ordering::Relaxed);
        }
        ctx.reject.push_back(Arc::clone(qi));
    }

    /// Record freshly persisted checkpoint ids and schedule the state
    /// snapshot that makes them durable.
    fn complete_flush(&self, ctx: &mut FlushCtx, flush_start: u32) {
        let mut schedule_snapshot = false;
        {
            let _vbset = self.vbset_mutex.lock();
            for (&vbid, &checkpoint_id) in ctx.checkpoint_ids.iter() {
                let Some(vb) = self.vbuckets.get(vbid) else {
                    continue;
                };
                if vb.state() == VBucketState::Dead {
                    continue;
                }
                if checkpoint_id > 0
                    && checkpoint_id != self.vbuckets.persistence_checkpoint_id(vbid)
                {
                    self.vbuckets
                        .set_persistence_checkpoint_id(vbid, checkpoint_id);
                    schedule_snapshot = true;
                }
            }
        }
        ctx.checkpoint_ids.clear();

        if schedule_snapshot {
            self.schedule_vb_snapshot(SnapshotPriority::High);
        }

        self.stats
            .queue_size
            .store(self.write_queue_size() as u64, Ordering::Relaxed);
        self.stats
            .record_flush_duration(unix_now().saturating_sub(flush_start) as u64);
    }
}
