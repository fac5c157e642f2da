use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Central statistics hub for the engine.
///
/// Every counter is a lock-free atomic; high-water marks use a
/// compare-exchange loop (`set_if_greater`) so readers never block writers.
#[derive(Debug)]
pub struct Statistics {
    // Memory accounting
    pub mem_used: AtomicUsize,
    pub max_data_size: AtomicUsize,
    pub mem_low_wat: AtomicUsize,
    pub mem_high_wat: AtomicUsize,

    // Store metrics
    pub curr_items: AtomicUsize,
    pub num_non_resident: AtomicUsize,
    pub num_temp_items: AtomicUsize,

    // Front-end operation outcomes
    pub num_not_my_vbuckets: AtomicU64,
    pub expired: AtomicU64,
    pub expired_pager: AtomicU64,

    // Pending-op waitlist
    pub pending_ops: AtomicU64,
    pub pending_ops_total: AtomicU64,
    pub pending_ops_max: AtomicU64,

    // Persistence queue
    pub tot_enqueued: AtomicU64,
    pub queue_size: AtomicU64,
    pub flusher_todo: AtomicU64,

    // Flusher outcomes
    pub total_persisted: AtomicU64,
    pub new_items: AtomicU64,
    pub del_items: AtomicU64,
    pub flush_expired: AtomicU64,
    pub flush_failed: AtomicU64,
    pub flusher_commits: AtomicU64,
    pub flusher_preempts: AtomicU64,
    pub begin_failed: AtomicU64,
    pub commit_failed: AtomicU64,
    pub too_young: AtomicU64,
    pub too_old: AtomicU64,
    pub flush_duration: AtomicU64,
    pub flush_duration_high_wat: AtomicU64,
    pub cumulative_flush_time: AtomicU64,

    // Item ages observed at flush time, in seconds
    pub dirty_age: AtomicU64,
    pub dirty_age_high_wat: AtomicU64,
    pub data_age: AtomicU64,
    pub data_age_high_wat: AtomicU64,

    // Background fetches
    pub bg_fetched: AtomicU64,
    pub bg_num_operations: AtomicU64,
    pub bg_wait_micros: AtomicU64,
    pub bg_load_micros: AtomicU64,

    // Eviction
    pub num_value_ejects: AtomicU64,
    pub num_eject_failures: AtomicU64,
    pub num_replica_ejects: AtomicU64,
    pub pager_runs: AtomicU64,

    // Warmup
    pub warmed_up: AtomicU64,
    pub warmed_up_meta: AtomicU64,
    pub warm_dups: AtomicU64,
    pub warm_oom: AtomicU64,
    pub warmup_complete: AtomicBool,

    // VBucket deletion
    pub vbucket_del_total: AtomicU64,
    pub vbucket_del_max_walltime_micros: AtomicU64,

    // Mutation log
    pub log_compactor_runs: AtomicU64,
    pub access_scanner_runs: AtomicU64,
}

impl Statistics {
    pub fn new(max_data_size: usize) -> Self {
        let stats = Self {
            mem_used: AtomicUsize::new(0),
            max_data_size: AtomicUsize::new(0),
            mem_low_wat: AtomicUsize::new(0),
            mem_high_wat: AtomicUsize::new(0),

            curr_items: AtomicUsize::new(0),
            num_non_resident: AtomicUsize::new(0),
            num_temp_items: AtomicUsize::new(0),

            num_not_my_vbuckets: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            expired_pager: AtomicU64::new(0),

            pending_ops: AtomicU64::new(0),
            pending_ops_total: AtomicU64::new(0),
            pending_ops_max: AtomicU64::new(0),

            tot_enqueued: AtomicU64::new(0),
            queue_size: AtomicU64::new(0),
            flusher_todo: AtomicU64::new(0),

            total_persisted: AtomicU64::new(0),
            new_items: AtomicU64::new(0),
            del_items: AtomicU64::new(0),
            flush_expired: AtomicU64::new(0),
            flush_failed: AtomicU64::new(0),
            flusher_commits: AtomicU64::new(0),
            flusher_preempts: AtomicU64::new(0),
            begin_failed: AtomicU64::new(0),
            commit_failed: AtomicU64::new(0),
            too_young: AtomicU64::new(0),
            too_old: AtomicU64::new(0),
            flush_duration: AtomicU64::new(0),
            flush_duration_high_wat: AtomicU64::new(0),
            cumulative_flush_time: AtomicU64::new(0),

            dirty_age: AtomicU64::new(0),
            dirty_age_high_wat: AtomicU64::new(0),
            data_age: AtomicU64::new(0),
            data_age_high_wat: AtomicU64::new(0),

            bg_fetched: AtomicU64::new(0),
            bg_num_operations: AtomicU64::new(0),
            bg_wait_micros: AtomicU64::new(0),
            bg_load_micros: AtomicU64::new(0),

            num_value_ejects: AtomicU64::new(0),
            num_eject_failures: AtomicU64::new(0),
            num_replica_ejects: AtomicU64::new(0),
            pager_runs: AtomicU64::new(0),

            warmed_up: AtomicU64::new(0),
            warmed_up_meta: AtomicU64::new(0),
            warm_dups: AtomicU64::new(0),
            warm_oom: AtomicU64::new(0),
            warmup_complete: AtomicBool::new(false),

            vbucket_del_total: AtomicU64::new(0),
            vbucket_del_max_walltime_micros: AtomicU64::new(0),

            log_compactor_runs: AtomicU64::new(0),
            access_scanner_runs: AtomicU64::new(0),
        };
        stats.set_max_data_size(max_data_size);
        stats
    }

    /// Resize the memory quota and derive the eviction watermarks from it.
    pub fn set_max_data_size(&self, max: usize) {
        self.max_data_size.store(max, Ordering::Release);
        self.mem_low_wat.store(
            (max as f64 * crate::constants::MEM_LOW_WAT_PERCENT) as usize,
            Ordering::Release,
        );
        self.mem_high_wat.store(
            (max as f64 * crate::constants::MEM_HIGH_WAT_PERCENT) as usize,
            Ordering::Release,
        );
    }

    #[inline]
    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn add_mem(&self, size: usize) {
        self.mem_used.fetch_add(size, Ordering::AcqRel);
    }

    #[inline]
    pub fn sub_mem(&self, size: usize) {
        self.mem_used.fetch_sub(size, Ordering::AcqRel);
    }

    /// Headroom check applied before accepting a mutation.
    pub fn has_memory_for(&self, size: usize) -> bool {
        let ceiling = (self.max_data_size.load(Ordering::Acquire) as f64
            * crate::constants::MUTATION_MEM_THRESHOLD) as usize;
        self.mem_used() + size <= ceiling
    }

    pub fn record_pending_op(&self) {
        self.pending_ops.fetch_add(1, Ordering::Relaxed);
        self.pending_ops_total.fetch_add(1, Ordering::Relaxed);
        let current = self.pending_ops.load(Ordering::Relaxed);
        set_if_greater(&self.pending_ops_max, current);
    }

    pub fn record_pending_ops_fired(&self, count: u64) {
        self.pending_ops.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn record_flush_duration(&self, secs: u64) {
        self.flush_duration.store(secs, Ordering::Relaxed);
        set_if_greater(&self.flush_duration_high_wat, secs);
        self.cumulative_flush_time.fetch_add(secs, Ordering::Relaxed);
    }

    pub fn record_item_ages(&self, dirty_age: u64, data_age: u64) {
        self.dirty_age.store(dirty_age, Ordering::Relaxed);
        self.data_age.store(data_age, Ordering::Relaxed);
        set_if_greater(&self.dirty_age_high_wat, dirty_age);
        set_if_greater(&self.data_age_high_wat, data_age);
    }

    pub fn record_bg_fetch(&self, wait_micros: u64, load_micros: u64) {
        self.bg_num_operations.fetch_add(1, Ordering::Relaxed);
        self.bg_wait_micros.fetch_add(wait_micros, Ordering::Relaxed);
        self.bg_load_micros.fetch_add(load_micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            mem_used: self.mem_used.load(Ordering::Relaxed),
            max_data_size: self.max_data_size.load(Ordering::Relaxed),
            curr_items: self.curr_items.load(Ordering::Relaxed),
            num_non_resident: self.num_non_resident.load(Ordering::Relaxed),
            num_temp_items: self.num_temp_items.load(Ordering::Relaxed),
            num_not_my_vbuckets: self.num_not_my_vbuckets.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            tot_enqueued: self.tot_enqueued.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            total_persisted: self.total_persisted.load(Ordering::Relaxed),
            new_items: self.new_items.load(Ordering::Relaxed),
            del_items: self.del_items.load(Ordering::Relaxed),
            flush_failed: self.flush_failed.load(Ordering::Relaxed),
            flusher_commits: self.flusher_commits.load(Ordering::Relaxed),
            commit_failed: self.commit_failed.load(Ordering::Relaxed),
            too_young: self.too_young.load(Ordering::Relaxed),
            too_old: self.too_old.load(Ordering::Relaxed),
            bg_fetched: self.bg_fetched.load(Ordering::Relaxed),
            num_value_ejects: self.num_value_ejects.load(Ordering::Relaxed),
            warmed_up: self.warmed_up.load(Ordering::Relaxed),
            warmed_up_meta: self.warmed_up_meta.load(Ordering::Relaxed),
            warm_oom: self.warm_oom.load(Ordering::Relaxed),
            warmup_complete: self.warmup_complete.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the most commonly inspected counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub mem_used: usize,
    pub max_data_size: usize,
    pub curr_items: usize,
    pub num_non_resident: usize,
    pub num_temp_items: usize,
    pub num_not_my_vbuckets: u64,
    pub expired: u64,
    pub tot_enqueued: u64,
    pub queue_size: u64,
    pub total_persisted: u64,
    pub new_items: u64,
    pub del_items: u64,
    pub flush_failed: u64,
    pub flusher_commits: u64,
    pub commit_failed: u64,
    pub too_young: u64,
    pub too_old: u64,
    pub bg_fetched: u64,
    pub num_value_ejects: u64,
    pub warmed_up: u64,
    pub warmed_up_meta: u64,
    pub warm_oom: u64,
    pub warmup_complete: bool,
}

impl StatsSnapshot {
    /// Human-readable rendering, used by the periodic stat snapshotter.
    pub fn format(&self) -> String {
        format!(
            "items={} mem={}/{} non_resident={} temp={} enqueued={} queue={} \
             persisted={} new={} del={} commits={} commit_failed={} \
             too_young={} too_old={} bg_fetched={} ejected={} expired={} \
             warmed_up={}/{} warm_oom={} warmup_complete={}",
            self.curr_items,
            self.mem_used,
            self.max_data_size,
            self.num_non_resident,
            self.num_temp_items,
            self.tot_enqueued,
            self.queue_size,
            self.total_persisted,
            self.new_items,
            self.del_items,
            self.flusher_commits,
            self.commit_failed,
            self.too_young,
            self.too_old,
            self.bg_fetched,
            self.num_value_ejects,
            self.expired,
            self.warmed_up,
            self.warmed_up_meta,
            self.warm_oom,
            self.warmup_complete,
        )
    }
}

/// Monotonic high-water update.
pub fn set_if_greater(cell: &AtomicU64, candidate: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while candidate > current {
        match cell.compare_exchange_weak(
            current,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}
