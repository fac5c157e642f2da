use log::{info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::constants::{
    ACCESS_SCANNER_SLEEP, CHECKPOINT_REMOVER_SLEEP, HT_RESIZER_SLEEP, ITEM_PAGER_SLEEP,
    LOG_COMPACTOR_SLEEP, STATSNAP_FREQ,
};
use crate::core::dispatcher::{priority, Dispatcher, Task, TaskId};
use crate::core::item::VBucketState;
use crate::core::store::DriftStore;
use crate::storage::mutation_log::MutationLog;
use crate::utils::unix_now;

/// Wire up every periodic worker; called once warmup finishes.
pub(crate) fn schedule_all(store: &DriftStore) {
    let weak = store.weak_self();

    store.set_expiry_pager_sleeptime(store.config.exp_pager_stime.load(Ordering::Acquire));

    store.nonio_dispatcher.schedule(
        Arc::new(ItemPagerTask(weak.clone())),
        priority::ITEM_PAGER,
        ITEM_PAGER_SLEEP,
    );
    store.nonio_dispatcher.schedule(
        Arc::new(CheckpointRemoverTask(weak.clone())),
        priority::CHECKPOINT_REMOVER,
        CHECKPOINT_REMOVER_SLEEP,
    );
    store.nonio_dispatcher.schedule(
        Arc::new(HashtableResizerTask(weak.clone())),
        priority::HT_RESIZER,
        HT_RESIZER_SLEEP,
    );
    store.nonio_dispatcher.schedule(
        Arc::new(StatSnapTask(weak.clone())),
        priority::STAT_SNAP,
        STATSNAP_FREQ,
    );

    if store.mutation_log.is_enabled() {
        store.rw_dispatcher.schedule(
            Arc::new(LogCompactorTask(weak.clone())),
            priority::LOG_COMPACTOR,
            LOG_COMPACTOR_SLEEP,
        );
    }
    if store.access_log_path.is_some() {
        store.rw_dispatcher.schedule(
            Arc::new(AccessScannerTask(weak.clone())),
            priority::ACCESS_SCANNER,
            ACCESS_SCANNER_SLEEP,
        );
    }
    if !store.invalid_vb_versions.lock().is_empty() {
        store.rw_dispatcher.schedule(
            Arc::new(InvalidItemPagerTask(weak)),
            priority::VBUCKET_DELETION,
            Duration::ZERO,
        );
    }
}

pub(crate) fn schedule_expiry_pager(store: &DriftStore, interval: Duration) -> TaskId {
    store.nonio_dispatcher.schedule(
        Arc::new(ExpiredItemPagerTask {
            store: store.weak_self(),
            interval,
        }),
        priority::ITEM_PAGER,
        interval,
    )
}

/// Ejects clean resident values until memory falls back under the low
/// watermark, respecting checkpoint-cursor eligibility.
struct ItemPagerTask(Weak<DriftStore>);

impl Task for ItemPagerTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.0.upgrade() else {
            return false;
        };
        let high = store.stats.mem_high_wat.load(Ordering::Acquire);
        let low = store.stats.mem_low_wat.load(Ordering::Acquire);
        if store.stats.mem_used() > high {
            store.stats.pager_runs.fetch_add(1, Ordering::Relaxed);
            store.visit_vbuckets(|vb| {
                if store.stats.mem_used() <= low {
                    return;
                }
                let mut candidates = Vec::new();
                vb.ht.visit(|v| {
                    if v.is_resident() && !v.is_dirty() && !v.is_temp() && v.id() >= 0 {
                        candidates.push(v.key().to_vec());
                    }
                });
                for key in candidates {
                    if store.stats.mem_used() <= low {
                        break;
                    }
                    if vb.checkpoint.eligible_for_eviction(&key) {
                        vb.ht.with_bucket(&key, |b| b.eject_value(&key));
                    }
                }
            });
        }
        dispatcher.snooze(id, ITEM_PAGER_SLEEP);
        true
    }

    fn description(&self) -> String {
        "Paging out items".to_string()
    }
}

/// Bulk lazy-deletion sweep for expired items.
struct ExpiredItemPagerTask {
    store: Weak<DriftStore>,
    interval: Duration,
}

impl Task for ExpiredItemPagerTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let now = unix_now();
        store.visit_vbuckets(|vb| {
            let mut expired = Vec::new();
            vb.ht.visit(|v| {
                if !v.is_deleted() && v.is_expired(now) {
                    expired.push(v.key().to_vec());
                }
            });
            for key in expired {
                store.stats.expired_pager.fetch_add(1, Ordering::Relaxed);
                vb.ht
                    .with_bucket(&key, |b| store.reap_in_bucket(vb, b, &key, now));
            }
        });
        dispatcher.snooze(id, self.interval);
        true
    }

    fn description(&self) -> String {
        "Paging expired items".to_string()
    }
}

/// Keeps bucket arrays sized to their population.
struct HashtableResizerTask(Weak<DriftStore>);

impl Task for HashtableResizerTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.0.upgrade() else {
            return false;
        };
        store.visit_vbuckets(|vb| vb.ht.resize());
        dispatcher.snooze(id, HT_RESIZER_SLEEP);
        true
    }

    fn description(&self) -> String {
        "Adjusting hash table sizes".to_string()
    }
}

/// Reaps closed, unreferenced checkpoints.
struct CheckpointRemoverTask(Weak<DriftStore>);

impl Task for CheckpointRemoverTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.0.upgrade() else {
            return false;
        };
        store.visit_vbuckets(|vb| {
            vb.checkpoint.remove_closed_checkpoints();
        });
        dispatcher.snooze(id, CHECKPOINT_REMOVER_SLEEP);
        true
    }

    fn description(&self) -> String {
        "Removing closed unreferenced checkpoints".to_string()
    }
}

/// Writes the access log: the resident key set that seeds the next
/// warmup's working-set load.
struct AccessScannerTask(Weak<DriftStore>);

impl Task for AccessScannerTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.0.upgrade() else {
            return false;
        };
        if let Some(path) = &store.access_log_path {
            let next_path = path.with_extension("next");
            let next = MutationLog::new(
                Some(next_path.clone()),
                store.config.klog_block_size,
                0,
            );
            let result = next.open().and_then(|_| {
                store.visit_vbuckets(|vb| {
                    if vb.state() != VBucketState::Active {
                        return;
                    }
                    vb.ht.visit(|v| {
                        if v.is_resident() && !v.is_deleted() && !v.is_temp() && v.id() >= 0 {
                            let _ = next.new_item(vb.id(), v.key(), v.id());
                        }
                    });
                });
                next.commit1()?;
                next.commit2()?;
                Ok(())
            });
            match result {
                Ok(()) => {
                    drop(next);
                    if path.exists() {
                        let _ = std::fs::rename(path, path.with_extension("old"));
                    }
                    if let Err(e) = std::fs::rename(&next_path, path) {
                        warn!("failed to rotate access log: {e}");
                    }
                    store
                        .stats
                        .access_scanner_runs
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("access scanner failed: {e}"),
            }
        }
        dispatcher.snooze(id, ACCESS_SCANNER_SLEEP);
        true
    }

    fn description(&self) -> String {
        "Generating access log".to_string()
    }
}

/// Rewrites the mutation log when it outgrows its size or entry-ratio
/// caps, provided the persistence queue is shallow enough.
struct LogCompactorTask(Weak<DriftStore>);

impl Task for LogCompactorTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.0.upgrade() else {
            return false;
        };
        let max_size = store.config.klog_max_log_size.load(Ordering::Acquire);
        let max_ratio = store.config.klog_max_entry_ratio.load(Ordering::Acquire) as u64;
        let queue_cap = store
            .config
            .klog_compactor_queue_cap
            .load(Ordering::Acquire);

        let oversized = store.mutation_log.file_size() > max_size
            || store.mutation_log.entry_ratio() > max_ratio;
        if oversized && store.write_queue_size() <= queue_cap {
            if let Err(e) = store.mutation_log.compact() {
                warn!("mutation log compaction failed: {e}");
            } else {
                store
                    .stats
                    .log_compactor_runs
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        dispatcher.snooze(id, LOG_COMPACTOR_SLEEP);
        true
    }

    fn description(&self) -> String {
        "Compacting the mutation log".to_string()
    }
}

/// Deletes rows persisted under stale vbucket versions discovered during
/// warmup.
struct InvalidItemPagerTask(Weak<DriftStore>);

impl Task for InvalidItemPagerTask {
    fn run(&self, _dispatcher: &Dispatcher, _id: TaskId) -> bool {
        let Some(store) = self.0.upgrade() else {
            return false;
        };
        let stale: Vec<(u16, u16)> = store.invalid_vb_versions.lock().drain(..).collect();
        for (vbid, vbver) in stale {
            if !store.rw.del_vbucket(vbid, vbver, None) {
                warn!("failed to purge invalid rows for vb{vbid} version {vbver}");
            }
        }
        false
    }

    fn description(&self) -> String {
        "Purging invalid-version items".to_string()
    }
}

/// Periodic statistics snapshot.
struct StatSnapTask(Weak<DriftStore>);

impl Task for StatSnapTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.0.upgrade() else {
            return false;
        };
        info!("stats: {}", store.stats.snapshot().format());
        dispatcher.snooze(id, STATSNAP_FREQ);
        true
    }

    fn description(&self) -> String {
        "Snapshotting statistics".to_string()
    }
}
