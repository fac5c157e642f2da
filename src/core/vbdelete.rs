use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::constants::{MIN_VB_DEL_CHUNK_SIZE, VB_DEL_RETRY_SNOOZE};
use crate::core::dispatcher::{priority, Dispatcher, Task, TaskId};
use crate::core::item::VBucketState;
use crate::core::store::DriftStore;
use crate::core::vbucket::VBucket;
use crate::stats::set_if_greater;
use crate::storage::kvstore::RowRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VbDelResult {
    Success,
    Fail,
    /// The vbucket was recreated out from under the deletion task.
    Invalid,
}

/// Group sorted rowids into contiguous ranges of at most `chunk_size` ids.
pub(crate) fn build_range_list(mut rowids: Vec<i64>, chunk_size: usize) -> VecDeque<RowRange> {
    rowids.sort_unstable();
    rowids.dedup();
    let mut ranges = VecDeque::new();
    let mut iter = rowids.chunks(chunk_size.max(1));
    for chunk in &mut iter {
        if let (Some(&first), Some(&last)) = (chunk.first(), chunk.last()) {
            ranges.push_back((first, last));
        }
    }
    ranges
}

/// Resize the head of the range list after a chunk-time measurement:
/// split an oversized head, or merge undersized neighbors, so the next
/// chunk spans roughly `target` rowids.
pub(crate) fn rescale_ranges(ranges: &mut VecDeque<RowRange>, target: i64) {
    let Some(&(first, last)) = ranges.front() else {
        return;
    };
    if last - first > target {
        ranges[0] = (first, first + target);
        ranges.insert(1, (first + target, last));
    } else {
        while ranges.len() >= 2 {
            let (head_first, _) = ranges[0];
            let (_, next_last) = ranges[1];
            if next_last - head_first <= target {
                ranges[0] = (head_first, next_last);
                ranges.remove(1);
            } else {
                break;
            }
        }
    }
}

/// Kick off disk cleanup for a dead or reset vbucket. The per-vbid
/// deletion flag guarantees a single active deletion task per vbid.
pub(crate) fn schedule_vb_deletion(
    store: &DriftStore,
    vb: Arc<VBucket>,
    vb_version: u16,
    delay: Duration,
) {
    if !store.vbuckets.set_bucket_deletion(vb.id(), true) {
        return;
    }
    if store.storage_props.efficient_vb_deletion {
        let task = Arc::new(FastVBucketDeletionTask {
            store: store.weak_self(),
            vbid: vb.id(),
            vb_version,
        });
        store
            .rw_dispatcher
            .schedule(task, priority::FAST_VBUCKET_DELETION, delay);
    } else {
        let mut rowids = Vec::new();
        vb.ht.visit(|v| {
            if v.id() >= 0 {
                rowids.push(v.id());
            }
        });
        let chunk_size = store.config.vb_del_chunk_size.load(Ordering::Acquire);
        let ranges = build_range_list(rowids, chunk_size);
        let initial_range_size = ranges
            .front()
            .map(|(first, last)| last - first)
            .unwrap_or(MIN_VB_DEL_CHUNK_SIZE);
        let task = Arc::new(VBucketDeletionTask {
            store: store.weak_self(),
            vbid: vb.id(),
            vb_version,
            threshold_ms: store.config.vb_chunk_del_time.load(Ordering::Acquire),
            state: Mutex::new(DeletionState {
                ranges,
                chunk_num: 1,
                range_size: initial_range_size,
                execution: Duration::ZERO,
                started: Instant::now(),
            }),
        });
        store
            .rw_dispatcher
            .schedule(task, priority::VBUCKET_DELETION, delay);
    }
}

struct FastVBucketDeletionTask {
    store: Weak<DriftStore>,
    vbid: u16,
    vb_version: u16,
}

impl Task for FastVBucketDeletionTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        match store.complete_vbucket_deletion(self.vbid, self.vb_version, None, true) {
            VbDelResult::Success | VbDelResult::Invalid => false,
            VbDelResult::Fail => {
                dispatcher.snooze(id, VB_DEL_RETRY_SNOOZE);
                true
            }
        }
    }

    fn description(&self) -> String {
        format!("Deleting vbucket {} from disk", self.vbid)
    }
}

struct DeletionState {
    ranges: VecDeque<RowRange>,
    chunk_num: usize,
    range_size: i64,
    execution: Duration,
    started: Instant,
}

/// Chunked vbucket deletion: delete one rowid range per dispatch, each in
/// its own small transaction, rescaling the chunk size so every chunk
/// lands near the configured wall-time threshold.
struct VBucketDeletionTask {
    store: Weak<DriftStore>,
    vbid: u16,
    vb_version: u16,
    threshold_ms: u32,
    state: Mutex<DeletionState>,
}

impl Task for VBucketDeletionTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let mut state = self.state.lock();
        let range = state.ranges.front().copied();
        let is_last = state.ranges.len() <= 1;

        let chunk_start = Instant::now();
        let result =
            store.complete_vbucket_deletion(self.vbid, self.vb_version, range, is_last);
        let chunk_time = chunk_start.elapsed();
        state.execution += chunk_time;

        match result {
            VbDelResult::Success => {
                if is_last {
                    let walltime = state.started.elapsed().as_micros() as u64;
                    set_if_greater(&store.stats.vbucket_del_max_walltime_micros, walltime);
                    return false;
                }
                let chunk_ms = chunk_time.as_millis() as i64;
                if let Some((first, last)) = range {
                    if chunk_ms > 0 && last >= first {
                        state.range_size = ((state.range_size * self.threshold_ms as i64)
                            / chunk_ms)
                            .max(MIN_VB_DEL_CHUNK_SIZE);
                    }
                }
                state.ranges.pop_front();
                let target = state.range_size;
                rescale_ranges(&mut state.ranges, target);
                state.chunk_num += 1;
                true
            }
            VbDelResult::Fail => {
                debug!(
                    "rescheduling chunk {} of vbucket {} deletion",
                    state.chunk_num, self.vbid
                );
                dispatcher.snooze(id, VB_DEL_RETRY_SNOOZE);
                true
            }
            VbDelResult::Invalid => false,
        }
    }

    fn description(&self) -> String {
        let state = self.state.lock();
        format!(
            "Removing chunk {}/{} of vbucket {} from disk",
            state.chunk_num,
            state.chunk_num + state.ranges.len(),
            self.vbid
        )
    }
}

impl DriftStore {
    /// Delete one chunk (or everything, when `range` is None) of a
    /// vbucket's rows in its own transaction. The last chunk releases the
    /// deletion flag, allowing the vbid to be recreated.
    pub(crate) fn complete_vbucket_deletion(
        &self,
        vbid: u16,
        vb_version: u16,
        range: Option<RowRange>,
        is_last: bool,
    ) -> VbDelResult {
        let proceed = match self.vbuckets.get(vbid) {
            None => true,
            Some(vb) => {
                vb.state() == VBucketState::Dead || self.vbuckets.is_bucket_deletion(vbid)
            }
        };
        if !proceed {
            return VbDelResult::Invalid;
        }

        self.rw.begin();
        if !self.rw.del_vbucket(vbid, vb_version, range) {
            return VbDelResult::Fail;
        }
        self.rw.commit();

        if is_last {
            self.stats.vbucket_del_total.fetch_add(1, Ordering::Relaxed);
            self.vbuckets.set_bucket_deletion(vbid, false);
        }
        VbDelResult::Success
    }
}
