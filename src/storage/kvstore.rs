use std::collections::HashMap;
use std::sync::Arc;

use crate::core::item::{Item, QueuedItem, VBucketState};
use crate::error::Result;
use crate::storage::mutation_log::MutationLog;

/// Capabilities the engine probes before wiring itself to a backing store.
#[derive(Debug, Clone, Copy)]
pub struct StorageProperties {
    pub max_concurrency: usize,
    pub max_readers: usize,
    pub max_writers: usize,
    pub efficient_vb_deletion: bool,
    pub key_dump_supported: bool,
}

/// Persisted lifecycle record for one (vbid, vbver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbStateSnapshot {
    pub state: VBucketState,
    pub checkpoint_id: u64,
    pub max_deleted_seqno: u32,
}

/// Result of a point read. `partial` means metadata only: the item carries
/// no value bytes.
#[derive(Debug, Clone)]
pub struct GetValue {
    pub item: Item,
    pub partial: bool,
}

/// One record streamed out of a dump or warmup enumeration, tagged with
/// the vbucket version it was written under.
#[derive(Debug, Clone)]
pub struct DumpItem {
    pub item: Item,
    pub vb_version: u16,
}

/// (rows affected, assigned rowid). Rows affected is 1 on success, 0 when
/// nothing matched, -1 on storage failure; the rowid is positive only for
/// fresh inserts.
pub type MutationResult = (i32, i64);

/// Inclusive rowid range for chunked deletion.
pub type RowRange = (i64, i64);

/// Contract for the durable backing store.
///
/// Writes are transactional: the flusher brackets batches of `set`/`del`
/// with `begin`/`commit`. Results come back through the supplied callbacks
/// so the flusher can thread persistence bookkeeping per item.
pub trait KVStore: Send + Sync {
    fn storage_properties(&self) -> StorageProperties;

    /// Point read. `rowid < 0` looks the key up by name instead; `partial`
    /// asks for metadata only.
    fn get(&self, key: &[u8], rowid: i64, vbid: u16, vbver: u16, partial: bool)
        -> Result<GetValue>;

    fn set(&self, itm: &Item, vbver: u16, cb: &mut dyn FnMut(MutationResult));

    fn del(&self, itm: &Item, rowid: i64, vbver: u16, cb: &mut dyn FnMut(i32));

    /// Drop a vbucket's rows, optionally restricted to a rowid range.
    fn del_vbucket(&self, vbid: u16, vbver: u16, range: Option<RowRange>) -> bool;

    /// Truncate everything.
    fn reset(&self);

    fn snapshot_vbuckets(&self, states: &HashMap<(u16, u16), VbStateSnapshot>) -> bool;

    fn list_persisted_vbuckets(&self) -> HashMap<(u16, u16), VbStateSnapshot>;

    /// Enumerate every row, values included.
    fn dump(&self, cb: &mut dyn FnMut(DumpItem));

    /// Enumerate keys (metadata only) for the given vbuckets.
    fn dump_keys(&self, vbids: &[u16], cb: &mut dyn FnMut(DumpItem));

    /// Load the predicted working set recorded in an access log. Calls
    /// `estimate` once with the expected row count, then streams rows.
    /// Returns the number of rows loaded.
    fn warmup(
        &self,
        access_log: &MutationLog,
        states: &HashMap<(u16, u16), VbStateSnapshot>,
        cb: &mut dyn FnMut(DumpItem),
        estimate: &mut dyn FnMut(usize),
    ) -> Result<usize>;

    fn estimated_item_count(&self) -> usize;

    fn num_shards(&self) -> usize {
        1
    }

    fn shard_id(&self, qi: &QueuedItem) -> usize {
        let _ = qi;
        0
    }

    /// Reorder a shard's batch for write locality. The flusher preserves
    /// per-key ordering by deduplicating upstream, so any permutation is
    /// legal here.
    fn optimize_writes(&self, items: &mut [Arc<QueuedItem>]) {
        let _ = items;
    }

    fn begin(&self) -> bool;

    fn commit(&self) -> bool;

    /// Record a vbucket state change in the transaction stream.
    fn vb_state_changed(&self, vbid: u16, state: VBucketState);

    /// Batching hint; stores may ignore it.
    fn set_vb_batch_count(&self, n: usize) {
        let _ = n;
    }
}
