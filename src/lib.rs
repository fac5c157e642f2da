//! # driftdb - Eventually-Persistent Partitioned Key/Value Engine
//!
// Copyright 2026 The driftdb Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//!
//! driftdb is an in-memory key/value storage engine partitioned into
//! virtual buckets (vbuckets), each an independently-stateful shard with
//! its own hash table, checkpoint log, and lifecycle. Mutations apply to
//! memory synchronously and drift to a durable backing store through a
//! bounded-batch background flusher.
//!
//! ## Architecture
//!
//! - **HashTable**: striped-mutex chained hash of stored values with CAS,
//!   TTL, per-key locks, soft deletes, and value ejection.
//! - **CheckpointManager**: a strictly ordered per-vbucket write-intent
//!   log feeding the flusher, with open-checkpoint deduplication.
//! - **Flusher**: drains checkpoints, backfill, and restore batches into
//!   shard-partitioned transactions against a pluggable [`KVStore`],
//!   requeuing anything the store rejects.
//! - **MutationLog**: an append-only, block-checksummed redo log whose
//!   COMMIT1/COMMIT2 bracketing makes recovery crash-safe.
//! - **Warmup**: a multi-stage state machine that rebuilds memory from
//!   the mutation log and access log, falling back to key dumps and full
//!   enumeration when either is missing or corrupt.
//! - **Dispatchers**: three priority task schedulers (read-write,
//!   read-only, non-I/O) running background fetches, pagers, snapshots,
//!   and chunked vbucket deletion.
//!
//! ## Durability model
//!
//! Writes are acknowledged once accepted by the in-memory index; a client
//! never observes a partial mutation. Persistence is eventual: the
//! flusher batches dirty items into transactions, and the mutation log
//! records every persisted row so a restart can rebuild the index without
//! scanning the full store. Operations on a non-resident value return
//! [`DriftError::WouldBlock`] and complete through the engine's
//! [`EngineNotifier`] once the background fetch lands.
//!
//! ## Quick start
//!
//! ```rust
//! use driftdb::{DriftStore, Item};
//! use std::time::Duration;
//!
//! # fn main() -> driftdb::Result<()> {
//! let store = DriftStore::builder().start_vb0(true).build()?;
//! store.wait_for_warmup(Duration::from_secs(5));
//!
//! let item = Item::new(b"key".to_vec(), 0, b"value".to_vec());
//! store.set(&item, 0, false)?;
//!
//! let fetched = store.get(b"key", 0, 0)?;
//! assert_eq!(fetched.value().map(|v| &v[..]), Some(&b"value"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! ## VBucket lifecycle
//!
//! ```rust
//! use driftdb::{DriftStore, DriftError, Item, VBucketState};
//! use std::time::Duration;
//!
//! # fn main() -> driftdb::Result<()> {
//! let store = DriftStore::builder().build()?;
//! store.wait_for_warmup(Duration::from_secs(5));
//!
//! // Operations against an unknown vbucket are refused.
//! let item = Item::new(b"k".to_vec(), 7, b"v".to_vec());
//! assert!(matches!(
//!     store.set(&item, 0, false),
//!     Err(DriftError::NotMyVbucket)
//! ));
//!
//! store.set_vbucket_state(7, VBucketState::Active);
//! store.set(&item, 0, false)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod stats;
pub mod storage;
pub mod utils;

pub use crate::config::{Config, ValueChangedListener};
pub use crate::core::dispatcher::{Dispatcher, Task, TaskId};
pub use crate::core::hash_table::{AddStatus, HashTable, InsertStatus, SetStatus};
pub use crate::core::item::{Cookie, Item, ItemMetaData, QueueOp, QueuedItem, VBucketState};
pub use crate::core::store::{
    DriftStore, DriftStoreBuilder, EngineNotifier, EvictResult, KeyStats, NullNotifier,
};
pub use crate::core::warmup::{Warmup, WarmupState};
pub use crate::error::{DriftError, Result};
pub use crate::stats::{Statistics, StatsSnapshot};
pub use crate::storage::flusher::{Flusher, FlusherState};
pub use crate::storage::kvstore::{
    DumpItem, GetValue, KVStore, MutationResult, RowRange, StorageProperties, VbStateSnapshot,
};
pub use crate::storage::memory::MemoryKVStore;
pub use crate::storage::mutation_log::{
    LogEntry, LogEntryType, MutationLog, MutationLogHarvester,
};

#[cfg(test)]
mod tests;
