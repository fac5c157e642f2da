use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::core::item::QueuedItem;

/// One ordered run of write intents for a vbucket.
#[derive(Debug)]
struct Checkpoint {
    id: u64,
    items: Vec<Arc<QueuedItem>>,
    key_index: HashMap<Vec<u8>, usize>,
}

impl Checkpoint {
    fn new(id: u64) -> Self {
        Self {
            id,
            items: Vec::new(),
            key_index: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    open: Checkpoint,
    /// Drained checkpoints awaiting the checkpoint remover.
    closed: VecDeque<Checkpoint>,
}

/// Strictly ordered per-vbucket write-intent log feeding the flusher.
///
/// Each mutation enqueues exactly one record; re-mutating a key already
/// queued in the open checkpoint replaces the earlier record in place, so
/// the flusher never sees two intents for one key in a single batch.
#[derive(Debug)]
pub struct CheckpointManager {
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    pub fn new(initial_id: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                open: Checkpoint::new(initial_id),
                closed: VecDeque::new(),
            }),
        }
    }

    /// Queue a write intent. Returns true when a new record was appended,
    /// false when an existing record for the key was replaced (dedup).
    pub fn queue_dirty(&self, qi: Arc<QueuedItem>) -> bool {
        let mut inner = self.inner.lock();
        let open = &mut inner.open;
        match open.key_index.get(&qi.key) {
            Some(&idx) => {
                open.items[idx] = qi;
                false
            }
            None => {
                open.key_index.insert(qi.key.clone(), open.items.len());
                open.items.push(qi);
                true
            }
        }
    }

    /// Hand every queued intent to the flusher in FIFO order and open a
    /// fresh checkpoint. Returns the id of the checkpoint the batch
    /// completes; once the flusher commits, that id is durable.
    pub fn drain_for_persistence(&self, out: &mut Vec<Arc<QueuedItem>>) -> u64 {
        let mut inner = self.inner.lock();
        if inner.open.items.is_empty() {
            return inner.open.id.saturating_sub(1);
        }
        let next_id = inner.open.id + 1;
        let mut drained = std::mem::replace(&mut inner.open, Checkpoint::new(next_id));
        let drained_id = drained.id;
        out.append(&mut drained.items);
        drained.key_index.clear();
        inner.closed.push_back(drained);
        drained_id
    }

    /// A key is evictable once no open-checkpoint record still references
    /// it (the persistence cursor has passed it).
    pub fn eligible_for_eviction(&self, key: &[u8]) -> bool {
        !self.inner.lock().open.key_index.contains_key(key)
    }

    pub fn num_items_for_persistence(&self) -> usize {
        self.inner.lock().open.items.len()
    }

    pub fn has_items_for_persistence(&self) -> bool {
        !self.inner.lock().open.items.is_empty()
    }

    pub fn open_checkpoint_id(&self) -> u64 {
        self.inner.lock().open.id
    }

    /// Warmup hands the recorded checkpoint id back to the manager.
    pub fn set_open_checkpoint_id(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.open.id = id;
    }

    /// Reap drained checkpoints. Returns how many were released.
    pub fn remove_closed_checkpoints(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.closed.len();
        inner.closed.clear();
        n
    }

    pub fn num_closed_checkpoints(&self) -> usize {
        self.inner.lock().closed.len()
    }

    /// Drop all queued intents and start over with a bumped id; used when a
    /// vbucket is reset.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let next_id = inner.open.id + 1;
        inner.open = Checkpoint::new(next_id);
        inner.closed.clear();
    }
}
