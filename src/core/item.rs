use bytes::Bytes;
use std::mem;

/// Opaque token identifying a suspended client operation. The engine hands
/// it back through `EngineNotifier::notify_io_complete` exactly once.
pub type Cookie = u64;

/// States a vbucket moves through over its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VBucketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(VBucketState::Active),
            1 => Some(VBucketState::Replica),
            2 => Some(VBucketState::Pending),
            3 => Some(VBucketState::Dead),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            VBucketState::Active => 0,
            VBucketState::Replica => 1,
            VBucketState::Pending => 2,
            VBucketState::Dead => 3,
        }
    }
}

/// The client-visible payload.
///
/// `exptime` is absolute unix seconds, 0 meaning never. `rowid` is the
/// backing store's primary key, -1 until the item has been persisted.
#[derive(Debug, Clone)]
pub struct Item {
    key: Vec<u8>,
    vbucket: u16,
    value: Option<Bytes>,
    flags: u32,
    exptime: u32,
    cas: u64,
    seqno: u32,
    rowid: i64,
}

impl Item {
    pub fn new(key: impl Into<Vec<u8>>, vbucket: u16, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            vbucket,
            value: Some(value.into()),
            flags: 0,
            exptime: 0,
            cas: 0,
            seqno: 1,
            rowid: -1,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_meta(
        key: impl Into<Vec<u8>>,
        vbucket: u16,
        value: Option<Bytes>,
        flags: u32,
        exptime: u32,
        cas: u64,
        seqno: u32,
        rowid: i64,
    ) -> Self {
        Self {
            key: key.into(),
            vbucket,
            value,
            flags,
            exptime,
            cas,
            seqno,
            rowid,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn take_value(self) -> Option<Bytes> {
        self.value
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    pub fn set_exptime(&mut self, exptime: u32) {
        self.exptime = exptime;
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub fn rowid(&self) -> i64 {
        self.rowid
    }

    pub fn set_rowid(&mut self, rowid: i64) {
        self.rowid = rowid;
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime < now
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}

/// Metadata summary returned by `get_metadata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetaData {
    pub cas: u64,
    pub seqno: u32,
    pub flags: u32,
    pub value_len: usize,
    pub deleted: bool,
}

/// Operations flowing through the persistence queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    Set,
    Del,
    /// Synthetic marker asking the flusher to wipe the backing store.
    Flush,
    Commit,
    Empty,
}

/// A write intent queued for the flusher. Shared (`Arc`) between a
/// vbucket's checkpoint and the outgoing flush queue until commit.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub key: Vec<u8>,
    pub vbucket: u16,
    pub op: QueueOp,
    pub vb_version: u16,
    pub rowid: i64,
    pub seqno: u32,
    /// Unix seconds at enqueue time; the flusher ages items off this.
    pub queued_at: u32,
}

impl QueuedItem {
    pub fn new(
        key: Vec<u8>,
        vbucket: u16,
        op: QueueOp,
        vb_version: u16,
        rowid: i64,
        seqno: u32,
        queued_at: u32,
    ) -> Self {
        Self {
            key,
            vbucket,
            op,
            vb_version,
            rowid,
            seqno,
            queued_at,
        }
    }

    pub fn marker(vbucket: u16, op: QueueOp) -> Self {
        Self {
            key: Vec::new(),
            vbucket,
            op,
            vb_version: 0,
            rowid: -1,
            seqno: 0,
            queued_at: 0,
        }
    }

    pub fn size(&self) -> usize {
        mem::size_of::<Self>() + self.key.len()
    }
}

/// The in-memory record owned by a hash table bucket.
#[derive(Debug)]
pub struct StoredValue {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Option<Bytes>,
    pub(crate) flags: u32,
    pub(crate) exptime: u32,
    pub(crate) cas: u64,
    pub(crate) seqno: u32,
    /// Backing-store rowid; -1 while unpersisted.
    pub(crate) id: i64,
    pub(crate) dirty: bool,
    pub(crate) deleted: bool,
    /// Metadata-only placeholder (awaiting a metadata fetch, or a
    /// tombstone of a prior delete).
    pub(crate) temp: bool,
    /// Temp item confirmed absent from the backing store.
    pub(crate) non_existent: bool,
    /// A persistence request for this value is in flight.
    pub(crate) pending_id: bool,
    pub(crate) resident: bool,
    /// Absolute unix second the lock lapses; 0 when unlocked.
    pub(crate) lock_expiry: u32,
    /// Unix second of the last mutation.
    pub(crate) data_age: u32,
}

impl StoredValue {
    pub(crate) fn from_item(itm: &Item, dirty: bool, now: u32) -> Self {
        Self {
            key: itm.key().to_vec(),
            value: itm.value().cloned(),
            flags: itm.flags(),
            exptime: itm.exptime(),
            cas: itm.cas(),
            seqno: itm.seqno(),
            id: itm.rowid(),
            dirty,
            deleted: false,
            temp: false,
            non_existent: false,
            pending_id: false,
            resident: itm.value().is_some(),
            lock_expiry: 0,
            data_age: now,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn data_age(&self) -> u32 {
        self.data_age
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_temp(&self) -> bool {
        self.temp
    }

    pub fn is_temp_non_existent(&self) -> bool {
        self.temp && self.non_existent
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    pub fn is_pending_id(&self) -> bool {
        self.pending_id
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime < now
    }

    pub fn is_locked(&self, now: u32) -> bool {
        self.lock_expiry != 0 && self.lock_expiry > now
    }

    pub(crate) fn lock(&mut self, until: u32) {
        self.lock_expiry = until;
    }

    pub(crate) fn unlock(&mut self) {
        self.lock_expiry = 0;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
        self.pending_id = false;
    }

    pub(crate) fn mark_dirty(&mut self, now: u32) {
        self.dirty = true;
        self.data_age = now;
    }

    /// Put a flushed-then-rejected value back on the dirty path without
    /// refreshing its age, so it does not look young forever.
    pub(crate) fn redirty(&mut self, data_age: u32) {
        self.dirty = true;
        self.pending_id = false;
        self.data_age = data_age;
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }

    pub(crate) fn size(&self) -> usize {
        mem::size_of::<Self>() + self.key.capacity() + self.value_len()
    }

    /// Materialize as an Item for handing to callers or the KVStore.
    pub fn to_item(&self, vbucket: u16) -> Item {
        Item::with_meta(
            self.key.clone(),
            vbucket,
            self.value.clone(),
            self.flags,
            self.exptime,
            self.cas,
            self.seqno,
            self.id,
        )
    }

    pub fn metadata(&self) -> ItemMetaData {
        ItemMetaData {
            cas: self.cas,
            seqno: self.seqno,
            flags: self.flags,
            value_len: self.value_len(),
            deleted: self.deleted,
        }
    }
}
