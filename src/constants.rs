use std::time::Duration;

// Size units
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

// Keyspace partitioning
pub const MAX_VBUCKETS: usize = 1024;
pub const MAX_KEY_SIZE: usize = 250;

// Hash table sizing. Bucket counts are powers of two so the murmur hash
// can be masked instead of divided.
pub const INITIAL_HT_BUCKETS: usize = 1 << 10;
pub const MIN_HT_BUCKETS: usize = 1 << 7;
pub const MAX_HT_BUCKETS: usize = 1 << 22;

// Memory management
pub const DEFAULT_MAX_DATA_SIZE: usize = 4 * GB;
pub const MEM_LOW_WAT_PERCENT: f64 = 0.75;
pub const MEM_HIGH_WAT_PERCENT: f64 = 0.85;
/// Fraction of max_data_size a single mutation may push memory up to.
pub const MUTATION_MEM_THRESHOLD: f64 = 0.95;

// Expiry
pub const DEFAULT_EXPIRY_WINDOW: u32 = 3;
pub const DEFAULT_TMP_ITEM_EXPIRY_WINDOW: u32 = 10;
pub const DEFAULT_EXP_PAGER_STIME: u64 = 3600;

// Flusher
pub const DEFAULT_MAX_TXN_SIZE: usize = 10_000;
pub const DEFAULT_MIN_DATA_AGE: u32 = 0;
pub const DEFAULT_QUEUE_AGE_CAP: u32 = 900;
pub const FLUSHER_IDLE_SNOOZE: Duration = Duration::from_secs(1);
pub const COMMIT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_COUCH_VB_BATCH_COUNT: usize = 4;

// VBucket deletion
pub const DEFAULT_VB_DEL_CHUNK_SIZE: usize = 100;
pub const MIN_VB_DEL_CHUNK_SIZE: i64 = 100;
pub const DEFAULT_VB_CHUNK_DEL_TIME_MS: u32 = 500;
pub const VB_DEL_RETRY_SNOOZE: Duration = Duration::from_secs(10);

// Mutation log
pub const LOG_HEADER_MAGIC: u32 = 0x4C47_A551;
pub const LOG_FORMAT_VERSION: u32 = 1;
pub const LOG_ENTRY_MAGIC: u8 = 0x45;
pub const DEFAULT_KLOG_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_KLOG_MAX_LOG_SIZE: u64 = GB as u64;
pub const DEFAULT_KLOG_MAX_ENTRY_RATIO: usize = 10;
pub const DEFAULT_KLOG_COMPACTOR_QUEUE_CAP: usize = 500_000;
/// fsync before the backing-store transaction commits
pub const SYNC_COMMIT_1: u8 = 1;
/// fsync after the backing-store transaction commits
pub const SYNC_COMMIT_2: u8 = 2;
pub const SYNC_FULL: u8 = SYNC_COMMIT_1 | SYNC_COMMIT_2;

// TAP throttling
pub const DEFAULT_TAP_THROTTLE_THRESHOLD: u32 = 90;
pub const DEFAULT_TAP_THROTTLE_QUEUE_CAP: i64 = 1_000_000;

// Warmup traffic gates, in percent
pub const DEFAULT_WARMUP_MIN_MEMORY_THRESHOLD: u32 = 100;
pub const DEFAULT_WARMUP_MIN_ITEMS_THRESHOLD: u32 = 100;

// Periodic worker cadence
pub const STATSNAP_FREQ: Duration = Duration::from_secs(60);
pub const ACCESS_SCANNER_SLEEP: Duration = Duration::from_secs(3600);
pub const HT_RESIZER_SLEEP: Duration = Duration::from_secs(60);
pub const CHECKPOINT_REMOVER_SLEEP: Duration = Duration::from_secs(5);
pub const ITEM_PAGER_SLEEP: Duration = Duration::from_secs(10);
pub const LOG_COMPACTOR_SLEEP: Duration = Duration::from_secs(600);

/// Environment variable that disables the flusher entirely.
pub const EP_NO_PERSISTENCE_ENV: &str = "EP_NO_PERSISTENCE";
