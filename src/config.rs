use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::constants::*;
use crate::error::{DriftError, Result};

/// Components that need to react to a parameter change (beyond reading the
/// atomic on their next pass) register one of these.
pub trait ValueChangedListener: Send {
    fn value_changed(&self, key: &str, value: u64);
}

/// Live engine configuration.
///
/// Every tunable is an atomic cell so workers can read it on each pass
/// without locking; `set_param` updates the cell and fires any registered
/// listeners. Paths and structural options are fixed at construction.
pub struct Config {
    // Fixed at construction
    pub max_vbuckets: usize,
    pub ht_initial_buckets: usize,
    pub klog_path: Option<PathBuf>,
    pub alog_path: Option<PathBuf>,
    pub klog_block_size: usize,
    pub klog_sync_policy: u8,
    pub fail_on_partial_warmup: bool,
    pub warmup: bool,
    pub max_data_size: usize,

    // Runtime-tunable
    pub bg_fetch_delay: AtomicU32,
    pub expiry_window: AtomicU32,
    pub tmp_item_expiry_window: AtomicU32,
    pub exp_pager_stime: AtomicU64,
    pub vb_del_chunk_size: AtomicUsize,
    pub vb_chunk_del_time: AtomicU32,
    pub max_txn_size: AtomicUsize,
    pub couch_vbucket_batch_count: AtomicUsize,
    pub klog_max_log_size: AtomicU64,
    pub klog_max_entry_ratio: AtomicUsize,
    pub klog_compactor_queue_cap: AtomicUsize,
    pub min_data_age: AtomicU32,
    pub queue_age_cap: AtomicU32,
    pub tap_throttle_threshold: AtomicU32,
    pub tap_throttle_queue_cap: AtomicI64,
    pub warmup_min_memory_threshold: AtomicU32,
    pub warmup_min_items_threshold: AtomicU32,

    listeners: Mutex<HashMap<String, Vec<Box<dyn ValueChangedListener>>>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            max_vbuckets: MAX_VBUCKETS,
            ht_initial_buckets: INITIAL_HT_BUCKETS,
            klog_path: None,
            alog_path: None,
            klog_block_size: DEFAULT_KLOG_BLOCK_SIZE,
            klog_sync_policy: SYNC_FULL,
            fail_on_partial_warmup: false,
            warmup: true,
            max_data_size: DEFAULT_MAX_DATA_SIZE,

            bg_fetch_delay: AtomicU32::new(0),
            expiry_window: AtomicU32::new(DEFAULT_EXPIRY_WINDOW),
            tmp_item_expiry_window: AtomicU32::new(DEFAULT_TMP_ITEM_EXPIRY_WINDOW),
            exp_pager_stime: AtomicU64::new(DEFAULT_EXP_PAGER_STIME),
            vb_del_chunk_size: AtomicUsize::new(DEFAULT_VB_DEL_CHUNK_SIZE),
            vb_chunk_del_time: AtomicU32::new(DEFAULT_VB_CHUNK_DEL_TIME_MS),
            max_txn_size: AtomicUsize::new(DEFAULT_MAX_TXN_SIZE),
            couch_vbucket_batch_count: AtomicUsize::new(DEFAULT_COUCH_VB_BATCH_COUNT),
            klog_max_log_size: AtomicU64::new(DEFAULT_KLOG_MAX_LOG_SIZE),
            klog_max_entry_ratio: AtomicUsize::new(DEFAULT_KLOG_MAX_ENTRY_RATIO),
            klog_compactor_queue_cap: AtomicUsize::new(DEFAULT_KLOG_COMPACTOR_QUEUE_CAP),
            min_data_age: AtomicU32::new(DEFAULT_MIN_DATA_AGE),
            queue_age_cap: AtomicU32::new(DEFAULT_QUEUE_AGE_CAP),
            tap_throttle_threshold: AtomicU32::new(DEFAULT_TAP_THROTTLE_THRESHOLD),
            tap_throttle_queue_cap: AtomicI64::new(DEFAULT_TAP_THROTTLE_QUEUE_CAP),
            warmup_min_memory_threshold: AtomicU32::new(DEFAULT_WARMUP_MIN_MEMORY_THRESHOLD),
            warmup_min_items_threshold: AtomicU32::new(DEFAULT_WARMUP_MIN_ITEMS_THRESHOLD),

            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_value_changed_listener(
        &self,
        key: &str,
        listener: Box<dyn ValueChangedListener>,
    ) {
        self.listeners
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(listener);
    }

    /// Apply a runtime parameter change. The new value takes effect
    /// immediately for the owning component.
    pub fn set_param(&self, key: &str, value: u64) -> Result<()> {
        match key {
            "bg_fetch_delay" => self.bg_fetch_delay.store(value as u32, Ordering::Release),
            "expiry_window" => self.expiry_window.store(value as u32, Ordering::Release),
            "tmp_item_expiry_window" => self
                .tmp_item_expiry_window
                .store(value as u32, Ordering::Release),
            "exp_pager_stime" => self.exp_pager_stime.store(value, Ordering::Release),
            "vb_del_chunk_size" => self
                .vb_del_chunk_size
                .store(value as usize, Ordering::Release),
            "vb_chunk_del_time" => self
                .vb_chunk_del_time
                .store(value as u32, Ordering::Release),
            "max_txn_size" => self.max_txn_size.store(value as usize, Ordering::Release),
            // Forwards a batching hint to the backing store and nothing
            // else; it does not alias any of the klog settings.
            "couch_vbucket_batch_count" => self
                .couch_vbucket_batch_count
                .store(value as usize, Ordering::Release),
            "klog_max_log_size" => self.klog_max_log_size.store(value, Ordering::Release),
            "klog_max_entry_ratio" => self
                .klog_max_entry_ratio
                .store(value as usize, Ordering::Release),
            "klog_compactor_queue_cap" => self
                .klog_compactor_queue_cap
                .store(value as usize, Ordering::Release),
            "min_data_age" => self.min_data_age.store(value as u32, Ordering::Release),
            "queue_age_cap" => self.queue_age_cap.store(value as u32, Ordering::Release),
            "tap_throttle_threshold" => self
                .tap_throttle_threshold
                .store(value as u32, Ordering::Release),
            "tap_throttle_queue_cap" => self
                .tap_throttle_queue_cap
                .store(value as i64, Ordering::Release),
            "warmup_min_memory_threshold" => self
                .warmup_min_memory_threshold
                .store(value as u32, Ordering::Release),
            "warmup_min_items_threshold" => self
                .warmup_min_items_threshold
                .store(value as u32, Ordering::Release),
            _ => return Err(DriftError::UnknownParameter(key.to_string())),
        }

        if let Some(listeners) = self.listeners.lock().get(key) {
            for listener in listeners {
                listener.value_changed(key, value);
            }
        }
        Ok(())
    }
}

/// Builder-style helpers for the fixed fields.
impl Config {
    pub fn with_mutation_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.klog_path = Some(path.into());
        self
    }

    pub fn with_access_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.alog_path = Some(path.into());
        self
    }

    pub fn with_max_data_size(mut self, max: usize) -> Self {
        self.max_data_size = max;
        self
    }

    pub fn with_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_fail_on_partial_warmup(mut self, fail: bool) -> Self {
        self.fail_on_partial_warmup = fail;
        self
    }

    pub fn with_klog_sync_policy(mut self, policy: u8) -> Self {
        self.klog_sync_policy = policy;
        self
    }

    pub fn with_ht_initial_buckets(mut self, buckets: usize) -> Self {
        self.ht_initial_buckets = buckets.next_power_of_two();
        self
    }
}
