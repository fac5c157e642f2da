use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::{Config, ValueChangedListener};
use crate::error::DriftError;

#[test]
fn test_set_param_updates_atomics() {
    let config = Config::new();
    config.set_param("min_data_age", 120).unwrap();
    assert_eq!(config.min_data_age.load(Ordering::Acquire), 120);

    config.set_param("bg_fetch_delay", 3).unwrap();
    assert_eq!(config.bg_fetch_delay.load(Ordering::Acquire), 3);

    config.set_param("queue_age_cap", 1800).unwrap();
    assert_eq!(config.queue_age_cap.load(Ordering::Acquire), 1800);
}

#[test]
fn test_unknown_parameter_is_rejected() {
    let config = Config::new();
    assert!(matches!(
        config.set_param("no_such_knob", 1),
        Err(DriftError::UnknownParameter(_))
    ));
}

#[test]
fn test_batch_count_does_not_alias_entry_ratio() {
    let config = Config::new();
    let ratio_before = config.klog_max_entry_ratio.load(Ordering::Acquire);
    config.set_param("couch_vbucket_batch_count", 32).unwrap();
    assert_eq!(
        config.couch_vbucket_batch_count.load(Ordering::Acquire),
        32
    );
    assert_eq!(
        config.klog_max_entry_ratio.load(Ordering::Acquire),
        ratio_before
    );
}

#[test]
fn test_listeners_fire_on_change() {
    struct Recorder(Arc<Mutex<Vec<(String, u64)>>>);
    impl ValueChangedListener for Recorder {
        fn value_changed(&self, key: &str, value: u64) {
            self.0.lock().push((key.to_string(), value));
        }
    }

    let config = Config::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    config.add_value_changed_listener("exp_pager_stime", Box::new(Recorder(Arc::clone(&seen))));

    config.set_param("exp_pager_stime", 60).unwrap();
    config.set_param("min_data_age", 5).unwrap(); // different key, no event
    assert_eq!(*seen.lock(), vec![("exp_pager_stime".to_string(), 60)]);
}

#[test]
fn test_builder_helpers() {
    let config = Config::new()
        .with_max_data_size(1024)
        .with_warmup(false)
        .with_fail_on_partial_warmup(true)
        .with_ht_initial_buckets(100);
    assert_eq!(config.max_data_size, 1024);
    assert!(!config.warmup);
    assert!(config.fail_on_partial_warmup);
    assert_eq!(config.ht_initial_buckets, 128);
}
