// Test modules for driftdb

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::item::Cookie;
use crate::core::store::EngineNotifier;
use crate::error::Result;

#[cfg(test)]
pub mod hash_table_tests;


#[cfg(test)]
pub mod dispatcher_tests;

#[cfg(test)]
pub mod mutation_log_tests;




#[cfg(test)]
pub mod persistence_tests;

#[cfg(test)]
pub mod vbucket_lifecycle_tests;

#[cfg(test)]
pub mod warmup_tests;

#[cfg(test)]
pub mod config_tests;

/// Notifier that forwards completions over a channel so tests can assert
/// on them.
pub struct ChannelNotifier {
    tx: Sender<(Cookie, Result<()>)>,
}

impl ChannelNotifier {
    pub fn new() -> (Arc<Self>, Receiver<(Cookie, Result<()>)>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl EngineNotifier for ChannelNotifier {
    fn notify_io_complete(&self, cookie: Cookie, status: Result<()>) {
        let _ = self.tx.send((cookie, status));
    }
}

/// Poll until `cond` holds or the timeout lapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
