use log::debug;
use std::sync::Weak;
use std::time::Instant;

use crate::core::dispatcher::{Dispatcher, Task, TaskId};
use crate::core::item::{Cookie, VBucketState};
use crate::core::store::DriftStore;
use crate::error::DriftError;
use crate::utils::unix_now;

/// Two flavors of background fetch: full value rehydration on a cache
/// miss, and metadata-only population of a temp placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgFetchKind {
    Value,
    Meta,
}

/// A scheduled fetch against the backing store. The suspended caller is
/// notified through the engine's I/O completion hook when it resolves.
pub struct BgFetchTask {
    store: Weak<DriftStore>,
    key: Vec<u8>,
    vbid: u16,
    vbver: u16,
    rowid: i64,
    cookie: Cookie,
    kind: BgFetchKind,
    init: Instant,
}

impl BgFetchTask {
    pub fn new(
        store: Weak<DriftStore>,
        key: Vec<u8>,
        vbid: u16,
        vbver: u16,
        rowid: i64,
        cookie: Cookie,
        kind: BgFetchKind,
    ) -> Self {
        Self {
            store,
            key,
            vbid,
            vbver,
            rowid,
            cookie,
            kind,
            init: Instant::now(),
        }
    }
}

impl Task for BgFetchTask {
    fn run(&self, _dispatcher: &Dispatcher, _id: TaskId) -> bool {
        if let Some(store) = self.store.upgrade() {
            store.complete_bg_fetch(
                &self.key,
                self.vbid,
                self.vbver,
                self.rowid,
                self.cookie,
                self.kind,
                self.init,
            );
        }
        false
    }

    fn description(&self) -> String {
        format!(
            "Fetching item {:?} from vb{}",
            String::from_utf8_lossy(&self.key),
            self.vbid
        )
    }
}

impl DriftStore {
    /// Runs on the RO dispatcher: read from the backing store, re-acquire
    /// the bucket, restore what is still wanted, and resolve the cookie.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn complete_bg_fetch(
        &self,
        key: &[u8],
        vbid: u16,
        vbver: u16,
        rowid: i64,
        cookie: Cookie,
        kind: BgFetchKind,
        init: Instant,
    ) {
        use std::sync::atomic::Ordering;

        let start = Instant::now();
        self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
        debug!(
            "completing a background fetch, {} outstanding",
            self.bg_fetch_queue_depth()
        );

        let fetched = self
            .ro
            .get(key, rowid, vbid, vbver, kind == BgFetchKind::Meta);

        // Hold the lifecycle lock so a concurrent vbucket deletion cannot
        // race the restore.
        let status = {
            let _lh = self.vbset_mutex.lock();
            let now = unix_now();
            let window = self.config.tmp_item_expiry_window.load(Ordering::Acquire);
            match self.vbuckets.get(vbid) {
                Some(vb) if vb.state() == VBucketState::Active => {
                    vb.ht.with_bucket(key, |b| match kind {
                        BgFetchKind::Meta => {
                            let item = fetched.as_ref().ok().map(|gv| gv.item.clone());
                            b.restore_meta(key, item.as_ref(), window, now);
                            match &fetched {
                                Ok(_) => Ok(()),
                                Err(_) => Err(DriftError::KeyNotFound),
                            }
                        }
                        BgFetchKind::Value => match &fetched {
                            Ok(gv) => {
                                if let Some(value) = gv.item.value() {
                                    b.restore_value(key, value.clone());
                                }
                                Ok(())
                            }
                            Err(_) => Err(DriftError::KeyNotFound),
                        },
                    })
                }
                _ => match &fetched {
                    Ok(_) => Ok(()),
                    Err(_) => Err(DriftError::KeyNotFound),
                },
            }
        };

        let stop = Instant::now();
        self.stats.record_bg_fetch(
            (start - init).as_micros() as u64,
            (stop - start).as_micros() as u64,
        );

        self.notify_io_complete(cookie, status);
        self.bg_fetch_done();
    }
}
