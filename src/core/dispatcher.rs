use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type TaskId = u64;

/// Task priorities, lower is more urgent.
pub mod priority {
    pub const WARMUP: u8 = 0;
    pub const VB_SNAPSHOT_HIGH: u8 = 1;
    pub const FAST_VBUCKET_DELETION: u8 = 1;
    pub const FLUSHER: u8 = 2;
    pub const VBUCKET_DELETION: u8 = 2;
    pub const BG_FETCHER: u8 = 3;
    pub const VB_SNAPSHOT_LOW: u8 = 3;
    pub const ITEM_PAGER: u8 = 4;
    pub const CHECKPOINT_REMOVER: u8 = 4;
    pub const HT_RESIZER: u8 = 5;
    pub const LOG_COMPACTOR: u8 = 5;
    pub const ACCESS_SCANNER: u8 = 6;
    pub const STAT_SNAP: u8 = 7;
}

/// A schedulable unit of background work.
///
/// `run` returns true to be rescheduled (immediately, or after a delay the
/// task registered via `Dispatcher::snooze`), false to retire.
pub trait Task: Send + Sync {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool;
    fn description(&self) -> String;
}

struct Entry {
    id: TaskId,
    priority: u8,
    wake_at: Instant,
    task: Arc<dyn Task>,
}

struct Sched {
    tasks: Vec<Entry>,
    snoozes: HashMap<TaskId, Duration>,
    cancelled: HashSet<TaskId>,
    next_id: TaskId,
    shutdown: bool,
    force: bool,
}

/// Single-threaded priority scheduler with snooze and cancellation.
///
/// The engine runs three of these: RW (persistence, vbucket deletion,
/// warmup), RO (background fetches; collapses onto RW when the backing
/// store has no concurrent readers), and NonIO (pagers and friends).
pub struct Dispatcher {
    name: &'static str,
    sched: Mutex<Sched>,
    cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create the dispatcher and start its worker thread.
    pub fn start(name: &'static str) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            name,
            sched: Mutex::new(Sched {
                tasks: Vec::new(),
                snoozes: HashMap::new(),
                cancelled: HashSet::new(),
                next_id: 1,
                shutdown: false,
                force: false,
            }),
            cond: Condvar::new(),
            handle: Mutex::new(None),
        });
        let worker = Arc::clone(&dispatcher);
        let handle = std::thread::Builder::new()
            .name(format!("drift-dispatcher-{name}"))
            .spawn(move || worker.run_loop())
            .expect("failed to spawn dispatcher thread");
        *dispatcher.handle.lock() = Some(handle);
        dispatcher
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn schedule(&self, task: Arc<dyn Task>, priority: u8, delay: Duration) -> TaskId {
        let mut sched = self.sched.lock();
        let id = sched.next_id;
        sched.next_id += 1;
        sched.tasks.push(Entry {
            id,
            priority,
            wake_at: Instant::now() + delay,
            task,
        });
        self.cond.notify_one();
        id
    }

    /// Called by a running task: when it returns true, reschedule it after
    /// `delay` instead of immediately.
    pub fn snooze(&self, id: TaskId, delay: Duration) {
        self.sched.lock().snoozes.insert(id, delay);
    }

    /// Pull a sleeping task's wake time forward to now.
    pub fn wake(&self, id: TaskId) {
        let mut sched = self.sched.lock();
        let now = Instant::now();
        if let Some(entry) = sched.tasks.iter_mut().find(|e| e.id == id) {
            entry.wake_at = now;
            self.cond.notify_one();
        }
    }

    pub fn cancel(&self, id: TaskId) {
        let mut sched = self.sched.lock();
        if let Some(pos) = sched.tasks.iter().position(|e| e.id == id) {
            sched.tasks.swap_remove(pos);
        } else {
            // May be mid-run; suppress its reschedule.
            sched.cancelled.insert(id);
        }
        sched.snoozes.remove(&id);
    }

    /// Stop the worker. Non-force lets tasks that are already due run one
    /// final time; force abandons everything immediately.
    pub fn stop(&self, force: bool) {
        {
            let mut sched = self.sched.lock();
            sched.shutdown = true;
            sched.force = force;
            self.cond.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(&self) {
        loop {
            let entry = {
                let mut sched = self.sched.lock();
                loop {
                    if sched.shutdown && sched.force {
                        return;
                    }
                    let now = Instant::now();
                    let due = sched
                        .tasks
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.wake_at <= now)
                        .min_by_key(|(_, e)| (e.priority, e.wake_at))
                        .map(|(i, _)| i);
                    if let Some(idx) = due {
                        break sched.tasks.swap_remove(idx);
                    }
                    if sched.shutdown {
                        // Nothing due right now; future work is abandoned.
                        return;
                    }
                    match sched.tasks.iter().map(|e| e.wake_at).min() {
                        Some(next) => {
                            self.cond.wait_until(&mut sched, next);
                        }
                        None => {
                            self.cond.wait(&mut sched);
                        }
                    }
                }
            };

            let rerun = entry.task.run(self, entry.id);

            let mut sched = self.sched.lock();
            let was_cancelled = sched.cancelled.remove(&entry.id);
            if rerun && !was_cancelled && !sched.shutdown {
                let delay = sched.snoozes.remove(&entry.id).unwrap_or(Duration::ZERO);
                sched.tasks.push(Entry {
                    id: entry.id,
                    priority: entry.priority,
                    wake_at: Instant::now() + delay,
                    task: entry.task,
                });
            } else {
                sched.snoozes.remove(&entry.id);
            }
        }
    }
}
