use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::wait_until;
use crate::core::dispatcher::{Dispatcher, Task, TaskId};

struct CountingTask {
    runs: AtomicUsize,
    rerun: bool,
    snooze: Option<Duration>,
}

impl CountingTask {
    fn new(rerun: bool, snooze: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            rerun,
            snooze,
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }
}

impl Task for CountingTask {
    fn run(&self, dispatcher: &Dispatcher, id: TaskId) -> bool {
        self.runs.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.snooze {
            dispatcher.snooze(id, delay);
        }
        self.rerun
    }

    fn description(&self) -> String {
        "Counting runs".to_string()
    }
}

struct OrderTask {
    label: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl Task for OrderTask {
    fn run(&self, _dispatcher: &Dispatcher, _id: TaskId) -> bool {
        self.order.lock().push(self.label);
        false
    }

    fn description(&self) -> String {
        format!("Recording {}", self.label)
    }
}

#[test]
fn test_one_shot_task_runs_once() {
    let d = Dispatcher::start("test");
    let task = CountingTask::new(false, None);
    d.schedule(task.clone(), 5, Duration::ZERO);
    assert!(wait_until(Duration::from_secs(2), || task.runs() == 1));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(task.runs(), 1);
    d.stop(true);
}

#[test]
fn test_rerun_with_snooze() {
    let d = Dispatcher::start("test");
    let task = CountingTask::new(true, Some(Duration::from_millis(10)));
    d.schedule(task.clone(), 5, Duration::ZERO);
    assert!(wait_until(Duration::from_secs(2), || task.runs() >= 3));
    d.stop(true);
}

#[test]
fn test_priority_ordering_among_due_tasks() {
    let d = Dispatcher::start("test");
    let order = Arc::new(Mutex::new(Vec::new()));

    // Park both behind a delay so they come due together.
    let low = Arc::new(OrderTask {
        label: "low",
        order: Arc::clone(&order),
    });
    let high = Arc::new(OrderTask {
        label: "high",
        order: Arc::clone(&order),
    });
    d.schedule(low, 9, Duration::from_millis(100));
    d.schedule(high, 1, Duration::from_millis(100));

    assert!(wait_until(Duration::from_secs(2), || order.lock().len() == 2));
    assert_eq!(*order.lock(), vec!["high", "low"]);
    d.stop(true);
}

#[test]
fn test_cancel_prevents_run() {
    let d = Dispatcher::start("test");
    let task = CountingTask::new(true, None);
    let id = d.schedule(task.clone(), 5, Duration::from_millis(200));
    d.cancel(id);
    std::thread::sleep(Duration::from_millis(350));
    assert_eq!(task.runs(), 0);
    d.stop(true);
}

#[test]
fn test_wake_pulls_sleeping_task_forward() {
    let d = Dispatcher::start("test");
    let task = CountingTask::new(false, None);
    let id = d.schedule(task.clone(), 5, Duration::from_secs(60));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(task.runs(), 0);
    d.wake(id);
    assert!(wait_until(Duration::from_secs(2), || task.runs() == 1));
    d.stop(true);
}

#[test]
fn test_stop_joins_worker() {
    let d = Dispatcher::start("test");
    let task = CountingTask::new(true, Some(Duration::from_millis(5)));
    d.schedule(task.clone(), 5, Duration::ZERO);
    assert!(wait_until(Duration::from_secs(2), || task.runs() >= 1));
    d.stop(false);
    let after = task.runs();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(task.runs(), after);
}
