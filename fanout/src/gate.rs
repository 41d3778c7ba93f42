//! Throttle background tasks by running excess work on the submitting thread.
//!
//! A gate runs up to `max_threads` tasks concurrently, each on its own freshly spawned thread.
//! Once that many tasks are in flight, further submissions run synchronously on the caller and
//! only return once done. A producer that submits work faster than it completes is therefore
//! slowed down to the pace of its consumers, without ever queueing work.
//!
//! Two flavors are provided:
//!
//! - [Gate]: owns its state and accepts `'static` tasks. Dropping it blocks until every task it
//!   spawned has finished.
//! - [scoped]: runs a closure with a [Scoped] gate whose tasks may borrow from the enclosing
//!   stack frame. [scoped] returns only once every task has finished.
//!
//! # Example
//!
//! ```
//! use commonware_fanout::{Dispatch, Gate};
//! use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
//!
//! let written = Arc::new(AtomicUsize::new(0));
//! {
//!     let gate = Gate::new(2);
//!     for _ in 0..10 {
//!         let written = written.clone();
//!         gate.run(move || {
//!             written.fetch_add(1, Ordering::SeqCst);
//!         });
//!     }
//! } // blocks until all tasks are done
//! assert_eq!(written.load(Ordering::SeqCst), 10);
//! ```

use crate::error::panic_message;
use std::{
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread,
};
use tracing::{debug, error, trace, warn};

/// Configuration for a [Gate] or [Scoped] gate.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of tasks running in the background at once.
    ///
    /// If `0`, every task runs synchronously on the submitting thread.
    pub max_threads: usize,

    /// Name given to background threads.
    pub name: String,

    /// Stack size of background threads.
    ///
    /// If not set, the platform default is used.
    pub stack_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_threads: thread::available_parallelism().map_or(1, |n| n.get()),
            name: "gate".to_string(),
            stack_size: None,
        }
    }
}

/// How a submitted task was executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// The task was handed to a background thread.
    Spawned,
    /// The task ran to completion on the submitting thread.
    Inline,
}

/// Number of background tasks in flight.
#[derive(Debug)]
struct Counter {
    active: Mutex<usize>,
    idle: Condvar,
    max_threads: usize,
}

impl Counter {
    fn new(max_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(0),
            idle: Condvar::new(),
            max_threads,
        })
    }

    /// Reserve a background slot, if one is free.
    fn acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut active = self.active.lock().unwrap();
        if *active >= self.max_threads {
            return None;
        }
        *active += 1;
        Some(Permit {
            counter: self.clone(),
        })
    }

    fn active(&self) -> usize {
        *self.active.lock().unwrap()
    }

    /// Block until no background task is in flight.
    fn wait(&self) {
        let mut active = self.active.lock().unwrap();
        if *active > 0 {
            debug!(active = *active, "waiting for background tasks");
        }
        while *active > 0 {
            active = self.idle.wait(active).unwrap();
        }
    }
}

/// A reserved background slot, released on drop (even if the task panicked).
struct Permit {
    counter: Arc<Counter>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut active = self.counter.active.lock().unwrap();
        *active -= 1;
        if *active == 0 {
            self.counter.idle.notify_all();
        }
    }
}

/// Run `task` in the background through `spawn` if `counter` has room, otherwise inline.
fn dispatch<'a, F>(
    counter: &Arc<Counter>,
    cfg: &Config,
    task: F,
    spawn: impl FnOnce(thread::Builder, Box<dyn FnOnce() + Send + 'a>) -> io::Result<()>,
) -> Dispatch
where
    F: FnOnce() + Send + 'a,
{
    let Some(permit) = counter.acquire() else {
        trace!(max_threads = counter.max_threads, "gate saturated, running inline");
        task();
        return Dispatch::Inline;
    };

    // The task is parked here so it can be recovered if the thread cannot be spawned.
    let handoff = Arc::new(Mutex::new(Some(task)));
    let body: Box<dyn FnOnce() + Send + 'a> = {
        let handoff = handoff.clone();
        Box::new(move || {
            let _permit = permit;
            let task = handoff.lock().unwrap().take();
            if let Some(task) = task {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    error!(err = panic_message(&payload), "background task panicked");
                }
            }
        })
    };

    let mut builder = thread::Builder::new().name(cfg.name.clone());
    if let Some(size) = cfg.stack_size {
        builder = builder.stack_size(size);
    }
    match spawn(builder, body) {
        Ok(()) => {
            trace!("spawned background task");
            Dispatch::Spawned
        }
        Err(err) => {
            warn!(?err, "failed to spawn background task, running inline");
            let task = handoff.lock().unwrap().take();
            if let Some(task) = task {
                task();
            }
            Dispatch::Inline
        }
    }
}

/// Runs up to `max_threads` `'static` tasks in the background.
///
/// Tasks are started on a fresh thread each (no pool). Once `max_threads` tasks are running,
/// [Gate::run] executes further tasks on the calling thread.
///
/// Dropping the gate blocks until every background task has finished. A task may submit more
/// work to the gate it runs on (for example through an [Arc]), but must not drop the last
/// reference to it or call [Gate::wait]: both wait for the task itself to finish.
#[derive(Debug)]
pub struct Gate {
    cfg: Config,
    counter: Arc<Counter>,
}

impl Gate {
    /// Creates a gate allowing up to `max_threads` background tasks.
    pub fn new(max_threads: usize) -> Self {
        Self::init(Config {
            max_threads,
            ..Default::default()
        })
    }

    /// Creates a gate from the given [Config].
    pub fn init(cfg: Config) -> Self {
        let counter = Counter::new(cfg.max_threads);
        Self { cfg, counter }
    }

    /// Maximum number of background tasks.
    pub fn max_threads(&self) -> usize {
        self.counter.max_threads
    }

    /// Number of background tasks currently in flight.
    pub fn active(&self) -> usize {
        self.counter.active()
    }

    /// Runs `task` in the background if fewer than `max_threads` tasks are in flight, otherwise
    /// runs it on the calling thread and returns once it completes.
    ///
    /// A background task that panics is logged and releases its slot.
    pub fn run<F>(&self, task: F) -> Dispatch
    where
        F: FnOnce() + Send + 'static,
    {
        dispatch(&self.counter, &self.cfg, task, |builder, body| {
            builder.spawn(body).map(drop)
        })
    }

    /// Blocks until every background task spawned so far has finished.
    pub fn wait(&self) {
        self.counter.wait();
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.wait();
    }
}

/// A gate whose tasks may borrow from the stack frame that called [scoped].
///
/// Cloning a [Scoped] gate yields a handle to the same gate (tasks can clone it to submit nested
/// work).
#[derive(Debug)]
pub struct Scoped<'scope, 'env: 'scope> {
    scope: &'scope thread::Scope<'scope, 'env>,
    cfg: Arc<Config>,
    counter: Arc<Counter>,
}

impl Clone for Scoped<'_, '_> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope,
            cfg: self.cfg.clone(),
            counter: self.counter.clone(),
        }
    }
}

impl<'scope> Scoped<'scope, '_> {
    /// Maximum number of background tasks.
    pub fn max_threads(&self) -> usize {
        self.counter.max_threads
    }

    /// Number of background tasks currently in flight.
    pub fn active(&self) -> usize {
        self.counter.active()
    }

    /// Runs `task` in the background if fewer than `max_threads` tasks are in flight, otherwise
    /// runs it on the calling thread and returns once it completes.
    pub fn run<F>(&self, task: F) -> Dispatch
    where
        F: FnOnce() + Send + 'scope,
    {
        let scope = self.scope;
        dispatch(&self.counter, &self.cfg, task, move |builder, body| {
            builder.spawn_scoped(scope, body).map(drop)
        })
    }
}

/// Runs `f` with a [Scoped] gate and returns once `f` and every task it submitted are done.
///
/// # Examples
///
/// ```
/// use commonware_fanout::gate::{scoped, Config};
/// use std::sync::Mutex;
///
/// let frames: Vec<u32> = (0..16).collect();
/// let encoded = Mutex::new(Vec::new());
/// scoped(Config { max_threads: 3, ..Default::default() }, |gate| {
///     for frame in &frames {
///         let encoded = &encoded;
///         gate.run(move || encoded.lock().unwrap().push(frame * 2));
///     }
/// });
/// assert_eq!(encoded.into_inner().unwrap().len(), 16);
/// ```
pub fn scoped<'env, T, F>(cfg: Config, f: F) -> T
where
    F: for<'scope> FnOnce(Scoped<'scope, 'env>) -> T,
{
    let counter = Counter::new(cfg.max_threads);
    let cfg = Arc::new(cfg);
    let result = thread::scope(|scope| {
        f(Scoped {
            scope,
            cfg,
            counter: counter.clone(),
        })
    });
    debug_assert_eq!(counter.active(), 0);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Barrier,
        },
        time::{Duration, Instant},
    };

    /// Tracks how many tasks run at once.
    #[derive(Default)]
    struct Tracker {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Tracker {
        fn enter(&self) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test_traced]
    fn test_peak_bounded_by_max_threads() {
        const K: usize = 3;
        let tracker = Arc::new(Tracker::default());
        let release = Arc::new(Barrier::new(K + 1));
        {
            let gate = Gate::new(K);
            for _ in 0..K {
                let tracker = tracker.clone();
                let release = release.clone();
                let dispatch = gate.run(move || {
                    tracker.enter();
                    release.wait();
                    tracker.exit();
                });
                assert_eq!(dispatch, Dispatch::Spawned);
            }
            assert_eq!(gate.active(), K);

            // Capacity is exhausted: the next task runs right here.
            let caller = thread::current().id();
            let ran_inline = Arc::new(AtomicBool::new(false));
            let flag = ran_inline.clone();
            let dispatch = gate.run(move || {
                assert_eq!(thread::current().id(), caller);
                flag.store(true, Ordering::SeqCst);
            });
            assert_eq!(dispatch, Dispatch::Inline);
            assert!(ran_inline.load(Ordering::SeqCst));

            release.wait();
        }
        assert_eq!(tracker.peak.load(Ordering::SeqCst), K);
        assert_eq!(tracker.running.load(Ordering::SeqCst), 0);
    }

    #[test_traced]
    fn test_saturated_run_executes_inline() {
        let start = Instant::now();
        {
            let gate = Gate::new(1);
            let dispatch = gate.run(|| thread::sleep(Duration::from_millis(100)));
            assert_eq!(dispatch, Dispatch::Spawned);

            // The slot is still taken, so the no-op runs on this thread instead of queueing.
            let caller = thread::current().id();
            let dispatch = gate.run(move || assert_eq!(thread::current().id(), caller));
            assert_eq!(dispatch, Dispatch::Inline);
            assert_eq!(gate.active(), 1);
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_inline_when_slot_taken() {
        let gate = Gate::new(1);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        gate.run(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();

        let start = Instant::now();
        let dispatch = gate.run(|| thread::sleep(Duration::from_millis(100)));
        assert_eq!(dispatch, Dispatch::Inline);
        assert!(start.elapsed() >= Duration::from_millis(100));
        release_tx.send(()).unwrap();
    }

    #[test_traced]
    fn test_drop_waits_for_tasks() {
        let done: Vec<Arc<AtomicBool>> = (0..4).map(|_| Arc::new(AtomicBool::new(false))).collect();
        {
            let gate = Gate::new(4);
            for flag in &done {
                let flag = flag.clone();
                gate.run(move || {
                    thread::sleep(Duration::from_millis(50));
                    flag.store(true, Ordering::SeqCst);
                });
            }
        }
        assert!(done.iter().all(|flag| flag.load(Ordering::SeqCst)));
    }

    #[test]
    fn test_zero_max_threads_always_inline() {
        let gate = Gate::new(0);
        let caller = thread::current().id();
        for _ in 0..5 {
            let dispatch = gate.run(move || assert_eq!(thread::current().id(), caller));
            assert_eq!(dispatch, Dispatch::Inline);
        }
        assert_eq!(gate.active(), 0);
        assert_eq!(gate.max_threads(), 0);
    }

    #[test_traced]
    fn test_panicking_task_releases_slot() {
        let gate = Gate::new(1);
        assert_eq!(gate.run(|| panic!("task failed")), Dispatch::Spawned);
        gate.wait();
        assert_eq!(gate.active(), 0);

        // The slot is free again.
        assert_eq!(gate.run(|| {}), Dispatch::Spawned);
    }

    #[test]
    fn test_slots_reused_after_completion() {
        let gate = Gate::init(Config {
            max_threads: 2,
            name: "gate-test".into(),
            stack_size: Some(256 * 1024),
        });
        let (names_tx, names_rx) = mpsc::channel();
        for _ in 0..10 {
            let names_tx = names_tx.clone();
            let dispatch = gate.run(move || {
                let name = thread::current().name().map(str::to_string);
                names_tx.send(name).unwrap();
            });
            assert_eq!(dispatch, Dispatch::Spawned);
            gate.wait();
        }
        drop(names_tx);

        let names: Vec<_> = names_rx.iter().collect();
        assert_eq!(names.len(), 10);
        for name in names {
            assert_eq!(name.as_deref(), Some("gate-test"));
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test_traced]
    fn test_spawn_failure_runs_inline() {
        // No platform can reserve a 64 TiB stack, so every spawn fails.
        let gate = Gate::init(Config {
            max_threads: 4,
            name: "gate-unspawnable".into(),
            stack_size: Some(1 << 46),
        });
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let observed = ran_on.clone();
        let dispatch = gate.run(move || {
            *observed.lock().unwrap() = Some(thread::current().id());
        });
        assert_eq!(dispatch, Dispatch::Inline);
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
        assert_eq!(gate.active(), 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_scoped_spawn_failure_runs_inline() {
        let caller = thread::current().id();
        let ran_on = Mutex::new(Vec::new());
        scoped(
            Config {
                max_threads: 2,
                name: "gate-unspawnable".into(),
                stack_size: Some(1 << 46),
            },
            |gate| {
                for _ in 0..3 {
                    let ran_on = &ran_on;
                    let dispatch = gate.run(move || {
                        ran_on.lock().unwrap().push(thread::current().id());
                    });
                    assert_eq!(dispatch, Dispatch::Inline);
                    assert_eq!(gate.active(), 0);
                }
            },
        );
        assert_eq!(ran_on.into_inner().unwrap(), vec![caller; 3]);
    }

    #[test]
    fn test_debug_output() {
        let gate = Gate::new(2);
        let rendered = format!("{gate:?}");
        assert!(rendered.starts_with("Gate"));
        assert!(rendered.contains("max_threads: 2"));

        let rendered = scoped(Config::default(), |gate| format!("{gate:?}"));
        assert!(rendered.starts_with("Scoped"));
    }

    #[test]
    fn test_nested_submission_with_shared_gate() {
        let gate = Arc::new(Gate::new(2));
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let inner_gate = gate.clone();
            let total = total.clone();
            gate.run(move || {
                for _ in 0..4 {
                    let total = total.clone();
                    inner_gate.run(move || {
                        total.fetch_add(1, Ordering::SeqCst);
                    });
                }
                total.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Wait until no task holds a reference, so the last drop happens here.
        while Arc::strong_count(&gate) > 1 {
            thread::yield_now();
        }
        drop(gate);
        assert_eq!(total.load(Ordering::SeqCst), 8 * 5);
    }

    #[test_traced]
    fn test_scoped_borrows_and_waits() {
        let tracker = Tracker::default();
        let items: Vec<usize> = (0..32).collect();
        let sum = AtomicUsize::new(0);
        let dispatches = scoped(
            Config {
                max_threads: 4,
                ..Default::default()
            },
            |gate| {
                items
                    .iter()
                    .map(|item| {
                        let (tracker, sum) = (&tracker, &sum);
                        gate.run(move || {
                            tracker.enter();
                            thread::sleep(Duration::from_millis(2));
                            sum.fetch_add(*item, Ordering::SeqCst);
                            tracker.exit();
                        })
                    })
                    .collect::<Vec<_>>()
            },
        );
        assert_eq!(sum.into_inner(), (0..32).sum::<usize>());
        assert!(tracker.peak.load(Ordering::SeqCst) <= 4 + 1);
        assert!(dispatches.contains(&Dispatch::Spawned));
    }

    #[test]
    fn test_scoped_nested_submission() {
        let total = AtomicUsize::new(0);
        scoped(
            Config {
                max_threads: 2,
                ..Default::default()
            },
            |gate| {
                for _ in 0..6 {
                    let (inner, total) = (gate.clone(), &total);
                    gate.run(move || {
                        inner.run(move || {
                            total.fetch_add(1, Ordering::SeqCst);
                        });
                        total.fetch_add(1, Ordering::SeqCst);
                    });
                }
                assert!(gate.active() <= gate.max_threads());
            },
        );
        assert_eq!(total.into_inner(), 12);
    }
}
