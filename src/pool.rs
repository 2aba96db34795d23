//! The shared worker pool.
//!
//! One pool serves any number of groups. It owns the ready queue, the elastic
//! worker set, and the timer service. Workers are spawned when ready work
//! piles up with nobody idle, up to the configured cap, and exit after the
//! idle timeout; at least one worker stays alive while any item is enrolled.
//!
//! # Thread architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         WeftPool                             |
//! |  ready queue: FIFO of (item, work value)                     |
//! |  timer heap:  min-heap of (deadline, item, work value)       |
//! +--------------------------------------------------------------+
//!        |  pop / run / advance           |  fire at deadline
//!        v                                v
//! +---------------------+        +---------------------+
//! |  {prefix}-worker-N  |  ...   |  {prefix}-timer     |
//! |  nesting TLS frame  |        |  promotes delayed   |
//! |  per run invocation |        |  items to ready     |
//! +---------------------+        +---------------------+
//! ```
//!
//! The dispatch step is factored so it can be re-entered with a termination
//! predicate: a `Group::wait` issued from inside a `run` hook services other
//! ready items on the same worker instead of blocking it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::builder::WeftBuilder;
use crate::config::WeftConfig;
use crate::context;
use crate::error::Result;
use crate::group::{Group, GroupInner};
use crate::io_aware::{IoAware, IoAwareWorkItem, IoAwareness};
use crate::metrics::WeftMetrics;
use crate::timer::TimerService;
use crate::work::{
    Next, WorkHandle, WorkValue, PHASE_DELAYED, PHASE_QUEUED, PHASE_RETIRED, PHASE_RUNNING,
};

/// How long a cooperative dispatcher parks when the ready queue is empty
/// before re-checking its termination predicate.
const DISPATCH_PARK: Duration = Duration::from_millis(5);

pub(crate) struct ReadyEntry {
    item: WorkHandle,
    work: WorkValue,
    epoch: u64,
}

struct Sched {
    queue: VecDeque<ReadyEntry>,
    live: usize,
    idle: usize,
    next_worker_id: u64,
    /// Bumped on every spawn and exit; spawn decisions racing with worker
    /// exits observe it through the lock rather than stale counts.
    generation: u64,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
}

pub(crate) struct PoolInner {
    pub(crate) config: WeftConfig,
    max_workers: usize,
    idle_timeout: Duration,
    sched: Mutex<Sched>,
    work_cv: Condvar,
    pub(crate) timer: TimerService,
    /// Items enrolled across all groups; keeps the last worker alive.
    enrolled_total: AtomicUsize,
    pub(crate) metrics: WeftMetrics,
}

/// A shared, elastic worker pool for dynamic thread pool groups.
///
/// Cheaply cloneable; all clones refer to the same pool. Most applications
/// use the process-global pool through [`make_group`](crate::make_group);
/// explicit pools built via [`WeftBuilder`] suit tests and embedders that
/// need their own sizing or metrics registry.
#[derive(Clone)]
pub struct WeftPool {
    inner: Arc<PoolInner>,
}

impl WeftPool {
    /// Create a pool from a configuration.
    ///
    /// This is typically called via [`WeftBuilder::build`].
    pub(crate) fn from_config(config: WeftConfig) -> Result<Self> {
        let hardware = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let max_workers = config.effective_max_workers(hardware);
        let metrics = WeftMetrics::with_prefix(&config.prefix);
        if let Some(ref registry) = config.prometheus_registry {
            if let Err(e) = metrics.register(registry) {
                warn!(%e, "failed to register prometheus metrics");
            }
        }

        info!(
            prefix = %config.prefix,
            max_workers,
            idle_timeout_ms = config.idle_timeout_ms,
            max_nesting_depth = config.max_nesting_depth,
            "building weft pool"
        );

        let idle_timeout = config.idle_timeout();
        let prefix = config.prefix.clone();
        let inner = Arc::new(PoolInner {
            config,
            max_workers,
            idle_timeout,
            sched: Mutex::new(Sched {
                queue: VecDeque::new(),
                live: 0,
                idle: 0,
                next_worker_id: 0,
                generation: 0,
                shutdown: false,
                handles: Vec::new(),
            }),
            work_cv: Condvar::new(),
            timer: TimerService::new(),
            enrolled_total: AtomicUsize::new(0),
            metrics,
        });
        inner.timer.start(Arc::downgrade(&inner), &prefix)?;
        Ok(Self { inner })
    }

    /// The process-global pool, built with default configuration on first
    /// use and living for the rest of the process.
    pub fn global() -> &'static WeftPool {
        static GLOBAL: OnceLock<WeftPool> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            WeftBuilder::new()
                .build()
                .expect("default weft pool construction should not fail")
        })
    }

    /// Create a new, idle group backed by this pool.
    pub fn make_group(&self) -> Result<Group> {
        Ok(Group::new(self.inner.clone()))
    }

    /// Construct an I/O-aware work item wrapper using this pool's configured
    /// pacing knobs and metrics.
    pub fn io_aware<T: IoAwareWorkItem>(
        &self,
        body: T,
        awareness: Vec<IoAwareness>,
    ) -> IoAware<T> {
        let knobs = self.inner.config.pacing.clone().unwrap_or_default();
        IoAware::new(body, awareness)
            .with_knobs(knobs)
            .with_metrics(self.inner.metrics.clone())
    }

    /// Get the resolved configuration.
    pub fn config(&self) -> &WeftConfig {
        &self.inner.config
    }

    /// Get the pool metrics.
    ///
    /// The metrics are always collected; providing a registry via
    /// [`WeftBuilder::prometheus_registry`] additionally exposes them for
    /// scraping.
    pub fn metrics(&self) -> &WeftMetrics {
        &self.inner.metrics
    }

    /// Number of worker threads currently alive.
    pub fn current_workers(&self) -> usize {
        self.inner.sched.lock().live
    }

    /// Number of items currently in the ready queue.
    pub fn ready_depth(&self) -> usize {
        self.inner.sched.lock().queue.len()
    }

    /// Stop accepting work, abandon queued items, and join all pool threads.
    ///
    /// In-flight `run` invocations complete before their workers exit.
    /// Idempotent. Must not be called from a worker thread.
    pub fn shutdown(&self) {
        let handles = {
            let mut sched = self.inner.sched.lock();
            if sched.shutdown {
                return;
            }
            sched.shutdown = true;
            sched.queue.clear();
            std::mem::take(&mut sched.handles)
        };
        self.inner.work_cv.notify_all();
        self.inner.timer.shutdown();
        for handle in handles {
            let _ = handle.join();
        }
        info!(prefix = %self.inner.config.prefix, "weft pool shut down");
    }
}

impl std::fmt::Debug for WeftPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sched = self.inner.sched.lock();
        f.debug_struct("WeftPool")
            .field("prefix", &self.inner.config.prefix)
            .field("max_workers", &self.inner.max_workers)
            .field("live", &sched.live)
            .field("idle", &sched.idle)
            .field("generation", &sched.generation)
            .field("ready", &sched.queue.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for WeftPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sched = self.inner.sched.lock();
        write!(
            f,
            "WeftPool[{}]: workers({}/{}, idle={}) ready({}) delayed({})",
            self.inner.config.prefix,
            sched.live,
            self.inner.max_workers,
            sched.idle,
            sched.queue.len(),
            self.inner.timer.len(),
        )
    }
}

impl PoolInner {
    /// Push an item onto the ready queue and make sure someone will pick it
    /// up: wake an idle worker, or spawn one if all are busy and the cap
    /// allows.
    pub(crate) fn enqueue_ready(self: &Arc<Self>, item: WorkHandle, work: WorkValue) {
        let epoch = item.epoch();
        let need_spawn = {
            let mut sched = self.sched.lock();
            if sched.shutdown {
                return;
            }
            sched.queue.push_back(ReadyEntry { item, work, epoch });
            self.metrics.ready_depth.set(sched.queue.len() as i64);
            sched.idle == 0 && sched.live < self.max_workers
        };
        self.work_cv.notify_one();
        if need_spawn {
            if let Err(e) = self.spawn_worker() {
                warn!(error = %e, "failed to spawn worker");
                if self.sched.lock().live == 0 {
                    self.abandon_queued(e.to_string());
                }
            }
        }
    }

    /// Spawn one worker unless shut down or at the cap.
    pub(crate) fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let mut sched = self.sched.lock();
        if sched.shutdown || sched.live >= self.max_workers {
            return Ok(());
        }
        // Reap handles of workers that already exited; is_finished() means
        // the worker closure has returned, so the join is immediate.
        let mut i = 0;
        while i < sched.handles.len() {
            if sched.handles[i].is_finished() {
                let _ = sched.handles.swap_remove(i).join();
            } else {
                i += 1;
            }
        }
        let id = sched.next_worker_id;
        sched.next_worker_id += 1;
        let name = format!("{}-worker-{:04}", self.config.prefix, id);
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(weak, id))?;
        sched.live += 1;
        sched.generation += 1;
        sched.handles.push(handle);
        self.metrics.worker_spawns.inc();
        self.metrics.workers.set(sched.live as i64);
        debug!(worker = id, live = sched.live, "spawned worker");
        Ok(())
    }

    /// Guarantee at least one live worker. Called at submit so enrolled
    /// groups always have someone to make progress.
    pub(crate) fn ensure_worker(self: &Arc<Self>) -> Result<()> {
        let needed = {
            let sched = self.sched.lock();
            !sched.shutdown && sched.live == 0
        };
        if needed {
            self.spawn_worker()
        } else {
            Ok(())
        }
    }

    /// No worker could be spawned and none is alive: fail the groups of
    /// everything queued.
    fn abandon_queued(self: &Arc<Self>, message: String) {
        let entries: Vec<ReadyEntry> = self.sched.lock().queue.drain(..).collect();
        for entry in entries {
            if let Some(group) = entry.item.parent() {
                group.fail(message.clone());
            }
        }
    }

    /// Decide an item's next step: retire it if its group is stopping,
    /// otherwise call `next` and queue, delay, or retire accordingly.
    ///
    /// `from_phase` is the phase the item must still be in; losing that CAS
    /// means `stop()` retired the item concurrently and there is nothing to
    /// do.
    pub(crate) fn advance(
        self: &Arc<Self>,
        item: &WorkHandle,
        group: &Arc<GroupInner>,
        from_phase: u8,
    ) {
        if group.stopping.load(Ordering::Acquire) {
            if item.transition(from_phase, PHASE_RETIRED) {
                self.metrics.items_cancelled.inc();
                retire_one(group);
            }
            return;
        }
        let decision = {
            let _hook = item.enter_hook();
            item.body().next()
        };
        // After each phase CAS below, stop() either already saw the new
        // phase (and retired the item itself) or will observe it through the
        // re-check here / the pop-time check; the total order on the phase
        // atomic guarantees exactly one side retires.
        match decision {
            Next::Retire => {
                if item.transition(from_phase, PHASE_RETIRED) {
                    retire_one(group);
                }
            }
            Next::Ready(work) => self.make_ready(item, group, from_phase, work),
            Next::After(work, delay) if delay.is_zero() => {
                self.make_ready(item, group, from_phase, work)
            }
            Next::After(work, delay) => {
                if item.transition(from_phase, PHASE_DELAYED) {
                    if self.cancel_if_stopping(item, group, PHASE_DELAYED) {
                        return;
                    }
                    self.timer
                        .schedule(Instant::now() + delay, item.clone(), work, item.epoch());
                    self.metrics.timer_depth.set(self.timer.len() as i64);
                }
            }
        }
    }

    fn make_ready(self: &Arc<Self>, item: &WorkHandle, group: &Arc<GroupInner>, from_phase: u8, work: WorkValue) {
        if item.transition(from_phase, PHASE_QUEUED) {
            if self.cancel_if_stopping(item, group, PHASE_QUEUED) {
                return;
            }
            self.enqueue_ready(item.clone(), work);
        }
    }

    /// Re-check the stopping flag after a phase CAS. Retires the item here
    /// unless stop() already did; either way, returns true when the group is
    /// stopping and the item must not be scheduled.
    fn cancel_if_stopping(&self, item: &WorkHandle, group: &Arc<GroupInner>, phase: u8) -> bool {
        if group.stopping.load(Ordering::Acquire) {
            if item.transition(phase, PHASE_RETIRED) {
                self.metrics.items_cancelled.inc();
                retire_one(group);
            }
            return true;
        }
        false
    }

    /// Execute one ready entry: run the item under a nesting frame, then
    /// advance it.
    pub(crate) fn run_entry(self: &Arc<Self>, entry: ReadyEntry) {
        let ReadyEntry { item, work, epoch } = entry;
        // Stale entries: the item was stopped or re-enrolled after queueing
        if item.epoch() != epoch {
            return;
        }
        if !item.transition(PHASE_QUEUED, PHASE_RUNNING) {
            return;
        }
        let Some(group) = item.parent() else {
            return;
        };
        // Entries raced past stop() (e.g. a timer firing mid-stop) are
        // cancelled at pop time: no new run starts once the group is stopping
        if group.inner.stopping.load(Ordering::Acquire) {
            if item.transition(PHASE_RUNNING, PHASE_RETIRED) {
                self.metrics.items_cancelled.inc();
                retire_one(&group.inner);
            }
            return;
        }
        self.metrics.items_executed.inc();
        let result = {
            let _frame = context::enter_frame(item.nesting(), item.clone());
            let _hook = item.enter_hook();
            // A panicking run must not take the worker down with it, or the
            // item's group would never finalize; treat it as a failed run.
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| item.body().run(work)))
                .unwrap_or_else(|payload| Err(crate::error::WeftError::Task(panic_message(payload))))
        };
        if let Err(err) = result {
            debug!(error = %err, "work item run failed");
            item.record_error(err);
        }
        self.advance(&item, &group.inner, PHASE_RUNNING);
    }

    /// Service ready items until `done()` holds or `deadline` passes.
    ///
    /// This is the cooperative re-entry point used by `Group::wait` on
    /// worker threads. Returns false only on deadline expiry.
    pub(crate) fn dispatch_until(
        self: &Arc<Self>,
        done: impl Fn() -> bool,
        deadline: Option<Instant>,
    ) -> bool {
        loop {
            if done() {
                return true;
            }
            if let Some(at) = deadline {
                if Instant::now() >= at {
                    return false;
                }
            }
            let entry = {
                let mut sched = self.sched.lock();
                let entry = sched.queue.pop_front();
                if entry.is_some() {
                    self.metrics.ready_depth.set(sched.queue.len() as i64);
                }
                entry
            };
            match entry {
                Some(entry) => self.run_entry(entry),
                None => {
                    let mut sched = self.sched.lock();
                    if sched.shutdown {
                        // Queued work was abandoned; the predicate can no
                        // longer make progress through us
                        return done();
                    }
                    if sched.queue.is_empty() {
                        let mut until = Instant::now() + DISPATCH_PARK;
                        if let Some(at) = deadline {
                            until = until.min(at);
                        }
                        self.work_cv.wait_until(&mut sched, until);
                    }
                }
            }
        }
    }

    pub(crate) fn on_enrolled(&self, n: usize) {
        self.enrolled_total.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn on_retired(&self, n: usize) {
        self.enrolled_total.fetch_sub(n, Ordering::AcqRel);
    }

    /// Wake cooperative dispatchers so they re-check their predicates.
    pub(crate) fn wake_dispatchers(&self) {
        self.work_cv.notify_all();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("run panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("run panicked: {s}")
    } else {
        "run panicked".to_string()
    }
}

fn retire_one(group: &Arc<GroupInner>) {
    if group.active.fetch_sub(1, Ordering::AcqRel) == 1 {
        crate::group::try_finalize(group);
    }
}

enum Fetched {
    Entry(ReadyEntry),
    Exit,
}

fn worker_loop(weak: Weak<PoolInner>, id: u64) {
    debug!(worker = id, "worker started");
    loop {
        let Some(pool) = weak.upgrade() else { break };
        let fetched = {
            let mut sched = pool.sched.lock();
            loop {
                if sched.shutdown {
                    sched.live -= 1;
                    sched.generation += 1;
                    break Fetched::Exit;
                }
                if let Some(entry) = sched.queue.pop_front() {
                    pool.metrics.ready_depth.set(sched.queue.len() as i64);
                    break Fetched::Entry(entry);
                }
                sched.idle += 1;
                let timed_out = pool
                    .work_cv
                    .wait_for(&mut sched, pool.idle_timeout)
                    .timed_out();
                sched.idle -= 1;
                // An idle worker may exit, but never the last one while any
                // item is still enrolled somewhere.
                if timed_out
                    && sched.queue.is_empty()
                    && (sched.live > 1 || pool.enrolled_total.load(Ordering::Acquire) == 0)
                {
                    sched.live -= 1;
                    sched.generation += 1;
                    break Fetched::Exit;
                }
            }
        };
        match fetched {
            Fetched::Entry(entry) => pool.run_entry(entry),
            Fetched::Exit => {
                pool.metrics.worker_exits.inc();
                pool.metrics.workers.set(pool.sched.lock().live as i64);
                break;
            }
        }
    }
    debug!(worker = id, "worker exiting");
}
