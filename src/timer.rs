//! Delayed-ready timer service.
//!
//! Items whose `next` asked for a positive delay park here until their
//! deadline, then move to the pool's ready queue. A dedicated thread sleeps
//! on a condition variable until the earliest deadline; pushing an earlier
//! entry wakes it. Entries never fire early beyond clock granularity: an
//! entry moves only once its deadline is at or before `Instant::now()`.
//!
//! Entries for items that were since stopped or re-enrolled are detected by
//! the (epoch, phase) check at fire time and dropped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::pool::PoolInner;
use crate::work::{WorkHandle, WorkValue, PHASE_DELAYED, PHASE_QUEUED};

pub(crate) struct TimerEntry {
    pub(crate) at: Instant,
    seq: u64,
    pub(crate) item: WorkHandle,
    pub(crate) work: WorkValue,
    pub(crate) epoch: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Heap key: deadline, then insertion order for a stable tie-break
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

struct TimerCore {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
    shutdown: bool,
}

pub(crate) struct TimerService {
    core: Mutex<TimerCore>,
    cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        Self {
            core: Mutex::new(TimerCore {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the timer thread. Called once during pool construction.
    pub(crate) fn start(&self, pool: Weak<PoolInner>, prefix: &str) -> std::io::Result<()> {
        let handle = thread::Builder::new()
            .name(format!("{}-timer", prefix))
            .spawn(move || timer_loop(pool))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Park an item until `at`, carrying the work value for its next `run`.
    pub(crate) fn schedule(&self, at: Instant, item: WorkHandle, work: WorkValue, epoch: u64) {
        let mut core = self.core.lock();
        let seq = core.next_seq;
        core.next_seq += 1;
        core.heap.push(Reverse(TimerEntry {
            at,
            seq,
            item,
            work,
            epoch,
        }));
        drop(core);
        self.cv.notify_one();
    }

    pub(crate) fn len(&self) -> usize {
        self.core.lock().heap.len()
    }

    /// Stop the timer thread and join it. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut core = self.core.lock();
            if core.shutdown {
                return;
            }
            core.shutdown = true;
            core.heap.clear();
        }
        self.cv.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

enum Step {
    Fired(Vec<TimerEntry>),
    Shutdown,
}

fn timer_loop(weak: Weak<PoolInner>) {
    debug!("timer service started");
    loop {
        let Some(pool) = weak.upgrade() else { break };
        let timer = &pool.timer;
        let step = {
            let mut core = timer.core.lock();
            loop {
                if core.shutdown {
                    break Step::Shutdown;
                }
                let now = Instant::now();
                let mut fired = Vec::new();
                while core
                    .heap
                    .peek()
                    .is_some_and(|Reverse(entry)| entry.at <= now)
                {
                    fired.push(core.heap.pop().unwrap().0);
                }
                if !fired.is_empty() {
                    break Step::Fired(fired);
                }
                match core.heap.peek() {
                    Some(Reverse(entry)) => {
                        let at = entry.at;
                        timer.cv.wait_until(&mut core, at);
                    }
                    None => timer.cv.wait(&mut core),
                }
            }
        };
        match step {
            Step::Shutdown => break,
            Step::Fired(entries) => {
                for entry in entries {
                    // Stale if the item was stopped or re-enrolled meanwhile
                    if entry.item.epoch() != entry.epoch {
                        continue;
                    }
                    if entry.item.transition(PHASE_DELAYED, PHASE_QUEUED) {
                        pool.enqueue_ready(entry.item, entry.work);
                    }
                }
                pool.metrics.timer_depth.set(timer.len() as i64);
            }
        }
        drop(pool);
    }
    debug!("timer service stopped");
}
