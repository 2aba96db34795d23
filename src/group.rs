//! Work item groups.
//!
//! A group is the lifecycle envelope over a batch of submitted work items:
//! the unit of cancellation and of completion waiting. Items from many groups
//! share one pool; the group only tracks which of its items are still active
//! and delivers `group_complete` once the last one retires.
//!
//! State machine:
//!
//! ```text
//! idle --submit--> running --stop()--> stopping --last complete--> stopped
//!                     \________________last retire_______________/
//! ```
//!
//! Re-submitting a stopped group is permitted and returns it to running.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::context;
use crate::error::{Result, WeftError};
use crate::pool::PoolInner;
use crate::work::{
    WorkHandle, PHASE_DELAYED, PHASE_PENDING, PHASE_QUEUED, PHASE_RETIRED, PHASE_UNENROLLED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupState {
    Idle,
    Running,
    Stopping,
    /// Transient: the last item retired and group_complete delivery is in
    /// progress. Keeps a concurrent submit from racing the teardown.
    Finalizing,
    Stopped,
}

pub(crate) enum StopCause {
    Cancelled,
    Failed(String),
}

pub(crate) struct GroupCore {
    pub(crate) state: GroupState,
    pub(crate) enrolled: Vec<WorkHandle>,
    /// Taken by the first `wait` that observes the stopped state; later
    /// waits on the same stopped group succeed.
    pub(crate) stop_cause: Option<StopCause>,
}

pub(crate) struct GroupInner {
    pub(crate) pool: Arc<PoolInner>,
    pub(crate) core: Mutex<GroupCore>,
    /// Enrolled items that have not yet retired.
    pub(crate) active: AtomicUsize,
    /// True from stop() (or an unrecoverable scheduling error) until the
    /// stopped transition completes.
    pub(crate) stopping: AtomicBool,
    pub(crate) cv: Condvar,
}

/// Handle to a dynamic thread pool group.
///
/// Cheaply cloneable; all clones refer to the same group.
#[derive(Clone)]
pub struct Group {
    pub(crate) inner: Arc<GroupInner>,
}

impl Group {
    pub(crate) fn new(pool: Arc<PoolInner>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                pool,
                core: Mutex::new(GroupCore {
                    state: GroupState::Idle,
                    enrolled: Vec::new(),
                    stop_cause: None,
                }),
                active: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    /// Enroll a batch of work items and make them ready.
    ///
    /// Each item's first `next` is called on this thread, in submission
    /// order, and the item is queued, delayed, or retired accordingly. The
    /// pool may execute ready items in any order.
    ///
    /// # Errors
    ///
    /// - [`WeftError::AlreadyEnrolled`] if any item is still enrolled
    ///   somewhere; the whole batch is rolled back.
    /// - [`WeftError::InvalidState`] if the group is currently stopping.
    /// - [`WeftError::NestingDepthExceeded`] if called from a `run` hook at
    ///   the configured depth cap.
    pub fn submit(&self, items: &[WorkHandle]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let pool = self.inner.pool.clone();
        let depth = context::current_nesting_level() + 1;
        let max = pool.config.max_nesting_depth;
        if depth > max {
            return Err(WeftError::NestingDepthExceeded { depth, max });
        }
        {
            let mut core = self.inner.core.lock();
            match core.state {
                GroupState::Stopping | GroupState::Finalizing => {
                    return Err(WeftError::InvalidState("group is stopping"))
                }
                GroupState::Idle | GroupState::Stopped => {
                    core.state = GroupState::Running;
                    core.stop_cause = None;
                    core.enrolled.clear();
                    self.inner.stopping.store(false, Ordering::Release);
                }
                GroupState::Running => {}
            }
            let mut enrolled = 0usize;
            for item in items {
                if let Err(err) = item.enroll(self.clone(), depth) {
                    for rolled in items.iter().take(enrolled) {
                        rolled.unenroll();
                        rolled.set_phase(PHASE_UNENROLLED);
                        core.enrolled.pop();
                    }
                    if core.enrolled.is_empty() && core.state == GroupState::Running {
                        core.state = GroupState::Idle;
                    }
                    return Err(err);
                }
                core.enrolled.push(item.clone());
                enrolled += 1;
            }
            self.inner.active.fetch_add(items.len(), Ordering::AcqRel);
        }
        pool.on_enrolled(items.len());
        debug!(items = items.len(), depth, "submitted work items");

        // Initial readiness, outside the core lock so stop() can interleave.
        for item in items {
            pool.advance(item, &self.inner, PHASE_PENDING);
        }

        if let Err(err) = pool.ensure_worker() {
            let msg = err.to_string();
            self.begin_stop(StopCause::Failed(msg));
            return Err(err);
        }
        Ok(())
    }

    /// Stop the group.
    ///
    /// Instantaneous on the scheduling plane: queued and delayed items retire
    /// without further hooks, and no new `next` is issued. In-flight `run`
    /// invocations complete naturally; long-running hooks should poll
    /// [`stopping`](Group::stopping) to cooperate. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.begin_stop(StopCause::Cancelled);
        Ok(())
    }

    /// Abandon the group after an unrecoverable scheduling failure.
    pub(crate) fn fail(&self, message: String) {
        self.begin_stop(StopCause::Failed(message));
    }

    fn begin_stop(&self, cause: StopCause) {
        let snapshot = {
            let mut core = self.inner.core.lock();
            match core.state {
                GroupState::Idle
                | GroupState::Stopped
                | GroupState::Stopping
                | GroupState::Finalizing => return,
                GroupState::Running => {
                    core.state = GroupState::Stopping;
                    core.stop_cause = Some(cause);
                    self.inner.stopping.store(true, Ordering::Release);
                    core.enrolled.clone()
                }
            }
        };
        debug!(items = snapshot.len(), "stopping group");

        // Retire everything parked in the queue or the timer. Running items
        // retire on their worker once `run` returns; pending items (initial
        // `next` not yet issued) retire on the submitting thread, which
        // re-checks the stopping flag. Stale queue/timer entries for the
        // items retired here are discarded at pop time.
        let mut retired = 0usize;
        for item in &snapshot {
            let won = item.transition(PHASE_QUEUED, PHASE_RETIRED)
                || item.transition(PHASE_DELAYED, PHASE_RETIRED);
            if won {
                retired += 1;
            }
        }
        if retired > 0 {
            self.inner
                .pool
                .metrics
                .items_cancelled
                .inc_by(retired as u64);
            if self.inner.active.fetch_sub(retired, Ordering::AcqRel) == retired {
                try_finalize(&self.inner);
            }
        }
    }

    /// Block until the group reaches the stopped state.
    ///
    /// On a worker thread (inside a `run` hook) this does not block: the
    /// worker re-enters the dispatch loop and services other ready items
    /// until the group stops, so a full pool cannot deadlock on nested waits.
    ///
    /// Returns [`WeftError::Cancelled`] if the group was stopped, or the
    /// first unrecoverable scheduling error; the cause is consumed by the
    /// first wait that observes completion, so subsequent waits succeed.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None)
    }

    /// Like [`wait`](Group::wait), giving up at `deadline` with
    /// [`WeftError::TimedOut`]. A timeout does not affect the group.
    pub fn wait_until(&self, deadline: Instant) -> Result<()> {
        self.wait_inner(Some(deadline))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> Result<()> {
        if context::current_work_item().is_some() {
            let observed = self.inner.clone();
            let finished = self.inner.pool.dispatch_until(
                move || {
                    matches!(
                        observed.core.lock().state,
                        GroupState::Idle | GroupState::Stopped
                    )
                },
                deadline,
            );
            if !finished {
                return Err(WeftError::TimedOut);
            }
        } else {
            let mut core = self.inner.core.lock();
            while !matches!(core.state, GroupState::Idle | GroupState::Stopped) {
                match deadline {
                    Some(at) => {
                        if self.inner.cv.wait_until(&mut core, at).timed_out()
                            && !matches!(core.state, GroupState::Idle | GroupState::Stopped)
                        {
                            return Err(WeftError::TimedOut);
                        }
                    }
                    None => self.inner.cv.wait(&mut core),
                }
            }
        }
        match self.inner.core.lock().stop_cause.take() {
            None => Ok(()),
            Some(StopCause::Cancelled) => Err(WeftError::Cancelled),
            Some(StopCause::Failed(msg)) => Err(WeftError::Scheduling(msg)),
        }
    }

    /// True between `stop()` (or an unrecoverable error) and the stopped
    /// transition.
    pub fn stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// True when no submitted work is outstanding: before the first submit
    /// and after every enrolled item has received `group_complete`.
    pub fn stopped(&self) -> bool {
        matches!(
            self.inner.core.lock().state,
            GroupState::Idle | GroupState::Stopped
        )
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Group {}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Group")
            .field("state", &core.state)
            .field("enrolled", &core.enrolled.len())
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .finish()
    }
}

/// Begin group teardown if the last active item really has retired.
///
/// The check runs under the core lock so a concurrent submit that refills
/// the group is either observed (active > 0, no teardown) or fails with the
/// finalizing state; exactly one caller wins the transition.
pub(crate) fn try_finalize(inner: &Arc<GroupInner>) {
    let won = {
        let mut core = inner.core.lock();
        if matches!(core.state, GroupState::Running | GroupState::Stopping)
            && inner.active.load(Ordering::Acquire) == 0
        {
            core.state = GroupState::Finalizing;
            true
        } else {
            false
        }
    };
    if won {
        finalize(inner);
    }
}

/// Deliver `group_complete` to every enrolled item and move the group to
/// stopped. Runs on whichever thread won the finalizing transition.
///
/// Hooks are delivered serialized, in submission order, with the item's
/// parent already cleared.
fn finalize(inner: &Arc<GroupInner>) {
    let (items, cancelled) = {
        let mut core = inner.core.lock();
        debug_assert!(core.state == GroupState::Finalizing);
        (std::mem::take(&mut core.enrolled), core.stop_cause.is_some())
    };
    for item in &items {
        let outcome = match item.take_error() {
            Some(err) => Err(err),
            None if cancelled => Err(WeftError::Cancelled),
            None => Ok(()),
        };
        item.unenroll();
        {
            let _hook = item.enter_hook();
            item.body().group_complete(outcome);
        }
        item.set_phase(PHASE_UNENROLLED);
    }
    inner.pool.on_retired(items.len());
    inner.core.lock().state = GroupState::Stopped;
    inner.stopping.store(false, Ordering::Release);
    inner.cv.notify_all();
    inner.pool.wake_dispatchers();
    inner.pool.metrics.groups_completed.inc();
    debug!(items = items.len(), cancelled, "group finalized");
}
