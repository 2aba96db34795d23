//! Work item contract and enrollment state.
//!
//! A work item is a user object with three hooks: `next` decides the work
//! value (and optional delay) for the following `run` invocation or retires
//! the item, `run` executes one unit of work, and `group_complete` is called
//! exactly once after the item's whole group has finished.
//!
//! The pool invokes the hooks strictly serially per item:
//!
//! ```text
//! next; run; next; run; ...; next -> Retire; group_complete
//! ```
//!
//! Items from the same group may run in parallel on distinct workers; only
//! per-item serialization is guaranteed. User state therefore needs interior
//! mutability (atomics are the common choice) but never a lock against the
//! item's own hooks.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, WeftError};
use crate::group::Group;

/// Work value handed from `next` to the following `run` invocation.
///
/// The pool does not interpret it; user code commonly uses it as an index or
/// a countdown.
pub type WorkValue = isize;

/// Decision returned by [`WorkItem::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Run again immediately with the given work value.
    Ready(WorkValue),
    /// Run again with the given work value once the delay has elapsed.
    After(WorkValue, Duration),
    /// Retire the item from its group.
    Retire,
}

/// A unit of work with continuation state, enrollable into a [`Group`].
///
/// Hooks are invoked serially per item. `next` must not block or call back
/// into the item's own group; `run` may block on I/O, sleep, or submit work
/// into another group (see the crate docs on nesting).
pub trait WorkItem: Send + Sync + 'static {
    /// Decide the next step for this item.
    ///
    /// Called once before the first `run` (on the submitting thread) and once
    /// after each `run` returns.
    fn next(&self) -> Next;

    /// Execute one unit of work.
    ///
    /// An error does not stop the group; it is recorded and delivered through
    /// this item's `group_complete`.
    fn run(&self, work: WorkValue) -> Result<()>;

    /// Called exactly once after the group as a whole has finished.
    ///
    /// The outcome is `Ok` under natural completion, the item's own `run`
    /// error if it failed, and [`WeftError::Cancelled`] if the group was
    /// stopped. [`WorkHandle::parent`] returns `None` while this hook runs.
    fn group_complete(&self, _outcome: Result<()>) {}
}

// Enrollment phases. An item is in exactly one of these at any instant;
// transitions are atomic CAS so stop() and workers can race safely.
pub(crate) const PHASE_UNENROLLED: u8 = 0;
pub(crate) const PHASE_PENDING: u8 = 1; // enrolled, first next() not yet called
pub(crate) const PHASE_QUEUED: u8 = 2;
pub(crate) const PHASE_DELAYED: u8 = 3;
pub(crate) const PHASE_RUNNING: u8 = 4;
pub(crate) const PHASE_RETIRED: u8 = 5;

pub(crate) struct WorkState {
    body: Box<dyn WorkItem>,
    parent: Mutex<Option<Group>>,
    phase: AtomicU8,
    /// Bumped on every enrollment; stale ready-queue and timer entries carry
    /// an older epoch and are discarded at pop time.
    epoch: AtomicU64,
    /// Nesting level this item runs at, fixed at submit time.
    nesting: AtomicUsize,
    /// Reentry flag: asserts that hook invocations never overlap.
    within: AtomicBool,
    last_error: Mutex<Option<WeftError>>,
}

/// Cloneable handle to an enrollable work item.
///
/// The user owns the handle (and through it the item body); the pool holds
/// clones only while the item is enrolled. A handle may be re-submitted after
/// its previous group has stopped.
#[derive(Clone)]
pub struct WorkHandle {
    pub(crate) state: Arc<WorkState>,
}

impl WorkHandle {
    /// Wrap a work item body into an enrollable handle.
    pub fn new(body: impl WorkItem) -> Self {
        Self {
            state: Arc::new(WorkState {
                body: Box::new(body),
                parent: Mutex::new(None),
                phase: AtomicU8::new(PHASE_UNENROLLED),
                epoch: AtomicU64::new(0),
                nesting: AtomicUsize::new(0),
                within: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// The group this item is currently enrolled in.
    ///
    /// `None` when not enrolled, including for the duration of the item's
    /// `group_complete` hook.
    pub fn parent(&self) -> Option<Group> {
        self.state.parent.lock().clone()
    }

    /// Whether two handles refer to the same work item.
    pub fn same_item(&self, other: &WorkHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn body(&self) -> &dyn WorkItem {
        self.state.body.as_ref()
    }

    pub(crate) fn phase(&self) -> u8 {
        self.state.phase.load(Ordering::Acquire)
    }

    /// Atomically move from `from` to `to`; false if another thread won.
    pub(crate) fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .phase
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_phase(&self, phase: u8) {
        self.state.phase.store(phase, Ordering::Release);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn nesting(&self) -> usize {
        self.state.nesting.load(Ordering::Acquire)
    }

    /// Enroll this item into a group. Fails if it is already enrolled.
    ///
    /// Caller holds the group's core lock, so two submits of the same batch
    /// cannot interleave; the parent slot's own lock arbitrates concurrent
    /// submits to different groups.
    pub(crate) fn enroll(&self, group: Group, nesting: usize) -> Result<()> {
        let mut parent = self.state.parent.lock();
        // The phase CAS also rejects re-enrollment while the previous group
        // is still delivering this item's group_complete
        if parent.is_some()
            || self
                .state
                .phase
                .compare_exchange(
                    PHASE_UNENROLLED,
                    PHASE_PENDING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return Err(WeftError::AlreadyEnrolled);
        }
        *parent = Some(group);
        self.state.epoch.fetch_add(1, Ordering::AcqRel);
        self.state.nesting.store(nesting, Ordering::Release);
        *self.state.last_error.lock() = None;
        Ok(())
    }

    /// Clear enrollment; called during group finalization, before
    /// `group_complete` is invoked.
    pub(crate) fn unenroll(&self) {
        *self.state.parent.lock() = None;
        self.state.nesting.store(0, Ordering::Release);
    }

    pub(crate) fn record_error(&self, err: WeftError) {
        *self.state.last_error.lock() = Some(err);
    }

    pub(crate) fn take_error(&self) -> Option<WeftError> {
        self.state.last_error.lock().take()
    }

    /// Assert serial hook entry and return a guard clearing the flag on exit.
    ///
    /// This is the testable "within" invariant: overlapping hook invocations
    /// on one item are a pool bug (or a user bug, if the same body was
    /// wrapped into two handles) and trip the debug assertion.
    pub(crate) fn enter_hook(&self) -> HookGuard<'_> {
        debug_assert!(
            self.state
                .within
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "concurrent hook invocation on a single work item"
        );
        #[cfg(not(debug_assertions))]
        self.state.within.store(true, Ordering::Release);
        HookGuard { state: &self.state }
    }
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("phase", &self.phase())
            .field("nesting", &self.nesting())
            .field("enrolled", &self.state.parent.lock().is_some())
            .finish()
    }
}

pub(crate) struct HookGuard<'a> {
    state: &'a WorkState,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.state.within.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting;
    impl WorkItem for Counting {
        fn next(&self) -> Next {
            Next::Retire
        }
        fn run(&self, _work: WorkValue) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fresh_handle_is_unenrolled() {
        let h = WorkHandle::new(Counting);
        assert!(h.parent().is_none());
        assert_eq!(h.phase(), PHASE_UNENROLLED);
        assert_eq!(h.nesting(), 0);
    }

    #[test]
    fn test_phase_transitions_are_exclusive() {
        let h = WorkHandle::new(Counting);
        h.set_phase(PHASE_QUEUED);

        // Two racers for the same transition: exactly one wins
        assert!(h.transition(PHASE_QUEUED, PHASE_RUNNING));
        assert!(!h.transition(PHASE_QUEUED, PHASE_RETIRED));
        assert_eq!(h.phase(), PHASE_RUNNING);
    }

    #[test]
    fn test_hook_guard_clears_flag() {
        let h = WorkHandle::new(Counting);
        {
            let _g = h.enter_hook();
            assert!(h.state.within.load(Ordering::Acquire));
        }
        assert!(!h.state.within.load(Ordering::Acquire));
    }

    #[test]
    fn test_error_slot_take_once() {
        let h = WorkHandle::new(Counting);
        h.record_error(WeftError::Task("boom".into()));
        assert!(matches!(h.take_error(), Some(WeftError::Task(_))));
        assert!(h.take_error().is_none());
    }

    #[test]
    fn test_same_item() {
        let a = WorkHandle::new(Counting);
        let b = a.clone();
        let c = WorkHandle::new(Counting);
        assert!(a.same_item(&b));
        assert!(!a.same_item(&c));
    }
}
