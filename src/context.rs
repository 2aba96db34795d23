//! Thread-local nesting tracker.
//!
//! Every `run` invocation executes under a nesting frame recording the depth
//! of the submission chain and the work item being executed. Frames form a
//! stack because a worker that calls [`Group::wait`](crate::Group::wait) from
//! inside `run` re-enters the dispatch loop and may execute further items
//! before the outer frame is popped.
//!
//! Outside any `run`, the level is 0 and there is no current work item.

use std::cell::RefCell;

use crate::work::WorkHandle;

struct Frame {
    level: usize,
    item: WorkHandle,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Get the nesting level of the submission chain leading to the currently
/// executing work item.
///
/// Returns 0 when called outside any `run` hook. Inside `run`, returns
/// 1 + the nesting level observed when the item's group was submitted.
pub fn current_nesting_level() -> usize {
    FRAMES.with(|f| f.borrow().last().map_or(0, |frame| frame.level))
}

/// Get the work item whose `run` hook encloses the current call.
///
/// Returns `None` when called outside any `run` hook.
pub fn current_work_item() -> Option<WorkHandle> {
    FRAMES.with(|f| f.borrow().last().map(|frame| frame.item.clone()))
}

/// Guard that pops the nesting frame on drop.
///
/// Panic-safe: the frame is popped even if the `run` hook panics, so a
/// poisoned worker does not report a stale nesting level.
pub(crate) struct FrameGuard {
    _private: (),
}

/// Push a nesting frame for the given item. The frame is popped when the
/// returned guard is dropped.
pub(crate) fn enter_frame(level: usize, item: WorkHandle) -> FrameGuard {
    FRAMES.with(|f| f.borrow_mut().push(Frame { level, item }));
    FrameGuard { _private: () }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|f| {
            f.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{Next, WorkItem};

    struct Noop;
    impl WorkItem for Noop {
        fn next(&self) -> Next {
            Next::Retire
        }
        fn run(&self, _work: isize) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_level_zero_outside_run() {
        assert_eq!(current_nesting_level(), 0);
        assert!(current_work_item().is_none());
    }

    #[test]
    fn test_frames_nest_and_unwind() {
        let outer = WorkHandle::new(Noop);
        let inner = WorkHandle::new(Noop);

        let g1 = enter_frame(1, outer.clone());
        assert_eq!(current_nesting_level(), 1);
        assert!(current_work_item().unwrap().same_item(&outer));

        {
            let _g2 = enter_frame(2, inner.clone());
            assert_eq!(current_nesting_level(), 2);
            assert!(current_work_item().unwrap().same_item(&inner));
        }

        // Inner frame popped; outer frame visible again
        assert_eq!(current_nesting_level(), 1);
        assert!(current_work_item().unwrap().same_item(&outer));

        drop(g1);
        assert_eq!(current_nesting_level(), 0);
        assert!(current_work_item().is_none());
    }
}
