//! # weft-rs
//!
//! **Grouped work, woven across a shared pool of threads**
//!
//! A dynamic thread pool group library: a cooperative, work-item-driven
//! scheduler that multiplexes any number of user-supplied work items onto a
//! shared, elastic worker pool.
//!
//! ## Features
//!
//! - **Work-item scheduling**: items decide their own continuation via a
//!   `next` hook returning a work value, a delay, or retirement
//! - **Groups**: batches of items share a lifecycle - stop, wait, and a
//!   per-item completion notification
//! - **Elastic pool**: one process-wide pool grows under load up to a cap
//!   and shrinks after an idle timeout
//! - **Per-item delays**: a timer service fires delayed items with
//!   millisecond precision
//! - **Nesting**: a `run` hook may submit into other groups and wait on them
//!   cooperatively, without deadlocking a fully-occupied pool
//! - **I/O-aware pacing**: an optional variant throttles submission when the
//!   backing storage device saturates
//! - **Flexible configuration**: configure via files (TOML/YAML/JSON),
//!   environment variables, or code; built-in clap support for CLI overrides
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft_rs::{make_group, Next, WorkHandle, WorkItem};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountDown(AtomicUsize);
//!
//! impl WorkItem for CountDown {
//!     fn next(&self) -> Next {
//!         match self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
//!             Ok(n) => Next::Ready(n as isize),
//!             Err(_) => Next::Retire,
//!         }
//!     }
//!
//!     fn run(&self, work: isize) -> weft_rs::Result<()> {
//!         println!("executing unit {work}");
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> weft_rs::Result<()> {
//!     let group = make_group()?;
//!     let items: Vec<WorkHandle> =
//!         (0..10).map(|_| WorkHandle::new(CountDown(AtomicUsize::new(5)))).collect();
//!     group.submit(&items)?;
//!     group.wait()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Explicit pools
//!
//! `make_group()` uses the lazily-built process-global pool. Tests and
//! embedders that need their own sizing, idle timeout, or metrics registry
//! build explicit pools:
//!
//! ```ignore
//! use weft_rs::WeftBuilder;
//!
//! let pool = WeftBuilder::new()
//!     .file("weft.toml")
//!     .env_prefix("WEFT")
//!     .prefix("myapp")
//!     .max_workers(16)
//!     .build()?;
//!
//! let group = pool.make_group()?;
//! ```
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! prefix = "myapp"
//! max_workers = 16
//! idle_timeout_ms = 30000
//! max_nesting_depth = 16
//! ```
//!
//! ### Environment Variables
//!
//! With `.env_prefix("WEFT")`:
//! - `WEFT_PREFIX=myapp`
//! - `WEFT_MAX_WORKERS=16`
//! - `WEFT_IDLE_TIMEOUT_MS=30000`
//!
//! ## Nesting
//!
//! A `run` hook may submit items into another group (same-pool or not) and
//! wait on it. `Group::wait` on a worker thread is a cooperative yield
//! point: the worker re-enters the dispatch loop and services other ready
//! items until the awaited group stops, so nested waits cannot deadlock the
//! pool. Submission depth is bounded by `max_nesting_depth`;
//! [`current_nesting_level`] and [`current_work_item`] expose the chain for
//! assertions and tests.
//!
//! ## Thread Naming
//!
//! Threads are named with the configured prefix:
//! - Workers: `{prefix}-worker-0000`, `{prefix}-worker-0001`, ...
//! - Timer: `{prefix}-timer`

pub mod builder;
pub mod config;
pub(crate) mod context;
pub mod error;
pub mod group;
pub mod io_aware;
pub mod metrics;
pub mod pool;
pub(crate) mod timer;
pub mod work;

pub use builder::{WeftArgs, WeftBuilder};
pub use config::WeftConfig;
pub use context::{current_nesting_level, current_work_item};
pub use error::{Result, WeftError};
pub use group::Group;
pub use io_aware::{IoAware, IoAwareWorkItem, IoAwareness, PacingKnobs, PacingObserver};
pub use metrics::WeftMetrics;
pub use pool::WeftPool;
pub use work::{Next, WorkHandle, WorkItem, WorkValue};

/// Create a new, idle group backed by the process-global pool.
///
/// The pool is built with default configuration on first use. Applications
/// that need explicit sizing should build a [`WeftPool`] through
/// [`WeftBuilder`] and call [`WeftPool::make_group`] instead.
pub fn make_group() -> Result<Group> {
    WeftPool::global().make_group()
}
