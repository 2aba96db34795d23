//! Metrics collection for weft pool observability.
//!
//! Prometheus-compatible counters and gauges covering the pool's moving
//! parts. Metrics are always collected (atomic operations only) and can
//! optionally be exposed via a Prometheus registry for scraping.
//!
//! # Available Metrics
//!
//! ## Gauges (current values)
//!
//! - `weft_workers` - live worker threads
//! - `weft_ready_depth` - items in the ready queue
//! - `weft_timer_depth` - items parked in the timer heap
//! - `weft_pacing_ns` - pacing most recently applied by an I/O-aware item
//!
//! ## Counters (cumulative)
//!
//! - `weft_items_executed` - `run` invocations
//! - `weft_items_cancelled` - items retired by `stop()` without running
//! - `weft_groups_completed` - groups that reached the stopped state
//! - `weft_worker_spawns` / `weft_worker_exits` - elastic sizing activity
//! - `weft_pacing_engaged` - `next` calls that added nonzero pacing
//!
//! # Example
//!
//! ```ignore
//! use prometheus::Registry;
//! use weft_rs::WeftBuilder;
//!
//! let registry = Registry::new();
//! let pool = WeftBuilder::new()
//!     .prometheus_registry(registry.clone())
//!     .build()?;
//!
//! // Later: expose metrics via HTTP
//! use prometheus::TextEncoder;
//! let encoder = TextEncoder::new();
//! let mut buffer = Vec::new();
//! encoder.encode(&registry.gather(), &mut buffer)?;
//! ```

mod prometheus;

pub use self::prometheus::WeftMetrics;
