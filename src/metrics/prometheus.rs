//! Prometheus metrics for the weft pool.
//!
//! Counters work standalone without a Registry - registration is only needed
//! for exposition (scraping). All updates are plain atomic operations, cheap
//! enough to leave always-on.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for a weft pool.
///
/// Counters are always incremented; registration to a Registry is optional
/// and only needed for exposition.
#[derive(Clone)]
pub struct WeftMetrics {
    // === Gauges (current values) ===
    /// Live worker threads
    pub workers: IntGauge,

    /// Items in the ready queue
    pub ready_depth: IntGauge,

    /// Items parked in the timer heap
    pub timer_depth: IntGauge,

    /// Pacing most recently applied by an I/O-aware item, in nanoseconds
    pub pacing_ns: IntGauge,

    // === Counters (cumulative) ===
    /// `run` invocations
    pub items_executed: IntCounter,

    /// Items retired by `stop()` without a further `run`
    pub items_cancelled: IntCounter,

    /// Groups that reached the stopped state
    pub groups_completed: IntCounter,

    /// Worker threads spawned
    pub worker_spawns: IntCounter,

    /// Worker threads exited after idling
    pub worker_exits: IntCounter,

    /// `next` calls on I/O-aware items that added nonzero pacing
    pub pacing_engaged: IntCounter,
}

impl Default for WeftMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WeftMetrics {
    /// Create metrics with default prefix "weft".
    pub fn new() -> Self {
        Self::with_prefix("weft")
    }

    /// Create metrics with a custom prefix.
    ///
    /// Metric names will be `{prefix}_workers`, `{prefix}_items_executed`,
    /// etc. The prefix is sanitized to be a valid Prometheus metric name:
    /// hyphens and other invalid characters are replaced with underscores.
    pub fn with_prefix(prefix: &str) -> Self {
        // Valid chars: [a-zA-Z_:] for first char, [a-zA-Z0-9_:] for rest
        let prefix: String = prefix
            .chars()
            .enumerate()
            .map(|(i, c)| {
                if i == 0 {
                    if c.is_ascii_alphabetic() || c == '_' || c == ':' {
                        c
                    } else {
                        '_'
                    }
                } else if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self {
            workers: IntGauge::with_opts(Opts::new(
                format!("{}_workers", prefix),
                "Live worker threads",
            ))
            .expect("metric creation should not fail"),

            ready_depth: IntGauge::with_opts(Opts::new(
                format!("{}_ready_depth", prefix),
                "Items in the ready queue",
            ))
            .expect("metric creation should not fail"),

            timer_depth: IntGauge::with_opts(Opts::new(
                format!("{}_timer_depth", prefix),
                "Items parked in the timer heap",
            ))
            .expect("metric creation should not fail"),

            pacing_ns: IntGauge::with_opts(Opts::new(
                format!("{}_pacing_ns", prefix),
                "Pacing most recently applied by an I/O-aware item (ns)",
            ))
            .expect("metric creation should not fail"),

            items_executed: IntCounter::with_opts(Opts::new(
                format!("{}_items_executed", prefix),
                "Work item run invocations",
            ))
            .expect("metric creation should not fail"),

            items_cancelled: IntCounter::with_opts(Opts::new(
                format!("{}_items_cancelled", prefix),
                "Items retired by stop() without a further run",
            ))
            .expect("metric creation should not fail"),

            groups_completed: IntCounter::with_opts(Opts::new(
                format!("{}_groups_completed", prefix),
                "Groups that reached the stopped state",
            ))
            .expect("metric creation should not fail"),

            worker_spawns: IntCounter::with_opts(Opts::new(
                format!("{}_worker_spawns", prefix),
                "Worker threads spawned",
            ))
            .expect("metric creation should not fail"),

            worker_exits: IntCounter::with_opts(Opts::new(
                format!("{}_worker_exits", prefix),
                "Worker threads exited after idling",
            ))
            .expect("metric creation should not fail"),

            pacing_engaged: IntCounter::with_opts(Opts::new(
                format!("{}_pacing_engaged", prefix),
                "I/O-aware next calls that added nonzero pacing",
            ))
            .expect("metric creation should not fail"),
        }
    }

    /// Register all metrics with a Prometheus registry for exposition.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.workers.clone()))?;
        registry.register(Box::new(self.ready_depth.clone()))?;
        registry.register(Box::new(self.timer_depth.clone()))?;
        registry.register(Box::new(self.pacing_ns.clone()))?;
        registry.register(Box::new(self.items_executed.clone()))?;
        registry.register(Box::new(self.items_cancelled.clone()))?;
        registry.register(Box::new(self.groups_completed.clone()))?;
        registry.register(Box::new(self.worker_spawns.clone()))?;
        registry.register(Box::new(self.worker_exits.clone()))?;
        registry.register(Box::new(self.pacing_engaged.clone()))?;
        Ok(())
    }
}
