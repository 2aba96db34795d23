//! I/O-aware work items.
//!
//! The adaptive variant of the work item contract: `next` is replaced by
//! `io_aware_next`, and the delay it returns is inflated by a pacing term
//! derived from the backing devices' observed busy fraction and queue depth.
//! Under a saturated device the pool therefore stops feeding it new work at
//! full tilt, instead of piling ever more requests onto the queue.
//!
//! Telemetry comes from `/proc/diskstats` on Linux (milliseconds spent doing
//! I/O and I/Os currently in progress, per device). Platforms or devices
//! without that telemetry fail [`IoAwareness::new`] with
//! [`WeftError::Unsupported`]; callers must treat the whole variant as
//! optional.
//!
//! # Pacing policy
//!
//! With `busy` the EMA-smoothed busy fraction and `qd` the queue depth, both
//! maxed over the associated devices:
//!
//! ```text
//! below both thresholds          -> no pacing
//! otherwise                      -> ceiling * max(busy_excess, depth_excess)
//! ```
//!
//! where each excess term is normalized into [0, 1] above its threshold. The
//! function is monotone non-decreasing in both inputs, zero at idle, and
//! reaches the ceiling as `busy -> 1`. The shape is a documented policy, not
//! a contract; tune it through [`PacingKnobs`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, WeftError};
use crate::metrics::WeftMetrics;
use crate::work::{Next, WorkItem, WorkValue};

/// Configuration knobs for the I/O-aware pacing policy.
///
/// Defaults engage pacing only once a device is nearly saturated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PacingKnobs {
    /// Busy fraction below which no pacing is added (given the queue depth
    /// is also below its threshold). Default: 0.95
    pub busy_threshold: f64,

    /// Queue depth at or below which no pacing is added. Default: 32
    pub queue_depth_threshold: u64,

    /// Queue depth span over which the depth term ramps from 0 to 1 above
    /// the threshold. Default: 256.0
    pub queue_depth_span: f64,

    /// Upper bound on the added pacing, in milliseconds. Default: 1000
    pub ceiling_ms: u64,

    /// Minimum interval between telemetry reads per device, in milliseconds.
    /// Default: 100
    pub sample_interval_ms: u64,

    /// Smoothing factor for the busy-fraction EMA. Default: 0.3
    pub ema_alpha: f64,
}

impl Default for PacingKnobs {
    fn default() -> Self {
        Self {
            busy_threshold: 0.95,
            queue_depth_threshold: 32,
            queue_depth_span: 256.0,
            ceiling_ms: 1000,
            sample_interval_ms: 100,
            ema_alpha: 0.3,
        }
    }
}

impl PacingKnobs {
    /// Create knobs with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the pacing ceiling.
    pub fn with_ceiling_ms(mut self, ceiling_ms: u64) -> Self {
        self.ceiling_ms = ceiling_ms;
        self
    }

    /// Builder method to set the busy-fraction threshold.
    pub fn with_busy_threshold(mut self, busy_threshold: f64) -> Self {
        self.busy_threshold = busy_threshold;
        self
    }

    /// Builder method to set the queue depth threshold and ramp span.
    pub fn with_queue_depth(mut self, threshold: u64, span: f64) -> Self {
        self.queue_depth_threshold = threshold;
        self.queue_depth_span = span;
        self
    }

    /// The pacing ceiling as a `Duration`.
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }

    pub(crate) fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Compute the pacing for the given telemetry under the given knobs.
pub(crate) fn pacing_for(busy: f64, queue_depth: u64, knobs: &PacingKnobs) -> Duration {
    if busy < knobs.busy_threshold && queue_depth <= knobs.queue_depth_threshold {
        return Duration::ZERO;
    }
    let busy_excess = ((busy - knobs.busy_threshold)
        / (1.0 - knobs.busy_threshold).max(f64::EPSILON))
    .clamp(0.0, 1.0);
    let depth_excess = (queue_depth.saturating_sub(knobs.queue_depth_threshold) as f64
        / knobs.queue_depth_span.max(1.0))
    .clamp(0.0, 1.0);
    knobs.ceiling().mul_f64(busy_excess.max(depth_excess))
}

/// Block device identity, as (major, minor).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct DeviceId {
    major: u32,
    minor: u32,
}

/// Split a raw `st_dev` into (major, minor) using the Linux dev_t encoding.
pub(crate) fn split_dev(dev: u64) -> DeviceId {
    DeviceId {
        major: (((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)) as u32,
        minor: ((dev & 0xff) | ((dev >> 12) & !0xff)) as u32,
    }
}

/// Telemetry snapshot for one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DiskStats {
    /// I/Os currently in progress (instantaneous queue depth).
    pub(crate) in_flight: u64,
    /// Cumulative milliseconds spent doing I/O.
    pub(crate) io_time_ms: u64,
}

/// Parse one `/proc/diskstats` line, returning stats if it matches `want`.
///
/// Line layout: major, minor, device name, then the counter fields; the 9th
/// counter is I/Os in progress and the 10th is ms spent doing I/O.
pub(crate) fn parse_diskstats_line(line: &str, want: DeviceId) -> Option<DiskStats> {
    let mut fields = line.split_whitespace();
    let major: u32 = fields.next()?.parse().ok()?;
    let minor: u32 = fields.next()?.parse().ok()?;
    if (DeviceId { major, minor }) != want {
        return None;
    }
    let _name = fields.next()?;
    let counters: Vec<&str> = fields.collect();
    Some(DiskStats {
        in_flight: counters.get(8)?.parse().ok()?,
        io_time_ms: counters.get(9)?.parse().ok()?,
    })
}

#[cfg(target_os = "linux")]
fn device_of(path: &Path) -> std::io::Result<DeviceId> {
    use std::os::unix::fs::MetadataExt;
    Ok(split_dev(std::fs::metadata(path)?.dev()))
}

#[cfg(not(target_os = "linux"))]
fn device_of(_path: &Path) -> std::io::Result<DeviceId> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no per-device i/o telemetry on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn read_device_stats(device: DeviceId) -> std::io::Result<DiskStats> {
    let contents = std::fs::read_to_string("/proc/diskstats")?;
    contents
        .lines()
        .find_map(|line| parse_diskstats_line(line, device))
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "device not present in /proc/diskstats",
            )
        })
}

#[cfg(not(target_os = "linux"))]
fn read_device_stats(_device: DeviceId) -> std::io::Result<DiskStats> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no per-device i/o telemetry on this platform",
    ))
}

struct SampleWindow {
    taken_at: Option<Instant>,
    io_time_ms: u64,
    busy: f64,
    queue_depth: u64,
}

/// Rolling telemetry estimator for one device, shared by every awareness
/// record pointing at it.
pub(crate) struct DeviceSampler {
    device: DeviceId,
    window: Mutex<SampleWindow>,
}

impl DeviceSampler {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            window: Mutex::new(SampleWindow {
                taken_at: None,
                io_time_ms: 0,
                busy: 0.0,
                queue_depth: 0,
            }),
        }
    }

    /// Current (busy fraction, queue depth), re-reading telemetry at most
    /// once per sample interval.
    pub(crate) fn sample(&self, knobs: &PacingKnobs) -> (f64, u64) {
        let mut window = self.window.lock();
        let now = Instant::now();
        if let Some(at) = window.taken_at {
            if now.duration_since(at) < knobs.sample_interval() {
                return (window.busy, window.queue_depth);
            }
        }
        match read_device_stats(self.device) {
            Ok(stats) => {
                if let Some(at) = window.taken_at {
                    let wall_ms = now.duration_since(at).as_millis().max(1) as f64;
                    let spent = stats.io_time_ms.saturating_sub(window.io_time_ms) as f64;
                    let raw = (spent / wall_ms).clamp(0.0, 1.0);
                    window.busy = knobs.ema_alpha * raw + (1.0 - knobs.ema_alpha) * window.busy;
                }
                window.io_time_ms = stats.io_time_ms;
                window.queue_depth = stats.in_flight;
            }
            Err(err) => {
                debug!(error = %err, "device telemetry read failed");
            }
        }
        window.taken_at = Some(now);
        (window.busy, window.queue_depth)
    }
}

fn sampler_for(device: DeviceId) -> Arc<DeviceSampler> {
    static SAMPLERS: OnceLock<Mutex<HashMap<DeviceId, Arc<DeviceSampler>>>> = OnceLock::new();
    let samplers = SAMPLERS.get_or_init(|| Mutex::new(HashMap::new()));
    samplers
        .lock()
        .entry(device)
        .or_insert_with(|| Arc::new(DeviceSampler::new(device)))
        .clone()
}

/// Associates an I/O-aware work item with one backing device.
///
/// Constructed from any path on the filesystem whose device should throttle
/// the item. The weight scales the device's busy contribution; 1.0 is the
/// common case.
pub struct IoAwareness {
    sampler: Arc<DeviceSampler>,
    weight: f32,
}

impl IoAwareness {
    /// Resolve the backing device of `path` and attach to its telemetry.
    ///
    /// # Errors
    ///
    /// [`WeftError::Unsupported`] if the platform has no per-device busy
    /// telemetry, or the path's device is not covered by it (e.g. tmpfs).
    pub fn new(path: impl AsRef<Path>, weight: f32) -> Result<Self> {
        let device = device_of(path.as_ref()).map_err(|_| WeftError::Unsupported)?;
        // Probe once so construction fails where the variant cannot work
        read_device_stats(device).map_err(|_| WeftError::Unsupported)?;
        Ok(Self {
            sampler: sampler_for(device),
            weight,
        })
    }
}

/// The I/O-aware rendition of [`WorkItem`].
///
/// Implementors provide `io_aware_next` instead of `next`; the currently
/// applied pacing is handed in so items can observe throttling decisions.
pub trait IoAwareWorkItem: Send + Sync + 'static {
    /// Like [`WorkItem::next`], called with the pacing about to be applied.
    fn io_aware_next(&self, pacing: Duration) -> Next;

    /// See [`WorkItem::run`].
    fn run(&self, work: WorkValue) -> Result<()>;

    /// See [`WorkItem::group_complete`].
    fn group_complete(&self, _outcome: Result<()>) {}
}

/// Adapter making an [`IoAwareWorkItem`] enrollable: implements [`WorkItem`]
/// by delegating to the body and inflating the returned delay with pacing.
pub struct IoAware<T> {
    body: T,
    awareness: Vec<IoAwareness>,
    knobs: PacingKnobs,
    current_pacing_ns: Arc<AtomicU64>,
    metrics: Option<WeftMetrics>,
}

impl<T: IoAwareWorkItem> IoAware<T> {
    /// Wrap `body` with the given awareness records.
    ///
    /// An empty record set is permitted and never paces. Prefer
    /// [`WeftPool::io_aware`](crate::WeftPool::io_aware), which also applies
    /// the pool's configured knobs and metrics.
    pub fn new(body: T, awareness: Vec<IoAwareness>) -> Self {
        Self {
            body,
            awareness,
            knobs: PacingKnobs::default(),
            current_pacing_ns: Arc::new(AtomicU64::new(0)),
            metrics: None,
        }
    }

    /// Replace the pacing knobs.
    pub fn with_knobs(mut self, knobs: PacingKnobs) -> Self {
        self.knobs = knobs;
        self
    }

    /// Attach pool metrics; the applied pacing is then exported as a gauge.
    pub fn with_metrics(mut self, metrics: WeftMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The pacing applied by the most recent `next`.
    pub fn current_pacing(&self) -> Duration {
        Duration::from_nanos(self.current_pacing_ns.load(Ordering::Relaxed))
    }

    /// A cloneable observer of the applied pacing, usable after the wrapper
    /// has been moved into a [`WorkHandle`](crate::WorkHandle).
    pub fn pacing_observer(&self) -> PacingObserver {
        PacingObserver(self.current_pacing_ns.clone())
    }

    fn compute_pacing(&self) -> Duration {
        let mut busy: f64 = 0.0;
        let mut depth: u64 = 0;
        for record in &self.awareness {
            let (device_busy, device_depth) = record.sampler.sample(&self.knobs);
            busy = busy.max((device_busy * f64::from(record.weight)).clamp(0.0, 1.0));
            depth = depth.max(device_depth);
        }
        pacing_for(busy, depth, &self.knobs)
    }
}

impl<T: IoAwareWorkItem> WorkItem for IoAware<T> {
    fn next(&self) -> Next {
        let pacing = self.compute_pacing();
        self.current_pacing_ns
            .store(pacing.as_nanos() as u64, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.pacing_ns.set(pacing.as_nanos() as i64);
            if !pacing.is_zero() {
                metrics.pacing_engaged.inc();
            }
        }
        match self.body.io_aware_next(pacing) {
            Next::Retire => Next::Retire,
            Next::Ready(work) if pacing.is_zero() => Next::Ready(work),
            Next::Ready(work) => Next::After(work, pacing),
            Next::After(work, delay) => Next::After(work, delay + pacing),
        }
    }

    fn run(&self, work: WorkValue) -> Result<()> {
        self.body.run(work)
    }

    fn group_complete(&self, outcome: Result<()>) {
        self.body.group_complete(outcome)
    }
}

/// Cloneable reader of an [`IoAware`] wrapper's applied pacing.
#[derive(Clone)]
pub struct PacingObserver(Arc<AtomicU64>);

impl PacingObserver {
    /// The pacing applied by the wrapper's most recent `next`.
    pub fn current(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_zero_at_idle() {
        let knobs = PacingKnobs::default();
        assert_eq!(pacing_for(0.0, 0, &knobs), Duration::ZERO);
    }

    #[test]
    fn test_pacing_zero_below_thresholds() {
        let knobs = PacingKnobs::default();
        assert_eq!(pacing_for(0.90, 32, &knobs), Duration::ZERO);
        assert_eq!(pacing_for(0.94, 0, &knobs), Duration::ZERO);
        assert_eq!(pacing_for(0.0, 32, &knobs), Duration::ZERO);
    }

    #[test]
    fn test_pacing_reaches_ceiling_at_full_busy() {
        let knobs = PacingKnobs::default();
        assert_eq!(pacing_for(1.0, 0, &knobs), knobs.ceiling());
    }

    #[test]
    fn test_pacing_monotone_in_busy() {
        let knobs = PacingKnobs::default();
        let mut last = Duration::ZERO;
        for step in 0..=20 {
            let busy = 0.95 + 0.05 * (step as f64 / 20.0);
            let pace = pacing_for(busy, 0, &knobs);
            assert!(pace >= last, "pacing decreased at busy={}", busy);
            last = pace;
        }
    }

    #[test]
    fn test_pacing_monotone_in_queue_depth() {
        let knobs = PacingKnobs::default();
        let mut last = Duration::ZERO;
        for depth in [33u64, 64, 128, 256, 512, 1024] {
            let pace = pacing_for(0.0, depth, &knobs);
            assert!(pace >= last, "pacing decreased at depth={}", depth);
            last = pace;
        }
    }

    #[test]
    fn test_pacing_bounded_by_ceiling() {
        let knobs = PacingKnobs::default().with_ceiling_ms(250);
        assert_eq!(pacing_for(1.0, 100_000, &knobs), Duration::from_millis(250));
    }

    #[test]
    fn test_knobs_builder_methods() {
        let knobs = PacingKnobs::new()
            .with_ceiling_ms(500)
            .with_busy_threshold(0.8)
            .with_queue_depth(16, 64.0);
        assert_eq!(knobs.ceiling_ms, 500);
        assert!((knobs.busy_threshold - 0.8).abs() < 0.001);
        assert_eq!(knobs.queue_depth_threshold, 16);
        assert!((knobs.queue_depth_span - 64.0).abs() < 0.001);
    }

    #[test]
    fn test_knobs_serialization() {
        let knobs = PacingKnobs::default();
        let json = serde_json::to_string(&knobs).unwrap();
        let parsed: PacingKnobs = serde_json::from_str(&json).unwrap();
        assert!((parsed.busy_threshold - knobs.busy_threshold).abs() < 0.001);
        assert_eq!(parsed.ceiling_ms, knobs.ceiling_ms);
    }

    #[test]
    fn test_split_dev_round_trip() {
        // 8:1 (sda1) in the packed encoding
        let id = split_dev((8 << 8) | 1);
        assert_eq!(id, DeviceId { major: 8, minor: 1 });

        // High minor bits live above bit 20
        let id = split_dev((259 << 8) | 3 | (1 << 20));
        assert_eq!(
            id,
            DeviceId {
                major: 259,
                minor: 3 | (1 << 8)
            }
        );
    }

    #[test]
    fn test_parse_diskstats_line() {
        let line = "   8       1 sda1 92381 1754 6554924 14381 131781 107391 21232485 630450 3 116932 644832 0 0 0 0 0 0";
        let want = DeviceId { major: 8, minor: 1 };
        let stats = parse_diskstats_line(line, want).unwrap();
        assert_eq!(stats.in_flight, 3);
        assert_eq!(stats.io_time_ms, 116_932);

        let other = DeviceId { major: 8, minor: 2 };
        assert!(parse_diskstats_line(line, other).is_none());
    }

    #[test]
    fn test_parse_diskstats_line_short_row_rejected() {
        let line = "   8       1 sda1 92381 1754";
        let want = DeviceId { major: 8, minor: 1 };
        assert!(parse_diskstats_line(line, want).is_none());
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_awareness_unsupported_off_linux() {
        let err = IoAwareness::new(std::env::temp_dir(), 1.0).unwrap_err();
        assert!(matches!(err, WeftError::Unsupported));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_awareness_resolves_or_reports_unsupported() {
        // tmpfs and overlay mounts are absent from /proc/diskstats, so both
        // outcomes are legitimate depending on where the test runs.
        match IoAwareness::new(std::env::temp_dir(), 1.0) {
            Ok(_) => {}
            Err(WeftError::Unsupported) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
