//! Configuration types for the weft pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::io_aware::PacingKnobs;
use prometheus::Registry;

/// Default worker oversubscription factor over hardware concurrency.
pub const DEFAULT_OVERSUBSCRIBE: usize = 4;

/// Default idle timeout before an excess worker exits.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Default cap on work-item submission nesting depth.
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 16;

/// Configuration for a weft pool.
///
/// This struct can be deserialized from TOML, YAML, JSON, or environment variables
/// using figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeftConfig {
    /// Thread name prefix (default: "weft")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Hard cap on worker threads, or None for hardware concurrency times
    /// the oversubscription factor.
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Oversubscription factor applied to hardware concurrency when
    /// `max_workers` is not set (default: 4).
    #[serde(default = "default_oversubscribe")]
    pub oversubscribe: usize,

    /// How long an idle worker lingers before exiting, in milliseconds
    /// (default: 30000).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Maximum submission nesting depth (default: 16).
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Pacing policy knobs applied to I/O-aware work items constructed
    /// through the pool. If None, default knobs are used.
    #[serde(default)]
    pub pacing: Option<PacingKnobs>,

    /// Prometheus registry for metrics exposition.
    /// If provided, metrics will be registered for scraping.
    /// Not serializable - must be set programmatically.
    #[serde(skip)]
    pub prometheus_registry: Option<Registry>,
}

fn default_prefix() -> String {
    "weft".to_string()
}

fn default_oversubscribe() -> usize {
    DEFAULT_OVERSUBSCRIBE
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_max_nesting_depth() -> usize {
    DEFAULT_MAX_NESTING_DEPTH
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            max_workers: None,
            oversubscribe: default_oversubscribe(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_nesting_depth: default_max_nesting_depth(),
            pacing: None,
            prometheus_registry: None,
        }
    }
}

impl WeftConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the effective worker cap.
    ///
    /// Returns the configured value, or hardware concurrency times the
    /// oversubscription factor. Never below one.
    pub fn effective_max_workers(&self, hardware_concurrency: usize) -> usize {
        self.max_workers
            .unwrap_or_else(|| hardware_concurrency.saturating_mul(self.oversubscribe.max(1)))
            .max(1)
    }

    /// Get the idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WeftConfig::default();
        assert_eq!(config.prefix, "weft");
        assert!(config.max_workers.is_none());
        assert_eq!(config.oversubscribe, 4);
        assert_eq!(config.idle_timeout_ms, 30_000);
        assert_eq!(config.max_nesting_depth, 16);
        assert!(config.pacing.is_none());
    }

    #[test]
    fn test_effective_max_workers() {
        let mut config = WeftConfig::default();
        // 8 CPUs, oversubscribe 4
        assert_eq!(config.effective_max_workers(8), 32);

        config.max_workers = Some(3);
        assert_eq!(config.effective_max_workers(8), 3);

        // Never below one, even on a degenerate report
        config.max_workers = None;
        config.oversubscribe = 0;
        assert_eq!(config.effective_max_workers(0), 1);
    }

    #[test]
    fn test_idle_timeout() {
        let mut config = WeftConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));

        config.idle_timeout_ms = 250;
        assert_eq!(config.idle_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_deserialize_config() {
        let toml = r#"
            prefix = "myapp"
            max_workers = 12
            oversubscribe = 2
            idle_timeout_ms = 5000
            max_nesting_depth = 32
        "#;

        let config: WeftConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.prefix, "myapp");
        assert_eq!(config.max_workers, Some(12));
        assert_eq!(config.oversubscribe, 2);
        assert_eq!(config.idle_timeout_ms, 5000);
        assert_eq!(config.max_nesting_depth, 32);
    }
}
