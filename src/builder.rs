//! Builder pattern for constructing weft pools.
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap

use crate::config::WeftConfig;
use crate::error::Result;
use crate::io_aware::PacingKnobs;
use crate::pool::WeftPool;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use prometheus::Registry;
use std::path::Path;

/// Builder for constructing a [`WeftPool`].
///
/// Configuration sources are merged in the following order (later sources
/// override earlier):
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides
///
/// # Examples
///
/// ```ignore
/// use weft_rs::WeftBuilder;
///
/// let pool = WeftBuilder::new()
///     .file("weft.toml")
///     .env_prefix("WEFT")
///     .prefix("myapp")
///     .max_workers(16)
///     .build()?;
/// ```
pub struct WeftBuilder {
    figment: Figment,
    prometheus_registry: Option<Registry>,
}

impl Default for WeftBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WeftBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeftBuilder")
            .field("figment", &self.figment)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .finish()
    }
}

impl WeftBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(WeftConfig::default())),
            prometheus_registry: None,
        }
    }

    /// Add a configuration file.
    ///
    /// Supports TOML, YAML, and JSON formats (detected by extension).
    /// Files are merged in the order they are added.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match extension.to_lowercase().as_str() {
            "toml" => self.figment.merge(Toml::file(path)),
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => {
                // Default to TOML
                self.figment.merge(Toml::file(path))
            }
        };
        self
    }

    /// Add environment variables with a prefix.
    ///
    /// Environment variables are expected in the format `{PREFIX}_{KEY}`,
    /// e.g., `WEFT_MAX_WORKERS`, `WEFT_IDLE_TIMEOUT_MS`.
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.figment = self.figment.merge(Env::prefixed(prefix).split("_"));
        self
    }

    /// Set the thread name prefix.
    ///
    /// Threads will be named `{prefix}-worker-{NNNN}` and `{prefix}-timer`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("prefix", prefix.into()));
        self
    }

    /// Set the hard cap on worker threads.
    ///
    /// Default is hardware concurrency times the oversubscription factor.
    pub fn max_workers(mut self, n: usize) -> Self {
        self.figment = self.figment.merge(Serialized::default("max_workers", n));
        self
    }

    /// Set the oversubscription factor applied to hardware concurrency when
    /// no explicit worker cap is given. Default is 4.
    pub fn oversubscribe(mut self, factor: usize) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("oversubscribe", factor));
        self
    }

    /// Set how long an idle worker lingers before exiting. Default is 30 s.
    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("idle_timeout_ms", ms));
        self
    }

    /// Set the maximum submission nesting depth. Default is 16.
    pub fn max_nesting_depth(mut self, depth: usize) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("max_nesting_depth", depth));
        self
    }

    /// Set the pacing knobs applied to I/O-aware items constructed through
    /// the pool. See [`PacingKnobs`] for details.
    pub fn pacing_knobs(mut self, knobs: PacingKnobs) -> Self {
        self.figment = self.figment.merge(Serialized::default("pacing", knobs));
        self
    }

    /// Provide an external Prometheus registry for metrics exposition.
    ///
    /// When a registry is provided, pool metrics will be registered and
    /// available for Prometheus scraping.
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Apply CLI argument overrides.
    ///
    /// This method applies any non-None values from the `WeftArgs` struct.
    pub fn with_cli_args(mut self, args: &WeftArgs) -> Self {
        if let Some(ref prefix) = args.weft_prefix {
            self.figment = self
                .figment
                .merge(Serialized::default("prefix", prefix.clone()));
        }
        if let Some(n) = args.weft_max_workers {
            self.figment = self.figment.merge(Serialized::default("max_workers", n));
        }
        if let Some(factor) = args.weft_oversubscribe {
            self.figment = self
                .figment
                .merge(Serialized::default("oversubscribe", factor));
        }
        if let Some(ms) = args.weft_idle_timeout_ms {
            self.figment = self
                .figment
                .merge(Serialized::default("idle_timeout_ms", ms));
        }
        if let Some(depth) = args.weft_max_nesting_depth {
            self.figment = self
                .figment
                .merge(Serialized::default("max_nesting_depth", depth));
        }
        self
    }

    /// Build the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration extraction fails or the timer
    /// thread cannot be spawned.
    pub fn build(self) -> Result<WeftPool> {
        let mut config: WeftConfig = self.figment.extract().map_err(Box::new)?;
        config.prometheus_registry = self.prometheus_registry;
        WeftPool::from_config(config)
    }
}

/// CLI arguments for weft pool configuration.
///
/// Use with clap's `Parser` derive macro. These arguments can be applied to
/// a [`WeftBuilder`] using `with_cli_args`.
///
/// # Examples
///
/// ```ignore
/// use clap::Parser;
/// use weft_rs::{WeftArgs, WeftBuilder};
///
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     weft: WeftArgs,
///     // ... other args
/// }
///
/// let args = MyArgs::parse();
/// let pool = WeftBuilder::new()
///     .with_cli_args(&args.weft)
///     .build()?;
/// ```
#[derive(Debug, Default, Clone, clap::Args)]
pub struct WeftArgs {
    /// Thread name prefix
    #[arg(long)]
    pub weft_prefix: Option<String>,

    /// Hard cap on worker threads
    #[arg(long)]
    pub weft_max_workers: Option<usize>,

    /// Oversubscription factor over hardware concurrency
    #[arg(long)]
    pub weft_oversubscribe: Option<usize>,

    /// Idle timeout before an excess worker exits, in milliseconds
    #[arg(long)]
    pub weft_idle_timeout_ms: Option<u64>,

    /// Maximum submission nesting depth
    #[arg(long)]
    pub weft_max_nesting_depth: Option<usize>,
}
