//! Tracker configuration using Figment
//!
//! `TrackerConfig` is the flat record consumed at construction. It is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `QTRK_` (e.g. `QTRK_MAX_QUEUE_SIZE=500`)
//!
//! Missing keys fall back to the serde defaults below. The configuration is fixed
//! once the tracker is started; there is no dynamic reconfiguration.
//!
//! # Example
//! ```no_run
//! use qtrk::config::TrackerConfig;
//!
//! let config = TrackerConfig::load_from("config/tracker.toml")?;
//! config.validate()?;
//! println!("ROI size: {}x{}", config.width, config.height);
//! # Ok::<(), qtrk::error::TrackerError>(())
//! ```

use crate::error::{TrackerError, TrackerResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "QTRK_";

/// Flat tracker configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// ROI width in pixels
    #[serde(default = "default_roi_size")]
    pub width: usize,
    /// ROI height in pixels
    #[serde(default = "default_roi_size")]
    pub height: usize,
    /// Worker threads: absent = one per CPU, 0 = direct (no-thread) mode
    #[serde(default)]
    pub num_threads: Option<usize>,
    /// Soft queue limit used for backpressure signalling
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Samples per radial profile (ZLUT row length)
    #[serde(default = "default_radial_steps")]
    pub zlut_radial_steps: usize,
    /// Spokes averaged per radial profile sample
    #[serde(default = "default_angular_steps")]
    pub zlut_angular_steps: usize,
    /// Inner radius of the radial profile, in pixels
    #[serde(default = "default_min_radius")]
    pub zlut_min_radius: f32,
    /// Outer radius of the radial profile, in pixels
    #[serde(default = "default_max_radius")]
    pub zlut_max_radius: f32,
    /// Windowed refinement passes for the refined centroid algorithm
    #[serde(default = "default_centroid_iterations")]
    pub centroid_iterations: usize,
    /// Worker idle wait when the queue is empty or paused, in milliseconds
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_roi_size() -> usize {
    64
}

fn default_max_queue_size() -> usize {
    200
}

fn default_radial_steps() -> usize {
    32
}

fn default_angular_steps() -> usize {
    64
}

fn default_min_radius() -> f32 {
    1.0
}

fn default_max_radius() -> f32 {
    24.0
}

fn default_centroid_iterations() -> usize {
    4
}

fn default_idle_backoff_ms() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            width: default_roi_size(),
            height: default_roi_size(),
            num_threads: None,
            max_queue_size: default_max_queue_size(),
            zlut_radial_steps: default_radial_steps(),
            zlut_angular_steps: default_angular_steps(),
            zlut_min_radius: default_min_radius(),
            zlut_max_radius: default_max_radius(),
            centroid_iterations: default_centroid_iterations(),
            idle_backoff_ms: default_idle_backoff_ms(),
            log_level: default_log_level(),
        }
    }
}

impl TrackerConfig {
    /// Configuration for `width` x `height` ROIs, everything else default.
    #[must_use]
    pub fn with_roi_size(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Set the worker thread count (`0` selects direct mode).
    #[must_use]
    pub fn threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Set the soft queue limit.
    #[must_use]
    pub fn queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Load configuration from a TOML file merged with `QTRK_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> TrackerResult<Self> {
        Self::figment(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Parse configuration from a TOML string merged with `QTRK_` environment variables.
    pub fn from_toml_str(toml: &str) -> TrackerResult<Self> {
        Self::figment(Figment::new().merge(Toml::string(toml)))
    }

    fn figment(base: Figment) -> TrackerResult<Self> {
        let config: Self = base.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> TrackerResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(TrackerError::InvalidConfig(format!(
                "ROI size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }

        if self.max_queue_size == 0 {
            return Err(TrackerError::InvalidConfig(
                "max_queue_size must be at least 1".to_string(),
            ));
        }

        if self.zlut_radial_steps < 2 || self.zlut_angular_steps == 0 {
            return Err(TrackerError::InvalidConfig(format!(
                "Radial profile needs >= 2 radial and >= 1 angular steps, got {} and {}",
                self.zlut_radial_steps, self.zlut_angular_steps
            )));
        }

        if !(self.zlut_min_radius >= 0.0 && self.zlut_min_radius < self.zlut_max_radius) {
            return Err(TrackerError::InvalidConfig(format!(
                "Invalid radius range [{}, {}]",
                self.zlut_min_radius, self.zlut_max_radius
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(TrackerError::InvalidConfig(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Number of worker threads to spawn; `0` means direct mode.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Whether jobs run synchronously on the caller's thread.
    #[must_use]
    pub fn is_direct_mode(&self) -> bool {
        self.num_threads == Some(0)
    }

    /// Idle back-off as a `Duration`.
    #[must_use]
    pub fn idle_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_backoff_ms.max(1))
    }
}
