//! # qtrk: queued bead tracker
//!
//! Multi-threaded localization of beads in camera ROIs. A producer enqueues ROI
//! images; a fixed pool of worker threads estimates each bead's lateral position
//! and, optionally, its axial position from a radial-profile lookup table (ZLUT).
//! Results are buffered until a consumer polls them.
//!
//! ## Crate Structure
//!
//! - **`tracker`**: [`QueuedTracker`], the lifecycle controller and worker pool.
//! - **`job`**: Job metadata, pooled job buffers and the FIFO job queue.
//! - **`results`**: Result records and the polled result buffer.
//! - **`zlut`**: ZLUT table and the atomically swappable shared store.
//! - **`engine`**: The [`LocalizationEngine`] trait and the built-in centroid engine.
//! - **`image`**: Pixel formats, pitched buffer conversion and ROI extraction.
//! - **`config`**: Figment-based [`TrackerConfig`] (TOML + `QTRK_` environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: [`TrackerError`] for all synchronous failures.
//!
//! ## Example
//!
//! ```no_run
//! use qtrk::{JobInfo, PixelDataType, QueuedTracker, TrackerConfig};
//!
//! # fn main() -> qtrk::TrackerResult<()> {
//! let tracker = QueuedTracker::new(TrackerConfig::with_roi_size(32, 32).threads(4))?;
//! tracker.start()?;
//!
//! let roi = vec![0u8; 32 * 32];
//! tracker.enqueue(&roi, 32, PixelDataType::U8, JobInfo::for_frame(0))?;
//!
//! tracker.wait_idle(std::time::Duration::from_secs(1));
//! for result in tracker.poll_finished(usize::MAX, true) {
//!     println!("{} -> ({}, {})", result.id, result.pos.x, result.pos.y);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod job;
pub mod logging;
pub mod results;
pub mod tracker;
pub mod zlut;

pub use config::TrackerConfig;
pub use engine::{
    centroid_factory, CentroidEngine, EngineError, EngineFactory, Localization,
    LocalizationEngine,
};
pub use error::{TrackerError, TrackerResult};
pub use image::{ImageData, PixelDataType, Roi, Vec2, Vec3};
pub use job::{JobId, JobInfo, LocalizeAlgorithm, LocalizeFlags};
pub use qtrk_pool::PoolStats;
pub use results::{LocalizationResult, ResultStatus};
pub use tracker::{QueuedTracker, TrackerState, WorkerStats};
pub use zlut::{ZlutDims, ZlutTable};
