//! Error types for the queued tracker.
//!
//! This module defines `TrackerError`, the single error type returned by the public
//! tracker API. Using the `thiserror` crate, it gives every failure a readable message
//! and lets callers use `?` across configuration loading, boundary validation and
//! lifecycle control.
//!
//! ## Error Categories
//!
//! 1. **Argument errors** - `DimensionMismatch`, `BeadOutOfRange`, `PlaneOutOfRange`
//!    - Detected synchronously at the call that received the bad argument
//!    - Never queued, never silently clamped
//!
//! 2. **Configuration and lifecycle errors** - `InvalidConfig`, `Config`, `InvalidState`
//!    - Occur at construction or when an operation is issued in the wrong state
//!
//! 3. **Resource errors** - `ThreadSpawn`, `Io`
//!    - Surface as a failed operation; the tracker stays usable for queries afterwards
//!
//! Failures while a worker processes an admitted job are *not* errors at this level:
//! they are recorded as a [`ResultStatus`](crate::results::ResultStatus) on the
//! published result so one bad ROI never takes down the worker pool.

use thiserror::Error;

/// Convenience alias for results using the tracker error type.
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Primary error type for the queued tracker.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Image, pitch, ROI or lookup-table dimensions do not agree.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Bead index beyond the current ZLUT.
    #[error("Bead index {bead} out of range (ZLUT holds {num_beads} beads)")]
    BeadOutOfRange {
        /// Requested bead
        bead: usize,
        /// Beads in the current table
        num_beads: usize,
    },

    /// Plane index beyond the current ZLUT.
    #[error("Plane index {plane} out of range (ZLUT holds {planes} planes)")]
    PlaneOutOfRange {
        /// Requested plane
        plane: usize,
        /// Planes in the current table
        planes: usize,
    },

    /// Semantically invalid configuration value.
    #[error("Configuration validation error: {0}")]
    InvalidConfig(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Operation not allowed in the current lifecycle state.
    #[error("Cannot {op} while tracker is {state}")]
    InvalidState {
        /// Attempted operation
        op: &'static str,
        /// Current lifecycle state
        state: crate::tracker::TrackerState,
    },

    /// A worker thread could not be spawned.
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(std::io::Error),

    /// The global tracing subscriber could not be installed.
    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for TrackerError {
    fn from(err: figment::Error) -> Self {
        TrackerError::Config(Box::new(err))
    }
}

impl TrackerError {
    /// Whether the error was caused by a bad argument rather than tracker state or resources.
    #[must_use]
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            TrackerError::DimensionMismatch(_)
                | TrackerError::BeadOutOfRange { .. }
                | TrackerError::PlaneOutOfRange { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_error_classification() {
        assert!(TrackerError::DimensionMismatch("x".into()).is_argument_error());
        assert!(TrackerError::BeadOutOfRange { bead: 3, num_beads: 2 }.is_argument_error());
        assert!(!TrackerError::InvalidConfig("x".into()).is_argument_error());
    }

    #[test]
    fn test_messages() {
        let err = TrackerError::PlaneOutOfRange { plane: 9, planes: 4 };
        assert_eq!(
            err.to_string(),
            "Plane index 9 out of range (ZLUT holds 4 planes)"
        );
    }
}
