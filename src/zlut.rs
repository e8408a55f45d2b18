//! Z lookup table (ZLUT) storage.
//!
//! A [`ZlutTable`] holds one expected radial intensity profile per (bead, plane),
//! `radial_steps` samples each, plus optional per-plane weights applied when
//! matching a measured profile.
//!
//! [`ZlutStore`] shares the table between all workers:
//! - the table lives behind `RwLock<Arc<ZlutTable>>`
//! - readers take the read lock only long enough to clone the `Arc`, then work on
//!   that snapshot for the rest of their job
//! - [`ZlutStore::set`] swaps the whole handle under the write lock
//! - ZLUT building mutates copy-on-write (`Arc::make_mut`) under the write lock
//!
//! A reader therefore never sees dimensions or rows from two different tables.

use crate::error::{TrackerError, TrackerResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Table dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZlutDims {
    /// Number of beads (rows of profiles)
    pub num_beads: usize,
    /// Number of z planes per bead
    pub planes: usize,
    /// Samples per radial profile
    pub radial_steps: usize,
}

impl ZlutDims {
    /// Total number of `f32` elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num_beads * self.planes * self.radial_steps
    }

    /// Whether the table holds no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense (bead, plane, radial step) lookup table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZlutTable {
    dims: ZlutDims,
    data: Vec<f32>,
    plane_weights: Option<Vec<f32>>,
}

impl ZlutTable {
    /// Zero-filled table.
    #[must_use]
    pub fn new(num_beads: usize, planes: usize, radial_steps: usize) -> Self {
        let dims = ZlutDims {
            num_beads,
            planes,
            radial_steps,
        };
        Self {
            data: vec![0.0; dims.len()],
            dims,
            plane_weights: None,
        }
    }

    /// Table from existing data laid out as `[bead][plane][radial step]`.
    pub fn from_data(
        data: Vec<f32>,
        num_beads: usize,
        planes: usize,
        radial_steps: usize,
        plane_weights: Option<Vec<f32>>,
    ) -> TrackerResult<Self> {
        let dims = ZlutDims {
            num_beads,
            planes,
            radial_steps,
        };
        if data.len() != dims.len() {
            return Err(TrackerError::DimensionMismatch(format!(
                "ZLUT data has {} elements, {} beads x {} planes x {} radial steps needs {}",
                data.len(),
                num_beads,
                planes,
                radial_steps,
                dims.len()
            )));
        }
        if let Some(weights) = &plane_weights {
            if weights.len() != planes {
                return Err(TrackerError::DimensionMismatch(format!(
                    "ZLUT plane weights have {} entries for {} planes",
                    weights.len(),
                    planes
                )));
            }
        }
        Ok(Self {
            dims,
            data,
            plane_weights,
        })
    }

    /// Table dimensions.
    #[must_use]
    pub fn dims(&self) -> ZlutDims {
        self.dims
    }

    /// Raw data, `[bead][plane][radial step]`.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Per-plane weights, if any.
    #[must_use]
    pub fn plane_weights(&self) -> Option<&[f32]> {
        self.plane_weights.as_deref()
    }

    /// Whether the table holds no profiles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    fn offset(&self, bead: usize, plane: usize) -> TrackerResult<usize> {
        if bead >= self.dims.num_beads {
            return Err(TrackerError::BeadOutOfRange {
                bead,
                num_beads: self.dims.num_beads,
            });
        }
        if plane >= self.dims.planes {
            return Err(TrackerError::PlaneOutOfRange {
                plane,
                planes: self.dims.planes,
            });
        }
        Ok((bead * self.dims.planes + plane) * self.dims.radial_steps)
    }

    /// Expected profile of `bead` at `plane`.
    pub fn profile(&self, bead: usize, plane: usize) -> TrackerResult<&[f32]> {
        let start = self.offset(bead, plane)?;
        Ok(&self.data[start..start + self.dims.radial_steps])
    }

    /// All planes of `bead`, `planes * radial_steps` long.
    pub fn bead_profiles(&self, bead: usize) -> TrackerResult<&[f32]> {
        if self.dims.planes == 0 {
            return Err(TrackerError::PlaneOutOfRange { plane: 0, planes: 0 });
        }
        let start = self.offset(bead, 0)?;
        Ok(&self.data[start..start + self.dims.planes * self.dims.radial_steps])
    }

    /// Add `profile` onto the stored profile of (`bead`, `plane`).
    pub fn accumulate(&mut self, bead: usize, plane: usize, profile: &[f32]) -> TrackerResult<()> {
        let start = self.offset(bead, plane)?;
        if profile.len() != self.dims.radial_steps {
            return Err(TrackerError::DimensionMismatch(format!(
                "Radial profile has {} samples, ZLUT rows have {}",
                profile.len(),
                self.dims.radial_steps
            )));
        }
        for (dst, src) in self.data[start..start + profile.len()].iter_mut().zip(profile) {
            *dst += src;
        }
        Ok(())
    }
}

/// Shared, atomically replaceable ZLUT.
#[derive(Debug, Default)]
pub struct ZlutStore {
    table: RwLock<Arc<ZlutTable>>,
}

impl ZlutStore {
    /// Store holding an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table.
    ///
    /// Jobs already holding a snapshot finish on the old table.
    pub fn set(&self, table: ZlutTable) {
        let dims = table.dims();
        *self.table.write() = Arc::new(table);
        info!(
            num_beads = dims.num_beads,
            planes = dims.planes,
            radial_steps = dims.radial_steps,
            "ZLUT replaced"
        );
    }

    /// Consistent read-only view of the current table.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ZlutTable> {
        Arc::clone(&self.table.read())
    }

    /// Owned copy of the current table.
    #[must_use]
    pub fn get(&self) -> ZlutTable {
        self.snapshot().as_ref().clone()
    }

    /// Dimensions of the current table.
    #[must_use]
    pub fn dims(&self) -> ZlutDims {
        self.table.read().dims()
    }

    /// Add a measured profile to (`bead`, `plane`) of the current table.
    ///
    /// Copy-on-write: if any reader still holds a snapshot, the table is cloned first.
    pub fn accumulate_profile(
        &self,
        bead: usize,
        plane: usize,
        profile: &[f32],
    ) -> TrackerResult<()> {
        let mut guard = self.table.write();
        if Arc::strong_count(&guard) > 1 {
            debug!(bead, plane, "ZLUT shared by readers, cloning before update");
        }
        Arc::make_mut(&mut guard).accumulate(bead, plane, profile)
    }
}
