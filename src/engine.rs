//! Localization engine seam.
//!
//! Every worker owns one boxed [`LocalizationEngine`]; engines keep scratch buffers
//! between jobs and are never shared across threads. The tracker only relies on the
//! trait contract, so production fitting code plugs in through an
//! [`EngineFactory`].
//!
//! [`CentroidEngine`] is the built-in reference implementation:
//! - lateral position by background-subtracted centre of mass, optionally refined in
//!   a window around the hint
//! - radial profile on concentric rings (bilinear samples), normalized to zero mean
//!   and unit energy
//! - z by least-squares profile match against the bead's ZLUT planes, refined with a
//!   parabola through the best plane and its neighbours

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::image::{ImageData, Vec2, Vec3};
use crate::job::{JobInfo, LocalizeAlgorithm, LocalizeFlags};
use crate::results::ResultStatus;
use crate::zlut::ZlutTable;
use std::sync::Arc;
use thiserror::Error;

/// Engine output for one ROI.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Localization {
    /// Final position, ROI coordinates; z in planes when estimated
    pub pos: Vec3,
    /// Unrefined lateral position
    pub first_guess: Vec2,
    /// Profile match residual, 0 without z
    pub error: f32,
}

/// Failure while localizing one ROI.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Nothing above background
    #[error("no signal above background")]
    NoSignal,

    /// Z requested but the ZLUT has no data for this bead
    #[error("ZLUT has no profile for bead {0}")]
    ZlutMissing(u32),

    /// Bead/plane/profile sizes disagree with the ZLUT or image
    #[error(transparent)]
    Dimension(#[from] TrackerError),

    /// Anything else
    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    /// Result status recorded for this failure.
    #[must_use]
    pub fn status(&self) -> ResultStatus {
        match self {
            EngineError::NoSignal => ResultStatus::NoSignal,
            EngineError::ZlutMissing(_) => ResultStatus::ZlutMissing,
            EngineError::Dimension(_) => ResultStatus::DimensionMismatch,
            EngineError::Failed(_) => ResultStatus::Failed,
        }
    }
}

/// Per-thread localization algorithm.
pub trait LocalizationEngine: Send {
    /// Estimate the position of the bead in `image`.
    ///
    /// `zlut` is a consistent snapshot, present when the job requests z.
    fn localize(
        &mut self,
        image: &ImageData,
        job: &JobInfo,
        zlut: Option<&ZlutTable>,
    ) -> Result<Localization, EngineError>;

    /// Radial intensity profile around `center`, one sample per element of `out`.
    fn radial_profile(
        &mut self,
        image: &ImageData,
        center: Vec2,
        out: &mut [f32],
    ) -> Result<(), EngineError>;
}

/// Creates one engine per worker (and one for direct mode).
pub type EngineFactory = Arc<dyn Fn(&TrackerConfig) -> Box<dyn LocalizationEngine> + Send + Sync>;

/// Factory for the built-in [`CentroidEngine`].
#[must_use]
pub fn centroid_factory() -> EngineFactory {
    Arc::new(|config: &TrackerConfig| {
        Box::new(CentroidEngine::new(config)) as Box<dyn LocalizationEngine>
    })
}

/// Reference engine: centre of mass + radial profile matching.
#[derive(Debug, Clone)]
pub struct CentroidEngine {
    radial_steps: usize,
    min_radius: f32,
    max_radius: f32,
    iterations: usize,
    /// Precomputed spoke directions
    spokes: Vec<(f32, f32)>,
    profile: Vec<f32>,
    lut_row: Vec<f32>,
    plane_errors: Vec<f32>,
}

impl CentroidEngine {
    /// Engine sized from the tracker configuration.
    #[must_use]
    pub fn new(config: &TrackerConfig) -> Self {
        let angular = config.zlut_angular_steps.max(1);
        let spokes = (0..angular)
            .map(|k| {
                let angle = 2.0 * std::f32::consts::PI * k as f32 / angular as f32;
                (angle.cos(), angle.sin())
            })
            .collect();

        Self {
            radial_steps: config.zlut_radial_steps,
            min_radius: config.zlut_min_radius,
            max_radius: config.zlut_max_radius,
            iterations: config.centroid_iterations,
            spokes,
            profile: vec![0.0; config.zlut_radial_steps],
            lut_row: vec![0.0; config.zlut_radial_steps],
            plane_errors: Vec::new(),
        }
    }

    /// Background-subtracted centre of mass inside `[x0, x1) x [y0, y1)`.
    fn centroid_in(
        image: &ImageData,
        background: f32,
        (x0, y0): (usize, usize),
        (x1, y1): (usize, usize),
    ) -> Option<Vec2> {
        let mut sum = 0.0f64;
        let mut sx = 0.0f64;
        let mut sy = 0.0f64;
        for y in y0..y1 {
            for x in x0..x1 {
                let w = f64::from((image.at(x, y) - background).max(0.0));
                sum += w;
                sx += w * x as f64;
                sy += w * y as f64;
            }
        }
        (sum > 0.0).then(|| Vec2::new((sx / sum) as f32, (sy / sum) as f32))
    }

    fn centroid(image: &ImageData) -> Result<Vec2, EngineError> {
        Self::centroid_in(image, image.mean(), (0, 0), (image.width, image.height))
            .ok_or(EngineError::NoSignal)
    }

    /// Windowed centroid iterations starting from `start`.
    fn refine(&self, image: &ImageData, start: Vec2) -> Vec2 {
        let background = image.mean();
        let half = (image.width.min(image.height) / 4).max(2) as f32;
        let mut pos = start;
        for _ in 0..self.iterations {
            let x0 = (pos.x - half).max(0.0) as usize;
            let y0 = (pos.y - half).max(0.0) as usize;
            let x1 = ((pos.x + half + 1.0).max(0.0) as usize).min(image.width);
            let y1 = ((pos.y + half + 1.0).max(0.0) as usize).min(image.height);
            if x0 >= x1 || y0 >= y1 {
                break;
            }
            match Self::centroid_in(image, background, (x0, y0), (x1, y1)) {
                Some(next) => pos = next,
                None => break,
            }
        }
        pos
    }

    fn inside(image: &ImageData, pos: Vec3) -> bool {
        pos.x > 0.0 && pos.y > 0.0 && pos.x < image.width as f32 && pos.y < image.height as f32
    }

    /// Normalize to zero mean and unit energy; flat profiles become all zeros.
    fn normalize(values: &mut [f32]) {
        if values.is_empty() {
            return;
        }
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let mut energy = 0.0;
        for v in values.iter_mut() {
            *v -= mean;
            energy += *v * *v;
        }
        if energy > 0.0 {
            let scale = energy.sqrt().recip();
            values.iter_mut().for_each(|v| *v *= scale);
        }
    }

    /// Fractional best-matching plane and its residual.
    fn match_z(&mut self, zlut: &ZlutTable, bead: u32) -> Result<(f32, f32), EngineError> {
        let dims = zlut.dims();
        if dims.is_empty() {
            return Err(EngineError::ZlutMissing(bead));
        }
        if dims.radial_steps != self.profile.len() {
            return Err(TrackerError::DimensionMismatch(format!(
                "ZLUT rows have {} radial steps, engine computes {}",
                dims.radial_steps,
                self.profile.len()
            ))
            .into());
        }
        let rows = zlut.bead_profiles(bead as usize)?;
        let weights = zlut.plane_weights();

        self.plane_errors.clear();
        for (plane, row) in rows.chunks_exact(dims.radial_steps).enumerate() {
            self.lut_row.copy_from_slice(row);
            Self::normalize(&mut self.lut_row);
            let err: f32 = self
                .profile
                .iter()
                .zip(&self.lut_row)
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            let weight = weights.map_or(1.0, |w| w[plane]);
            self.plane_errors.push(err * weight);
        }

        let (best, &best_err) = self
            .plane_errors
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .ok_or(EngineError::ZlutMissing(bead))?;

        let mut z = best as f32;
        if best > 0 && best + 1 < self.plane_errors.len() {
            let (em, ep) = (self.plane_errors[best - 1], self.plane_errors[best + 1]);
            let denom = em - 2.0 * best_err + ep;
            if denom > f32::EPSILON {
                z += (0.5 * (em - ep) / denom).clamp(-0.5, 0.5);
            }
        }
        Ok((z, best_err))
    }
}

impl LocalizationEngine for CentroidEngine {
    fn localize(
        &mut self,
        image: &ImageData,
        job: &JobInfo,
        zlut: Option<&ZlutTable>,
    ) -> Result<Localization, EngineError> {
        let first_guess = Self::centroid(image)?;

        let xy = match job.algorithm {
            LocalizeAlgorithm::Centroid => first_guess,
            LocalizeAlgorithm::RefinedCentroid => {
                let start = if Self::inside(image, job.initial_pos) {
                    job.initial_pos.xy()
                } else {
                    first_guess
                };
                self.refine(image, start)
            }
        };

        let mut result = Localization {
            pos: Vec3::new(xy.x, xy.y, job.initial_pos.z),
            first_guess,
            error: 0.0,
        };

        if job.flags.contains(LocalizeFlags::COMPUTE_Z) {
            let zlut = zlut.ok_or(EngineError::ZlutMissing(job.bead))?;
            let mut profile = std::mem::take(&mut self.profile);
            let computed = self.radial_profile(image, xy, &mut profile);
            self.profile = profile;
            computed?;

            let (z, error) = self.match_z(zlut, job.bead)?;
            result.pos.z = z;
            result.error = error;
        }

        Ok(result)
    }

    fn radial_profile(
        &mut self,
        image: &ImageData,
        center: Vec2,
        out: &mut [f32],
    ) -> Result<(), EngineError> {
        if out.is_empty() {
            return Err(EngineError::Failed("empty radial profile requested".into()));
        }
        let background = image.mean();
        let step = (self.max_radius - self.min_radius) / out.len() as f32;

        for (i, sample) in out.iter_mut().enumerate() {
            let radius = self.min_radius + step * i as f32;
            let mut sum = 0.0;
            let mut count = 0usize;
            for &(cos, sin) in &self.spokes {
                if let Some(v) = image.interpolate(center.x + radius * cos, center.y + radius * sin) {
                    sum += v;
                    count += 1;
                }
            }
            *sample = if count > 0 { sum / count as f32 } else { background };
        }

        Self::normalize(out);
        Ok(())
    }
}
