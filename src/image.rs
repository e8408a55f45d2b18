//! Pixel data at the tracker boundary.
//!
//! Producers hand the tracker raw pitched memory in one of three pixel formats.
//! Jobs keep those bytes untouched; the worker converts them into the single
//! canonical [`ImageData`] (row-major `f32`) right before the engine runs, so the
//! engine never sees the original pixel type.

use crate::error::{TrackerError, TrackerResult};
use serde::{Deserialize, Serialize};

/// Pixel formats accepted by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelDataType {
    /// 8-bit unsigned integer pixels
    #[default]
    U8,
    /// 16-bit unsigned integer pixels (native endian)
    U16,
    /// 32-bit float pixels (native endian)
    F32,
}

impl PixelDataType {
    /// Size of one pixel in bytes.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelDataType::U8 => 1,
            PixelDataType::U16 => 2,
            PixelDataType::F32 => 4,
        }
    }

    /// Tightly packed row pitch for `width` pixels.
    #[must_use]
    pub const fn packed_pitch(self, width: usize) -> usize {
        width * self.bytes_per_pixel()
    }
}

impl std::fmt::Display for PixelDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PixelDataType::U8 => "u8",
            PixelDataType::U16 => "u16",
            PixelDataType::F32 => "f32",
        };
        write!(f, "{}", label)
    }
}

/// 2D position in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    /// Column coordinate
    pub x: f32,
    /// Row coordinate
    pub y: f32,
}

impl Vec2 {
    /// New position
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// 3D position: pixel coordinates plus z in (fractional) ZLUT planes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// Column coordinate
    pub x: f32,
    /// Row coordinate
    pub y: f32,
    /// Axial position
    pub z: f32,
}

impl Vec3 {
    /// New position
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Lateral part of the position.
    #[must_use]
    pub const fn xy(&self) -> Vec2 {
        Vec2 {
            x: self.x,
            y: self.y,
        }
    }
}

/// Top-left corner of a region of interest inside a frame.
///
/// The ROI size is the tracker's configured width and height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Roi {
    /// First column
    pub x: usize,
    /// First row
    pub y: usize,
}

impl Roi {
    /// New ROI corner
    #[must_use]
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

/// Check that a pitched buffer of `len` bytes can hold a `width` x `height` image.
///
/// The last row only needs `width * bpp` bytes, so a sub-rectangle view into a
/// larger frame passes without padding at its end. Returns that byte count.
pub fn validate_pitched(
    len: usize,
    pitch: usize,
    width: usize,
    height: usize,
    data_type: PixelDataType,
) -> TrackerResult<usize> {
    if width == 0 || height == 0 {
        return Err(TrackerError::DimensionMismatch(format!(
            "Empty image ({}x{})",
            width, height
        )));
    }
    let row_bytes = width
        .checked_mul(data_type.bytes_per_pixel())
        .ok_or_else(|| {
            TrackerError::DimensionMismatch(format!(
                "Row of {} {} pixels overflows",
                width, data_type
            ))
        })?;
    if pitch < row_bytes {
        return Err(TrackerError::DimensionMismatch(format!(
            "Pitch {} is smaller than one {} row of {} pixels ({} bytes)",
            pitch, data_type, width, row_bytes
        )));
    }
    let required = pitch
        .checked_mul(height - 1)
        .and_then(|rows| rows.checked_add(row_bytes))
        .ok_or_else(|| {
            TrackerError::DimensionMismatch(format!(
                "Pitch {} x {} rows overflows the address space",
                pitch, height
            ))
        })?;
    if len < required {
        return Err(TrackerError::DimensionMismatch(format!(
            "Image buffer has {} bytes, {}x{} {} image with pitch {} needs {}",
            len, width, height, data_type, pitch, required
        )));
    }
    Ok(required)
}

/// Whether a `width` x `height` ROI at `roi` lies inside a `frame_width` x
/// `frame_height` frame.
#[must_use]
pub fn roi_fits(
    roi: Roi,
    width: usize,
    height: usize,
    frame_width: usize,
    frame_height: usize,
) -> bool {
    let right = roi.x.checked_add(width);
    let bottom = roi.y.checked_add(height);
    matches!((right, bottom), (Some(r), Some(b)) if r <= frame_width && b <= frame_height)
}

/// Copy one ROI out of a pitched frame into `out` with a packed pitch.
///
/// Returns the pitch of the copied ROI. Fails if the ROI leaves the frame.
#[allow(clippy::too_many_arguments)]
pub fn copy_roi(
    frame: &[u8],
    pitch: usize,
    frame_width: usize,
    frame_height: usize,
    roi: Roi,
    roi_width: usize,
    roi_height: usize,
    data_type: PixelDataType,
    out: &mut Vec<u8>,
) -> TrackerResult<usize> {
    validate_pitched(frame.len(), pitch, frame_width, frame_height, data_type)?;
    if !roi_fits(roi, roi_width, roi_height, frame_width, frame_height) {
        return Err(TrackerError::DimensionMismatch(format!(
            "ROI at ({}, {}) of size {}x{} exceeds frame {}x{}",
            roi.x, roi.y, roi_width, roi_height, frame_width, frame_height
        )));
    }

    let bpp = data_type.bytes_per_pixel();
    let roi_pitch = roi_width * bpp;
    out.clear();
    out.reserve(roi_pitch * roi_height);
    for row in roi.y..roi.y + roi_height {
        let start = row * pitch + roi.x * bpp;
        out.extend_from_slice(&frame[start..start + roi_pitch]);
    }
    Ok(roi_pitch)
}

/// Canonical engine input: row-major `f32` pixels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageData {
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
    /// Row-major pixel values, `width * height` long
    pub pixels: Vec<f32>,
}

impl ImageData {
    /// Wrap already converted pixels.
    pub fn new(width: usize, height: usize, pixels: Vec<f32>) -> TrackerResult<Self> {
        if pixels.len() != width * height {
            return Err(TrackerError::DimensionMismatch(format!(
                "{} pixels supplied for a {}x{} image",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Convert pitched raw bytes into a new image.
    pub fn from_pitched(
        bytes: &[u8],
        pitch: usize,
        width: usize,
        height: usize,
        data_type: PixelDataType,
    ) -> TrackerResult<Self> {
        let mut image = Self::default();
        image.fill_from_pitched(bytes, pitch, width, height, data_type)?;
        Ok(image)
    }

    /// Convert pitched raw bytes into this image, reusing its allocation.
    pub fn fill_from_pitched(
        &mut self,
        bytes: &[u8],
        pitch: usize,
        width: usize,
        height: usize,
        data_type: PixelDataType,
    ) -> TrackerResult<()> {
        validate_pitched(bytes.len(), pitch, width, height, data_type)?;

        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.reserve(width * height);

        let row_bytes = data_type.packed_pitch(width);
        for row in 0..height {
            let line = &bytes[row * pitch..row * pitch + row_bytes];
            match data_type {
                PixelDataType::U8 => self.pixels.extend(line.iter().map(|&v| f32::from(v))),
                PixelDataType::U16 => self.pixels.extend(
                    line.chunks_exact(2)
                        .map(|c| f32::from(u16::from_ne_bytes([c[0], c[1]]))),
                ),
                PixelDataType::F32 => self.pixels.extend(
                    line.chunks_exact(4)
                        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
                ),
            }
        }
        Ok(())
    }

    /// Pixel value at integer coordinates.
    #[inline]
    #[must_use]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.pixels[y * self.width + x]
    }

    /// Bilinear sample, `None` outside the image.
    #[must_use]
    pub fn interpolate(&self, x: f32, y: f32) -> Option<f32> {
        if self.width < 2 || self.height < 2 {
            return None;
        }
        if !(x >= 0.0 && y >= 0.0) {
            return None;
        }
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        if x0 + 1 >= self.width || y0 + 1 >= self.height {
            return None;
        }
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x0 + 1, y0) * fx;
        let bottom = self.at(x0, y0 + 1) * (1.0 - fx) + self.at(x0 + 1, y0 + 1) * fx;
        Some(top * (1.0 - fy) + bottom * fy)
    }

    /// Mean pixel value (0 for an empty image).
    #[must_use]
    pub fn mean(&self) -> f32 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        self.pixels.iter().sum::<f32>() / self.pixels.len() as f32
    }

    /// Maximum pixel value (`f32::MIN` for an empty image).
    #[must_use]
    pub fn max(&self) -> f32 {
        self.pixels.iter().copied().fold(f32::MIN, f32::max)
    }
}
