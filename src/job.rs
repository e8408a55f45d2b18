//! Jobs and the job queue.
//!
//! A [`Job`] is one unit of localization work: a private copy of one ROI's pixels
//! plus its [`JobInfo`]. Jobs move through four states:
//!
//! ```text
//! free (in pool) -> queued (in JobQueue) -> running (owned by one worker) -> recycled
//! ```
//!
//! Ownership is transferred by value at every step, so a job's buffer can never be
//! read by two workers at once.
//!
//! [`JobQueue`] keeps admission order. Removal is non-blocking (`try_dequeue`) or a
//! bounded condition-variable wait (`dequeue_timeout`) so idle workers sleep instead
//! of spinning, while still waking up regularly to notice pause and shutdown.

use crate::image::{PixelDataType, Vec3};
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Job identifier used to reorder results.
pub type JobId = u64;

/// Lateral localization algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LocalizeAlgorithm {
    /// Background-subtracted centre of mass over the whole ROI
    #[default]
    Centroid,
    /// Centre of mass refined inside a window around the initial hint
    RefinedCentroid,
}

bitflags! {
    /// Extra work requested for a job on top of the lateral position.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LocalizeFlags: u32 {
        /// Estimate z by matching the radial profile against the ZLUT
        const COMPUTE_Z = 1 << 0;
        /// Add the radial profile to the ZLUT at (bead, plane)
        const BUILD_ZLUT = 1 << 1;
    }
}

/// Per-job metadata supplied by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JobInfo {
    /// Caller id; `None` lets the tracker assign the next sequential id
    pub id: Option<JobId>,
    /// Source frame number
    pub frame: u32,
    /// Lateral algorithm
    pub algorithm: LocalizeAlgorithm,
    /// Z estimation / ZLUT building
    pub flags: LocalizeFlags,
    /// Initial position hint, ROI coordinates
    pub initial_pos: Vec3,
    /// Bead index (ZLUT row)
    pub bead: u32,
    /// Target ZLUT plane, only meaningful with `BUILD_ZLUT`
    pub zlut_plane: u32,
}

impl JobInfo {
    /// Job info for a frame, all other fields default.
    #[must_use]
    pub fn for_frame(frame: u32) -> Self {
        Self {
            frame,
            ..Default::default()
        }
    }

    /// Set an explicit job id.
    #[must_use]
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the bead index.
    #[must_use]
    pub fn with_bead(mut self, bead: u32) -> Self {
        self.bead = bead;
        self
    }

    /// Set the lateral algorithm.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: LocalizeAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Request z estimation against the current ZLUT.
    #[must_use]
    pub fn with_z(mut self) -> Self {
        self.flags |= LocalizeFlags::COMPUTE_Z;
        self
    }

    /// Turn the job into a ZLUT building job for `plane`.
    #[must_use]
    pub fn building_zlut(mut self, plane: u32) -> Self {
        self.flags |= LocalizeFlags::BUILD_ZLUT;
        self.zlut_plane = plane;
        self
    }

    /// Set the initial position hint.
    #[must_use]
    pub fn with_initial_pos(mut self, pos: Vec3) -> Self {
        self.initial_pos = pos;
        self
    }

    /// The id, or 0 when unassigned.
    #[must_use]
    pub fn id_or_default(&self) -> JobId {
        self.id.unwrap_or_default()
    }
}

/// One queued unit of work: owned pixel bytes plus metadata.
#[derive(Debug, Clone, Default)]
pub struct Job {
    /// Raw pitched pixel bytes
    pub pixels: Vec<u8>,
    /// Bytes per row in `pixels`
    pub pitch: usize,
    /// ROI width in pixels
    pub width: usize,
    /// ROI height in pixels
    pub height: usize,
    /// Pixel format of `pixels`
    pub data_type: PixelDataType,
    /// Producer metadata (id always assigned once queued)
    pub info: JobInfo,
}

impl Job {
    /// Fill a (possibly recycled) job, reusing its buffer allocation.
    pub fn load(
        &mut self,
        pixels: &[u8],
        pitch: usize,
        width: usize,
        height: usize,
        data_type: PixelDataType,
        info: JobInfo,
    ) {
        self.pixels.clear();
        self.pixels.extend_from_slice(pixels);
        self.pitch = pitch;
        self.width = width;
        self.height = height;
        self.data_type = data_type;
        self.info = info;
    }

    /// Clear metadata before the job goes back to the pool. Capacity is kept.
    pub fn reset(&mut self) {
        self.pixels.clear();
        self.pitch = 0;
        self.width = 0;
        self.height = 0;
        self.info = JobInfo::default();
    }
}

struct QueueState {
    jobs: VecDeque<Job>,
    processing: bool,
}

/// FIFO of pending jobs shared by the producer and all workers.
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    /// Empty queue with processing enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                processing: true,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a job at the tail and wake one waiting worker. Never rejects.
    pub fn enqueue(&self, job: Job) {
        let mut state = self.state.lock();
        state.jobs.push_back(job);
        drop(state);
        self.available.notify_one();
    }

    /// Append several jobs atomically, preserving their order.
    pub fn enqueue_batch(&self, jobs: impl IntoIterator<Item = Job>) {
        let mut state = self.state.lock();
        state.jobs.extend(jobs);
        drop(state);
        self.available.notify_all();
    }

    /// Remove the head job without waiting.
    ///
    /// Returns `None` when the queue is empty or processing is paused.
    pub fn try_dequeue(&self) -> Option<Job> {
        let mut state = self.state.lock();
        if !state.processing {
            return None;
        }
        state.jobs.pop_front()
    }

    /// Remove the head job, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, while paused, or after [`wake_all`](Self::wake_all),
    /// so callers can re-check their own stop condition.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.processing {
                if let Some(job) = state.jobs.pop_front() {
                    return Some(job);
                }
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
            // Spurious or wake_all: a paused queue must hand control back
            if !state.processing {
                return None;
            }
        }
    }

    /// Enable or disable dequeuing. Queued jobs keep their order either way.
    pub fn set_processing(&self, enabled: bool) {
        self.state.lock().processing = enabled;
        self.available.notify_all();
    }

    /// Whether dequeuing is enabled.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.state.lock().processing
    }

    /// Wake every waiting worker (used on shutdown).
    pub fn wake_all(&self) {
        self.available.notify_all();
    }

    /// Remove and return all pending jobs in admission order.
    pub fn drain(&self) -> Vec<Job> {
        self.state.lock().jobs.drain(..).collect()
    }

    /// Number of queued (not yet running) jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Whether no job is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
