//! Queued tracker: worker pool and lifecycle controller.
//!
//! ```text
//! producer ──enqueue/schedule_frame──▶ JobQueue ──▶ worker 0..N ──publish──▶ ResultBuffer ──poll──▶ consumer
//!                     │                                 │    ▲
//!                     └──── Pool<Job> ◀──── recycle ────┘    └── ZlutStore snapshot (COMPUTE_Z)
//! ```
//!
//! Three independent locks (queue, results, ZLUT handle) plus the lock-free job pool
//! let a producer enqueue, one worker dequeue and another recycle at the same time.
//!
//! ## Lifecycle
//!
//! `Constructed -> Running <-> Paused -> Stopping -> Stopped`
//!
//! - [`QueuedTracker::start`] spawns the workers
//! - [`QueuedTracker::pause`] freezes dequeuing without touching queued jobs
//! - [`QueuedTracker::stop`] (also run on drop) lets in-flight jobs finish, joins the
//!   workers and discards whatever is still queued
//!
//! ## Live job count
//!
//! The count rises at admission and falls only after the job's result is published,
//! so [`is_queue_filled`](QueuedTracker::is_queue_filled) and
//! [`is_idle`](QueuedTracker::is_idle) account for jobs that are being processed.
//!
//! ## Direct mode
//!
//! With `num_threads = Some(0)` no thread is spawned: every enqueue runs on the
//! caller's thread with a dedicated engine and publishes its result before returning.
//! Queue and pool are bypassed, which makes runs reproducible for debugging.

use crate::config::TrackerConfig;
use crate::engine::{centroid_factory, EngineError, EngineFactory, LocalizationEngine};
use crate::error::{TrackerError, TrackerResult};
use crate::image::{copy_roi, roi_fits, validate_pitched, ImageData, PixelDataType, Roi, Vec2};
use crate::job::{Job, JobId, JobInfo, JobQueue, LocalizeFlags};
use crate::results::{LocalizationResult, ResultBuffer, ResultStatus};
use crate::zlut::{ZlutDims, ZlutStore, ZlutTable};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use qtrk_pool::{Pool, PoolStats};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};

/// Tracker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerState {
    /// Created, workers not yet spawned
    Constructed,
    /// Workers dequeuing
    Running,
    /// Workers alive, dequeuing frozen
    Paused,
    /// Shutdown in progress
    Stopping,
    /// Workers joined; terminal
    Stopped,
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TrackerState::Constructed => "constructed",
            TrackerState::Running => "running",
            TrackerState::Paused => "paused",
            TrackerState::Stopping => "stopping",
            TrackerState::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

/// Per-worker counters, logged when the worker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs processed
    pub processed: u64,
    /// Jobs whose result status is not `Ok`
    pub failed: u64,
    /// Engine panics caught
    pub panics: u64,
}

/// State shared between the controller and all workers.
struct Shared {
    config: TrackerConfig,
    queue: JobQueue,
    pool: Pool<Job>,
    zlut: ZlutStore,
    results: ResultBuffer,
    /// Jobs admitted whose result is not yet published
    job_count: AtomicUsize,
    keep_running: AtomicBool,
}

impl Shared {
    /// Run the engine on one canonical image and build the result to publish.
    ///
    /// Never fails: engine errors become a result status.
    fn localize(
        &self,
        engine: &mut dyn LocalizationEngine,
        image: &ImageData,
        profile: &mut Vec<f32>,
        info: &JobInfo,
    ) -> LocalizationResult {
        let zlut = info
            .flags
            .contains(LocalizeFlags::COMPUTE_Z)
            .then(|| self.zlut.snapshot());

        let outcome = engine.localize(image, info, zlut.as_deref()).and_then(|loc| {
            if info.flags.contains(LocalizeFlags::BUILD_ZLUT) {
                self.build_zlut(engine, image, profile, info, loc.pos.xy())?;
            }
            Ok(loc)
        });

        match outcome {
            Ok(loc) => LocalizationResult {
                id: info.id_or_default(),
                frame: info.frame,
                bead: info.bead,
                pos: loc.pos,
                first_guess: loc.first_guess,
                error: loc.error,
                status: ResultStatus::Ok,
            },
            Err(err) => {
                warn!(
                    id = info.id_or_default(),
                    frame = info.frame,
                    bead = info.bead,
                    error = %err,
                    "Localization failed"
                );
                LocalizationResult::failed(info, err.status())
            }
        }
    }

    fn build_zlut(
        &self,
        engine: &mut dyn LocalizationEngine,
        image: &ImageData,
        profile: &mut Vec<f32>,
        info: &JobInfo,
        center: Vec2,
    ) -> Result<(), EngineError> {
        profile.resize(self.config.zlut_radial_steps, 0.0);
        engine.radial_profile(image, center, profile)?;
        self.zlut
            .accumulate_profile(info.bead as usize, info.zlut_plane as usize, profile)?;
        Ok(())
    }

    fn finish_job(&self, job: Job) {
        self.pool.recycle(job);
        self.job_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Engine plus scratch buffers; one per worker and one for direct mode.
struct EngineSlot {
    engine: Box<dyn LocalizationEngine>,
    image: ImageData,
    profile: Vec<f32>,
}

impl EngineSlot {
    fn new(config: &TrackerConfig, factory: &EngineFactory) -> Self {
        Self {
            engine: factory(config),
            image: ImageData::default(),
            profile: Vec::new(),
        }
    }

    /// Convert and localize one job.
    ///
    /// A panic in conversion or in the engine becomes a `Failed` result and the
    /// engine is rebuilt from `factory`. The flag reports whether that happened.
    fn process(
        &mut self,
        shared: &Shared,
        factory: &EngineFactory,
        pixels: &[u8],
        pitch: usize,
        data_type: PixelDataType,
        info: &JobInfo,
    ) -> (LocalizationResult, bool) {
        let Self {
            engine,
            image,
            profile,
        } = &mut *self;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let filled = image.fill_from_pitched(
                pixels,
                pitch,
                shared.config.width,
                shared.config.height,
                data_type,
            );
            if let Err(err) = filled {
                warn!(id = info.id_or_default(), error = %err, "Job buffer rejected");
                return LocalizationResult::failed(info, ResultStatus::DimensionMismatch);
            }
            shared.localize(engine.as_mut(), image, profile, info)
        }));

        match outcome {
            Ok(result) => (result, false),
            Err(_) => {
                error!(
                    id = info.id_or_default(),
                    "Engine panicked, replacing engine instance"
                );
                self.engine = factory(&shared.config);
                (LocalizationResult::failed(info, ResultStatus::Failed), true)
            }
        }
    }
}

/// One worker thread.
struct Worker {
    index: usize,
    shared: Arc<Shared>,
    factory: EngineFactory,
    slot: EngineSlot,
    stats: WorkerStats,
}

impl Worker {
    fn new(index: usize, shared: Arc<Shared>, factory: EngineFactory) -> Self {
        let slot = EngineSlot::new(&shared.config, &factory);
        Self {
            index,
            shared,
            factory,
            slot,
            stats: WorkerStats::default(),
        }
    }

    fn run(mut self) -> WorkerStats {
        let _span = info_span!("worker", index = self.index).entered();
        debug!("Worker started");

        let backoff = self.shared.config.idle_backoff();
        while self.shared.keep_running.load(Ordering::Acquire) {
            let Some(job) = self.shared.queue.dequeue_timeout(backoff) else {
                continue;
            };

            let (result, panicked) = self.slot.process(
                &self.shared,
                &self.factory,
                &job.pixels,
                job.pitch,
                job.data_type,
                &job.info,
            );
            self.stats.processed += 1;
            if panicked {
                self.stats.panics += 1;
            }
            if !result.status.is_ok() {
                self.stats.failed += 1;
            }
            self.shared.results.publish(result);
            self.shared.finish_job(job);
        }

        debug!(
            processed = self.stats.processed,
            failed = self.stats.failed,
            panics = self.stats.panics,
            "Worker exiting"
        );
        self.stats
    }
}

/// Queued, multi-threaded bead tracker.
///
/// All methods take `&self`; share one tracker between producer and consumer
/// threads with `Arc<QueuedTracker>`.
pub struct QueuedTracker {
    shared: Arc<Shared>,
    factory: EngineFactory,
    state: Mutex<TrackerState>,
    workers: Mutex<Vec<JoinHandle<WorkerStats>>>,
    /// Admission gate: producers hold the read side while admitting, `stop`
    /// closes it before draining so no job lands in an abandoned queue
    admission: RwLock<bool>,
    direct: Option<Mutex<EngineSlot>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for QueuedTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTracker")
            .field("state", &*self.state.lock())
            .field("job_count", &self.job_count())
            .field("result_count", &self.result_count())
            .field("direct", &self.direct.is_some())
            .finish()
    }
}

impl QueuedTracker {
    /// Tracker using the built-in [`CentroidEngine`](crate::engine::CentroidEngine).
    pub fn new(config: TrackerConfig) -> TrackerResult<Self> {
        Self::with_engine(config, centroid_factory())
    }

    /// Tracker creating one engine per worker through `factory`.
    pub fn with_engine(config: TrackerConfig, factory: EngineFactory) -> TrackerResult<Self> {
        config.validate()?;

        let direct = config
            .is_direct_mode()
            .then(|| Mutex::new(EngineSlot::new(&config, &factory)));

        let shared = Arc::new(Shared {
            pool: Pool::new_with_reset(0, Job::default, Job::reset),
            queue: JobQueue::new(),
            zlut: ZlutStore::new(),
            results: ResultBuffer::new(),
            job_count: AtomicUsize::new(0),
            keep_running: AtomicBool::new(false),
            config,
        });

        debug!(
            width = shared.config.width,
            height = shared.config.height,
            direct = direct.is_some(),
            "Tracker constructed"
        );

        Ok(Self {
            shared,
            factory,
            state: Mutex::new(TrackerState::Constructed),
            workers: Mutex::new(Vec::new()),
            admission: RwLock::new(true),
            direct,
            next_id: AtomicU64::new(0),
        })
    }

    /// Configuration fixed at construction.
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        *self.state.lock()
    }

    /// Worker threads spawned by `start` (0 in direct mode).
    #[must_use]
    pub fn num_threads(&self) -> usize {
        if self.direct.is_some() {
            0
        } else {
            self.shared.config.worker_count()
        }
    }

    /// Spawn the workers and enable processing.
    pub fn start(&self) -> TrackerResult<()> {
        let mut state = self.state.lock();
        if *state != TrackerState::Constructed {
            return Err(TrackerError::InvalidState {
                op: "start",
                state: *state,
            });
        }

        if self.direct.is_none() {
            self.shared.keep_running.store(true, Ordering::Release);
            self.shared.queue.set_processing(true);

            let count = self.shared.config.worker_count().max(1);
            let mut workers = self.workers.lock();
            for index in 0..count {
                let worker =
                    Worker::new(index, Arc::clone(&self.shared), Arc::clone(&self.factory));
                let spawned = thread::Builder::new()
                    .name(format!("qtrk-worker-{index}"))
                    .spawn(move || worker.run());
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(err) => {
                        error!(index, error = %err, "Failed to spawn worker");
                        self.abort_start(&mut state, &mut workers);
                        return Err(TrackerError::ThreadSpawn(err));
                    }
                }
            }
        }

        *state = TrackerState::Running;
        info!(threads = self.num_threads(), "Tracker started");
        Ok(())
    }

    /// Freeze (`true`) or resume (`false`) dequeuing.
    ///
    /// Queued jobs stay queued in admission order. In direct mode jobs run inside
    /// `enqueue`, so pausing only changes the reported state.
    pub fn pause(&self, pause: bool) -> TrackerResult<()> {
        let mut state = self.state.lock();
        let next = match (*state, pause) {
            (TrackerState::Running | TrackerState::Paused, true) => TrackerState::Paused,
            (TrackerState::Running | TrackerState::Paused, false) => TrackerState::Running,
            (current, _) => {
                return Err(TrackerError::InvalidState {
                    op: if pause { "pause" } else { "resume" },
                    state: current,
                })
            }
        };
        self.shared.queue.set_processing(!pause);
        let from = *state;
        if from != next {
            info!(%from, to = %next, "Tracker state changed");
        }
        *state = next;
        Ok(())
    }

    /// Tear down a partially started tracker: close admission, join the workers
    /// spawned so far and release queued jobs.
    fn abort_start(&self, state: &mut TrackerState, workers: &mut Vec<JoinHandle<WorkerStats>>) {
        *self.admission.write() = false;
        self.shared.keep_running.store(false, Ordering::Release);
        self.shared.queue.wake_all();
        Self::join_workers(std::mem::take(workers));
        self.discard_queued();
        *state = TrackerState::Stopped;
    }

    /// Stop the workers and release queued jobs.
    ///
    /// Jobs already running finish and publish their results; jobs still queued are
    /// discarded. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, TrackerState::Stopping | TrackerState::Stopped) {
                return;
            }
            *state = TrackerState::Stopping;
        }

        // Waits for admissions in flight
        *self.admission.write() = false;

        self.shared.keep_running.store(false, Ordering::Release);
        self.shared.queue.wake_all();

        let handles = std::mem::take(&mut *self.workers.lock());
        Self::join_workers(handles);
        self.discard_queued();

        *self.state.lock() = TrackerState::Stopped;
        info!(pending_results = self.result_count(), "Tracker stopped");
    }

    fn join_workers(handles: Vec<JoinHandle<WorkerStats>>) {
        for handle in handles {
            match handle.join() {
                Ok(stats) => trace!(?stats, "Worker joined"),
                Err(_) => error!("Worker thread panicked outside job processing"),
            }
        }
    }

    fn discard_queued(&self) {
        let discarded = self.shared.queue.drain();
        if !discarded.is_empty() {
            warn!(count = discarded.len(), "Discarding queued jobs");
        }
        for job in discarded {
            self.shared.finish_job(job);
        }
    }

    /// Hold the admission gate for one enqueue or frame.
    fn open_admission(&self, op: &'static str) -> TrackerResult<RwLockReadGuard<'_, bool>> {
        let gate = self.admission.read();
        if *gate {
            return Ok(gate);
        }
        drop(gate);
        Err(TrackerError::InvalidState {
            op,
            state: self.state(),
        })
    }

    fn assign_id(&self, mut info: JobInfo) -> (JobId, JobInfo) {
        let id = *info
            .id
            .get_or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        (id, info)
    }

    /// Queue one ROI for localization.
    ///
    /// `pixels` holds a `width` x `height` image (configured ROI size) with rows
    /// `pitch` bytes apart. Returns the job id (assigned when `info.id` is `None`).
    pub fn enqueue(
        &self,
        pixels: &[u8],
        pitch: usize,
        data_type: PixelDataType,
        info: JobInfo,
    ) -> TrackerResult<JobId> {
        let _gate = self.open_admission("enqueue")?;
        let (width, height) = (self.shared.config.width, self.shared.config.height);
        let used = validate_pitched(pixels.len(), pitch, width, height, data_type)?;
        let (id, info) = self.assign_id(info);

        if let Some(direct) = &self.direct {
            self.run_direct(direct, &pixels[..used], pitch, data_type, &info);
            return Ok(id);
        }

        let mut job = self.shared.pool.acquire();
        job.load(&pixels[..used], pitch, width, height, data_type, info);
        self.shared.job_count.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.enqueue(job);
        trace!(id, frame = info.frame, "Job queued");
        Ok(id)
    }

    /// Queue one job per ROI of a frame.
    ///
    /// ROI `i` is tracked as bead `template.bead + i`. With an id in `template` it
    /// gets id `template.id + i`; otherwise ids are assigned sequentially. All ROIs
    /// are validated before any job is admitted.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_frame(
        &self,
        frame: &[u8],
        pitch: usize,
        frame_width: usize,
        frame_height: usize,
        rois: &[Roi],
        data_type: PixelDataType,
        template: JobInfo,
    ) -> TrackerResult<Vec<JobId>> {
        let _gate = self.open_admission("schedule frame")?;
        let (width, height) = (self.shared.config.width, self.shared.config.height);
        validate_pitched(frame.len(), pitch, frame_width, frame_height, data_type)?;
        if let Some(roi) = rois
            .iter()
            .find(|roi| !roi_fits(**roi, width, height, frame_width, frame_height))
        {
            return Err(TrackerError::DimensionMismatch(format!(
                "ROI at ({}, {}) of size {}x{} exceeds frame {}x{}",
                roi.x, roi.y, width, height, frame_width, frame_height
            )));
        }

        let infos = (0..rois.len())
            .map(|index| roi_job_info(&template, index))
            .collect::<TrackerResult<Vec<_>>>()?;
        let infos: Vec<(JobId, JobInfo)> =
            infos.into_iter().map(|info| self.assign_id(info)).collect();
        let ids = infos.iter().map(|(id, _)| *id).collect();

        if let Some(direct) = &self.direct {
            let mut buffer = Vec::new();
            for (roi, (_, info)) in rois.iter().zip(&infos) {
                let roi_pitch = copy_roi(
                    frame, pitch, frame_width, frame_height, *roi, width, height, data_type,
                    &mut buffer,
                )?;
                self.run_direct(direct, &buffer, roi_pitch, data_type, info);
            }
            return Ok(ids);
        }

        let mut jobs = Vec::with_capacity(rois.len());
        for (roi, (_, info)) in rois.iter().zip(infos) {
            let mut job = self.shared.pool.acquire();
            match copy_roi(
                frame, pitch, frame_width, frame_height, *roi, width, height, data_type,
                &mut job.pixels,
            ) {
                Ok(roi_pitch) => {
                    job.pitch = roi_pitch;
                    job.width = width;
                    job.height = height;
                    job.data_type = data_type;
                    job.info = info;
                    jobs.push(job);
                }
                Err(err) => {
                    self.shared.pool.recycle(job);
                    for job in jobs {
                        self.shared.pool.recycle(job);
                    }
                    return Err(err);
                }
            }
        }

        self.shared.job_count.fetch_add(jobs.len(), Ordering::AcqRel);
        self.shared.queue.enqueue_batch(jobs);
        trace!(frame = template.frame, rois = rois.len(), "Frame scheduled");
        Ok(ids)
    }

    fn run_direct(
        &self,
        direct: &Mutex<EngineSlot>,
        pixels: &[u8],
        pitch: usize,
        data_type: PixelDataType,
        info: &JobInfo,
    ) {
        let (result, _) =
            direct
                .lock()
                .process(&self.shared, &self.factory, pixels, pitch, data_type, info);
        self.shared.results.publish(result);
    }

    /// Replace the ZLUT with `data` laid out as `[bead][plane][radial step]`.
    ///
    /// `radial_steps` must match the configured profile length. Concurrent calls
    /// must be serialized by the caller; the last one wins.
    pub fn set_zlut(
        &self,
        data: Vec<f32>,
        num_beads: usize,
        planes: usize,
        radial_steps: usize,
        plane_weights: Option<Vec<f32>>,
    ) -> TrackerResult<()> {
        self.set_zlut_table(ZlutTable::from_data(
            data,
            num_beads,
            planes,
            radial_steps,
            plane_weights,
        )?)
    }

    /// Replace the ZLUT with a prepared table.
    pub fn set_zlut_table(&self, table: ZlutTable) -> TrackerResult<()> {
        let dims = table.dims();
        if !dims.is_empty() && dims.radial_steps != self.shared.config.zlut_radial_steps {
            return Err(TrackerError::DimensionMismatch(format!(
                "ZLUT has {} radial steps, tracker is configured for {}",
                dims.radial_steps, self.shared.config.zlut_radial_steps
            )));
        }
        self.shared.zlut.set(table);
        Ok(())
    }

    /// Copy of the current ZLUT (dimensions included).
    #[must_use]
    pub fn zlut(&self) -> ZlutTable {
        self.shared.zlut.get()
    }

    /// Dimensions of the current ZLUT.
    #[must_use]
    pub fn zlut_dims(&self) -> ZlutDims {
        self.shared.zlut.dims()
    }

    /// Remove up to `max_count` finished results, optionally sorted by job id.
    pub fn poll_finished(&self, max_count: usize, sort_by_id: bool) -> Vec<LocalizationResult> {
        self.shared.results.poll(max_count, sort_by_id)
    }

    /// Discard all buffered results.
    pub fn clear_results(&self) {
        self.shared.results.clear();
    }

    /// Number of buffered results.
    #[must_use]
    pub fn result_count(&self) -> usize {
        self.shared.results.len()
    }

    /// Jobs admitted whose result is not yet published.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.shared.job_count.load(Ordering::Acquire)
    }

    /// Backpressure signal: `job_count() >= max_queue_size`.
    #[must_use]
    pub fn is_queue_filled(&self) -> bool {
        self.job_count() >= self.shared.config.max_queue_size
    }

    /// No job queued or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.job_count() == 0
    }

    /// Admission is immediate, so there is never deferred work to push out.
    pub fn flush(&self) {
        trace!(job_count = self.job_count(), "Flush requested");
    }

    /// Wait until idle or `timeout` elapses; returns whether the tracker is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let step = self.shared.config.idle_backoff();
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(step);
        }
        true
    }

    /// Job pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }
}

/// Job info of ROI `index` in a scheduled frame.
fn roi_job_info(template: &JobInfo, index: usize) -> TrackerResult<JobInfo> {
    let overflow = |what: &str| {
        TrackerError::DimensionMismatch(format!("{} of ROI {} overflows", what, index))
    };
    let mut info = *template;
    if let Some(base) = template.id {
        let id = u64::try_from(index)
            .ok()
            .and_then(|offset| base.checked_add(offset))
            .ok_or_else(|| overflow("Job id"))?;
        info.id = Some(id);
    }
    info.bead = u32::try_from(index)
        .ok()
        .and_then(|offset| template.bead.checked_add(offset))
        .ok_or_else(|| overflow("Bead index"))?;
    Ok(info)
}

impl Drop for QueuedTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
