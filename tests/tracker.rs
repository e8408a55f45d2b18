//! End-to-end tests of the queued tracker
//!
//! Covers:
//! - no lost or duplicated jobs under multiple workers
//! - ordering (FIFO admission, sort-by-id on poll)
//! - backpressure and idle accounting
//! - pause/resume and stop semantics
//! - ZLUT replacement while workers read it
//! - frame scheduling and ZLUT building with the centroid engine

use qtrk::{
    EngineError, EngineFactory, ImageData, JobInfo, Localization, LocalizationEngine,
    PixelDataType, QueuedTracker, ResultStatus, Roi, TrackerConfig, TrackerState, Vec2, Vec3,
    ZlutTable,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ROI: usize = 8;
const WAIT: Duration = Duration::from_secs(10);

/// Reports the first pixel as x; with a ZLUT, reports the table's first value and
/// plane count so a torn read would show up as x != y.
struct EchoEngine;

impl LocalizationEngine for EchoEngine {
    fn localize(
        &mut self,
        image: &ImageData,
        _job: &JobInfo,
        zlut: Option<&ZlutTable>,
    ) -> Result<Localization, EngineError> {
        let pos = match zlut {
            Some(table) => {
                let data = table.data();
                let first = data.first().copied().unwrap_or(-1.0);
                let uniform = data.iter().all(|&v| v == first);
                Vec3::new(
                    first,
                    table.dims().planes as f32,
                    if uniform { 0.0 } else { 1.0 },
                )
            }
            None => Vec3::new(image.pixels[0], 0.0, 0.0),
        };
        Ok(Localization {
            pos,
            ..Default::default()
        })
    }

    fn radial_profile(
        &mut self,
        _image: &ImageData,
        _center: Vec2,
        out: &mut [f32],
    ) -> Result<(), EngineError> {
        out.fill(1.0);
        Ok(())
    }
}

fn echo_factory() -> EngineFactory {
    Arc::new(|_: &TrackerConfig| Box::new(EchoEngine) as Box<dyn LocalizationEngine>)
}

fn echo_config(threads: usize) -> TrackerConfig {
    TrackerConfig {
        idle_backoff_ms: 1,
        zlut_radial_steps: 4,
        ..TrackerConfig::with_roi_size(ROI, ROI).threads(threads)
    }
}

fn echo_tracker(config: TrackerConfig) -> QueuedTracker {
    QueuedTracker::with_engine(config, echo_factory()).unwrap()
}

fn flat_roi(value: u8) -> Vec<u8> {
    vec![value; ROI * ROI]
}

fn enqueue_id(tracker: &QueuedTracker, id: u64) {
    tracker
        .enqueue(
            &flat_roi(1),
            ROI,
            PixelDataType::U8,
            JobInfo::default().with_id(id),
        )
        .unwrap();
}

/// Gaussian spot rendered into a packed u8 image.
fn spot(width: usize, height: usize, cx: f32, cy: f32, sigma: f32) -> Vec<u8> {
    let mut pixels = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let r2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            let value = 10.0 + 200.0 * (-r2 / (2.0 * sigma * sigma)).exp();
            pixels[y * width + x] = value as u8;
        }
    }
    pixels
}

#[test]
fn test_every_job_yields_exactly_one_result() {
    let tracker = echo_tracker(echo_config(4).queue_size(1000));
    tracker.start().unwrap();

    for id in 0..500 {
        enqueue_id(&tracker, id);
    }
    assert!(tracker.wait_idle(WAIT));

    let results = tracker.poll_finished(usize::MAX, false);
    assert_eq!(results.len(), 500);
    let ids: HashSet<u64> = results.iter().map(|r| r.id).collect();
    assert_eq!(ids, (0..500).collect());
    assert!(results.iter().all(|r| r.status == ResultStatus::Ok));
    assert_eq!(tracker.result_count(), 0);
}

#[test]
fn test_sorted_poll_is_ordered_by_id() {
    let tracker = echo_tracker(echo_config(4));
    tracker.start().unwrap();

    for id in (0..100).rev() {
        enqueue_id(&tracker, id);
    }
    assert!(tracker.wait_idle(WAIT));

    let first = tracker.poll_finished(40, true);
    let rest = tracker.poll_finished(usize::MAX, true);
    assert_eq!(first.len() + rest.len(), 100);
    for batch in [&first, &rest] {
        assert!(batch.windows(2).all(|w| w[0].id < w[1].id));
    }
}

#[test]
fn test_reorder_with_two_workers() {
    let tracker = echo_tracker(echo_config(2));
    tracker.start().unwrap();

    for id in [5, 2, 8] {
        enqueue_id(&tracker, id);
    }
    assert!(tracker.wait_idle(WAIT));

    let ids: Vec<u64> = tracker
        .poll_finished(10, true)
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![2, 5, 8]);
}

#[test]
fn test_single_worker_preserves_admission_order() {
    let tracker = echo_tracker(echo_config(1));
    tracker.start().unwrap();
    tracker.pause(true).unwrap();

    for id in [5, 2, 8, 1] {
        enqueue_id(&tracker, id);
    }
    tracker.pause(false).unwrap();
    assert!(tracker.wait_idle(WAIT));

    let ids: Vec<u64> = tracker
        .poll_finished(10, false)
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![5, 2, 8, 1]);
}

#[test]
fn test_backpressure_counts_queued_jobs() {
    let tracker = echo_tracker(echo_config(2).queue_size(8));
    tracker.start().unwrap();
    tracker.pause(true).unwrap();

    for id in 0..7 {
        enqueue_id(&tracker, id);
    }
    assert!(!tracker.is_queue_filled());
    enqueue_id(&tracker, 7);
    assert!(tracker.is_queue_filled());

    // Soft limit: admission still succeeds past it
    enqueue_id(&tracker, 8);
    assert_eq!(tracker.job_count(), 9);
    assert!(!tracker.is_idle());

    tracker.pause(false).unwrap();
    assert!(tracker.wait_idle(WAIT));
    assert!(!tracker.is_queue_filled());
    assert_eq!(tracker.result_count(), 9);
}

#[test]
fn test_queue_size_one() {
    let tracker = echo_tracker(echo_config(1).queue_size(1));
    tracker.start().unwrap();
    tracker.pause(true).unwrap();

    assert!(!tracker.is_queue_filled());
    enqueue_id(&tracker, 0);
    assert!(tracker.is_queue_filled());

    tracker.pause(false).unwrap();
    assert!(tracker.wait_idle(WAIT));
    assert!(!tracker.is_queue_filled());
}

#[test]
fn test_paused_tracker_holds_jobs() {
    let tracker = echo_tracker(echo_config(2));
    tracker.start().unwrap();
    tracker.pause(true).unwrap();
    assert_eq!(tracker.state(), TrackerState::Paused);

    for id in 0..10 {
        enqueue_id(&tracker, id);
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(tracker.result_count(), 0);
    assert_eq!(tracker.job_count(), 10);

    tracker.pause(false).unwrap();
    assert!(tracker.wait_idle(WAIT));
    assert_eq!(tracker.result_count(), 10);
}

#[test]
fn test_idle_after_stop() {
    let tracker = echo_tracker(echo_config(2));
    tracker.start().unwrap();
    for id in 0..200 {
        enqueue_id(&tracker, id);
    }

    tracker.stop();
    assert_eq!(tracker.state(), TrackerState::Stopped);
    assert_eq!(tracker.job_count(), 0);
    assert!(tracker.is_idle());
    assert_eq!(tracker.pool_stats().in_use(), 0);

    // Results published before the stop stay available
    let results = tracker.poll_finished(usize::MAX, true);
    assert!(results.len() <= 200);
    assert!(enqueue_fails_after_stop(&tracker));
}

#[test]
fn test_stop_while_producers_enqueue() {
    for _ in 0..20 {
        let tracker = Arc::new(echo_tracker(echo_config(2)));
        tracker.start().unwrap();

        let producers: Vec<_> = (0..3)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    let mut admitted = 0usize;
                    while tracker
                        .enqueue(&flat_roi(1), ROI, PixelDataType::U8, JobInfo::default())
                        .is_ok()
                    {
                        admitted += 1;
                    }
                    admitted
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(2));
        tracker.stop();
        let admitted: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();

        // Every admitted job was either processed or discarded by stop
        assert_eq!(tracker.job_count(), 0);
        assert!(tracker.is_idle());
        assert_eq!(tracker.pool_stats().in_use(), 0);
        assert!(tracker.result_count() <= admitted);
    }
}

fn enqueue_fails_after_stop(tracker: &QueuedTracker) -> bool {
    tracker
        .enqueue(&flat_roi(1), ROI, PixelDataType::U8, JobInfo::default())
        .is_err()
}

#[test]
fn test_job_buffers_are_recycled() {
    let tracker = echo_tracker(echo_config(2));
    tracker.start().unwrap();

    for round in 0..5 {
        for id in 0..20 {
            enqueue_id(&tracker, round * 20 + id);
        }
        assert!(tracker.wait_idle(WAIT));
    }

    let stats = tracker.pool_stats();
    assert_eq!(stats.total_acquires, 100);
    assert_eq!(stats.total_recycles, 100);
    assert!(stats.allocated <= 20);
    assert_eq!(stats.in_use(), 0);
}

#[test]
fn test_zlut_swap_is_atomic_for_readers() {
    let tracker = Arc::new(echo_tracker(echo_config(4).queue_size(64)));
    let table_a = ZlutTable::from_data(vec![1.0; 4], 1, 1, 4, None).unwrap();
    let table_b = ZlutTable::from_data(vec![2.0; 8], 1, 2, 4, None).unwrap();
    tracker.set_zlut_table(table_a.clone()).unwrap();
    tracker.start().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let swapper = {
        let tracker = Arc::clone(&tracker);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut flip = false;
            while !done.load(Ordering::Relaxed) {
                let table = if flip { table_a.clone() } else { table_b.clone() };
                tracker.set_zlut_table(table).unwrap();
                flip = !flip;
            }
        })
    };

    for _ in 0..400 {
        while tracker.is_queue_filled() {
            thread::sleep(Duration::from_millis(1));
        }
        tracker
            .enqueue(&flat_roi(1), ROI, PixelDataType::U8, JobInfo::default().with_z())
            .unwrap();
    }
    assert!(tracker.wait_idle(WAIT));
    done.store(true, Ordering::Relaxed);
    swapper.join().unwrap();

    let results = tracker.poll_finished(usize::MAX, false);
    assert_eq!(results.len(), 400);
    for r in &results {
        // Table A: value 1 / 1 plane, table B: value 2 / 2 planes
        assert_eq!(r.pos.x, r.pos.y, "torn ZLUT read in job {}", r.id);
        assert_eq!(r.pos.z, 0.0);
    }
}

#[test]
fn test_concurrent_producer_and_consumer() {
    let tracker = Arc::new(echo_tracker(echo_config(3).queue_size(16)));
    tracker.start().unwrap();

    let producer = {
        let tracker = Arc::clone(&tracker);
        thread::spawn(move || {
            for id in 0..300 {
                while tracker.is_queue_filled() {
                    thread::sleep(Duration::from_millis(1));
                }
                enqueue_id(&tracker, id);
            }
        })
    };

    let mut seen = HashSet::new();
    while seen.len() < 300 {
        for result in tracker.poll_finished(32, true) {
            assert!(seen.insert(result.id), "duplicate result {}", result.id);
        }
        thread::sleep(Duration::from_millis(1));
    }
    producer.join().unwrap();
    assert!(tracker.wait_idle(WAIT));
    assert_eq!(tracker.result_count(), 0);
}

#[test]
fn test_direct_mode_publishes_before_return() {
    let tracker = echo_tracker(echo_config(0));
    assert_eq!(tracker.num_threads(), 0);

    for value in [3u8, 9, 4] {
        tracker
            .enqueue(&flat_roi(value), ROI, PixelDataType::U8, JobInfo::default())
            .unwrap();
        assert!(tracker.is_idle());
    }

    let xs: Vec<f32> = tracker
        .poll_finished(10, false)
        .iter()
        .map(|r| r.pos.x)
        .collect();
    assert_eq!(xs, vec![3.0, 9.0, 4.0]);
}

#[test]
fn test_pitched_input_with_padding() {
    let tracker = echo_tracker(echo_config(0));
    // 8 pixels of data + 8 bytes of padding per row; last row unpadded
    let pitch = 16;
    let mut buffer = vec![0xEEu8; pitch * (ROI - 1) + ROI];
    for row in 0..ROI {
        buffer[row * pitch..row * pitch + ROI].fill(6);
    }
    tracker
        .enqueue(&buffer, pitch, PixelDataType::U8, JobInfo::default())
        .unwrap();
    assert_eq!(tracker.poll_finished(1, false)[0].pos.x, 6.0);

    // Pitch smaller than a row is rejected
    assert!(tracker
        .enqueue(&buffer, 4, PixelDataType::U8, JobInfo::default())
        .is_err());
}

#[test]
fn test_schedule_frame_localizes_each_roi() {
    let config = TrackerConfig {
        idle_backoff_ms: 1,
        ..TrackerConfig::with_roi_size(16, 16).threads(2)
    };
    let tracker = QueuedTracker::new(config).unwrap();
    tracker.start().unwrap();

    // 48x16 frame, spots in the first and third 16x16 tile
    let (fw, fh) = (48, 16);
    let mut frame = vec![10u8; fw * fh];
    let left = spot(16, 16, 7.5, 8.0, 2.0);
    let right = spot(16, 16, 9.0, 6.5, 2.0);
    for y in 0..16 {
        frame[y * fw..y * fw + 16].copy_from_slice(&left[y * 16..y * 16 + 16]);
        frame[y * fw + 32..y * fw + 48].copy_from_slice(&right[y * 16..y * 16 + 16]);
    }

    let rois = [Roi::new(0, 0), Roi::new(32, 0)];
    let ids = tracker
        .schedule_frame(
            &frame,
            fw,
            fw,
            fh,
            &rois,
            PixelDataType::U8,
            JobInfo::for_frame(4).with_id(10),
        )
        .unwrap();
    assert_eq!(ids, vec![10, 11]);
    assert!(tracker.wait_idle(WAIT));

    let results = tracker.poll_finished(10, true);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.frame == 4 && r.status.is_ok()));
    assert_eq!((results[0].bead, results[1].bead), (0, 1));
    assert!((results[0].pos.x - 7.5).abs() < 0.5);
    assert!((results[0].pos.y - 8.0).abs() < 0.5);
    assert!((results[1].pos.x - 9.0).abs() < 0.5);
    assert!((results[1].pos.y - 6.5).abs() < 0.5);
}

#[test]
fn test_schedule_frame_rejects_roi_outside_frame() {
    let tracker = echo_tracker(echo_config(1));
    let frame = vec![0u8; 20 * 20];
    let rois = [Roi::new(0, 0), Roi::new(15, 0)];

    let err = tracker
        .schedule_frame(
            &frame,
            20,
            20,
            20,
            &rois,
            PixelDataType::U8,
            JobInfo::default(),
        )
        .unwrap_err();
    assert!(err.is_argument_error());
    // Validation happens before admission: nothing was queued
    assert_eq!(tracker.job_count(), 0);
}

#[test]
fn test_build_zlut_then_estimate_z() {
    let config = TrackerConfig {
        idle_backoff_ms: 1,
        zlut_radial_steps: 16,
        zlut_min_radius: 1.0,
        zlut_max_radius: 12.0,
        ..TrackerConfig::with_roi_size(32, 32).threads(2)
    };
    let tracker = QueuedTracker::new(config).unwrap();
    let planes = 6;
    tracker.set_zlut_table(ZlutTable::new(1, planes, 16)).unwrap();
    tracker.start().unwrap();

    // Spot width encodes z: plane p has sigma 2 + p
    let sigma = |plane: usize| 2.0 + plane as f32;
    for plane in 0..planes {
        let roi = spot(32, 32, 16.0, 16.0, sigma(plane));
        tracker
            .enqueue(
                &roi,
                32,
                PixelDataType::U8,
                JobInfo::default().building_zlut(plane as u32),
            )
            .unwrap();
    }
    assert!(tracker.wait_idle(WAIT));
    let built = tracker.poll_finished(usize::MAX, false);
    assert_eq!(built.len(), planes);
    assert!(built.iter().all(|r| r.status.is_ok()));

    let zlut = tracker.zlut();
    for plane in 0..planes {
        assert!(zlut.profile(0, plane).unwrap().iter().any(|&v| v != 0.0));
    }

    let sample = spot(32, 32, 15.5, 16.5, sigma(3));
    tracker
        .enqueue(&sample, 32, PixelDataType::U8, JobInfo::default().with_z())
        .unwrap();
    assert!(tracker.wait_idle(WAIT));

    let result = tracker.poll_finished(1, false)[0];
    assert!(result.status.is_ok());
    assert!((result.pos.z - 3.0).abs() < 0.75, "z = {}", result.pos.z);
}

#[test]
fn test_missing_zlut_is_reported_per_job() {
    let tracker = QueuedTracker::new(TrackerConfig {
        idle_backoff_ms: 1,
        ..TrackerConfig::with_roi_size(32, 32).threads(1)
    })
    .unwrap();
    tracker.start().unwrap();

    let roi = spot(32, 32, 16.0, 16.0, 3.0);
    tracker
        .enqueue(&roi, 32, PixelDataType::U8, JobInfo::default().with_z())
        .unwrap();
    assert!(tracker.wait_idle(WAIT));

    let result = tracker.poll_finished(1, false)[0];
    assert!(!result.status.is_ok());
    assert_eq!(tracker.state(), TrackerState::Running);
}
