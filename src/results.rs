//! Localization results and the result buffer.
//!
//! Workers publish one [`LocalizationResult`] per job, in completion order. The
//! consumer drains the buffer with [`ResultBuffer::poll`], optionally sorting each
//! drained batch by job id to recover admission order.
//!
//! The buffer is unbounded: a consumer that never polls lets it grow without limit.

use crate::image::{Vec2, Vec3};
use crate::job::{JobId, JobInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Outcome of processing one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Position (and z, when requested) estimated
    #[default]
    Ok,
    /// ROI had no usable signal above background
    NoSignal,
    /// Z requested but the ZLUT holds no row for this bead
    ZlutMissing,
    /// Job referenced a bead/plane outside the ZLUT or mismatching profile size
    DimensionMismatch,
    /// Engine failed for another reason
    Failed,
}

impl ResultStatus {
    /// Whether the result carries a valid position.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == ResultStatus::Ok
    }
}

/// Published result of one job. Immutable once published.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalizationResult {
    /// Job id assigned at enqueue
    pub id: JobId,
    /// Source frame number
    pub frame: u32,
    /// Bead index
    pub bead: u32,
    /// Estimated position; z is in ZLUT planes when estimated
    pub pos: Vec3,
    /// Position before refinement
    pub first_guess: Vec2,
    /// Profile match residual (0 when z was not estimated)
    pub error: f32,
    /// Processing outcome
    pub status: ResultStatus,
}

impl LocalizationResult {
    /// Result of a job that failed before producing a position.
    #[must_use]
    pub fn failed(info: &JobInfo, status: ResultStatus) -> Self {
        Self {
            id: info.id_or_default(),
            frame: info.frame,
            bead: info.bead,
            pos: info.initial_pos,
            status,
            ..Default::default()
        }
    }
}

/// Buffer of completed results, drained by a polling consumer.
#[derive(Debug, Default)]
pub struct ResultBuffer {
    results: Mutex<VecDeque<LocalizationResult>>,
}

impl ResultBuffer {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result.
    pub fn publish(&self, result: LocalizationResult) {
        self.results.lock().push_back(result);
    }

    /// Remove up to `max_count` of the oldest results.
    ///
    /// With `sort_by_id` the removed batch is sorted by job id before it is
    /// returned; the buffer itself is not reordered.
    pub fn poll(&self, max_count: usize, sort_by_id: bool) -> Vec<LocalizationResult> {
        let mut batch: Vec<_> = {
            let mut results = self.results.lock();
            let count = max_count.min(results.len());
            results.drain(..count).collect()
        };
        if sort_by_id {
            batch.sort_by_key(|r| r.id);
        }
        batch
    }

    /// Discard all buffered results.
    pub fn clear(&self) {
        self.results.lock().clear();
    }

    /// Number of buffered results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    /// Whether no result is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: JobId) -> LocalizationResult {
        LocalizationResult {
            id,
            ..Default::default()
        }
    }

    #[test]
    fn test_poll_oldest_first() {
        let buffer = ResultBuffer::new();
        for id in [3, 1, 2, 0] {
            buffer.publish(result(id));
        }

        let batch = buffer.poll(2, false);
        assert_eq!(batch.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_poll_sorts_batch_only() {
        let buffer = ResultBuffer::new();
        for id in [8, 5, 2, 1] {
            buffer.publish(result(id));
        }

        // Only the 3 oldest are taken, then sorted
        let batch = buffer.poll(3, true);
        assert_eq!(batch.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 5, 8]);
        assert_eq!(buffer.poll(10, true)[0].id, 1);
    }

    #[test]
    fn test_poll_zero_and_clear() {
        let buffer = ResultBuffer::new();
        buffer.publish(result(1));
        assert!(buffer.poll(0, true).is_empty());
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_failed_result_keeps_metadata() {
        let info = JobInfo::for_frame(12).with_id(9).with_bead(4);
        let failed = LocalizationResult::failed(&info, ResultStatus::NoSignal);
        assert_eq!((failed.id, failed.frame, failed.bead), (9, 12, 4));
        assert!(!failed.status.is_ok());
    }

    #[test]
    fn test_serializes_status_snake_case() {
        let json = serde_json::to_string(&LocalizationResult::failed(
            &JobInfo::default(),
            ResultStatus::ZlutMissing,
        ))
        .unwrap();
        assert!(json.contains("\"status\":\"zlut_missing\""));
    }
}
