//! Health monitoring and metrics for pipeline

use chrono::{DateTime, Local, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Health metrics for a pipeline
///
/// Written by the frame probe on the streaming thread, read by the
/// controlling loop. All fields use atomic operations for thread-safe access.
pub struct PipelineHealth {
    /// Number of buffers seen by the frame probe
    pub frames_processed: AtomicU64,

    /// Number of buffers that reached the probe without batch metadata
    pub frames_without_meta: AtomicU64,

    /// Number of detected objects inspected
    pub objects_seen: AtomicU64,

    /// Number of objects covered by a redaction patch
    pub objects_redacted: AtomicU64,

    /// Number of annotation files written
    pub annotation_files: AtomicU64,

    /// Number of annotation files that could not be opened or written
    pub annotation_failures: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last processed frame
    pub last_frame_time: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            frames_without_meta: AtomicU64::new(0),
            objects_seen: AtomicU64::new(0),
            objects_redacted: AtomicU64::new(0),
            annotation_files: AtomicU64::new(0),
            annotation_failures: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
        }
    }

    /// Record a buffer handled by the probe
    pub fn record_frame(&self, has_meta: bool) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        if !has_meta {
            self.frames_without_meta.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the objects of one frame
    pub fn record_objects(&self, seen: usize, redacted: usize) {
        self.objects_seen.fetch_add(seen as u64, Ordering::Relaxed);
        self.objects_redacted
            .fetch_add(redacted as u64, Ordering::Relaxed);
    }

    /// Record an annotation file outcome
    pub fn record_annotation(&self, ok: bool) {
        if ok {
            self.annotation_files.fetch_add(1, Ordering::Relaxed);
        } else {
            self.annotation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_without_meta(&self) -> u64 {
        self.frames_without_meta.load(Ordering::Relaxed)
    }

    pub fn objects_seen(&self) -> u64 {
        self.objects_seen.load(Ordering::Relaxed)
    }

    pub fn objects_redacted(&self) -> u64 {
        self.objects_redacted.load(Ordering::Relaxed)
    }

    pub fn annotation_files(&self) -> u64 {
        self.annotation_files.load(Ordering::Relaxed)
    }

    pub fn annotation_failures(&self) -> u64 {
        self.annotation_failures.load(Ordering::Relaxed)
    }

    /// Get the timestamp of the last frame (Unix microseconds)
    pub fn last_frame_time(&self) -> u64 {
        self.last_frame_time.load(Ordering::Relaxed)
    }

    /// Local wall-clock time of the last processed frame
    pub fn last_frame_at(&self) -> Option<DateTime<Local>> {
        DateTime::<Utc>::from_timestamp_micros(self.last_frame_time() as i64)
            .map(|at| at.with_timezone(&Local))
    }

    /// Check if the pipeline has stalled (no frames for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = now_micros().saturating_sub(self.last_frame_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_processed: self.frames_processed(),
            frames_without_meta: self.frames_without_meta(),
            objects_seen: self.objects_seen(),
            objects_redacted: self.objects_redacted(),
            annotation_files: self.annotation_files(),
            annotation_failures: self.annotation_failures(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub frames_processed: u64,
    pub frames_without_meta: u64,
    pub objects_seen: u64,
    pub objects_redacted: u64,
    pub annotation_files: u64,
    pub annotation_failures: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames ({} without metadata), {} objects ({} redacted), {} annotation files ({} failed)",
            self.frames_processed,
            self.frames_without_meta,
            self.objects_seen,
            self.objects_redacted,
            self.annotation_files,
            self.annotation_failures
        )
    }
}
