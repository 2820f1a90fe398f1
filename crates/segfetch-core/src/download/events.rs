//! Event surface the Coordinator emits toward the host application.

use super::model::DownloadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatusTag {
    Pending,
    Fetching,
    /// Fetching, but resumed from a non-zero `bytes_written` rather than
    /// starting the segment from byte 0.
    Resumed,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    pub segment_index: usize,
    pub bytes_written: u64,
    pub range_len: u64,
    pub status: SegmentStatusTag,
    pub speed_bps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Probing,
    Fetching,
    Merging,
}

/// Emitted by the Progress Aggregator (through the Update Batcher's flush)
/// and at lifecycle transitions. One `DownloadListener::on_event` call per
/// emission; the host decides how to render or relay it.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Started {
        download_id: DownloadId,
        total_size: u64,
        segment_count: usize,
    },
    Progress {
        download_id: DownloadId,
        phase: DownloadPhase,
        downloaded_bytes: u64,
        total_size: u64,
        percent: f64,
        segments: Vec<SegmentSnapshot>,
        /// Set when this event bypassed the emission throttle (§4.E): the
        /// initial view, or any tick where a segment transitioned to
        /// `completed`. Listeners can treat it as "don't coalesce this one".
        force_immediate: bool,
    },
    SegmentRetrying {
        download_id: DownloadId,
        segment_index: usize,
        retry_count: u32,
        backoff: std::time::Duration,
    },
    BreakerOpened {
        download_id: DownloadId,
    },
    Paused {
        download_id: DownloadId,
    },
    Resumed {
        download_id: DownloadId,
    },
    Merging {
        download_id: DownloadId,
    },
    Completed {
        download_id: DownloadId,
        final_path: std::path::PathBuf,
    },
    Failed {
        download_id: DownloadId,
        message: String,
    },
    Cancelled {
        download_id: DownloadId,
    },
}

/// The host registers one of these to receive `DownloadEvent`s. Implementors
/// must not block: the Coordinator calls `on_event` inline on its own task.
pub trait DownloadListener: Send + Sync {
    fn on_event(&self, event: DownloadEvent);
}

/// A listener that discards every event; the default when the host doesn't
/// care to observe progress.
pub struct NullListener;

impl DownloadListener for NullListener {
    fn on_event(&self, _event: DownloadEvent) {}
}
