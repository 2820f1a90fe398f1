//! Domain model for a segmented download: the Download and its Segments.

use std::path::PathBuf;

/// Stable identifier for a Download (its row id in the segment state store).
pub type DownloadId = i64;

/// Lifecycle state of a Download. Transitions form a DAG:
/// `idle -> downloading <-> paused`, `downloading -> merging -> completed`,
/// any non-terminal -> `failed|cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    Idle,
    Downloading,
    Paused,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Idle => "idle",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Merging => "merging",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "downloading" => DownloadState::Downloading,
            "paused" => DownloadState::Paused,
            "merging" => DownloadState::Merging,
            "completed" => DownloadState::Completed,
            "failed" => DownloadState::Failed,
            "cancelled" => DownloadState::Cancelled,
            _ => DownloadState::Idle,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

/// Lifecycle state of one Segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    Pending,
    Fetching,
    Paused,
    Completed,
    Failed,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Pending => "pending",
            SegmentState::Fetching => "fetching",
            SegmentState::Paused => "paused",
            SegmentState::Completed => "completed",
            SegmentState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "fetching" => SegmentState::Fetching,
            "paused" => SegmentState::Paused,
            "completed" => SegmentState::Completed,
            "failed" => SegmentState::Failed,
            _ => SegmentState::Pending,
        }
    }
}

/// One contiguous byte range of a Download, with inclusive `start_byte`/`end_byte`
/// (HTTP-Range style), owned exclusively by its Fetcher while `Fetching`.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub segment_index: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub bytes_written: u64,
    pub state: SegmentState,
    pub temp_path: PathBuf,
    pub retry_count: u32,
    pub last_speed: f64,
}

impl SegmentRecord {
    /// Length of this segment's byte range, inclusive on both ends.
    pub fn range_len(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    /// `Range:` header value for resuming from the current `bytes_written` offset.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start_byte + self.bytes_written, self.end_byte)
    }

    pub fn is_complete(&self) -> bool {
        self.state == SegmentState::Completed
    }
}

/// One remote file acquisition: the parent of a set of Segments.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub source_url: String,
    pub final_path: PathBuf,
    pub total_size: u64,
    pub segment_count: usize,
    pub state: DownloadState,
}
