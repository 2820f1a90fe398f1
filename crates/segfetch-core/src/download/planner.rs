//! Range Planner (§4.A): divides a total size into contiguous byte ranges.
//!
//! Pure function of `(total_size, config)` — no I/O, no randomness.

use super::error::DownloadError;

#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    pub min_segment_bytes: u64,
    /// Preferred segment count for files at or above `small_file_cutoff`,
    /// used as long as splitting into this many segments still keeps each
    /// one at or above `min_segment_bytes` (see `plan`'s doc comment for why
    /// this field is load-bearing, not inert).
    pub default_segments: usize,
    pub max_segments: usize,
    pub small_file_cutoff: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_segment_bytes: 5 * 1024 * 1024,
            default_segments: 4,
            max_segments: 16,
            small_file_cutoff: 10 * 1024 * 1024,
        }
    }
}

/// One planned byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRange {
    pub start_byte: u64,
    pub end_byte: u64,
}

/// Plans a segment layout for `total_size`. Fails with `InvalidSize` if
/// `total_size == 0` (the u64 realization of "total_size <= 0").
///
/// For files at or above `small_file_cutoff`, `default_segments` is used as
/// long as it keeps every segment at or above `min_segment_bytes`; only when
/// `default_segments` would make segments too small does the count fall back
/// to `floor(total_size / min_segment_bytes)`, both clamped to
/// `[2, max_segments]`. (`floor(total_size / min_segment_bytes)` alone would
/// pick the *maximum* segment count a file's size allows rather than the
/// preferred one — for a 40 MB file with `min_segment_bytes = 5 MB` that's 8
/// tiny segments, not the 4 ten-megabyte ones a default-segments-first reading
/// produces; see DESIGN.md's open-question note on this.)
pub fn plan(total_size: u64, cfg: &PlannerConfig) -> Result<Vec<PlannedRange>, DownloadError> {
    if total_size == 0 {
        return Err(DownloadError::InvalidSize);
    }

    let segment_count = if total_size < cfg.small_file_cutoff {
        2usize
    } else {
        let max_segments = cfg.max_segments.max(2);
        let preferred = cfg.default_segments.max(1);
        let min_segment_bytes = cfg.min_segment_bytes.max(1);
        if total_size / preferred as u64 >= min_segment_bytes {
            preferred.clamp(2, max_segments)
        } else {
            let raw = (total_size / min_segment_bytes) as usize;
            raw.clamp(2, max_segments)
        }
    };

    Ok(split_equal(total_size, segment_count))
}

/// Splits `total_size` into `segment_count` equal-width ranges, except the
/// last, which absorbs the remainder.
fn split_equal(total_size: u64, segment_count: usize) -> Vec<PlannedRange> {
    let segment_count = segment_count.max(1) as u64;
    let base = total_size / segment_count;
    let mut out = Vec::with_capacity(segment_count as usize);
    let mut start = 0u64;

    for i in 0..segment_count {
        let len = if i == segment_count - 1 {
            total_size - start
        } else {
            base
        };
        let end = start + len - 1;
        out.push(PlannedRange {
            start_byte: start,
            end_byte: end,
        });
        start += len;
    }

    out
}
