//! Progress Aggregator (§4.E): folds per-segment byte counters into one
//! overall Download progress view, throttled so the Coordinator doesn't emit
//! an event on every single chunk.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::events::{DownloadPhase, SegmentSnapshot, SegmentStatusTag};
use super::model::SegmentRecord;

/// Per-segment runtime counters the Aggregator tracks between flushes, kept
/// separate from the persisted `SegmentRecord` so a speed estimate never
/// needs a store round-trip.
#[derive(Debug, Clone)]
pub struct SegmentRuntime {
    pub bytes_written: u64,
    pub range_len: u64,
    pub status: SegmentStatusTag,
    last_sample_at: Instant,
    last_sample_bytes: u64,
    speed_bps: f64,
}

impl SegmentRuntime {
    pub fn new(record: &SegmentRecord) -> Self {
        SegmentRuntime {
            bytes_written: record.bytes_written,
            range_len: record.range_len(),
            status: status_tag(record),
            last_sample_at: Instant::now(),
            last_sample_bytes: record.bytes_written,
            speed_bps: 0.0,
        }
    }

    /// Updates the running byte count and recomputes a smoothed throughput
    /// estimate (simple delta-over-wall-clock, no exponential smoothing:
    /// matches the Aggregator's stated job of a "fold", not a forecaster).
    pub fn observe(&mut self, bytes_written: u64, status: SegmentStatusTag) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_at);
        if elapsed >= Duration::from_millis(200) {
            let delta = bytes_written.saturating_sub(self.last_sample_bytes);
            self.speed_bps = delta as f64 / elapsed.as_secs_f64().max(0.001);
            self.last_sample_at = now;
            self.last_sample_bytes = bytes_written;
        }
        self.bytes_written = bytes_written;
        self.status = status;
    }

    pub fn snapshot(&self, segment_index: usize) -> SegmentSnapshot {
        SegmentSnapshot {
            segment_index,
            bytes_written: self.bytes_written,
            range_len: self.range_len,
            status: self.status,
            speed_bps: self.speed_bps,
        }
    }
}

fn status_tag(record: &SegmentRecord) -> SegmentStatusTag {
    use super::model::SegmentState::*;
    match record.state {
        Pending => SegmentStatusTag::Pending,
        Fetching => SegmentStatusTag::Fetching,
        Paused => SegmentStatusTag::Paused,
        Completed => SegmentStatusTag::Completed,
        Failed => SegmentStatusTag::Failed,
    }
}

/// Folds every Segment's runtime state into one view, and decides (via
/// `EmissionGate`) whether the Coordinator should actually emit a `Progress`
/// event for the current tick.
pub struct ProgressAggregator {
    total_size: u64,
    phase: DownloadPhase,
    segments: BTreeMap<usize, SegmentRuntime>,
    gate: EmissionGate,
}

impl ProgressAggregator {
    pub fn new(total_size: u64, records: &[SegmentRecord], min_interval: Duration) -> Self {
        let segments = records
            .iter()
            .map(|r| (r.segment_index, SegmentRuntime::new(r)))
            .collect();
        ProgressAggregator {
            total_size,
            phase: DownloadPhase::Fetching,
            segments,
            gate: EmissionGate::new(min_interval),
        }
    }

    pub fn set_phase(&mut self, phase: DownloadPhase) {
        self.phase = phase;
    }

    pub fn record(&mut self, segment_index: usize, bytes_written: u64, status: SegmentStatusTag) {
        if let Some(runtime) = self.segments.get_mut(&segment_index) {
            runtime.observe(bytes_written, status);
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.bytes_written).sum()
    }

    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.downloaded_bytes() as f64 / self.total_size as f64) * 100.0
    }

    pub fn segment_snapshots(&self) -> Vec<SegmentSnapshot> {
        self.segments
            .iter()
            .map(|(idx, runtime)| runtime.snapshot(*idx))
            .collect()
    }

    /// Mean throughput across currently-`Fetching` segments; `0.0` if none
    /// are active. Feeds the adaptive-concurrency speed check (§4.G).
    pub fn active_average_speed(&self) -> f64 {
        let active: Vec<&SegmentRuntime> = self
            .segments
            .values()
            .filter(|s| matches!(s.status, SegmentStatusTag::Fetching | SegmentStatusTag::Resumed))
            .collect();
        if active.is_empty() {
            return 0.0;
        }
        active.iter().map(|s| s.speed_bps).sum::<f64>() / active.len() as f64
    }

    /// Returns `Some(snapshot-ready-to-emit)` if the emission gate allows a
    /// flush right now; `force_immediate` bypasses the throttle for events
    /// that must reach the host without delay (state transitions, errors).
    pub fn poll(&mut self, force_immediate: bool) -> Option<AggregatedProgress> {
        if !force_immediate && !self.gate.ready() {
            return None;
        }
        self.gate.mark_emitted();
        Some(AggregatedProgress {
            phase: self.phase,
            downloaded_bytes: self.downloaded_bytes(),
            total_size: self.total_size,
            percent: self.percent(),
            segments: self.segment_snapshots(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AggregatedProgress {
    pub phase: DownloadPhase,
    pub downloaded_bytes: u64,
    pub total_size: u64,
    pub percent: f64,
    pub segments: Vec<SegmentSnapshot>,
}

/// Throttle gate: admits an emission only once `min_interval` has elapsed
/// since the last one, unless bypassed.
struct EmissionGate {
    min_interval: Duration,
    last_emitted: Option<Instant>,
}

impl EmissionGate {
    fn new(min_interval: Duration) -> Self {
        EmissionGate { min_interval, last_emitted: None }
    }

    fn ready(&self) -> bool {
        match self.last_emitted {
            None => true,
            Some(t) => t.elapsed() >= self.min_interval,
        }
    }

    fn mark_emitted(&mut self) {
        self.last_emitted = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn seg(i: usize, len: u64) -> SegmentRecord {
        SegmentRecord {
            segment_index: i,
            start_byte: 0,
            end_byte: len - 1,
            bytes_written: 0,
            state: super::super::model::SegmentState::Pending,
            temp_path: PathBuf::from("x"),
            retry_count: 0,
            last_speed: 0.0,
        }
    }

    #[test]
    fn percent_reflects_sum_of_segments() {
        let records = vec![seg(0, 100), seg(1, 100)];
        let mut agg = ProgressAggregator::new(200, &records, Duration::from_millis(0));
        agg.record(0, 50, SegmentStatusTag::Fetching);
        agg.record(1, 50, SegmentStatusTag::Fetching);
        assert_eq!(agg.downloaded_bytes(), 100);
        assert_eq!(agg.percent(), 50.0);
    }

    #[test]
    fn gate_throttles_unless_forced() {
        let records = vec![seg(0, 100)];
        let mut agg = ProgressAggregator::new(100, &records, Duration::from_secs(60));
        assert!(agg.poll(false).is_some(), "first poll always emits");
        agg.record(0, 10, SegmentStatusTag::Fetching);
        assert!(agg.poll(false).is_none(), "throttled within min_interval");
        assert!(agg.poll(true).is_some(), "force_immediate bypasses the gate");
    }
}
