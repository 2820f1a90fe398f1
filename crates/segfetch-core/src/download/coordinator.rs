//! Download Coordinator (§4.G): the lifecycle owner. Probes the remote file,
//! plans Segments, drives Fetchers under an adaptive concurrency limit,
//! retries and pauses failing Segments, and hands off to the Merge Worker
//! once every Segment has landed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use super::aggregator::ProgressAggregator;
use super::batcher::UpdateBatcher;
use super::breaker::{Breaker, BreakerConfig};
use super::error::DownloadError;
use super::events::{DownloadEvent, DownloadListener, DownloadPhase};
use super::fetcher::{self, FetchFailure, FetcherConfig};
use super::merge::{self, MergeCommand, MergeEvent, MergePiece, MergeRuntimeConfig};
use super::model::{DownloadId, SegmentRecord, SegmentState};
use super::planner::{self, PlannerConfig};
use super::preallocate::preallocate_file;
use super::probe;
use super::store::Store;

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// If `false`, concurrency is held at `min_concurrent_segments` for the
    /// whole run; `adapt_concurrency` becomes a no-op.
    pub enabled: bool,
    /// Fraction of active Fetchers currently in the backpressure set above
    /// which concurrency is stepped down outright (§4.G: "> 50%").
    pub backpressure_high_watermark: f64,
    /// Fraction at or above which concurrency is stepped down even when
    /// throughput looks fine (§4.G's "ratio >= 30%" branch); also the upper
    /// bound a ratio must stay under for the throughput-driven step-up.
    pub backpressure_low_watermark: f64,
    /// Average active-segment throughput (bytes/sec) below which the
    /// Coordinator tries stepping concurrency up, provided backpressure is
    /// low.
    pub target_speed_per_segment: f64,
    pub step: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backpressure_high_watermark: 0.5,
            backpressure_low_watermark: 0.3,
            target_speed_per_segment: 1_000_000.0,
            step: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub min_concurrent_segments: usize,
    pub max_concurrent_segments: usize,
    pub planner: PlannerConfig,
    pub breaker: BreakerConfig,
    pub fetcher: FetcherConfig,
    pub retry_max: u32,
    pub progress_min_interval: Duration,
    pub update_batch_flush_interval: Duration,
    pub adaptive: AdaptiveConfig,
    pub use_worker_thread: bool,
    pub probe_connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub preallocate: bool,
    pub merge: MergeRuntimeConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_concurrent_segments: 2,
            max_concurrent_segments: 8,
            planner: PlannerConfig::default(),
            breaker: BreakerConfig::default(),
            fetcher: FetcherConfig::default(),
            retry_max: 5,
            progress_min_interval: Duration::from_millis(50),
            update_batch_flush_interval: Duration::from_secs(2),
            adaptive: AdaptiveConfig::default(),
            use_worker_thread: true,
            probe_connect_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(30),
            preallocate: true,
            merge: MergeRuntimeConfig::default(),
        }
    }
}

struct ActiveDownload {
    pause_requested: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct Coordinator {
    store: Arc<Store>,
    listener: Arc<dyn DownloadListener>,
    cfg: CoordinatorConfig,
    active: AsyncMutex<HashMap<DownloadId, ActiveDownload>>,
}

impl Coordinator {
    pub fn new(store: Arc<Store>, listener: Arc<dyn DownloadListener>, cfg: CoordinatorConfig) -> Self {
        Coordinator { store, listener, cfg, active: AsyncMutex::new(HashMap::new()) }
    }

    /// Probes `url`, plans its Segments, persists them, and spawns the fetch
    /// loop. Returns as soon as the Download is durably recorded; progress
    /// streams out through the registered `DownloadListener`.
    pub async fn start_download(&self, url: String, destination: PathBuf) -> Result<DownloadId, DownloadError> {
        let cfg = self.cfg.clone();
        let probe_result = {
            let url = url.clone();
            tokio::task::spawn_blocking(move || probe::probe(&url, cfg.probe_connect_timeout, cfg.probe_timeout))
                .await
                .map_err(|e| DownloadError::Network(e.to_string()))??
        };

        if probe_result.total_size == 0 {
            return Err(DownloadError::InvalidSize);
        }

        let download_id = self.store.create_download(&url, &destination, probe_result.total_size).await?;

        let ranges = if probe_result.range_supported {
            planner::plan(probe_result.total_size, &self.cfg.planner)?
        } else {
            vec![planner::PlannedRange { start_byte: 0, end_byte: probe_result.total_size - 1 }]
        };

        let records: Vec<SegmentRecord> = ranges
            .into_iter()
            .enumerate()
            .map(|(i, r)| SegmentRecord {
                segment_index: i,
                start_byte: r.start_byte,
                end_byte: r.end_byte,
                bytes_written: 0,
                state: SegmentState::Pending,
                temp_path: scratch_path(&destination, i),
                retry_count: 0,
                last_speed: 0.0,
            })
            .collect();

        self.store.create_segments(download_id, &records).await?;
        if self.cfg.preallocate {
            if let Err(e) = preallocate_file(&destination, probe_result.total_size) {
                tracing::warn!(download_id, error = %e, "preallocation failed, continuing without it");
            }
        }

        self.listener.on_event(DownloadEvent::Started {
            download_id,
            total_size: probe_result.total_size,
            segment_count: records.len(),
        });

        self.spawn_run(download_id, url, destination, probe_result.total_size).await?;
        Ok(download_id)
    }

    /// Resumes a Download that is `Paused`, `Failed`, or was left mid-flight
    /// by a crash (its row exists but no task is currently running it).
    pub async fn resume_download(&self, download_id: DownloadId) -> Result<(), DownloadError> {
        {
            let mut active = self.active.lock().await;
            if let Some(a) = active.get(&download_id) {
                if !a.handle.is_finished() {
                    return Ok(());
                }
                // The task behind this entry has already run to completion
                // (it reached a terminal state or paused itself); its handle
                // is stale and must not shadow a fresh run.
                active.remove(&download_id);
            }
        }
        let record = self
            .store
            .get_download(download_id)
            .await?
            .ok_or_else(|| DownloadError::Store(format!("no such download {download_id}")))?;
        let total_size = record.total_size;
        self.spawn_run(download_id, record.source_url, record.final_path, total_size).await?;
        self.listener.on_event(DownloadEvent::Resumed { download_id });
        Ok(())
    }

    pub async fn pause_download(&self, download_id: DownloadId) -> Result<(), DownloadError> {
        let mut active = self.active.lock().await;
        match active.get(&download_id) {
            Some(a) if !a.handle.is_finished() => {
                a.pause_requested.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(_) => {
                active.remove(&download_id);
                Err(DownloadError::Store(format!("download {download_id} is not running")))
            }
            None => Err(DownloadError::Store(format!("download {download_id} is not running"))),
        }
    }

    pub async fn cancel_download(&self, download_id: DownloadId) -> Result<(), DownloadError> {
        let mut active = self.active.lock().await;
        match active.get(&download_id) {
            Some(a) if !a.handle.is_finished() => {
                a.cancel_requested.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(_) => {
                active.remove(&download_id);
                drop(active);
                self.store.set_download_state(download_id, super::model::DownloadState::Cancelled).await?;
                Ok(())
            }
            None => {
                drop(active);
                self.store.set_download_state(download_id, super::model::DownloadState::Cancelled).await?;
                Ok(())
            }
        }
    }

    async fn spawn_run(
        &self,
        download_id: DownloadId,
        url: String,
        destination: PathBuf,
        total_size: u64,
    ) -> Result<(), DownloadError> {
        let pause_requested = Arc::new(AtomicBool::new(false));
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let store = Arc::clone(&self.store);
        let listener = Arc::clone(&self.listener);
        let cfg = self.cfg.clone();
        let pause_cb = Arc::clone(&pause_requested);
        let cancel_cb = Arc::clone(&cancel_requested);

        let handle = tokio::spawn(async move {
            let outcome = run_fetch_loop(
                download_id,
                url,
                destination,
                total_size,
                store.clone(),
                listener.clone(),
                cfg,
                pause_cb,
                cancel_cb,
            )
            .await;
            if let Err(e) = outcome {
                tracing::error!(download_id, error = %e, "download run ended with error");
                let _ = store.set_download_state(download_id, super::model::DownloadState::Failed).await;
                listener.on_event(DownloadEvent::Failed { download_id, message: e.to_string() });
            }
        });

        self.active.lock().await.insert(download_id, ActiveDownload { pause_requested, cancel_requested, handle });
        Ok(())
    }
}

fn scratch_path(destination: &std::path::Path, segment_index: usize) -> PathBuf {
    let dir = destination.parent().unwrap_or_else(|| std::path::Path::new("."));
    let name = destination.file_name().and_then(|n| n.to_str()).unwrap_or("download");
    dir.join(format!(".{name}.chunk{segment_index}"))
}

enum LoopExit {
    AllCompleted,
    Paused,
    Cancelled,
}

/// Per-segment backpressure bookkeeping for the adaptive-concurrency loop
/// (§4.G): "segments currently experiencing backpressure" age out of the set
/// after 2 s with no further increment of the Fetcher's backpressure counter.
struct BackpressureTrack {
    counter: Arc<AtomicU64>,
    last_seen: u64,
    last_change_at: Instant,
}

const BACKPRESSURE_AGE_OUT: Duration = Duration::from_secs(2);

#[allow(clippy::too_many_arguments)]
async fn run_fetch_loop(
    download_id: DownloadId,
    url: String,
    destination: PathBuf,
    total_size: u64,
    store: Arc<Store>,
    listener: Arc<dyn DownloadListener>,
    cfg: CoordinatorConfig,
    pause_requested: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
) -> Result<(), DownloadError> {
    let mut records = store.list_segments(download_id).await?;
    reconcile_scratch_files(&mut records);
    store.set_download_state(download_id, super::model::DownloadState::Downloading).await?;

    let mut aggregator = ProgressAggregator::new(total_size, &records, cfg.progress_min_interval);
    let mut batcher = UpdateBatcher::new(download_id, cfg.update_batch_flush_interval);
    let breaker = Arc::new(Breaker::new(cfg.breaker));

    // Step 4 of §4.G's start() sequence: an initial full-segment-set view
    // before any fetch slot is filled, forced past the emission throttle.
    if let Some(initial) = aggregator.poll(true) {
        listener.on_event(DownloadEvent::Progress {
            download_id,
            phase: DownloadPhase::Fetching,
            downloaded_bytes: initial.downloaded_bytes,
            total_size: initial.total_size,
            percent: initial.percent,
            segments: initial.segments,
            force_immediate: true,
        });
    }

    let mut pending: VecDeque<usize> = records
        .iter()
        .filter(|r| r.state != SegmentState::Completed)
        .map(|r| r.segment_index)
        .collect();
    let mut deferred: Vec<(usize, Instant)> = Vec::new();
    let mut by_index: HashMap<usize, SegmentRecord> = records.into_iter().map(|r| (r.segment_index, r)).collect();

    // §4.G: "current_concurrency ∈ [2, max_concurrent_segments], starts at
    // max" — the adaptive loop only ever steps down from there if backpressure
    // or slow throughput warrants it.
    let mut current_concurrency = cfg.max_concurrent_segments.max(cfg.min_concurrent_segments).max(1);
    let mut in_flight_progress: HashMap<usize, Arc<AtomicU64>> = HashMap::new();
    let mut resumed_segments: HashSet<usize> = HashSet::new();
    let mut backpressure_tracks: HashMap<usize, BackpressureTrack> = HashMap::new();
    let mut join_set: JoinSet<(usize, Result<fetcher::FetchOutcome, FetchFailure>)> = JoinSet::new();
    let mut breaker_blocked_emitted = false;
    let mut first_progress_emitted = true;

    let exit = loop {
        if cancel_requested.load(Ordering::SeqCst) {
            break LoopExit::Cancelled;
        }
        let mut segment_completed_this_tick = false;

        let now_deferred: Vec<usize> = {
            let now = Instant::now();
            let (ready, still_waiting): (Vec<_>, Vec<_>) = deferred.into_iter().partition(|(_, at)| *at <= now);
            deferred = still_waiting;
            ready.into_iter().map(|(i, _)| i).collect()
        };
        for i in now_deferred {
            pending.push_back(i);
        }

        let paused_requested = pause_requested.load(Ordering::SeqCst);
        if !paused_requested {
            while join_set.len() < current_concurrency {
                let Some(segment_index) = pending.pop_front() else { break };
                if breaker.check().is_err() {
                    pending.push_front(segment_index);
                    if !breaker_blocked_emitted {
                        listener.on_event(DownloadEvent::BreakerOpened { download_id });
                        breaker_blocked_emitted = true;
                    }
                    break;
                }
                breaker_blocked_emitted = false;
                let record = by_index.get(&segment_index).expect("segment tracked").clone();
                let progress = Arc::new(AtomicU64::new(record.bytes_written));
                let backpressure = Arc::new(AtomicU64::new(0));
                in_flight_progress.insert(segment_index, Arc::clone(&progress));
                backpressure_tracks.insert(
                    segment_index,
                    BackpressureTrack { counter: Arc::clone(&backpressure), last_seen: 0, last_change_at: Instant::now() },
                );
                by_index.get_mut(&segment_index).unwrap().state = SegmentState::Fetching;
                batcher.queue_state(segment_index, SegmentState::Fetching);
                let dispatch_tag = if record.bytes_written > 0 {
                    resumed_segments.insert(segment_index);
                    super::events::SegmentStatusTag::Resumed
                } else {
                    resumed_segments.remove(&segment_index);
                    super::events::SegmentStatusTag::Fetching
                };
                aggregator.record(segment_index, record.bytes_written, dispatch_tag);

                let fetch_url = url.clone();
                let fetch_cfg = cfg.fetcher;
                let fetch_pause = Arc::clone(&pause_requested);
                let fetch_cancel = Arc::clone(&cancel_requested);
                join_set.spawn(async move {
                    let result =
                        fetcher::fetch_segment(fetch_url, record, progress, backpressure, fetch_pause, fetch_cancel, fetch_cfg)
                            .await;
                    (segment_index, result)
                });
            }
        }

        if join_set.is_empty() {
            if pending.is_empty() && deferred.is_empty() {
                break LoopExit::AllCompleted;
            }
            if paused_requested {
                break LoopExit::Paused;
            }
            // Every in-flight Fetcher has drained, segments remain to send,
            // and none are waiting out a retry backoff: the only reason
            // nothing was dispatched this tick is the breaker rejecting
            // admission. §4.G: "on a Fetcher error, if the Breaker is open,
            // abort the whole Download" — with no in-flight stream left to
            // finish on its own, waiting any longer just spins forever.
            if !pending.is_empty() && deferred.is_empty() && breaker.is_open() {
                batcher.flush(&store).await?;
                return Err(DownloadError::BreakerOpen);
            }
            // nothing in flight but segments remain deferred (backoff) or
            // the breaker is blocking admission with a backoff still
            // outstanding: wait briefly and re-poll.
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        tokio::select! {
            Some(joined) = join_set.join_next() => {
                let (segment_index, result) = joined.map_err(|e| DownloadError::Store(e.to_string()))?;
                in_flight_progress.remove(&segment_index);
                resumed_segments.remove(&segment_index);
                backpressure_tracks.remove(&segment_index);
                match result {
                    Ok(outcome) => {
                        breaker.record_success();
                        let rec = by_index.get_mut(&segment_index).unwrap();
                        rec.bytes_written = outcome.bytes_written;
                        rec.state = SegmentState::Completed;
                        batcher.queue_progress(segment_index, outcome.bytes_written);
                        batcher.queue_state(segment_index, SegmentState::Completed);
                        aggregator.record(segment_index, outcome.bytes_written, super::events::SegmentStatusTag::Completed);
                        segment_completed_this_tick = true;
                        // a segment landing is exactly the moment the durable
                        // state should match the observed progress (§4.F).
                        batcher.flush(&store).await?;
                    }
                    Err(FetchFailure::Io(_)) | Err(FetchFailure::Aborted) | Err(FetchFailure::PrematureClose) => {
                        // `Aborted` is the Coordinator's own pause/cancel signal
                        // reaching back from the fetch it just stopped, and
                        // `PrematureClose` is a mid-stream disconnect with bytes
                        // still owed (§4.D) — neither is a transport failure, so
                        // no breaker record and no retry count bump (§4.G's
                        // pause semantics).
                        let rec = by_index.get_mut(&segment_index).unwrap();
                        rec.state = SegmentState::Paused;
                        batcher.queue_state(segment_index, SegmentState::Paused);
                        aggregator.record(segment_index, rec.bytes_written, super::events::SegmentStatusTag::Paused);
                        pending.push_back(segment_index);
                    }
                    Err(FetchFailure::Transport(e)) => {
                        breaker.record_failure();
                        let retryable = e.is_retryable();
                        let rec = by_index.get_mut(&segment_index).unwrap();
                        if retryable && rec.retry_count < cfg.retry_max {
                            rec.retry_count += 1;
                            batcher.queue_retry_count(segment_index, rec.retry_count);
                            let backoff = retry_backoff(rec.retry_count);
                            listener.on_event(DownloadEvent::SegmentRetrying {
                                download_id,
                                segment_index,
                                retry_count: rec.retry_count,
                                backoff,
                            });
                            deferred.push((segment_index, Instant::now() + backoff));
                        } else {
                            rec.state = SegmentState::Failed;
                            batcher.queue_state(segment_index, SegmentState::Failed);
                            batcher.flush(&store).await?;
                            return Err(e);
                        }
                    }
                }
            }
            _ = tokio::time::sleep(cfg.progress_min_interval) => {}
        }

        // Fold each in-flight segment's live byte counter into the
        // Aggregator so the periodic Progress event reflects mid-transfer
        // state, not just the byte counts seen at dispatch and completion.
        for (segment_index, progress) in in_flight_progress.iter() {
            let bytes_written = progress.load(Ordering::Relaxed);
            let tag = if resumed_segments.contains(segment_index) {
                super::events::SegmentStatusTag::Resumed
            } else {
                super::events::SegmentStatusTag::Fetching
            };
            aggregator.record(*segment_index, bytes_written, tag);
        }

        current_concurrency = adapt_concurrency(current_concurrency, &in_flight_progress, &mut backpressure_tracks, &aggregator, &cfg);

        let force_immediate = !first_progress_emitted || segment_completed_this_tick;
        if let Some(progress) = aggregator.poll(force_immediate) {
            first_progress_emitted = true;
            listener.on_event(DownloadEvent::Progress {
                download_id,
                phase: DownloadPhase::Fetching,
                downloaded_bytes: progress.downloaded_bytes,
                total_size: progress.total_size,
                percent: progress.percent,
                segments: progress.segments,
                force_immediate,
            });
            batcher.queue_download_progress(progress.percent, progress.downloaded_bytes);
        }
        if batcher.due() {
            batcher.flush(&store).await?;
        }
    };

    batcher.flush(&store).await?;

    match exit {
        LoopExit::Cancelled => {
            for rec in by_index.values() {
                let _ = std::fs::remove_file(&rec.temp_path);
            }
            store.set_download_state(download_id, super::model::DownloadState::Cancelled).await?;
            listener.on_event(DownloadEvent::Cancelled { download_id });
            Ok(())
        }
        LoopExit::Paused => {
            store.set_download_state(download_id, super::model::DownloadState::Paused).await?;
            listener.on_event(DownloadEvent::Paused { download_id });
            Ok(())
        }
        LoopExit::AllCompleted => {
            store.set_download_state(download_id, super::model::DownloadState::Merging).await?;
            listener.on_event(DownloadEvent::Merging { download_id });
            if let Some(p) = aggregator.poll(true) {
                listener.on_event(DownloadEvent::Progress {
                    download_id,
                    phase: DownloadPhase::Merging,
                    downloaded_bytes: p.downloaded_bytes,
                    total_size: p.total_size,
                    percent: p.percent,
                    segments: p.segments,
                    force_immediate: true,
                });
            }

            let pieces: Vec<MergePiece> = by_index
                .values()
                .map(|r| MergePiece { temp_path: r.temp_path.clone(), start_byte: r.start_byte, len: r.range_len() })
                .collect();

            let outcome = run_merge(
                download_id,
                destination.clone(),
                pieces,
                total_size,
                cfg.use_worker_thread,
                cfg.merge,
                &listener,
                &pause_requested,
                &cancel_requested,
            )
            .await?;

            match outcome {
                MergeWait::Cancelled if cancel_requested.load(Ordering::SeqCst) => {
                    // full cancel mid-merge: every segment was Completed and
                    // un-merged, so its scratch file is still on disk (merge
                    // only unlinks pieces once the whole pass verifies).
                    for rec in by_index.values() {
                        let _ = std::fs::remove_file(&rec.temp_path);
                    }
                    store.set_download_state(download_id, super::model::DownloadState::Cancelled).await?;
                    listener.on_event(DownloadEvent::Cancelled { download_id });
                    Ok(())
                }
                MergeWait::Cancelled => {
                    // pause mid-merge: segments stay Completed with their
                    // scratch files intact; a later start() re-enters this
                    // same merge from scratch (§9's "pause-while-merging").
                    store.set_download_state(download_id, super::model::DownloadState::Paused).await?;
                    listener.on_event(DownloadEvent::Paused { download_id });
                    Ok(())
                }
                MergeWait::Completed => {
                    // §4.H: the worker itself already waits a short grace
                    // after its own progress{1.0} before sending `complete`;
                    // the Coordinator mirrors that grace before its own
                    // terminal `Completed` event so a listener reading only
                    // Download-level events still observes the 100% progress
                    // checkpoint before completion.
                    tokio::time::sleep(Duration::from_millis(150)).await;

                    store.set_download_state(download_id, super::model::DownloadState::Completed).await?;
                    listener.on_event(DownloadEvent::Completed { download_id, final_path: destination });
                    Ok(())
                }
            }
        }
    }
}

/// How the merge run ended, distinguishing a normal completion from a
/// cancel observed mid-merge (§4.H) — a `Cancel` can be the Download's own
/// `cancel_download()`, or a `pause_download()` arriving while merging (see
/// DESIGN.md's "pause-while-merging" decision): either aborts the worker the
/// same way, but the Coordinator reacts differently to each afterward.
enum MergeWait {
    Completed,
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn run_merge(
    download_id: DownloadId,
    destination: PathBuf,
    pieces: Vec<MergePiece>,
    total_size: u64,
    use_worker_thread: bool,
    merge_cfg: MergeRuntimeConfig,
    listener: &Arc<dyn DownloadListener>,
    pause_requested: &Arc<AtomicBool>,
    cancel_requested: &Arc<AtomicBool>,
) -> Result<MergeWait, DownloadError> {
    let should_cancel = {
        let pause = Arc::clone(pause_requested);
        let cancel = Arc::clone(cancel_requested);
        move || pause.load(Ordering::SeqCst) || cancel.load(Ordering::SeqCst)
    };

    if use_worker_thread {
        let mut worker = merge::spawn_worker();
        worker.submit(MergeCommand::Merge { download_id, final_path: destination, pieces, total_size, cfg: merge_cfg });
        let mut cancel_sent = false;
        loop {
            if !cancel_sent && should_cancel() {
                worker.submit(MergeCommand::Cancel);
                cancel_sent = true;
            }
            tokio::select! {
                event = worker.events.recv() => {
                    match event {
                        Some(MergeEvent::Progress { .. }) => continue,
                        Some(MergeEvent::Completed { .. }) => return Ok(MergeWait::Completed),
                        Some(MergeEvent::Cancelled { .. }) => return Ok(MergeWait::Cancelled),
                        Some(MergeEvent::Failed { message, .. }) => return Err(DownloadError::Store(message)),
                        None => return Err(DownloadError::Store("merge worker exited unexpectedly".into())),
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)), if !cancel_sent => {}
            }
        }
    } else {
        match merge::merge_in_process(download_id, destination, pieces, total_size, merge_cfg, should_cancel, |_| {}).await {
            Ok(merge::MergeOutcome::Completed) => Ok(MergeWait::Completed),
            Ok(merge::MergeOutcome::Cancelled) => Ok(MergeWait::Cancelled),
            Err(e) => Err(e),
        }
    }
    .map_err(|e| {
        listener.on_event(DownloadEvent::Failed { download_id, message: e.to_string() });
        e
    })
}

fn retry_backoff(retry_count: u32) -> Duration {
    let secs = 1u64.saturating_shl(retry_count.saturating_sub(1).min(10));
    Duration::from_secs(secs.min(10))
}

/// Adaptive parallelism (§4.G): ages backpressure tracking entries, derives
/// the backpressure ratio and average active-segment throughput, and steps
/// `current_concurrency` per the three-branch rule in the component spec.
fn adapt_concurrency(
    current: usize,
    in_flight_progress: &HashMap<usize, Arc<AtomicU64>>,
    backpressure_tracks: &mut HashMap<usize, BackpressureTrack>,
    aggregator: &ProgressAggregator,
    cfg: &CoordinatorConfig,
) -> usize {
    if !cfg.adaptive.enabled {
        return current;
    }
    let active_count = in_flight_progress.len();
    if active_count == 0 {
        return current;
    }

    let now = Instant::now();
    let mut in_backpressure_set = 0usize;
    for (segment_index, track) in backpressure_tracks.iter_mut() {
        if !in_flight_progress.contains_key(segment_index) {
            continue;
        }
        let observed = track.counter.load(Ordering::Relaxed);
        if observed != track.last_seen {
            track.last_seen = observed;
            track.last_change_at = now;
        }
        if observed > 0 && now.duration_since(track.last_change_at) <= BACKPRESSURE_AGE_OUT {
            in_backpressure_set += 1;
        }
    }
    let ratio = in_backpressure_set as f64 / active_count as f64;
    let avg_speed = aggregator.active_average_speed();

    if ratio > cfg.adaptive.backpressure_high_watermark {
        current.saturating_sub(cfg.adaptive.step).max(cfg.min_concurrent_segments)
    } else if avg_speed < cfg.adaptive.target_speed_per_segment && ratio < cfg.adaptive.backpressure_low_watermark {
        (current + cfg.adaptive.step).min(cfg.max_concurrent_segments)
    } else if ratio >= cfg.adaptive.backpressure_low_watermark {
        current.saturating_sub(cfg.adaptive.step).max(cfg.min_concurrent_segments)
    } else {
        current
    }
}

/// A scratch file whose length no longer matches the store's recorded
/// `bytes_written` (missing entirely, truncated by an external actor, or
/// left over from a killed process mid-write) is reset to `Pending` rather
/// than trusted: the state store is the source of truth for intent, but the
/// filesystem is the source of truth for what bytes actually exist.
///
/// A `Completed` record is held to a stricter check: the scratch file must
/// still exist with exactly the expected length, otherwise the segment is
/// demoted back to `Pending` with `bytes_written` zeroed so the Coordinator
/// re-fetches it rather than handing a missing file to the Merge Worker.
fn reconcile_scratch_files(records: &mut [SegmentRecord]) {
    for rec in records.iter_mut() {
        let expected_len = rec.range_len();
        let actual_len = std::fs::metadata(&rec.temp_path).map(|m| m.len()).unwrap_or(0);
        match rec.state {
            SegmentState::Completed => {
                if actual_len < expected_len {
                    rec.bytes_written = 0;
                    rec.state = SegmentState::Pending;
                }
            }
            // No process can still be mid-fetch at reconcile time, and a
            // prior run left this one `Failed`: both unconditionally become
            // `Pending`, adopting whatever bytes made it to disk, even when
            // that happens to match the persisted count exactly.
            SegmentState::Fetching | SegmentState::Failed => {
                rec.bytes_written = actual_len.min(expected_len);
                rec.state = SegmentState::Pending;
            }
            SegmentState::Pending | SegmentState::Paused => {
                if actual_len != rec.bytes_written {
                    rec.bytes_written = actual_len.min(expected_len);
                    rec.state = SegmentState::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_caps_at_ten_seconds() {
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(2), Duration::from_secs(2));
        assert_eq!(retry_backoff(4), Duration::from_secs(8));
        assert_eq!(retry_backoff(10), Duration::from_secs(10));
        assert_eq!(retry_backoff(20), Duration::from_secs(10));
    }

    fn active_segment(index: usize) -> (HashMap<usize, Arc<AtomicU64>>, SegmentRecord) {
        let mut in_flight = HashMap::new();
        in_flight.insert(index, Arc::new(AtomicU64::new(0)));
        let rec = SegmentRecord {
            segment_index: index,
            start_byte: 0,
            end_byte: 99,
            bytes_written: 0,
            state: SegmentState::Fetching,
            temp_path: PathBuf::from("x"),
            retry_count: 0,
            last_speed: 0.0,
        };
        (in_flight, rec)
    }

    #[test]
    fn adaptive_concurrency_steps_up_when_slow_and_quiet() {
        let cfg = CoordinatorConfig::default();
        let (in_flight, rec) = active_segment(0);
        let agg = ProgressAggregator::new(1000, std::slice::from_ref(&rec), Duration::from_millis(0));
        let mut tracks = HashMap::new();
        let mut c = cfg.min_concurrent_segments;
        for _ in 0..10 {
            c = adapt_concurrency(c, &in_flight, &mut tracks, &agg, &cfg);
        }
        assert_eq!(c, cfg.max_concurrent_segments);
    }

    #[test]
    fn adaptive_concurrency_steps_down_under_sustained_backpressure() {
        let cfg = CoordinatorConfig::default();
        let (in_flight, rec) = active_segment(0);
        let agg = ProgressAggregator::new(1000, std::slice::from_ref(&rec), Duration::from_millis(0));
        let mut tracks = HashMap::new();
        tracks.insert(
            0,
            BackpressureTrack { counter: Arc::new(AtomicU64::new(5)), last_seen: 0, last_change_at: Instant::now() },
        );
        let mut c = cfg.max_concurrent_segments;
        for _ in 0..10 {
            c = adapt_concurrency(c, &in_flight, &mut tracks, &agg, &cfg);
        }
        assert_eq!(c, cfg.min_concurrent_segments);
    }

    #[test]
    fn disabled_adaptive_parallelism_holds_concurrency_fixed() {
        let mut cfg = CoordinatorConfig::default();
        cfg.adaptive.enabled = false;
        let (in_flight, rec) = active_segment(0);
        let agg = ProgressAggregator::new(1000, std::slice::from_ref(&rec), Duration::from_millis(0));
        let mut tracks = HashMap::new();
        let start = cfg.min_concurrent_segments;
        let mut c = start;
        for _ in 0..10 {
            c = adapt_concurrency(c, &in_flight, &mut tracks, &agg, &cfg);
        }
        assert_eq!(c, start);
    }

    #[test]
    fn adaptive_concurrency_is_a_no_op_with_no_active_segments() {
        let cfg = CoordinatorConfig::default();
        let in_flight: HashMap<usize, Arc<AtomicU64>> = HashMap::new();
        let rec = SegmentRecord {
            segment_index: 0,
            start_byte: 0,
            end_byte: 99,
            bytes_written: 0,
            state: SegmentState::Pending,
            temp_path: PathBuf::from("x"),
            retry_count: 0,
            last_speed: 0.0,
        };
        let agg = ProgressAggregator::new(1000, std::slice::from_ref(&rec), Duration::from_millis(0));
        let mut tracks = HashMap::new();
        let c = adapt_concurrency(cfg.max_concurrent_segments, &in_flight, &mut tracks, &agg, &cfg);
        assert_eq!(c, cfg.max_concurrent_segments);
    }

    #[test]
    fn reconcile_resets_segment_missing_its_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = vec![SegmentRecord {
            segment_index: 0,
            start_byte: 0,
            end_byte: 99,
            bytes_written: 50,
            state: SegmentState::Paused,
            temp_path: dir.path().join(".out.chunk0"),
            retry_count: 0,
            last_speed: 0.0,
        }];
        reconcile_scratch_files(&mut records);
        assert_eq!(records[0].bytes_written, 0);
        assert_eq!(records[0].state, SegmentState::Pending);
    }

    #[test]
    fn reconcile_resets_completed_segment_whose_scratch_file_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = vec![SegmentRecord {
            segment_index: 3,
            start_byte: 0,
            end_byte: 99,
            bytes_written: 100,
            state: SegmentState::Completed,
            temp_path: dir.path().join(".out.chunk3"),
            retry_count: 0,
            last_speed: 0.0,
        }];
        reconcile_scratch_files(&mut records);
        assert_eq!(records[0].bytes_written, 0);
        assert_eq!(records[0].state, SegmentState::Pending);
    }

    #[test]
    fn reconcile_trusts_completed_segment_whose_scratch_file_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".out.chunk3");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        let mut records = vec![SegmentRecord {
            segment_index: 3,
            start_byte: 0,
            end_byte: 99,
            bytes_written: 100,
            state: SegmentState::Completed,
            temp_path: path,
            retry_count: 0,
            last_speed: 0.0,
        }];
        reconcile_scratch_files(&mut records);
        assert_eq!(records[0].bytes_written, 100);
        assert_eq!(records[0].state, SegmentState::Completed);
    }

    #[test]
    fn reconcile_trusts_matching_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".out.chunk0");
        std::fs::write(&path, vec![0u8; 50]).unwrap();
        let mut records = vec![SegmentRecord {
            segment_index: 0,
            start_byte: 0,
            end_byte: 99,
            bytes_written: 50,
            state: SegmentState::Paused,
            temp_path: path,
            retry_count: 0,
            last_speed: 0.0,
        }];
        reconcile_scratch_files(&mut records);
        assert_eq!(records[0].bytes_written, 50);
        assert_eq!(records[0].state, SegmentState::Paused);
    }

    #[test]
    fn reconcile_always_resets_stale_fetching_even_when_bytes_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".out.chunk0");
        std::fs::write(&path, vec![0u8; 50]).unwrap();
        let mut records = vec![SegmentRecord {
            segment_index: 0,
            start_byte: 0,
            end_byte: 99,
            bytes_written: 50,
            state: SegmentState::Fetching,
            temp_path: path,
            retry_count: 0,
            last_speed: 0.0,
        }];
        reconcile_scratch_files(&mut records);
        assert_eq!(records[0].bytes_written, 50);
        assert_eq!(records[0].state, SegmentState::Pending);
    }

    #[test]
    fn reconcile_always_resets_failed_even_when_bytes_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".out.chunk0");
        std::fs::write(&path, vec![0u8; 30]).unwrap();
        let mut records = vec![SegmentRecord {
            segment_index: 0,
            start_byte: 0,
            end_byte: 99,
            bytes_written: 30,
            state: SegmentState::Failed,
            temp_path: path,
            retry_count: 2,
            last_speed: 0.0,
        }];
        reconcile_scratch_files(&mut records);
        assert_eq!(records[0].bytes_written, 30);
        assert_eq!(records[0].state, SegmentState::Pending);
    }
}
