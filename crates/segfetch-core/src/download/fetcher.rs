//! Segment Fetcher (§4.D): performs one Segment's Range GET against its own
//! scratch file, with a bounded channel standing in for the "downstream
//! file-write buffer" between the network read and the disk write.
//!
//! The curl transfer itself is synchronous (libcurl drives `write_function`
//! on its own stack), so it runs inside `spawn_blocking`. A dedicated writer
//! thread owns the scratch file's `File` handle; the curl callback hands it
//! chunks over a `std::sync::mpsc::sync_channel`. `try_send` is the
//! "is the writer ready" check; falling back to the blocking `send` when the
//! channel is full is the pause itself — it stalls libcurl's receive loop,
//! which is exactly the backpressure this component is responsible for.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use super::error::DownloadError;
use super::model::SegmentRecord;

/// A transport-layer failure (HTTP status, connection drop before any bytes
/// owed were lost, timeout, short clean stream end) is retried with backoff;
/// a local I/O failure pauses the Segment without touching its retry count;
/// an abort is the Coordinator reaching in mid-transfer because the Download
/// was paused or cancelled — same treatment as `Io`, but worth a distinct
/// name at the call site. `PrematureClose` is the connection dropping mid
/// range with bytes still owed (§4.D): paused like `Io`/`Aborted`, never
/// counted as a retry.
#[derive(Debug)]
pub enum FetchFailure {
    Transport(DownloadError),
    Io(DownloadError),
    Aborted,
    PrematureClose,
}

pub struct FetchOutcome {
    pub bytes_written: u64,
}

/// Segment length above which the write-buffer sizing rule (§4.D) doubles
/// the default depth; segments at or below it (the spec's "small" bucket
/// included) use the default unchanged.
const LARGE_SEGMENT_CUTOFF: u64 = 50 * 1024 * 1024;

/// Outbound headers for segment GETs (§6): browser-class `User-Agent`, an
/// open `Accept`, and `Connection: keep-alive` so a multi-segment download
/// doesn't pay a fresh TCP/TLS handshake per Range request.
pub(super) const USER_AGENT: &str = concat!("segfetch/", env!("CARGO_PKG_VERSION"));

fn apply_standard_headers(easy: &mut curl::easy::Easy) -> Result<(), curl::Error> {
    easy.useragent(USER_AGENT)?;
    let mut headers = curl::easy::List::new();
    headers.append("Accept: */*")?;
    headers.append("Connection: keep-alive")?;
    easy.http_headers(headers)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct FetcherConfig {
    pub min_write_buffer_chunks: usize,
    pub default_write_buffer_chunks: usize,
    pub max_write_buffer_chunks: usize,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            min_write_buffer_chunks: 2,
            default_write_buffer_chunks: 8,
            max_write_buffer_chunks: 32,
            connect_timeout: Duration::from_secs(15),
            timeout: Duration::from_secs(3600),
        }
    }
}

impl FetcherConfig {
    /// Per-segment write-buffer depth (§4.D): small segments use the
    /// default, large ones double it, both clamped to the configured
    /// `[min, max]` window.
    pub fn buffer_chunks_for(&self, range_len: u64) -> usize {
        let chunks = if range_len > LARGE_SEGMENT_CUTOFF {
            self.default_write_buffer_chunks.saturating_mul(2)
        } else {
            self.default_write_buffer_chunks
        };
        chunks.clamp(self.min_write_buffer_chunks, self.max_write_buffer_chunks.max(self.min_write_buffer_chunks))
    }
}

enum WriterMsg {
    Data(Vec<u8>),
    /// The server ignored the `Range` header and answered `200` instead of
    /// `206`: the transfer restarts from byte zero of this scratch file.
    Restart,
}

/// Fetches one Segment's remaining bytes (resuming from `segment.bytes_written`
/// if nonzero) and returns the total bytes now present in the scratch file.
///
/// Runs the blocking curl transfer in a background thread via
/// `spawn_blocking`; `progress` is updated live so the Progress Aggregator
/// can observe partial progress mid-transfer, not only on completion.
/// `backpressure` counts how many times the writer's channel was found full
/// (§4.D's "downstream file-write buffer not ready" signal) — the
/// Coordinator reads it to drive adaptive concurrency (§4.G). `pause_requested`
/// and `cancel_requested` are polled from inside the curl write callback; the
/// Coordinator flips one of them the moment a pause or cancel is requested,
/// which is what makes "aborts each active fetch" (§4.G) an actual
/// mid-transfer abort rather than a wait for the transfer to finish on its
/// own.
pub async fn fetch_segment(
    url: String,
    segment: SegmentRecord,
    progress: Arc<AtomicU64>,
    backpressure: Arc<AtomicU64>,
    pause_requested: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
    cfg: FetcherConfig,
) -> Result<FetchOutcome, FetchFailure> {
    tokio::task::spawn_blocking(move || {
        fetch_segment_blocking(&url, &segment, progress, backpressure, pause_requested, cancel_requested, cfg)
    })
    .await
    .unwrap_or_else(|e| Err(FetchFailure::Io(DownloadError::Store(format!("fetch task panicked: {e}")))))
}

fn fetch_segment_blocking(
    url: &str,
    segment: &SegmentRecord,
    progress: Arc<AtomicU64>,
    backpressure: Arc<AtomicU64>,
    pause_requested: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
    cfg: FetcherConfig,
) -> Result<FetchOutcome, FetchFailure> {
    let should_stop = || pause_requested.load(Ordering::Acquire) || cancel_requested.load(Ordering::Acquire);
    let (tx, writer_handle) = spawn_writer_thread(
        &segment.temp_path,
        segment.bytes_written,
        Arc::clone(&progress),
        cfg.buffer_chunks_for(segment.range_len()).max(1),
    )
    .map_err(FetchFailure::Io)?;

    let range_ok = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let range_checked = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let response_headers: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let expect_partial = segment.bytes_written > 0;

    let mut easy = curl::easy::Easy::new();
    let transport_result = (|| -> Result<u32, curl::Error> {
        easy.url(url)?;
        easy.follow_location(true)?;
        easy.connect_timeout(cfg.connect_timeout)?;
        easy.timeout(cfg.timeout)?;
        easy.low_speed_limit(512)?;
        easy.low_speed_time(Duration::from_secs(60))?;
        easy.range(&segment.range_header()[6..])?; // strip the leading "bytes="
        apply_standard_headers(&mut easy)?;

        {
            let headers_cb = Arc::clone(&response_headers);
            let range_ok_cb = Arc::clone(&range_ok);
            let range_checked_cb = Arc::clone(&range_checked);
            let backpressure_cb = Arc::clone(&backpressure);
            let pause_cb = Arc::clone(&pause_requested);
            let cancel_cb = Arc::clone(&cancel_requested);
            let tx_cb = tx.clone();
            let seg_start = segment.start_byte;
            let seg_end = segment.end_byte;

            let mut transfer = easy.transfer();
            transfer.header_function(move |data| {
                if let Ok(s) = str::from_utf8(data) {
                    let line = s.trim_end();
                    let mut headers = headers_cb.lock().unwrap();
                    if line.starts_with("HTTP/") {
                        headers.clear();
                    }
                    headers.push(line.to_string());
                }
                true
            })?;
            transfer.write_function(move |data| {
                if pause_cb.load(Ordering::Acquire) || cancel_cb.load(Ordering::Acquire) {
                    // Returning a short count tells curl the write failed,
                    // which aborts the transfer immediately — this is the
                    // mid-transfer abort itself, not a symptom of one.
                    return Ok(0);
                }
                if !range_checked_cb.load(Ordering::Acquire) {
                    let headers = headers_cb.lock().unwrap();
                    let status = parse_status(&headers);
                    let range_match = status == Some(206) && content_range_matches(&headers, seg_start, seg_end);
                    // A `200` is only a valid stand-in for `206` when this
                    // segment starts at byte zero: the whole-body response
                    // then happens to coincide with what this segment wants.
                    // For any other segment, a `200` means the server is no
                    // longer honouring `Range` and its bytes don't line up
                    // with this segment's offset.
                    let whole_body_ok = status == Some(200) && seg_start == 0;
                    if status == Some(200) && expect_partial {
                        // server ignored the resume Range: restart from zero.
                        let _ = tx_cb.send(WriterMsg::Restart);
                        range_ok_cb.store(seg_start == 0, Ordering::Release);
                    } else {
                        range_ok_cb.store(range_match || whole_body_ok, Ordering::Release);
                    }
                    range_checked_cb.store(true, Ordering::Release);
                }
                if !range_ok_cb.load(Ordering::Acquire) {
                    return Ok(0);
                }
                if tx_cb.try_send(WriterMsg::Data(data.to_vec())).is_err() {
                    // channel full: block until the writer drains it. this IS
                    // the pause of the inbound stream.
                    backpressure_cb.fetch_add(1, Ordering::Relaxed);
                    let stall_started = std::time::Instant::now();
                    if tx_cb.send(WriterMsg::Data(data.to_vec())).is_err() {
                        return Ok(0);
                    }
                    let stalled_for = stall_started.elapsed();
                    if stalled_for > Duration::from_millis(100) {
                        tracing::debug!(segment_start = seg_start, segment_end = seg_end, stalled_ms = stalled_for.as_millis() as u64, "drain episode exceeded 100ms");
                    }
                }
                Ok(data.len())
            })?;
            transfer.perform()?;
        }

        let code = easy.response_code()?;
        Ok(code)
    })();

    drop(tx);
    let final_bytes = writer_handle
        .join()
        .unwrap_or(Err(DownloadError::Store("writer thread panicked".into())))
        .map_err(FetchFailure::Io)?;

    let expected = segment.range_len();

    let code = match transport_result {
        Ok(code) => code,
        Err(_) if should_stop() => return Err(FetchFailure::Aborted),
        Err(e) if e.is_partial_file() && final_bytes < expected => return Err(FetchFailure::PrematureClose),
        Err(e) => return Err(FetchFailure::Transport(DownloadError::from(e))),
    };
    if !(200..300).contains(&code) {
        return Err(FetchFailure::Transport(DownloadError::HttpStatus { code }));
    }
    if !range_ok.load(Ordering::Acquire) {
        return Err(FetchFailure::Transport(DownloadError::RangeNotSupported));
    }

    if final_bytes < expected {
        return Err(FetchFailure::Transport(DownloadError::IncompleteSegment {
            expected,
            received: final_bytes,
        }));
    }

    // A server that ignores the requested end byte may hand back a few bytes
    // more than asked; clamp to the planned range so progress percentages
    // never read above 100%.
    Ok(FetchOutcome { bytes_written: final_bytes.min(expected) })
}

fn parse_status(lines: &[String]) -> Option<u32> {
    lines.iter().find(|l| l.starts_with("HTTP/")).and_then(|l| {
        l.split_whitespace().nth(1).and_then(|s| s.parse::<u32>().ok())
    })
}

fn content_range_matches(lines: &[String], start: u64, end: u64) -> bool {
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-range") {
                if let Some(spec) = value.trim().strip_prefix("bytes ") {
                    if let Some((range, _total)) = spec.split_once('/') {
                        if let Some((s, e)) = range.split_once('-') {
                            if let (Ok(s), Ok(e)) = (s.trim().parse::<u64>(), e.trim().parse::<u64>()) {
                                return s == start && e == end;
                            }
                        }
                    }
                }
            }
        }
    }
    false
}

/// Spawns the writer thread that owns this Segment's scratch file, returning
/// a sender for chunks and a join handle yielding the final byte count.
fn spawn_writer_thread(
    temp_path: &Path,
    resume_from: u64,
    progress: Arc<AtomicU64>,
    write_buffer_chunks: usize,
) -> Result<(SyncSender<WriterMsg>, std::thread::JoinHandle<Result<u64, DownloadError>>), DownloadError> {
    let temp_path: PathBuf = temp_path.to_path_buf();
    let mut file = File::options()
        .create(true)
        .write(true)
        .open(&temp_path)
        .map_err(|e| DownloadError::io("open scratch file", temp_path.clone(), e))?;
    file.seek(SeekFrom::Start(resume_from))
        .map_err(|e| DownloadError::io("seek scratch file", temp_path.clone(), e))?;

    let (tx, rx) = sync_channel::<WriterMsg>(write_buffer_chunks);
    progress.store(resume_from, Ordering::Relaxed);

    let handle = std::thread::spawn(move || -> Result<u64, DownloadError> {
        let mut written = resume_from;
        for msg in rx {
            match msg {
                WriterMsg::Restart => {
                    file.seek(SeekFrom::Start(0))
                        .map_err(|e| DownloadError::io("seek scratch file", temp_path.clone(), e))?;
                    file.set_len(0)
                        .map_err(|e| DownloadError::io("truncate scratch file", temp_path.clone(), e))?;
                    written = 0;
                    progress.store(0, Ordering::Relaxed);
                }
                WriterMsg::Data(chunk) => {
                    file.write_all(&chunk)
                        .map_err(|e| DownloadError::io("write scratch file", temp_path.clone(), e))?;
                    written += chunk.len() as u64;
                    progress.store(written, Ordering::Relaxed);
                }
            }
        }
        file.flush().map_err(|e| DownloadError::io("flush scratch file", temp_path.clone(), e))?;
        Ok(written)
    });

    Ok((tx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::model::SegmentState;

    /// Minimal one-shot 206 server for exercising `fetch_segment_blocking`
    /// without pulling in the integration suite's shared range server.
    fn start_one_shot_server(body: Vec<u8>) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                use std::io::{Read, Write};
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let header = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-{}/{}\r\nContent-Length: {}\r\n\r\n",
                    body.len() - 1,
                    body.len(),
                    body.len(),
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        format!("http://127.0.0.1:{port}/")
    }

    /// Advertises `full_len` in `Content-Length` but closes the connection
    /// after writing only `sent_len` bytes, the boundary condition from §8
    /// ("server drops the connection at 50% of the range").
    fn start_truncating_server(full_len: usize, sent_len: usize) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                use std::io::{Read, Write};
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let header = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-{}/{}\r\nContent-Length: {}\r\n\r\n",
                    full_len - 1,
                    full_len,
                    full_len,
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&vec![3u8; sent_len]);
                // drop the stream here, before the promised Content-Length is met
            }
        });
        format!("http://127.0.0.1:{port}/")
    }

    fn segment_record(dir: &std::path::Path, range_len: u64) -> SegmentRecord {
        SegmentRecord {
            segment_index: 0,
            start_byte: 0,
            end_byte: range_len - 1,
            bytes_written: 0,
            state: SegmentState::Pending,
            temp_path: dir.join("seg.chunk0"),
            retry_count: 0,
            last_speed: 0.0,
        }
    }

    #[test]
    fn fetch_aborts_immediately_when_pause_already_requested() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![7u8; 4096];
        let url = start_one_shot_server(body.clone());
        let segment = segment_record(dir.path(), body.len() as u64);

        let result = fetch_segment_blocking(
            &url,
            &segment,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            FetcherConfig::default(),
        );
        assert!(matches!(result, Err(FetchFailure::Aborted)));
    }

    #[test]
    fn fetch_aborts_immediately_when_cancel_already_requested() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![9u8; 4096];
        let url = start_one_shot_server(body.clone());
        let segment = segment_record(dir.path(), body.len() as u64);

        let result = fetch_segment_blocking(
            &url,
            &segment,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(true)),
            FetcherConfig::default(),
        );
        assert!(matches!(result, Err(FetchFailure::Aborted)));
    }

    #[test]
    fn mid_stream_close_pauses_without_transport_failure() {
        let dir = tempfile::tempdir().unwrap();
        let full_len = 4096;
        let url = start_truncating_server(full_len, full_len / 2);
        let segment = segment_record(dir.path(), full_len as u64);

        let result = fetch_segment_blocking(
            &url,
            &segment,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            FetcherConfig::default(),
        );
        assert!(matches!(result, Err(FetchFailure::PrematureClose)), "got {result:?}");
    }

    #[test]
    fn buffer_sizing_doubles_for_large_segments_and_holds_for_small() {
        let cfg = FetcherConfig::default();
        assert_eq!(cfg.buffer_chunks_for(1024 * 1024), cfg.default_write_buffer_chunks);
        assert_eq!(cfg.buffer_chunks_for(49 * 1024 * 1024), cfg.default_write_buffer_chunks);
        assert_eq!(cfg.buffer_chunks_for(51 * 1024 * 1024), cfg.default_write_buffer_chunks * 2);
    }

    #[test]
    fn buffer_sizing_clamps_to_configured_window() {
        let cfg = FetcherConfig { min_write_buffer_chunks: 2, default_write_buffer_chunks: 20, max_write_buffer_chunks: 24, ..FetcherConfig::default() };
        assert_eq!(cfg.buffer_chunks_for(100 * 1024 * 1024), 24, "doubled default clamps to max");
    }

    #[test]
    fn parse_status_reads_http_status_line() {
        let lines = vec!["HTTP/1.1 206 Partial Content".to_string()];
        assert_eq!(parse_status(&lines), Some(206));
    }

    #[test]
    fn content_range_matches_exact_bounds() {
        let lines = vec!["Content-Range: bytes 100-199/1000".to_string()];
        assert!(content_range_matches(&lines, 100, 199));
        assert!(!content_range_matches(&lines, 100, 200));
    }

    #[test]
    fn writer_thread_resumes_from_offset_and_tracks_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.chunk0");
        std::fs::write(&path, vec![1u8; 50]).unwrap();

        let progress = Arc::new(AtomicU64::new(0));
        let (tx, handle) = spawn_writer_thread(&path, 50, Arc::clone(&progress), 8).unwrap();
        tx.send(WriterMsg::Data(vec![2u8; 25])).unwrap();
        drop(tx);
        let total = handle.join().unwrap().unwrap();
        assert_eq!(total, 75);
        assert_eq!(progress.load(Ordering::Relaxed), 75);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 75);
    }

    #[test]
    fn writer_thread_restart_truncates_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.chunk0");
        std::fs::write(&path, vec![1u8; 50]).unwrap();

        let progress = Arc::new(AtomicU64::new(0));
        let (tx, handle) = spawn_writer_thread(&path, 50, Arc::clone(&progress), 8).unwrap();
        tx.send(WriterMsg::Restart).unwrap();
        tx.send(WriterMsg::Data(vec![9u8; 10])).unwrap();
        drop(tx);
        let total = handle.join().unwrap().unwrap();
        assert_eq!(total, 10);
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 10);
        assert!(contents.iter().all(|&b| b == 9));
    }
}
