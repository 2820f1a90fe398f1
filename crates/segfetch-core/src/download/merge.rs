//! Merge Worker (§4.H): copies every completed Segment's scratch file into
//! its place in the final file and removes the scratch files, once every
//! Segment has reached `Completed`.
//!
//! Runs on a dedicated `std::thread` talking over `std::sync::mpsc` command
//! and event channels; the Coordinator bridges that synchronous channel into
//! its own async world with a forwarding task. `merge_in_process` realizes
//! the identical copy routine as a plain `tokio::task` for hosts that set
//! `use_worker_thread = false`, yielding between batches instead of blocking
//! a whole OS thread on I/O.
//!
//! Both paths honour a cancel at batch boundaries (never mid-read): the
//! worker thread checks for a queued `MergeCommand::Cancel` between pieces,
//! the in-process fallback polls a shared `AtomicBool` the same way. Either
//! path reports `MergeOutcome::Cancelled` without deleting any scratch file
//! it had not already finished copying, so a later merge run starts over
//! cleanly.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::mpsc as tokio_mpsc;

use super::error::DownloadError;
use super::model::DownloadId;
use super::preallocate::preallocate_file;

/// Batch/buffer sizing for the copy loop (§6 `merge` config group).
#[derive(Debug, Clone, Copy)]
pub struct MergeRuntimeConfig {
    /// Bytes read from a scratch file per `read()` call.
    pub batch_bytes: usize,
    /// Upper bound on the reusable copy buffer's size; the buffer is sized
    /// to `min(batch_bytes, buffer_bytes)` so a larger `buffer_bytes` never
    /// allocates more than one batch actually needs.
    pub buffer_bytes: usize,
    /// How many batches the in-process fallback copies before yielding to
    /// the runtime. Ignored by the dedicated worker thread, which relies on
    /// ordinary OS preemption instead.
    pub yield_every_n_batches: u32,
}

impl Default for MergeRuntimeConfig {
    fn default() -> Self {
        Self { batch_bytes: 4 * 1024 * 1024, buffer_bytes: 8 * 1024 * 1024, yield_every_n_batches: 4 }
    }
}

impl MergeRuntimeConfig {
    fn copy_chunk(&self) -> usize {
        self.batch_bytes.min(self.buffer_bytes).max(1)
    }
}

/// Short pause the worker holds between its final progress{1.0} report and
/// its terminal `Completed` event, so a listener observing only the merge
/// channel still sees the 100% checkpoint land before the file is declared
/// done (§4.H).
const COMPLETION_GRACE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone)]
pub struct MergePiece {
    pub temp_path: PathBuf,
    pub start_byte: u64,
    pub len: u64,
}

/// How a merge run ended: either it wrote and verified the whole file, or a
/// `Cancel` was observed at a batch boundary and it exited early without
/// touching any scratch file it hadn't already finished copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug)]
pub enum MergeCommand {
    Merge {
        download_id: DownloadId,
        final_path: PathBuf,
        pieces: Vec<MergePiece>,
        total_size: u64,
        cfg: MergeRuntimeConfig,
    },
    /// Host-level cancel (§4.H). Checked between copy batches; a merge in
    /// flight finishes its current batch, emits `Cancelled`, and exits
    /// rather than stopping mid-write.
    Cancel,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum MergeEvent {
    Progress { download_id: DownloadId, bytes_merged: u64 },
    Completed { download_id: DownloadId },
    Failed { download_id: DownloadId, message: String },
    Cancelled { download_id: DownloadId },
}

/// Handle to a running Merge Worker thread.
pub struct MergeWorkerHandle {
    commands: std_mpsc::Sender<MergeCommand>,
    pub events: tokio_mpsc::Receiver<MergeEvent>,
    _forwarder: tokio::task::JoinHandle<()>,
    _thread: std::thread::JoinHandle<()>,
}

impl MergeWorkerHandle {
    pub fn submit(&self, cmd: MergeCommand) {
        let _ = self.commands.send(cmd);
    }
}

impl Drop for MergeWorkerHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(MergeCommand::Shutdown);
    }
}

/// Spawns the dedicated merge thread and a forwarding task that relays its
/// `std::sync::mpsc` events into a `tokio::sync::mpsc` channel the
/// Coordinator can `.recv().await` on.
pub fn spawn_worker() -> MergeWorkerHandle {
    let (cmd_tx, cmd_rx) = std_mpsc::channel::<MergeCommand>();
    let (evt_tx_std, evt_rx_std) = std_mpsc::channel::<MergeEvent>();
    let (evt_tx_tokio, evt_rx_tokio) = tokio_mpsc::channel::<MergeEvent>(64);

    let thread = std::thread::spawn(move || merge_thread_main(cmd_rx, evt_tx_std));

    let forwarder = tokio::task::spawn_blocking(move || {
        while let Ok(event) = evt_rx_std.recv() {
            if evt_tx_tokio.blocking_send(event).is_err() {
                break;
            }
        }
    });

    MergeWorkerHandle {
        commands: cmd_tx,
        events: evt_rx_tokio,
        _forwarder: tokio::task::spawn(async move {
            let _ = forwarder.await;
        }),
        _thread: thread,
    }
}

fn merge_thread_main(commands: std_mpsc::Receiver<MergeCommand>, events: std_mpsc::Sender<MergeEvent>) {
    loop {
        let cmd = match commands.recv() {
            Ok(cmd) => cmd,
            Err(_) => break,
        };
        match cmd {
            MergeCommand::Shutdown => break,
            // No merge in flight to cancel; a stray Cancel before any Merge
            // command is a no-op.
            MergeCommand::Cancel => continue,
            MergeCommand::Merge { download_id, final_path, pieces, total_size, cfg } => {
                let result = run_merge_algorithm(
                    &final_path,
                    &pieces,
                    total_size,
                    cfg,
                    |merged| {
                        let _ = events.send(MergeEvent::Progress { download_id, bytes_merged: merged });
                    },
                    || matches!(commands.try_recv(), Ok(MergeCommand::Cancel)),
                );
                match result {
                    Ok(MergeOutcome::Completed) => {
                        std::thread::sleep(COMPLETION_GRACE);
                        let _ = events.send(MergeEvent::Completed { download_id });
                    }
                    Ok(MergeOutcome::Cancelled) => {
                        let _ = events.send(MergeEvent::Cancelled { download_id });
                    }
                    Err(e) => {
                        let _ = events.send(MergeEvent::Failed { download_id, message: e.to_string() });
                    }
                }
            }
        }
    }
}

/// In-process fallback: identical copy routine, run as a plain async task
/// that yields to the runtime between pieces instead of occupying a thread.
pub async fn merge_in_process(
    download_id: DownloadId,
    final_path: PathBuf,
    pieces: Vec<MergePiece>,
    total_size: u64,
    cfg: MergeRuntimeConfig,
    mut should_cancel: impl FnMut() -> bool,
    mut on_event: impl FnMut(MergeEvent),
) -> Result<MergeOutcome, DownloadError> {
    let mut file = preallocate_file(&final_path, total_size)?;
    let mut merged = 0u64;
    let mut buf = vec![0u8; cfg.copy_chunk()];
    let mut batches_since_yield = 0u32;
    for piece in &pieces {
        match copy_piece(&mut file, piece, &mut buf, |_n| batches_since_yield += 1, &mut should_cancel) {
            Ok(()) => {}
            Err(DownloadError::Aborted) => {
                on_event(MergeEvent::Cancelled { download_id });
                return Ok(MergeOutcome::Cancelled);
            }
            Err(e) => return Err(e),
        }
        merged += piece.len;
        on_event(MergeEvent::Progress { download_id, bytes_merged: merged });
        if batches_since_yield >= cfg.yield_every_n_batches.max(1) {
            batches_since_yield = 0;
            tokio::task::yield_now().await;
        }
    }
    verify_and_cleanup(&mut file, &final_path, &pieces, total_size)?;
    tokio::time::sleep(COMPLETION_GRACE).await;
    Ok(MergeOutcome::Completed)
}

fn run_merge_algorithm(
    final_path: &std::path::Path,
    pieces: &[MergePiece],
    total_size: u64,
    cfg: MergeRuntimeConfig,
    mut on_progress: impl FnMut(u64),
    mut should_cancel: impl FnMut() -> bool,
) -> Result<MergeOutcome, DownloadError> {
    let mut file = preallocate_file(final_path, total_size)?;
    let mut merged = 0u64;
    let mut buf = vec![0u8; cfg.copy_chunk()];
    for piece in pieces {
        match copy_piece(&mut file, piece, &mut buf, |_n| {}, &mut should_cancel) {
            Ok(()) => {}
            Err(DownloadError::Aborted) => return Ok(MergeOutcome::Cancelled),
            Err(e) => return Err(e),
        }
        merged += piece.len;
        on_progress(merged);
    }
    verify_and_cleanup(&mut file, final_path, pieces, total_size)?;
    Ok(MergeOutcome::Completed)
}

/// Copies one scratch file into `final_file` at `piece.start_byte`, reusing
/// `buf` across calls. `on_batch` is invoked once per `buf`-sized read;
/// `should_cancel` is polled at each batch boundary (§4.H: "finishes its
/// current I/O batch" before honouring a cancel, never mid-read).
fn copy_piece(
    final_file: &mut File,
    piece: &MergePiece,
    buf: &mut [u8],
    mut on_batch: impl FnMut(usize),
    mut should_cancel: impl FnMut() -> bool,
) -> Result<(), DownloadError> {
    let mut src = File::open(&piece.temp_path)
        .map_err(|e| DownloadError::io("open scratch file for merge", piece.temp_path.clone(), e))?;
    final_file
        .seek(SeekFrom::Start(piece.start_byte))
        .map_err(|e| DownloadError::io("seek final file", piece.temp_path.clone(), e))?;

    let chunk = buf.len();
    let mut remaining = piece.len;
    while remaining > 0 {
        if should_cancel() {
            return Err(DownloadError::Aborted);
        }
        let want = remaining.min(chunk as u64) as usize;
        let n = src
            .read(&mut buf[..want])
            .map_err(|e| DownloadError::io("read scratch file", piece.temp_path.clone(), e))?;
        if n == 0 {
            return Err(DownloadError::SizeMismatch {
                expected: piece.len,
                actual: piece.len - remaining,
            });
        }
        final_file
            .write_all(&buf[..n])
            .map_err(|e| DownloadError::io("write final file", piece.temp_path.clone(), e))?;
        remaining -= n as u64;
        on_batch(n);
    }
    Ok(())
}

fn verify_and_cleanup(
    final_file: &mut File,
    final_path: &std::path::Path,
    pieces: &[MergePiece],
    total_size: u64,
) -> Result<(), DownloadError> {
    final_file
        .flush()
        .map_err(|e| DownloadError::io("flush final file", final_path.to_path_buf(), e))?;
    let actual = final_file
        .metadata()
        .map_err(|e| DownloadError::io("stat final file", final_path.to_path_buf(), e))?
        .len();
    if actual != total_size {
        return Err(DownloadError::SizeMismatch { expected: total_size, actual });
    }
    for piece in pieces {
        let _ = fs::remove_file(&piece.temp_path);
    }
    Ok(())
}
