//! `DownloadListener` implementation that prints a progress line and a final
//! status to stdout. The only business logic here is formatting: every
//! decision about what happened lives in the engine.

use std::io::Write;

use segfetch_core::download::{DownloadEvent, DownloadListener};

pub struct CliListener;

impl DownloadListener for CliListener {
    fn on_event(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::Started { download_id, total_size, segment_count } => {
                println!(
                    "[{download_id}] starting: {:.1} MiB across {segment_count} segment(s)",
                    total_size as f64 / 1_048_576.0
                );
            }
            DownloadEvent::Progress { download_id, downloaded_bytes, total_size, percent, .. } => {
                print!(
                    "\r[{download_id}] {:.1} / {:.1} MiB ({:.1}%)  ",
                    downloaded_bytes as f64 / 1_048_576.0,
                    total_size as f64 / 1_048_576.0,
                    percent
                );
                let _ = std::io::stdout().flush();
            }
            DownloadEvent::SegmentRetrying { download_id, segment_index, retry_count, backoff } => {
                println!(
                    "\n[{download_id}] segment {segment_index} retrying (attempt {retry_count}, backoff {:?})",
                    backoff
                );
            }
            DownloadEvent::BreakerOpened { download_id } => {
                println!("\n[{download_id}] breaker open: pausing new requests to this endpoint");
            }
            DownloadEvent::Paused { download_id } => {
                println!("\n[{download_id}] paused");
            }
            DownloadEvent::Resumed { download_id } => {
                println!("\n[{download_id}] resumed");
            }
            DownloadEvent::Merging { download_id } => {
                println!("\n[{download_id}] merging segments into final file");
            }
            DownloadEvent::Completed { download_id, final_path } => {
                println!("\n[{download_id}] completed: {}", final_path.display());
            }
            DownloadEvent::Failed { download_id, message } => {
                println!("\n[{download_id}] failed: {message}");
            }
            DownloadEvent::Cancelled { download_id } => {
                println!("\n[{download_id}] cancelled");
            }
        }
    }
}
