//! CLI for the segfetch download manager: a thin driver over the engine's
//! public `Coordinator` API (`add`, `start`, `pause`, `cancel`, `status`)
//! with no independent business logic of its own.

mod listener;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use segfetch_core::config;
use segfetch_core::download::{Coordinator, DownloadId, DownloadState, Store};

use listener::CliListener;

#[derive(Debug, Parser)]
#[command(name = "segfetch")]
#[command(about = "segfetch: parallel segmented download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Probe a URL, plan its segments, and start fetching immediately.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,
        /// Destination file path. Defaults to the URL's last path segment in the current directory.
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Resume a download that is idle, paused, or was interrupted by a crash.
    Start {
        /// Download identifier.
        id: i64,
    },

    /// Pause a running download. In-flight segments finish; pending ones stop.
    Pause {
        /// Download identifier.
        id: i64,
    },

    /// Cancel a download and delete its scratch files.
    Cancel {
        /// Download identifier.
        id: i64,
    },

    /// Show the status of one download, or every known download.
    Status {
        /// Download identifier. Omit to list every download.
        id: Option<i64>,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        let store = Arc::new(Store::open_default().await.context("opening segment state store")?);
        let listener = Arc::new(CliListener);
        let coordinator = Coordinator::new(Arc::clone(&store), listener, cfg.to_coordinator_config());

        match cli.command {
            CliCommand::Add { url, output } => {
                let destination = output.unwrap_or_else(|| default_output_path(&url));
                let id = coordinator.start_download(url, destination).await?;
                println!("download {id} registered");
                // The engine runs the fetch on a detached background task and
                // returns as soon as it's registered; this process is the
                // only thing keeping that task's runtime alive, so it has to
                // stay up until the download reaches a terminal state rather
                // than exit and abort the task mid-flight.
                wait_for_terminal_state(&store, id).await?;
            }
            CliCommand::Start { id } => {
                coordinator.resume_download(id).await?;
                wait_for_terminal_state(&store, id).await?;
            }
            CliCommand::Pause { id } => {
                coordinator.pause_download(id).await?;
            }
            CliCommand::Cancel { id } => {
                coordinator.cancel_download(id).await?;
            }
            CliCommand::Status { id } => {
                print_status(&store, id).await?;
            }
        }

        Ok(())
    }
}

/// Polls the store until `id` reaches a terminal state, so the process
/// stays alive long enough for the engine's background task to finish (and
/// for its progress lines, printed by the registered listener, to reach
/// stdout before the process exits).
async fn wait_for_terminal_state(store: &Store, id: DownloadId) -> Result<DownloadState> {
    loop {
        if let Some(record) = store.get_download(id).await? {
            if record.state.is_terminal() {
                return Ok(record.state);
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn default_output_path(url: &str) -> PathBuf {
    let name = url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("download");
    PathBuf::from(name)
}

async fn print_status(store: &Store, id: Option<DownloadId>) -> Result<()> {
    let records = match id {
        Some(id) => store.get_download(id).await?.into_iter().collect::<Vec<_>>(),
        None => store.list_downloads().await?,
    };
    if records.is_empty() {
        println!("no downloads found");
        return Ok(());
    }
    for record in records {
        let segments = store.list_segments(record.id).await?;
        let completed = segments.iter().filter(|s| s.is_complete()).count();
        println!(
            "[{}] {} -> {} ({:?}, {}/{} segments)",
            record.id,
            record.source_url,
            record.final_path.display(),
            record.state,
            completed,
            segments.len(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_path_uses_last_path_segment() {
        assert_eq!(default_output_path("https://example.com/files/archive.tar.gz"), PathBuf::from("archive.tar.gz"));
    }

    #[test]
    fn default_output_path_falls_back_when_url_has_no_segment() {
        assert_eq!(default_output_path("https://example.com/"), PathBuf::from("download"));
    }
}
