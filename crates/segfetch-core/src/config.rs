//! Engine configuration surface (§6): loaded from a TOML file under the
//! host's XDG config directory at startup, with every field defaulted if
//! the file or a given key is absent, and written back with defaults filled
//! in the first time the process runs with no existing file.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::download::{AdaptiveConfig, CoordinatorConfig, MergeRuntimeConfig};
use crate::download::breaker::BreakerConfig;
use crate::download::fetcher::FetcherConfig;
use crate::download::planner::PlannerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveParallelismConfig {
    pub enabled: bool,
    pub target_speed_per_segment: f64,
    pub backpressure_threshold: f64,
}

impl Default for AdaptiveParallelismConfig {
    fn default() -> Self {
        Self { enabled: true, target_speed_per_segment: 1_000_000.0, backpressure_threshold: 0.7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { enabled: true, failure_threshold: 10, success_threshold: 3, reset_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSettings {
    pub buffer_bytes: usize,
    pub batch_bytes: usize,
    pub yield_every_n_batches: u32,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self { buffer_bytes: 8 * 1024 * 1024, batch_bytes: 4 * 1024 * 1024, yield_every_n_batches: 4 }
    }
}

/// Global configuration loaded from `~/.config/segfetch/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegfetchConfig {
    pub max_concurrent_segments: usize,
    pub max_segments: usize,
    pub min_segment_bytes: u64,
    pub default_segments: usize,
    pub small_file_cutoff: u64,
    pub min_write_buffer: usize,
    pub max_write_buffer: usize,
    pub default_write_buffer: usize,
    pub retry_max: u32,
    pub progress_min_interval_ms: u64,
    pub update_batch_flush_ms: u64,
    pub adaptive_parallelism: AdaptiveParallelismConfig,
    pub breaker: BreakerSettings,
    pub preallocate: bool,
    pub use_worker_thread: bool,
    pub merge: MergeSettings,
}

impl Default for SegfetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_segments: 8,
            max_segments: 16,
            min_segment_bytes: 5 * 1024 * 1024,
            default_segments: 4,
            small_file_cutoff: 10 * 1024 * 1024,
            min_write_buffer: 2,
            max_write_buffer: 32,
            default_write_buffer: 8,
            retry_max: 5,
            progress_min_interval_ms: 50,
            update_batch_flush_ms: 2_000,
            adaptive_parallelism: AdaptiveParallelismConfig::default(),
            breaker: BreakerSettings::default(),
            preallocate: true,
            use_worker_thread: true,
            merge: MergeSettings::default(),
        }
    }
}

impl SegfetchConfig {
    /// Translates the host-facing TOML surface into the engine's internal
    /// `CoordinatorConfig`.
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            min_concurrent_segments: 2.min(self.max_concurrent_segments),
            max_concurrent_segments: self.max_concurrent_segments,
            planner: PlannerConfig {
                min_segment_bytes: self.min_segment_bytes,
                default_segments: self.default_segments,
                max_segments: self.max_segments,
                small_file_cutoff: self.small_file_cutoff,
            },
            breaker: BreakerConfig {
                enabled: self.breaker.enabled,
                failure_threshold: self.breaker.failure_threshold,
                open_duration: Duration::from_millis(self.breaker.reset_timeout_ms),
                success_threshold: self.breaker.success_threshold,
            },
            fetcher: FetcherConfig {
                min_write_buffer_chunks: self.min_write_buffer,
                default_write_buffer_chunks: self.default_write_buffer,
                max_write_buffer_chunks: self.max_write_buffer,
                connect_timeout: Duration::from_secs(15),
                timeout: Duration::from_secs(3600),
            },
            retry_max: self.retry_max,
            progress_min_interval: Duration::from_millis(self.progress_min_interval_ms),
            update_batch_flush_interval: Duration::from_millis(self.update_batch_flush_ms),
            adaptive: AdaptiveConfig {
                enabled: self.adaptive_parallelism.enabled,
                backpressure_high_watermark: self.adaptive_parallelism.backpressure_threshold,
                backpressure_low_watermark: self.adaptive_parallelism.backpressure_threshold * 0.3,
                target_speed_per_segment: self.adaptive_parallelism.target_speed_per_segment,
                step: 1,
            },
            use_worker_thread: self.use_worker_thread,
            probe_connect_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(10),
            preallocate: self.preallocate,
            merge: MergeRuntimeConfig {
                batch_bytes: self.merge.batch_bytes,
                buffer_bytes: self.merge.buffer_bytes,
                yield_every_n_batches: self.merge.yield_every_n_batches,
            },
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("segfetch")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SegfetchConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SegfetchConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SegfetchConfig = toml::from_str(&data)?;
    Ok(cfg)
}
