//! Segmented download engine: partitions a remote file into byte ranges,
//! fetches them concurrently with crash-resumable progress, and reassembles
//! them into one file.
//!
//! [`Coordinator`] is the entry point; everything else in this module is a
//! component it drives (the Range Planner, Segment State Store, Failure
//! Breaker, Segment Fetcher, Progress Aggregator, Update Batcher, Merge
//! Worker, Range-Support Probe, and Preallocator).

pub mod aggregator;
pub mod batcher;
pub mod breaker;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod merge;
pub mod model;
pub mod planner;
pub mod preallocate;
pub mod probe;
pub mod store;

pub use coordinator::{AdaptiveConfig, Coordinator, CoordinatorConfig};
pub use error::DownloadError;
pub use events::{DownloadEvent, DownloadListener, DownloadPhase, NullListener, SegmentSnapshot, SegmentStatusTag};
pub use merge::MergeRuntimeConfig;
pub use model::{DownloadId, DownloadRecord, DownloadState, SegmentRecord, SegmentState};
pub use store::Store;
