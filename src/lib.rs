//! TrackSignal Server Library
//!
//! Collects platform signals for tracked artists and tracks, stores them as
//! immutable snapshots and raises viral alerts from the history.

pub mod admin;
pub mod background_jobs;
pub mod collector;
pub mod config;
pub mod detector;
pub mod inference;
pub mod job_store;
pub mod metrics;
pub mod normalizer;
pub mod signal_store;
pub mod sources;
pub mod sqlite_persistence;
pub mod velocity;

// Re-export commonly used types for convenience
pub use collector::{CollectionStats, SnapshotCollector};
pub use detector::{Detector, ScanStats};
pub use job_store::{JobStore, SqliteJobStore};
pub use signal_store::{SignalStore, SqliteSignalStore};
pub use sources::{SourceAdapter, SourceRegistry};
