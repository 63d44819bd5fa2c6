//! Pipeline job implementations.
//!
//! Each job wraps one pipeline stage behind the `BackgroundJob` trait so it can
//! run on a cadence inside the server or once from `cli-jobs`.

mod artist_snapshots;
mod chart_scrape;
mod collection;
mod viral_detection;

pub use artist_snapshots::ArtistSnapshotsJob;
pub use chart_scrape::ChartScrapeJob;
pub use viral_detection::ViralDetectionJob;
