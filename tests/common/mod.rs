//! Common test infrastructure
//!
//! Temporary stores, fake source adapters and a store wrapper whose snapshot
//! writes always fail. Tests should only import from this module.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{hours_ago, ChartTable, TestPipeline};
//!
//! #[test]
//! fn test_collect() {
//!     let pipeline = TestPipeline::new();
//!     let chart = ChartTable::new();
//!     pipeline.add_track("Song", "chart-1");
//!     chart.publish(hours_ago(1), &[("chart-1", 3)]);
//! }
//! ```

mod adapters;
mod fixtures;

#[allow(unused_imports)]
pub use adapters::{ChartTable, FailingWritesStore};
#[allow(unused_imports)]
pub use fixtures::{fast_collector_settings, hours_ago, TestPipeline};
