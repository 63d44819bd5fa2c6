//! Chart positions and track popularity.
//!
//! The chart listing is fetched once per run by the chart adapter's cache;
//! every track with a chart identifier then gets its position (or nothing, if
//! it is not charting). Tracks with a Spotify identifier also get a
//! popularity snapshot, which feeds the popularity-gain viral signal.

use super::collection::run_collection;
use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
};
use crate::config::CollectorSettings;
use crate::signal_store::{EntityKind, Platform};
use serde_json::Value as JsonValue;

const PLATFORMS: [Platform; 2] = [Platform::Chart, Platform::Spotify];

pub struct ChartScrapeJob {
    schedule: JobSchedule,
    settings: CollectorSettings,
}

impl ChartScrapeJob {
    pub const ID: &'static str = "scrape_charts";

    pub fn new(schedule: JobSchedule, settings: CollectorSettings) -> Self {
        Self { schedule, settings }
    }
}

impl BackgroundJob for ChartScrapeJob {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn name(&self) -> &'static str {
        "Chart Scrape"
    }

    fn description(&self) -> &'static str {
        "Records chart positions and Spotify popularity for tracked tracks"
    }

    fn schedule(&self) -> JobSchedule {
        self.schedule.clone()
    }

    fn execute(&self, ctx: &JobContext) -> Result<JsonValue, JobError> {
        run_collection(self.id(), ctx, &self.settings, EntityKind::Track, &PLATFORMS)
    }
}
