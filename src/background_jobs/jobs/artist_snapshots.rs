//! Periodic follower, popularity and listener snapshots for tracked artists.

use super::collection::run_collection;
use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule, ShutdownBehavior},
};
use crate::config::CollectorSettings;
use crate::signal_store::{EntityKind, Platform};
use serde_json::Value as JsonValue;

const PLATFORMS: [Platform; 2] = [Platform::Spotify, Platform::LastFm];

pub struct ArtistSnapshotsJob {
    schedule: JobSchedule,
    settings: CollectorSettings,
}

impl ArtistSnapshotsJob {
    pub const ID: &'static str = "collect_artists";

    pub fn new(schedule: JobSchedule, settings: CollectorSettings) -> Self {
        Self { schedule, settings }
    }
}

impl BackgroundJob for ArtistSnapshotsJob {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn name(&self) -> &'static str {
        "Artist Snapshots"
    }

    fn description(&self) -> &'static str {
        "Collects a Spotify and Last.fm snapshot for every tracked artist"
    }

    fn schedule(&self) -> JobSchedule {
        self.schedule.clone()
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    fn execute(&self, ctx: &JobContext) -> Result<JsonValue, JobError> {
        run_collection(self.id(), ctx, &self.settings, EntityKind::Artist, &PLATFORMS)
    }
}
