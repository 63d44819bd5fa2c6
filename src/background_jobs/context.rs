use crate::inference::TrackClassifier;
use crate::job_store::JobStore;
use crate::signal_store::SignalStore;
use crate::sources::SourceRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
///
/// Contains references to shared resources and a cancellation token
/// for graceful shutdown handling.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Entities, snapshots and alerts.
    pub signal_store: Arc<dyn SignalStore>,

    /// Job history, schedule state and audit log.
    pub job_store: Arc<dyn JobStore>,

    /// Configured source adapters.
    pub sources: SourceRegistry,

    /// Classifier used to enrich alert evidence.
    pub classifier: Arc<dyn TrackClassifier>,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        signal_store: Arc<dyn SignalStore>,
        job_store: Arc<dyn JobStore>,
        sources: SourceRegistry,
        classifier: Arc<dyn TrackClassifier>,
    ) -> Self {
        Self {
            cancellation_token,
            signal_store,
            job_store,
            sources,
            classifier,
        }
    }

    /// Same resources, different cancellation token.
    pub fn with_token(&self, cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            ..self.clone()
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
