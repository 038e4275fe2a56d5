//! Reconciliation, orchestration and scheduling for the exchange entity sync.

use std::time::Duration;

use chrono::Utc;
use exsync_adapters::ExternalSourceError;
use exsync_storage::{PersistenceError, Store};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

mod config;
mod cron;
mod orchestrator;
mod participants;
mod pull;
mod reconcile;
mod scheduler;

pub use config::{JobKind, ScheduleRegistry, SourceApiConfig, SyncConfig, TriggerSpec};
pub use cron::{install_triggers, CronTriggers};
pub use orchestrator::{CaseSyncReport, CaseSyncer, EntityCounts};
pub use participants::{AssignmentSummary, ParticipantAssigner};
pub use pull::{PullSummary, RawCasePull};
pub use reconcile::{
    lookup_for, DuplicateHint, DuplicateReviewer, Reconciler, ReviewConfig, UpsertOutcome,
};
pub use scheduler::{
    BatchSettings, CaseFailure, RunAggregate, RunGuard, RunMode, RunPermit, SyncScheduler,
    SyncStatus, TriggerOutcome, TriggerResponse,
};

pub const CRATE_NAME: &str = "exsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("case {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    ExternalSource(#[from] ExternalSourceError),
    #[error("cancelled after {0:?}")]
    Cancelled(Duration),
}

impl SyncError {
    /// Short reason recorded on a failed sync log entry.
    pub fn log_reason(&self) -> String {
        match self {
            Self::NotFound(_) => "not_found".to_string(),
            Self::Cancelled(_) => "cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

/// Delete sync log entries started more than `retention_days` ago.
pub async fn purge_expired_logs(store: &dyn Store, retention_days: u32) -> Result<u64, PersistenceError> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let purged = store.purge_sync_logs(cutoff).await?;
    info!(purged, retention_days, "purged expired sync logs");
    Ok(purged)
}
