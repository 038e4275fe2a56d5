use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use exsync_adapters::extract;
use exsync_core::{CaseSyncStatus, PersonKind, PersonRecord, SyncLogEntry, SyncLogStatus, SyncTrigger};
use exsync_storage::{PersistenceError, Store};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::participants::ParticipantAssigner;
use crate::reconcile::{DuplicateHint, DuplicateReviewer, Reconciler};
use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Results payload of one completed pass, stored on its sync log entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseSyncReport {
    pub case_id: Uuid,
    pub candidates: usize,
    pub users: EntityCounts,
    pub contacts: EntityCounts,
    pub participants_added: usize,
    pub participants_skipped: usize,
    pub participants_failed: usize,
    pub primary_links_updated: usize,
    pub possible_duplicates: Vec<DuplicateHint>,
    pub errors: Vec<String>,
}

impl CaseSyncReport {
    pub fn entities_created(&self) -> usize {
        self.users.created + self.contacts.created
    }

    fn counts_mut(&mut self, kind: PersonKind) -> &mut EntityCounts {
        match kind {
            PersonKind::User => &mut self.users,
            PersonKind::Contact => &mut self.contacts,
        }
    }
}

/// Runs the per-case workflow and keeps its audit log entry.
#[derive(Clone)]
pub struct CaseSyncer {
    store: Arc<dyn Store>,
    reconciler: Reconciler,
    assigner: ParticipantAssigner,
    reviewer: DuplicateReviewer,
    case_timeout: Duration,
}

impl CaseSyncer {
    pub fn new(store: Arc<dyn Store>, case_timeout: Duration) -> Self {
        let reconciler = Reconciler::new(store.clone());
        Self {
            assigner: ParticipantAssigner::new(store.clone(), reconciler.clone()),
            reconciler,
            store,
            reviewer: DuplicateReviewer::default(),
            case_timeout,
        }
    }

    pub fn with_reviewer(mut self, reviewer: DuplicateReviewer) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// One orchestration pass for `case_id`.
    ///
    /// The log entry is written before anything else and always finalized:
    /// `completed` with the report, or `failed` with `not_found`, `cancelled`
    /// or the error message. The error is still returned to the caller.
    pub async fn sync_case(&self, case_id: Uuid, trigger: SyncTrigger) -> Result<CaseSyncReport, SyncError> {
        let span = info_span!("case_sync", %case_id, trigger = trigger.as_str());
        async move {
            let entry = SyncLogEntry::start(case_id, trigger, Utc::now());
            self.store.insert_sync_log(&entry).await?;

            let outcome = match tokio::time::timeout(self.case_timeout, self.run_steps(case_id)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SyncError::Cancelled(self.case_timeout)),
            };

            let outcome = match outcome {
                Ok(report) => self.finalize_completed(entry.id, &report).await.map(|()| report),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(report) => {
                    info!(
                        candidates = report.candidates,
                        created = report.entities_created(),
                        participants_added = report.participants_added,
                        "case synced"
                    );
                    Ok(report)
                }
                Err(err) => {
                    let reason = err.log_reason();
                    if let Err(finalize_err) = self
                        .store
                        .finalize_sync_log(entry.id, SyncLogStatus::Failed, Utc::now(), None, Some(&reason))
                        .await
                    {
                        error!(error = %finalize_err, "failed to finalize sync log");
                    }
                    warn!(error = %err, "case sync failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn finalize_completed(&self, log_id: Uuid, report: &CaseSyncReport) -> Result<(), SyncError> {
        let results = serde_json::to_value(report)
            .map_err(|err| PersistenceError::Serialization(err.to_string()))?;
        self.store
            .finalize_sync_log(log_id, SyncLogStatus::Completed, Utc::now(), Some(&results), None)
            .await?;
        Ok(())
    }

    async fn run_steps(&self, case_id: Uuid) -> Result<CaseSyncReport, SyncError> {
        let case = self
            .store
            .get_case(case_id)
            .await?
            .ok_or(SyncError::NotFound(case_id))?;

        let candidates = case.raw.as_ref().map(extract).unwrap_or_default();
        let mut report = CaseSyncReport {
            case_id,
            candidates: candidates.len(),
            ..Default::default()
        };

        for kind in [PersonKind::User, PersonKind::Contact] {
            for candidate in candidates
                .iter()
                .filter(|c| c.kind == kind && c.should_create_record)
            {
                match self.reconciler.upsert(candidate, case_id).await {
                    Ok(outcome) if outcome.created => {
                        report.counts_mut(kind).created += 1;
                        let hints = self.review_new(&outcome.record).await;
                        report.possible_duplicates.extend(hints);
                    }
                    Ok(_) => report.counts_mut(kind).updated += 1,
                    Err(err) => {
                        warn!(source = %candidate.source, error = %err, "upsert failed");
                        report.counts_mut(kind).failed += 1;
                        report.errors.push(format!("{}: {err}", candidate.source));
                    }
                }
            }
        }

        let assignment = self.assigner.assign_participants(&candidates, case_id).await;
        report.participants_added = assignment.added;
        report.participants_skipped = assignment.skipped;
        report.participants_failed = assignment.failed;
        report.errors.extend(assignment.errors);

        report.primary_links_updated = self.assigner.update_primary_links(&case, &candidates).await?;

        if let Err(err) = self
            .store
            .mark_case_synced(case_id, CaseSyncStatus::Completed, Utc::now())
            .await
        {
            warn!(error = %err, "could not record case sync timestamp");
        }

        Ok(report)
    }

    async fn review_new(&self, created: &PersonRecord) -> Vec<DuplicateHint> {
        let Some(initial) = created.display_name.trim().chars().next() else {
            return Vec::new();
        };
        match self
            .store
            .people_sharing_initial(created.kind, initial, self.reviewer.scan_limit())
            .await
        {
            Ok(existing) => self.reviewer.review(created, &existing),
            Err(err) => {
                warn!(error = %err, "duplicate review skipped");
                Vec::new()
            }
        }
    }
}
