use std::sync::Arc;

use chrono::Utc;
use exsync_core::{CandidateEntity, Case, CaseLinkPatch, ParticipantLink, ParticipantRef};
use exsync_storage::{PersistenceError, Store};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::reconcile::Reconciler;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSummary {
    pub added: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Adds each participant-flagged candidate to the case exactly once.
#[derive(Clone)]
pub struct ParticipantAssigner {
    store: Arc<dyn Store>,
    reconciler: Reconciler,
}

impl ParticipantAssigner {
    pub fn new(store: Arc<dyn Store>, reconciler: Reconciler) -> Self {
        Self { store, reconciler }
    }

    /// Failures are recorded per candidate and never stop the loop.
    pub async fn assign_participants(
        &self,
        candidates: &[CandidateEntity],
        case_id: Uuid,
    ) -> AssignmentSummary {
        let mut summary = AssignmentSummary::default();

        for candidate in candidates.iter().filter(|c| c.should_add_as_participant) {
            match self.assign_one(candidate, case_id).await {
                Ok(true) => summary.added += 1,
                Ok(false) => summary.skipped += 1,
                Err(err) => {
                    warn!(%case_id, source = %candidate.source, error = %err, "participant assignment failed");
                    summary.failed += 1;
                    summary.errors.push(format!("{}: {err}", candidate.source));
                }
            }
        }

        summary
    }

    async fn assign_one(
        &self,
        candidate: &CandidateEntity,
        case_id: Uuid,
    ) -> Result<bool, PersistenceError> {
        let person = self
            .reconciler
            .find_existing(candidate)
            .await?
            .ok_or_else(|| PersistenceError::Backend("no person record for candidate".to_string()))?;
        let person_ref = ParticipantRef::for_person(&person);

        if self
            .store
            .find_active_participant(case_id, person_ref)
            .await?
            .is_some()
        {
            debug!(%case_id, person_id = %person.id, "participant already linked");
            return Ok(false);
        }

        let link = ParticipantLink::new(case_id, person_ref, candidate.participant_role, Utc::now());
        self.store.insert_participant(&link).await
    }

    /// Stage client and coordinator links from the first flagged candidate of
    /// each kind and write them in one case update. Returns the number of
    /// fields written.
    ///
    /// The coordinator is mirrored onto `primary_attorney_id`.
    pub async fn update_primary_links(
        &self,
        case: &Case,
        candidates: &[CandidateEntity],
    ) -> Result<usize, PersistenceError> {
        let mut patch = CaseLinkPatch::default();

        if let Some(candidate) = candidates.iter().find(|c| c.should_set_as_client) {
            if let Some(person) = self.reconciler.find_existing(candidate).await? {
                patch.client_id = Some(person.id);
            }
        }

        if let Some(candidate) = candidates.iter().find(|c| c.should_set_as_coordinator) {
            if let Some(person) = self.reconciler.find_existing(candidate).await? {
                patch.coordinator_id = Some(person.id);
                patch.primary_attorney_id = Some(person.id);
            }
        }

        if patch.is_empty() {
            return Ok(0);
        }
        self.store.update_case_links(case.id, &patch, Utc::now()).await?;
        Ok(patch.staged_fields())
    }
}
