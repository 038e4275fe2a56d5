use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exsync_core::{
    Case, CaseLinkPatch, CaseStatus, CaseSyncStatus, ParticipantLink, ParticipantRef, PersonKind, PersonRecord,
    RawCaseRecord, SyncLogEntry, SyncLogStatus,
};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    AssignmentMerge, CaseSelection, PersistenceError, PersonLookup, PersonWrite, SourceCaseWrite, Store,
};

#[derive(Debug, Default)]
struct MemoryState {
    cases: Vec<Case>,
    users: Vec<PersonRecord>,
    contacts: Vec<PersonRecord>,
    participants: Vec<ParticipantLink>,
    sync_logs: Vec<SyncLogEntry>,
}

impl MemoryState {
    fn people(&self, kind: PersonKind) -> &Vec<PersonRecord> {
        match kind {
            PersonKind::User => &self.users,
            PersonKind::Contact => &self.contacts,
        }
    }

    fn people_mut(&mut self, kind: PersonKind) -> &mut Vec<PersonRecord> {
        match kind {
            PersonKind::User => &mut self.users,
            PersonKind::Contact => &mut self.contacts,
        }
    }

    fn case_mut(&mut self, id: Uuid) -> Result<&mut Case, PersistenceError> {
        self.cases
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| PersistenceError::Backend(format!("case {id} not found")))
    }
}

/// In-process [`Store`]. Every operation runs under one lock, which makes the
/// external-id conflict merge in `insert_person` atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_case(&self, case: Case) {
        self.state.lock().await.cases.push(case);
    }

    pub async fn cases(&self) -> Vec<Case> {
        self.state.lock().await.cases.clone()
    }

    pub async fn people(&self, kind: PersonKind) -> Vec<PersonRecord> {
        self.state.lock().await.people(kind).clone()
    }

    pub async fn participants(&self) -> Vec<ParticipantLink> {
        self.state.lock().await.participants.clone()
    }

    pub async fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.state.lock().await.sync_logs.clone()
    }
}

fn merge_into(existing: &mut PersonRecord, incoming: &PersonRecord) {
    for case_id in &incoming.assigned_cases {
        existing.absorb_assignment(*case_id, incoming.raw_snapshot.as_ref(), incoming.updated_at);
    }
    existing.backfill_identity(None, incoming.email.as_deref());
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_case(&self, id: Uuid) -> Result<Option<Case>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state.cases.iter().find(|c| c.id == id).cloned())
    }

    async fn select_cases(&self, selection: &CaseSelection) -> Result<Vec<Case>, PersistenceError> {
        let state = self.state.lock().await;
        let out = match selection {
            CaseSelection::Full => {
                let mut out = state
                    .cases
                    .iter()
                    .filter(|c| c.status == CaseStatus::Active && c.has_source_payload())
                    .cloned()
                    .collect::<Vec<_>>();
                out.sort_by_key(|c| c.created_at);
                out
            }
            CaseSelection::Incremental {
                stale_before,
                limit,
            } => {
                let mut out = state
                    .cases
                    .iter()
                    .filter(|c| match c.synced_at {
                        None => true,
                        Some(synced_at) => synced_at < *stale_before || c.updated_at < *stale_before,
                    })
                    .cloned()
                    .collect::<Vec<_>>();
                // `None` sorts first: never-synced cases lead.
                out.sort_by_key(|c| (c.synced_at, c.created_at));
                out.truncate(*limit);
                out
            }
        };
        Ok(out)
    }

    async fn upsert_source_case(
        &self,
        external_id: &str,
        raw: &RawCaseRecord,
        raw_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<SourceCaseWrite, PersistenceError> {
        let mut state = self.state.lock().await;
        if let Some(case) = state
            .cases
            .iter_mut()
            .find(|c| c.external_id.as_deref() == Some(external_id))
        {
            if case.raw_hash.as_deref() == Some(raw_hash) {
                return Ok(SourceCaseWrite::Unchanged(case.id));
            }
            case.raw = Some(raw.clone());
            case.raw_hash = Some(raw_hash.to_string());
            case.updated_at = at;
            return Ok(SourceCaseWrite::Updated(case.id));
        }

        let mut case = Case::new(raw.clone(), at);
        case.external_id = Some(external_id.to_string());
        case.raw_hash = Some(raw_hash.to_string());
        let id = case.id;
        state.cases.push(case);
        Ok(SourceCaseWrite::Inserted(id))
    }

    async fn update_case_links(
        &self,
        id: Uuid,
        patch: &CaseLinkPatch,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let case = state.case_mut(id)?;
        if let Some(client_id) = patch.client_id {
            case.client_id = Some(client_id);
        }
        if let Some(coordinator_id) = patch.coordinator_id {
            case.coordinator_id = Some(coordinator_id);
        }
        if let Some(attorney_id) = patch.primary_attorney_id {
            case.primary_attorney_id = Some(attorney_id);
        }
        case.updated_at = at;
        Ok(())
    }

    async fn mark_case_synced(
        &self,
        id: Uuid,
        status: CaseSyncStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let case = state.case_mut(id)?;
        case.synced_at = Some(at);
        case.sync_status = Some(status);
        Ok(())
    }

    async fn find_person(
        &self,
        kind: PersonKind,
        lookup: &PersonLookup,
    ) -> Result<Option<PersonRecord>, PersistenceError> {
        let state = self.state.lock().await;
        let people = state.people(kind);
        let found = match lookup {
            PersonLookup::Identity { external_id, email } => {
                let by_external = external_id.as_deref().and_then(|ext| {
                    people.iter().find(|p| p.external_id.as_deref() == Some(ext))
                });
                by_external.or_else(|| {
                    email.as_deref().and_then(|email| {
                        people.iter().find(|p| {
                            p.email
                                .as_deref()
                                .is_some_and(|candidate| candidate.eq_ignore_ascii_case(email))
                        })
                    })
                })
            }
            PersonLookup::Company(name) => people
                .iter()
                .find(|p| p.company_name.as_deref() == Some(name.as_str())),
            PersonLookup::FullName {
                first_name,
                last_name,
            } => people
                .iter()
                .find(|p| &p.first_name == first_name && &p.last_name == last_name),
        };
        Ok(found.cloned())
    }

    async fn people_sharing_initial(
        &self,
        kind: PersonKind,
        initial: char,
        limit: usize,
    ) -> Result<Vec<PersonRecord>, PersistenceError> {
        let state = self.state.lock().await;
        let initial = initial.to_lowercase().collect::<String>();
        Ok(state
            .people(kind)
            .iter()
            .filter(|p| p.display_name.to_lowercase().starts_with(&initial))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_person(&self, record: &PersonRecord) -> Result<PersonWrite, PersistenceError> {
        let mut state = self.state.lock().await;
        let people = state.people_mut(record.kind);
        if let Some(external_id) = record.external_id.as_deref() {
            if let Some(existing) = people
                .iter_mut()
                .find(|p| p.external_id.as_deref() == Some(external_id))
            {
                merge_into(existing, record);
                return Ok(PersonWrite {
                    record: existing.clone(),
                    created: false,
                });
            }
        }
        people.push(record.clone());
        Ok(PersonWrite {
            record: record.clone(),
            created: true,
        })
    }

    async fn merge_assignment(
        &self,
        kind: PersonKind,
        id: Uuid,
        merge: &AssignmentMerge,
    ) -> Result<PersonRecord, PersistenceError> {
        let mut state = self.state.lock().await;
        let slot = state
            .people_mut(kind)
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| PersistenceError::Backend(format!("{} {id} not found", kind.as_str())))?;
        slot.absorb_assignment(merge.case_id, merge.snapshot.as_ref(), merge.at);
        slot.backfill_identity(merge.external_id.as_deref(), merge.email.as_deref());
        Ok(slot.clone())
    }

    async fn find_active_participant(
        &self,
        case_id: Uuid,
        person: ParticipantRef,
    ) -> Result<Option<ParticipantLink>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state
            .participants
            .iter()
            .find(|p| p.case_id == case_id && p.person == person && p.is_active)
            .cloned())
    }

    async fn insert_participant(&self, link: &ParticipantLink) -> Result<bool, PersistenceError> {
        let mut state = self.state.lock().await;
        let duplicate = state
            .participants
            .iter()
            .any(|p| p.case_id == link.case_id && p.person == link.person && p.is_active);
        if duplicate {
            return Ok(false);
        }
        state.participants.push(link.clone());
        Ok(true)
    }

    async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<(), PersistenceError> {
        self.state.lock().await.sync_logs.push(entry.clone());
        Ok(())
    }

    async fn finalize_sync_log(
        &self,
        id: Uuid,
        status: SyncLogStatus,
        completed_at: DateTime<Utc>,
        results: Option<&JsonValue>,
        error: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let entry = state
            .sync_logs
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| PersistenceError::Backend(format!("sync log {id} not found")))?;
        entry.status = status;
        entry.completed_at = Some(completed_at);
        entry.results = results.cloned();
        entry.error = error.map(str::to_string);
        Ok(())
    }

    async fn purge_sync_logs(&self, older_than: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        let before = state.sync_logs.len();
        state.sync_logs.retain(|e| e.started_at >= older_than);
        Ok((before - state.sync_logs.len()) as u64)
    }
}
