#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exsync_core::{
    Case, CaseLinkPatch, CaseSyncStatus, ParticipantLink, ParticipantRef, PersonKind, PersonRecord,
    PersonRole, RawCaseRecord, SyncLogEntry, SyncLogStatus,
};
use exsync_storage::{
    AssignmentMerge, CaseSelection, MemoryStore, PersistenceError, PersonLookup, PersonWrite, SourceCaseWrite, Store,
};
use exsync_sync::{BatchSettings, CaseSyncer, RunGuard, SyncScheduler};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

/// [`MemoryStore`] wrapper with fault injection and a gate on case selection.
pub struct ScriptedStore {
    pub inner: Arc<MemoryStore>,
    failing_link_updates: Mutex<HashSet<Uuid>>,
    select_gate: Option<Arc<Semaphore>>,
    fail_selection: AtomicBool,
    fail_completed_finalize: AtomicBool,
    case_load_delay: Option<Duration>,
    person_lookup_delay: Option<Duration>,
}

impl ScriptedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_link_updates: Mutex::new(HashSet::new()),
            select_gate: None,
            fail_selection: AtomicBool::new(false),
            fail_completed_finalize: AtomicBool::new(false),
            case_load_delay: None,
            person_lookup_delay: None,
        }
    }

    pub fn with_case_load_delay(mut self, delay: Duration) -> Self {
        self.case_load_delay = Some(delay);
        self
    }

    /// Every person lookup suspends for `delay`, like a database round-trip.
    pub fn with_person_lookup_delay(mut self, delay: Duration) -> Self {
        self.person_lookup_delay = Some(delay);
        self
    }

    pub fn fail_selection(&self) {
        self.fail_selection.store(true, Ordering::SeqCst);
    }

    /// Finalizing a log as `completed` fails; other finalizes pass through.
    pub fn fail_completed_finalize(&self) {
        self.fail_completed_finalize.store(true, Ordering::SeqCst);
    }

    /// Case selection blocks until a permit is added to `gate`.
    pub fn with_select_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.select_gate = Some(gate);
        self
    }

    pub async fn fail_link_update_for(&self, case_id: Uuid) {
        self.failing_link_updates.lock().await.insert(case_id);
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn get_case(&self, id: Uuid) -> Result<Option<Case>, PersistenceError> {
        if let Some(delay) = self.case_load_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.get_case(id).await
    }

    async fn select_cases(&self, selection: &CaseSelection) -> Result<Vec<Case>, PersistenceError> {
        if let Some(gate) = &self.select_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| PersistenceError::Backend("gate closed".into()))?;
            permit.forget();
        }
        if self.fail_selection.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("injected selection failure".into()));
        }
        self.inner.select_cases(selection).await
    }

    async fn upsert_source_case(
        &self,
        external_id: &str,
        raw: &RawCaseRecord,
        raw_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<SourceCaseWrite, PersistenceError> {
        self.inner.upsert_source_case(external_id, raw, raw_hash, at).await
    }

    async fn update_case_links(
        &self,
        id: Uuid,
        patch: &CaseLinkPatch,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        if self.failing_link_updates.lock().await.contains(&id) {
            return Err(PersistenceError::Backend("injected link update failure".into()));
        }
        self.inner.update_case_links(id, patch, at).await
    }

    async fn mark_case_synced(
        &self,
        id: Uuid,
        status: CaseSyncStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.inner.mark_case_synced(id, status, at).await
    }

    async fn find_person(
        &self,
        kind: PersonKind,
        lookup: &PersonLookup,
    ) -> Result<Option<PersonRecord>, PersistenceError> {
        if let Some(delay) = self.person_lookup_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.find_person(kind, lookup).await
    }

    async fn people_sharing_initial(
        &self,
        kind: PersonKind,
        initial: char,
        limit: usize,
    ) -> Result<Vec<PersonRecord>, PersistenceError> {
        self.inner.people_sharing_initial(kind, initial, limit).await
    }

    async fn insert_person(&self, record: &PersonRecord) -> Result<PersonWrite, PersistenceError> {
        self.inner.insert_person(record).await
    }

    async fn merge_assignment(
        &self,
        kind: PersonKind,
        id: Uuid,
        merge: &AssignmentMerge,
    ) -> Result<PersonRecord, PersistenceError> {
        self.inner.merge_assignment(kind, id, merge).await
    }

    async fn find_active_participant(
        &self,
        case_id: Uuid,
        person: ParticipantRef,
    ) -> Result<Option<ParticipantLink>, PersistenceError> {
        self.inner.find_active_participant(case_id, person).await
    }

    async fn insert_participant(&self, link: &ParticipantLink) -> Result<bool, PersistenceError> {
        self.inner.insert_participant(link).await
    }

    async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<(), PersistenceError> {
        self.inner.insert_sync_log(entry).await
    }

    async fn finalize_sync_log(
        &self,
        id: Uuid,
        status: SyncLogStatus,
        completed_at: DateTime<Utc>,
        results: Option<&JsonValue>,
        error: Option<&str>,
    ) -> Result<(), PersistenceError> {
        if status == SyncLogStatus::Completed && self.fail_completed_finalize.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("injected finalize failure".into()));
        }
        self.inner
            .finalize_sync_log(id, status, completed_at, results, error)
            .await
    }

    async fn purge_sync_logs(&self, older_than: DateTime<Utc>) -> Result<u64, PersistenceError> {
        self.inner.purge_sync_logs(older_than).await
    }
}

pub fn matter(external_id: &str, client: &str, coordinator: &str) -> JsonValue {
    json!({
        "id": external_id,
        "display_name": format!("Exchange {external_id}"),
        "account_ref": {
            "id": format!("acct-{external_id}"),
            "display_name": client,
        },
        "assigned_to_users": [
            {"id": "u-coordinator", "display_name": coordinator, "email_address": "maria@example.com"}
        ],
        "custom_field_values": [
            {"custom_field_ref": {"label": "Escrow Officer"}, "contact_ref": {"id": "c-escrow", "display_name": "Dana Whitfield"}}
        ],
        "buyer_names": "Carlos Rivera",
        "bank_name": "First Federal Bank"
    })
}

pub async fn seed_case(store: &MemoryStore, payload: JsonValue) -> Uuid {
    let case = Case::new(RawCaseRecord::from_json(&payload), Utc::now());
    let id = case.id;
    store.insert_case(case).await;
    id
}

pub fn person(kind: PersonKind, external_id: Option<&str>, email: Option<&str>, name: &str) -> PersonRecord {
    let now = Utc::now();
    let mut parts = name.split_whitespace();
    let first_name = parts.next().unwrap_or_default().to_string();
    let last_name = parts.collect::<Vec<_>>().join(" ");
    PersonRecord {
        id: Uuid::new_v4(),
        kind,
        external_id: external_id.map(str::to_string),
        email: email.map(str::to_string),
        display_name: name.to_string(),
        first_name,
        last_name,
        company_name: None,
        role: PersonRole::Client,
        assigned_cases: Vec::new(),
        assignment_count: 0,
        last_assignment_at: None,
        raw_snapshot: None,
        credential_hash: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn fast_settings() -> BatchSettings {
    BatchSettings {
        batch_size: 5,
        batch_pause: Duration::ZERO,
        incremental_limit: 50,
        incremental_stale: chrono::Duration::hours(24),
        incremental_delay: Duration::ZERO,
        run_deadline: Duration::from_secs(600),
    }
}

pub fn scheduler_over(store: Arc<dyn Store>, settings: BatchSettings) -> SyncScheduler {
    SyncScheduler::new(
        CaseSyncer::new(store, Duration::from_secs(30)),
        Arc::new(RunGuard::new()),
        settings,
    )
}
