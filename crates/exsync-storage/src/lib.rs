//! Persistence collaborator + HTTP fetch utilities for the sync engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exsync_core::{
    Case, CaseLinkPatch, CaseSyncStatus, ParticipantLink, ParticipantRef, PersonKind, PersonRecord,
    RawCaseRecord, SyncLogEntry, SyncLogStatus,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "exsync-storage";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("{0}")]
    Backend(String),
}

/// Which cases a batch run should visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseSelection {
    /// Active cases carrying a source payload, oldest first.
    Full,
    /// Never synced, synced before `stale_before`, or updated before `stale_before`.
    Incremental {
        stale_before: DateTime<Utc>,
        limit: usize,
    },
}

/// Reconciliation key handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersonLookup {
    /// OR across the populated keys; an external-id hit outranks an email hit.
    Identity {
        external_id: Option<String>,
        email: Option<String>,
    },
    Company(String),
    FullName {
        first_name: String,
        last_name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersonWrite {
    pub record: PersonRecord,
    pub created: bool,
}

/// One more case assignment for a person who already exists.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentMerge {
    pub case_id: Uuid,
    pub snapshot: Option<JsonValue>,
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCaseWrite {
    Inserted(Uuid),
    Updated(Uuid),
    Unchanged(Uuid),
}

impl SourceCaseWrite {
    pub fn case_id(self) -> Uuid {
        match self {
            Self::Inserted(id) | Self::Updated(id) | Self::Unchanged(id) => id,
        }
    }
}

/// The relational store as consumed by the sync engine.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_case(&self, id: Uuid) -> Result<Option<Case>, PersistenceError>;

    async fn select_cases(&self, selection: &CaseSelection) -> Result<Vec<Case>, PersistenceError>;

    async fn upsert_source_case(
        &self,
        external_id: &str,
        raw: &RawCaseRecord,
        raw_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<SourceCaseWrite, PersistenceError>;

    async fn update_case_links(
        &self,
        id: Uuid,
        patch: &CaseLinkPatch,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn mark_case_synced(
        &self,
        id: Uuid,
        status: CaseSyncStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn find_person(
        &self,
        kind: PersonKind,
        lookup: &PersonLookup,
    ) -> Result<Option<PersonRecord>, PersistenceError>;

    async fn people_sharing_initial(
        &self,
        kind: PersonKind,
        initial: char,
        limit: usize,
    ) -> Result<Vec<PersonRecord>, PersistenceError>;

    /// Insert, or merge into the record already holding the same external id.
    async fn insert_person(&self, record: &PersonRecord) -> Result<PersonWrite, PersistenceError>;

    /// Add `merge.case_id` to the person's assignment set and backfill missing
    /// identifiers in one atomic write. Returns the stored record.
    async fn merge_assignment(
        &self,
        kind: PersonKind,
        id: Uuid,
        merge: &AssignmentMerge,
    ) -> Result<PersonRecord, PersistenceError>;

    async fn find_active_participant(
        &self,
        case_id: Uuid,
        person: ParticipantRef,
    ) -> Result<Option<ParticipantLink>, PersistenceError>;

    /// Returns false when an active link for the same (case, person) already exists.
    async fn insert_participant(&self, link: &ParticipantLink) -> Result<bool, PersistenceError>;

    async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<(), PersistenceError>;

    async fn finalize_sync_log(
        &self,
        id: Uuid,
        status: SyncLogStatus,
        completed_at: DateTime<Utc>,
        results: Option<&JsonValue>,
        error: Option<&str>,
    ) -> Result<(), PersistenceError>;

    async fn purge_sync_logs(&self, older_than: DateTime<Utc>) -> Result<u64, PersistenceError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash of a JSON payload. `serde_json` maps keep keys sorted, so equal
/// documents hash equally regardless of upstream key order.
pub fn payload_hash(value: &JsonValue) -> String {
    sha256_hex(value.to_string().as_bytes())
}
