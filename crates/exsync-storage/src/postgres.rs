use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exsync_core::{
    Case, CaseLinkPatch, CaseStatus, CaseSyncStatus, ParticipantLink, ParticipantRef, ParticipantRole,
    PersonKind, PersonRecord, PersonRole, RawCaseRecord, SyncLogEntry, SyncLogStatus,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{
    AssignmentMerge, CaseSelection, PersistenceError, PersonLookup, PersonWrite, SourceCaseWrite, Store,
};

const CASE_COLUMNS: &str = "id, external_id, status, raw_payload, raw_hash, client_id, coordinator_id, \
     primary_attorney_id, synced_at, sync_status, created_at, updated_at";

const PERSON_COLUMNS: &str = "id, external_id, email, display_name, first_name, last_name, company_name, \
     role, assigned_cases, assignment_count, last_assignment_at, raw_snapshot, credential_hash, \
     created_at, updated_at";

const PARTICIPANT_COLUMNS: &str = "id, case_id, user_id, contact_id, role, is_active, created_at";

fn person_table(kind: PersonKind) -> &'static str {
    match kind {
        PersonKind::User => "users",
        PersonKind::Contact => "contacts",
    }
}

fn serialization(err: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Serialization(err.to_string())
}

fn case_from_row(row: &PgRow) -> Result<Case, PersistenceError> {
    let status: String = row.try_get("status")?;
    let sync_status: Option<String> = row.try_get("sync_status")?;
    let raw_payload: Option<JsonValue> = row.try_get("raw_payload")?;
    Ok(Case {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        status: CaseStatus::from_db_value(&status)
            .ok_or_else(|| serialization(format!("invalid case status '{status}'")))?,
        raw: raw_payload.as_ref().map(RawCaseRecord::from_json),
        raw_hash: row.try_get("raw_hash")?,
        client_id: row.try_get("client_id")?,
        coordinator_id: row.try_get("coordinator_id")?,
        primary_attorney_id: row.try_get("primary_attorney_id")?,
        synced_at: row.try_get("synced_at")?,
        sync_status: match sync_status {
            Some(raw) => Some(
                CaseSyncStatus::from_db_value(&raw)
                    .ok_or_else(|| serialization(format!("invalid sync status '{raw}'")))?,
            ),
            None => None,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn person_from_row(kind: PersonKind, row: &PgRow) -> Result<PersonRecord, PersistenceError> {
    let role: String = row.try_get("role")?;
    let assignment_count: i32 = row.try_get("assignment_count")?;
    Ok(PersonRecord {
        id: row.try_get("id")?,
        kind,
        external_id: row.try_get("external_id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        company_name: row.try_get("company_name")?,
        role: PersonRole::from_db_value(&role)
            .ok_or_else(|| serialization(format!("invalid person role '{role}'")))?,
        assigned_cases: row.try_get("assigned_cases")?,
        assignment_count: assignment_count.max(0) as u32,
        last_assignment_at: row.try_get("last_assignment_at")?,
        raw_snapshot: row.try_get("raw_snapshot")?,
        credential_hash: row.try_get("credential_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn participant_from_row(row: &PgRow) -> Result<ParticipantLink, PersistenceError> {
    let user_id: Option<Uuid> = row.try_get("user_id")?;
    let contact_id: Option<Uuid> = row.try_get("contact_id")?;
    let person = match (user_id, contact_id) {
        (Some(id), _) => ParticipantRef::User(id),
        (None, Some(id)) => ParticipantRef::Contact(id),
        (None, None) => return Err(serialization("participant row without user_id or contact_id")),
    };
    let role: String = row.try_get("role")?;
    Ok(ParticipantLink {
        id: row.try_get("id")?,
        case_id: row.try_get("case_id")?,
        person,
        role: ParticipantRole::from_db_value(&role)
            .ok_or_else(|| serialization(format!("invalid participant role '{role}'")))?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Postgres-backed [`Store`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_case(&self, id: Uuid) -> Result<Option<Case>, PersistenceError> {
        let row = sqlx::query(&format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(case_from_row).transpose()
    }

    async fn select_cases(&self, selection: &CaseSelection) -> Result<Vec<Case>, PersistenceError> {
        let rows = match selection {
            CaseSelection::Full => {
                sqlx::query(&format!(
                    r#"
                    SELECT {CASE_COLUMNS}
                      FROM cases
                     WHERE status = 'active'
                       AND raw_payload IS NOT NULL
                       AND raw_payload <> '{{}}'::jsonb
                     ORDER BY created_at ASC
                    "#
                ))
                .fetch_all(&self.pool)
                .await?
            }
            CaseSelection::Incremental {
                stale_before,
                limit,
            } => {
                sqlx::query(&format!(
                    r#"
                    SELECT {CASE_COLUMNS}
                      FROM cases
                     WHERE synced_at IS NULL
                        OR synced_at < $1
                        OR updated_at < $1
                     ORDER BY synced_at ASC NULLS FIRST, created_at ASC
                     LIMIT $2
                    "#
                ))
                .bind(stale_before)
                .bind(*limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(case_from_row).collect()
    }

    async fn upsert_source_case(
        &self,
        external_id: &str,
        raw: &RawCaseRecord,
        raw_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<SourceCaseWrite, PersistenceError> {
        let payload = serde_json::to_value(raw).map_err(serialization)?;
        let written = sqlx::query(
            r#"
            INSERT INTO cases (id, external_id, status, raw_payload, raw_hash, created_at, updated_at)
            VALUES ($1, $2, 'active', $3, $4, $5, $5)
            ON CONFLICT (external_id) DO UPDATE
               SET raw_payload = EXCLUDED.raw_payload,
                   raw_hash = EXCLUDED.raw_hash,
                   updated_at = EXCLUDED.updated_at
             WHERE cases.raw_hash IS DISTINCT FROM EXCLUDED.raw_hash
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(&payload)
        .bind(raw_hash)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = written {
            let id: Uuid = row.try_get("id")?;
            let inserted: bool = row.try_get("inserted")?;
            return Ok(if inserted {
                SourceCaseWrite::Inserted(id)
            } else {
                SourceCaseWrite::Updated(id)
            });
        }

        let id: Uuid = sqlx::query_scalar("SELECT id FROM cases WHERE external_id = $1")
            .bind(external_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(SourceCaseWrite::Unchanged(id))
    }

    async fn update_case_links(
        &self,
        id: Uuid,
        patch: &CaseLinkPatch,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE cases
               SET client_id = COALESCE($2, client_id),
                   coordinator_id = COALESCE($3, coordinator_id),
                   primary_attorney_id = COALESCE($4, primary_attorney_id),
                   updated_at = $5
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.client_id)
        .bind(patch.coordinator_id)
        .bind(patch.primary_attorney_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::Backend(format!("case {id} not found")));
        }
        Ok(())
    }

    async fn mark_case_synced(
        &self,
        id: Uuid,
        status: CaseSyncStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE cases SET synced_at = $2, sync_status = $3 WHERE id = $1")
            .bind(id)
            .bind(at)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_person(
        &self,
        kind: PersonKind,
        lookup: &PersonLookup,
    ) -> Result<Option<PersonRecord>, PersistenceError> {
        let table = person_table(kind);
        let row = match lookup {
            PersonLookup::Identity { external_id, email } => {
                sqlx::query(&format!(
                    r#"
                    SELECT {PERSON_COLUMNS}
                      FROM {table}
                     WHERE ($1::text IS NOT NULL AND external_id = $1)
                        OR ($2::text IS NOT NULL AND lower(email) = lower($2))
                     ORDER BY CASE WHEN external_id = $1 THEN 0 ELSE 1 END, created_at ASC
                     LIMIT 1
                    "#
                ))
                .bind(external_id.as_deref())
                .bind(email.as_deref())
                .fetch_optional(&self.pool)
                .await?
            }
            PersonLookup::Company(name) => {
                sqlx::query(&format!(
                    "SELECT {PERSON_COLUMNS} FROM {table} WHERE company_name = $1 ORDER BY created_at ASC LIMIT 1"
                ))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
            PersonLookup::FullName {
                first_name,
                last_name,
            } => {
                sqlx::query(&format!(
                    "SELECT {PERSON_COLUMNS} FROM {table} \
                     WHERE first_name = $1 AND last_name = $2 ORDER BY created_at ASC LIMIT 1"
                ))
                .bind(first_name)
                .bind(last_name)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(|r| person_from_row(kind, r)).transpose()
    }

    async fn people_sharing_initial(
        &self,
        kind: PersonKind,
        initial: char,
        limit: usize,
    ) -> Result<Vec<PersonRecord>, PersistenceError> {
        let table = person_table(kind);
        let rows = sqlx::query(&format!(
            "SELECT {PERSON_COLUMNS} FROM {table} WHERE lower(left(display_name, 1)) = $1 LIMIT $2"
        ))
        .bind(initial.to_lowercase().collect::<String>())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| person_from_row(kind, r)).collect()
    }

    async fn insert_person(&self, record: &PersonRecord) -> Result<PersonWrite, PersistenceError> {
        let table = person_table(record.kind);
        // Concurrent passes can race to create the same person; the partial
        // unique index on external_id turns the loser into a merge.
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {table} ({PERSON_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (external_id) WHERE external_id IS NOT NULL DO UPDATE
               SET assigned_cases = CASE
                       WHEN EXCLUDED.assigned_cases <@ {table}.assigned_cases THEN {table}.assigned_cases
                       ELSE {table}.assigned_cases || EXCLUDED.assigned_cases
                   END,
                   assignment_count = cardinality(CASE
                       WHEN EXCLUDED.assigned_cases <@ {table}.assigned_cases THEN {table}.assigned_cases
                       ELSE {table}.assigned_cases || EXCLUDED.assigned_cases
                   END),
                   email = COALESCE({table}.email, EXCLUDED.email),
                   last_assignment_at = EXCLUDED.last_assignment_at,
                   raw_snapshot = COALESCE(EXCLUDED.raw_snapshot, {table}.raw_snapshot),
                   updated_at = EXCLUDED.updated_at
            RETURNING {PERSON_COLUMNS}, (xmax = 0) AS inserted
            "#
        ))
        .bind(record.id)
        .bind(record.external_id.as_deref())
        .bind(record.email.as_deref())
        .bind(&record.display_name)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(record.company_name.as_deref())
        .bind(record.role.as_str())
        .bind(&record.assigned_cases)
        .bind(record.assignment_count as i32)
        .bind(record.last_assignment_at)
        .bind(record.raw_snapshot.as_ref())
        .bind(record.credential_hash.as_deref())
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        let stored = person_from_row(record.kind, &row)?;
        Ok(PersonWrite {
            record: stored,
            created: inserted,
        })
    }

    async fn merge_assignment(
        &self,
        kind: PersonKind,
        id: Uuid,
        merge: &AssignmentMerge,
    ) -> Result<PersonRecord, PersistenceError> {
        let table = person_table(kind);
        // Single statement so concurrent passes for the same person never drop
        // each other's case ids.
        let row = sqlx::query(&format!(
            r#"
            UPDATE {table}
               SET assigned_cases = CASE
                       WHEN $2 = ANY(assigned_cases) THEN assigned_cases
                       ELSE array_append(assigned_cases, $2)
                   END,
                   assignment_count = cardinality(CASE
                       WHEN $2 = ANY(assigned_cases) THEN assigned_cases
                       ELSE array_append(assigned_cases, $2)
                   END),
                   raw_snapshot = COALESCE($3, raw_snapshot),
                   external_id = COALESCE(external_id, $4),
                   email = COALESCE(email, $5),
                   last_assignment_at = $6,
                   updated_at = $6
             WHERE id = $1
            RETURNING {PERSON_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(merge.case_id)
        .bind(merge.snapshot.as_ref())
        .bind(merge.external_id.as_deref())
        .bind(merge.email.as_deref())
        .bind(merge.at)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => person_from_row(kind, &row),
            None => Err(PersistenceError::Backend(format!(
                "{} {id} not found",
                kind.as_str()
            ))),
        }
    }

    async fn find_active_participant(
        &self,
        case_id: Uuid,
        person: ParticipantRef,
    ) -> Result<Option<ParticipantLink>, PersistenceError> {
        let (column, person_id) = match person {
            ParticipantRef::User(id) => ("user_id", id),
            ParticipantRef::Contact(id) => ("contact_id", id),
        };
        let row = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM case_participants \
             WHERE case_id = $1 AND {column} = $2 AND is_active LIMIT 1"
        ))
        .bind(case_id)
        .bind(person_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    async fn insert_participant(&self, link: &ParticipantLink) -> Result<bool, PersistenceError> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO case_participants ({PARTICIPANT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#
        ))
        .bind(link.id)
        .bind(link.case_id)
        .bind(link.person.user_id())
        .bind(link.person.contact_id())
        .bind(link.role.as_str())
        .bind(link.is_active)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO sync_logs (id, case_id, trigger, status, started_at, completed_at, results, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.case_id)
        .bind(entry.trigger.as_str())
        .bind(entry.status.as_str())
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .bind(entry.results.as_ref())
        .bind(entry.error.as_deref())
        .execute(&self.pool)
        .await?;
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
        sqlx::query(
            r#"
            UPDATE sync_logs
               SET status = $2,
                   completed_at = $3,
                   results = $4,
                   error = $5
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(completed_at)
        .bind(results)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_sync_logs(&self, older_than: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM sync_logs WHERE started_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
