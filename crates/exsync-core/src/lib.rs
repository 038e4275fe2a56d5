//! Core domain model for the exchange entity sync engine.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "exsync-core";

// Upstream payloads are loosely typed: a malformed nested reference must
// degrade to "absent" instead of rejecting the whole case record.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = JsonValue::deserialize(deserializer)?;
    if !value.is_object() {
        return Ok(None);
    }
    Ok(serde_json::from_value(value).ok())
}

fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(match value {
        JsonValue::Array(items) => items
            .into_iter()
            .filter(JsonValue::is_object)
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(match value {
        JsonValue::String(s) => Some(s),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Raw matter payload as delivered by the practice-management system.
///
/// Every nested reference is optional; unknown or malformed sub-records
/// deserialize to `None` (or are dropped from lists) rather than failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCaseRecord {
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub account_ref: Option<AccountRef>,
    #[serde(default, deserialize_with = "lenient_vec", skip_serializing_if = "Vec::is_empty")]
    pub assigned_to_users: Vec<UserRef>,
    #[serde(default, deserialize_with = "lenient_vec", skip_serializing_if = "Vec::is_empty")]
    pub custom_field_values: Vec<CustomFieldValue>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub buyer_names: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub seller_names: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub referral_source: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub referral_email: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub bank_name: Option<String>,
}

impl RawCaseRecord {
    /// Lenient parse from an arbitrary JSON value. Non-object input yields an empty record.
    pub fn from_json(value: &JsonValue) -> Self {
        if !value.is_object() {
            return Self::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountRef {
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
}

impl AccountRef {
    pub fn reference_name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .or(self.company_name.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactRef {
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldRef {
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub custom_field_ref: Option<CustomFieldRef>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub contact_ref: Option<ContactRef>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
}

/// What a custom field actually holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldContent<'a> {
    Contact(&'a ContactRef),
    Text(&'a str),
    Absent,
}

impl CustomFieldValue {
    pub fn label(&self) -> &str {
        self.custom_field_ref
            .as_ref()
            .and_then(|r| r.label.as_deref())
            .unwrap_or_default()
    }

    pub fn content(&self) -> FieldContent<'_> {
        match (&self.contact_ref, &self.value_string) {
            (Some(contact), _) => FieldContent::Contact(contact),
            (None, Some(text)) => FieldContent::Text(text),
            (None, None) => FieldContent::Absent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonKind {
    User,
    Contact,
}

impl PersonKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Contact => "contact",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "contact" => Some(Self::Contact),
            _ => None,
        }
    }
}

/// System role carried on a person record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonRole {
    Client,
    Coordinator,
    SettlementAgent,
    Attorney,
    Internal,
    Referral,
    Buyer,
    Seller,
    Organization,
    Other,
}

impl PersonRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Coordinator => "coordinator",
            Self::SettlementAgent => "settlement_agent",
            Self::Attorney => "attorney",
            Self::Internal => "internal",
            Self::Referral => "referral",
            Self::Buyer => "buyer",
            Self::Seller => "seller",
            Self::Organization => "organization",
            Self::Other => "other",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "client" => Some(Self::Client),
            "coordinator" => Some(Self::Coordinator),
            "settlement_agent" => Some(Self::SettlementAgent),
            "attorney" => Some(Self::Attorney),
            "internal" => Some(Self::Internal),
            "referral" => Some(Self::Referral),
            "buyer" => Some(Self::Buyer),
            "seller" => Some(Self::Seller),
            "organization" => Some(Self::Organization),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Role a person plays inside one case. Distinct from [`PersonRole`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Client,
    ThirdParty,
}

impl ParticipantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::ThirdParty => "third_party",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "client" => Some(Self::Client),
            "third_party" => Some(Self::ThirdParty),
            _ => None,
        }
    }
}

/// Result of display-name parsing. Both name parts are always present, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedName {
    pub first_name: String,
    pub last_name: String,
    pub company_name: Option<String>,
}

impl ParsedName {
    pub fn person(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            company_name: None,
        }
    }

    pub fn company(name: impl Into<String>) -> Self {
        Self {
            first_name: String::new(),
            last_name: String::new(),
            company_name: Some(name.into()),
        }
    }

    pub fn is_company(&self) -> bool {
        self.company_name.is_some()
    }
}

/// Transient entity derived from one raw case record; consumed within a single pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateEntity {
    /// Path inside the raw payload the candidate was read from.
    pub source: String,
    pub kind: PersonKind,
    pub role: PersonRole,
    pub external_contact_id: Option<String>,
    pub external_user_id: Option<String>,
    pub display_name: String,
    pub parsed_name: ParsedName,
    pub email: Option<String>,
    pub is_primary: bool,
    pub company_only: bool,
    pub should_create_record: bool,
    pub should_add_as_participant: bool,
    pub participant_role: ParticipantRole,
    pub should_set_as_client: bool,
    pub should_set_as_coordinator: bool,
    pub snapshot: Option<JsonValue>,
}

impl CandidateEntity {
    /// The external identifier that applies to this candidate's kind.
    pub fn external_id(&self) -> Option<&str> {
        match self.kind {
            PersonKind::User => self.external_user_id.as_deref(),
            PersonKind::Contact => self.external_contact_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: Uuid,
    pub kind: PersonKind,
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub display_name: String,
    pub first_name: String,
    pub last_name: String,
    pub company_name: Option<String>,
    pub role: PersonRole,
    pub assigned_cases: Vec<Uuid>,
    pub assignment_count: u32,
    pub last_assignment_at: Option<DateTime<Utc>>,
    pub raw_snapshot: Option<JsonValue>,
    pub credential_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersonRecord {
    pub fn from_candidate(candidate: &CandidateEntity, case_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: candidate.kind,
            external_id: candidate.external_id().map(str::to_string),
            email: candidate.email.clone(),
            display_name: candidate.display_name.clone(),
            first_name: candidate.parsed_name.first_name.clone(),
            last_name: candidate.parsed_name.last_name.clone(),
            company_name: candidate.parsed_name.company_name.clone(),
            role: candidate.role,
            assigned_cases: vec![case_id],
            assignment_count: 1,
            last_assignment_at: Some(now),
            raw_snapshot: candidate.snapshot.clone(),
            credential_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge one more case assignment into the record.
    ///
    /// `assigned_cases` is a set: re-absorbing a known case leaves it and the
    /// count untouched. Returns whether the case was newly added.
    pub fn absorb_assignment(
        &mut self,
        case_id: Uuid,
        snapshot: Option<&JsonValue>,
        now: DateTime<Utc>,
    ) -> bool {
        let added = if self.assigned_cases.contains(&case_id) {
            false
        } else {
            self.assigned_cases.push(case_id);
            true
        };
        self.assignment_count = self.assigned_cases.len() as u32;
        self.last_assignment_at = Some(now);
        if let Some(snapshot) = snapshot {
            self.raw_snapshot = Some(snapshot.clone());
        }
        self.updated_at = now;
        added
    }

    /// Fill identifiers the record is missing. Never overwrites.
    pub fn backfill_identity(&mut self, external_id: Option<&str>, email: Option<&str>) {
        if self.external_id.is_none() {
            self.external_id = external_id.map(str::to_string);
        }
        if self.email.is_none() {
            self.email = email.map(str::to_string);
        }
    }
}

/// Identity field a participant link is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ParticipantRef {
    User(Uuid),
    Contact(Uuid),
}

impl ParticipantRef {
    pub fn for_person(person: &PersonRecord) -> Self {
        match person.kind {
            PersonKind::User => Self::User(person.id),
            PersonKind::Contact => Self::Contact(person.id),
        }
    }

    pub fn user_id(self) -> Option<Uuid> {
        match self {
            Self::User(id) => Some(id),
            Self::Contact(_) => None,
        }
    }

    pub fn contact_id(self) -> Option<Uuid> {
        match self {
            Self::Contact(id) => Some(id),
            Self::User(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantLink {
    pub id: Uuid,
    pub case_id: Uuid,
    pub person: ParticipantRef,
    pub role: ParticipantRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ParticipantLink {
    pub fn new(case_id: Uuid, person: ParticipantRef, role: ParticipantRole, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            case_id,
            person,
            role,
            is_active: true,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Active,
    Closed,
    Archived,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Archived => "archived",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSyncStatus {
    Pending,
    Completed,
    Failed,
}

impl CaseSyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An exchange: the business record participants and primary links hang off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub status: CaseStatus,
    pub raw: Option<RawCaseRecord>,
    pub raw_hash: Option<String>,
    pub client_id: Option<Uuid>,
    pub coordinator_id: Option<Uuid>,
    pub primary_attorney_id: Option<Uuid>,
    pub synced_at: Option<DateTime<Utc>>,
    pub sync_status: Option<CaseSyncStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    pub fn new(raw: RawCaseRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: raw.id.clone(),
            status: CaseStatus::Active,
            raw: Some(raw),
            raw_hash: None,
            client_id: None,
            coordinator_id: None,
            primary_attorney_id: None,
            synced_at: None,
            sync_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_source_payload(&self) -> bool {
        self.raw.as_ref().is_some_and(|raw| !raw.is_empty())
    }
}

/// Primary-link fields staged for a single case update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseLinkPatch {
    pub client_id: Option<Uuid>,
    pub coordinator_id: Option<Uuid>,
    pub primary_attorney_id: Option<Uuid>,
}

impl CaseLinkPatch {
    pub fn is_empty(&self) -> bool {
        self.client_id.is_none() && self.coordinator_id.is_none() && self.primary_attorney_id.is_none()
    }

    pub fn staged_fields(&self) -> usize {
        [self.client_id, self.coordinator_id, self.primary_attorney_id]
            .iter()
            .filter(|v| v.is_some())
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    FullSync,
    IncrementalSync,
    Scheduled,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::FullSync => "full_sync",
            Self::IncrementalSync => "incremental_sync",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "full_sync" => Some(Self::FullSync),
            "incremental_sync" => Some(Self::IncrementalSync),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLogStatus {
    Running,
    Completed,
    Failed,
}

impl SyncLogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Append-only audit row for one orchestration pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub case_id: Uuid,
    pub trigger: SyncTrigger,
    pub status: SyncLogStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Option<JsonValue>,
    pub error: Option<String>,
}

impl SyncLogEntry {
    pub fn start(case_id: Uuid, trigger: SyncTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            case_id,
            trigger,
            status: SyncLogStatus::Running,
            started_at: now,
            completed_at: None,
            results: None,
            error: None,
        }
    }
}
