use std::sync::Arc;

use chrono::Utc;
use exsync_core::{CandidateEntity, PersonKind, PersonRecord};
use exsync_storage::{sha256_hex, AssignmentMerge, PersistenceError, PersonLookup, Store};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use uuid::Uuid;

/// Store lookup for a candidate, or `None` when it carries no usable key.
///
/// External id and email are queried together; names are only used when
/// neither identity key is present.
pub fn lookup_for(candidate: &CandidateEntity) -> Option<PersonLookup> {
    let external_id = candidate.external_id().map(str::to_string);
    let email = candidate.email.clone();
    if external_id.is_some() || email.is_some() {
        return Some(PersonLookup::Identity { external_id, email });
    }

    let name = &candidate.parsed_name;
    if let Some(company) = name.company_name.as_deref().filter(|c| !c.is_empty()) {
        return Some(PersonLookup::Company(company.to_string()));
    }
    if name.first_name.is_empty() && name.last_name.is_empty() {
        return None;
    }
    Some(PersonLookup::FullName {
        first_name: name.first_name.clone(),
        last_name: name.last_name.clone(),
    })
}

/// A random credential marker for new user records. Only its hash is kept.
fn issue_credential_hash() -> String {
    let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    sha256_hex(token.as_bytes())
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub record: PersonRecord,
    pub created: bool,
}

/// Matches candidates to stored people and materialises them.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn find_existing(
        &self,
        candidate: &CandidateEntity,
    ) -> Result<Option<PersonRecord>, PersistenceError> {
        match lookup_for(candidate) {
            Some(lookup) => self.store.find_person(candidate.kind, &lookup).await,
            None => Ok(None),
        }
    }

    /// Create or update the person behind `candidate` and record `case_id`
    /// in its assignment set. Safe to repeat for the same pair.
    pub async fn upsert(
        &self,
        candidate: &CandidateEntity,
        case_id: Uuid,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let now = Utc::now();

        if let Some(existing) = self.find_existing(candidate).await? {
            let merge = AssignmentMerge {
                case_id,
                snapshot: candidate.snapshot.clone(),
                external_id: candidate.external_id().map(str::to_string),
                email: candidate.email.clone(),
                at: now,
            };
            let record = self
                .store
                .merge_assignment(existing.kind, existing.id, &merge)
                .await?;
            return Ok(UpsertOutcome {
                record,
                created: false,
            });
        }

        let mut record = PersonRecord::from_candidate(candidate, case_id, now);
        if record.kind == PersonKind::User {
            record.credential_hash = Some(issue_credential_hash());
        }
        let written = self.store.insert_person(&record).await?;
        Ok(UpsertOutcome {
            record: written.record,
            created: written.created,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReviewConfig {
    pub threshold: f64,
    pub scan_limit: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            threshold: 0.92,
            scan_limit: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateHint {
    pub kind: PersonKind,
    pub person_id: Uuid,
    pub display_name: String,
    pub similar_to_id: Uuid,
    pub similar_to_name: String,
    pub confidence_score: f64,
}

/// Flags newly created people whose names closely resemble existing ones.
/// It never merges anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateReviewer {
    config: ReviewConfig,
}

impl DuplicateReviewer {
    pub fn new(config: ReviewConfig) -> Self {
        Self { config }
    }

    pub fn scan_limit(&self) -> usize {
        self.config.scan_limit
    }

    pub fn normalize_name(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn similarity(a: &str, b: &str) -> f64 {
        jaro_winkler(&Self::normalize_name(a), &Self::normalize_name(b))
    }

    pub fn review(&self, created: &PersonRecord, existing: &[PersonRecord]) -> Vec<DuplicateHint> {
        let mut hints: Vec<DuplicateHint> = existing
            .iter()
            .filter(|other| other.id != created.id && other.kind == created.kind)
            .filter_map(|other| {
                let score = Self::similarity(&created.display_name, &other.display_name);
                (score >= self.config.threshold).then(|| DuplicateHint {
                    kind: created.kind,
                    person_id: created.id,
                    display_name: created.display_name.clone(),
                    similar_to_id: other.id,
                    similar_to_name: other.display_name.clone(),
                    confidence_score: score,
                })
            })
            .collect();
        hints.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));
        hints
    }
}
