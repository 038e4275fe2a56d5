use exsync_core::{
    CandidateEntity, ContactRef, FieldContent, ParsedName, ParticipantRole, PersonKind, PersonRole,
    RawCaseRecord, UserRef,
};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Free-text values the upstream system uses to mean "nothing here".
pub const PLACEHOLDER_VALUES: [&str; 4] = ["", "false", "null", "undefined"];

/// Substrings that mark a display name as an organisation rather than a person.
pub const ORGANIZATION_INDICATORS: [&str; 16] = [
    "bank",
    "llc",
    "inc",
    "corp",
    "company",
    "title",
    "escrow",
    "trust",
    "group",
    "associates",
    "partners",
    "law",
    "legal",
    "services",
    "holdings",
    "capital",
];

// Checked top to bottom; the first hit wins even if a later rule also matches.
const FIELD_LABEL_RULES: [(&[&str], PersonRole); 4] = [
    (&["settlement", "escrow"], PersonRole::SettlementAgent),
    (&["attorney", "lawyer"], PersonRole::Attorney),
    (&["internal", "credit"], PersonRole::Internal),
    (&["referral", "source"], PersonRole::Referral),
];

pub fn is_placeholder(value: &str) -> bool {
    PLACEHOLDER_VALUES.contains(&value.trim())
}

fn clean_text(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !is_placeholder(v))
}

fn clean_email(value: Option<&str>) -> Option<String> {
    clean_text(value).map(str::to_ascii_lowercase)
}

fn snapshot_of<T: Serialize>(value: &T) -> Option<JsonValue> {
    serde_json::to_value(value).ok().filter(JsonValue::is_object)
}

/// Indicators are matched against whole words so "Prince" stays a person
/// while "Acme Title & Escrow LLC" or "Smith Holdings, Inc." do not.
pub fn is_organization_name(name: &str) -> bool {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| ORGANIZATION_INDICATORS.contains(&word))
}

/// Split a free-text display name into first/last, or recognise it as a company.
///
/// Never fails: empty input yields an empty person name.
pub fn parse_name(display_name: &str) -> ParsedName {
    let name = display_name.trim();
    if name.is_empty() {
        return ParsedName::default();
    }
    if is_organization_name(name) {
        return ParsedName::company(name);
    }

    let segments: Vec<&str> = name.split(',').map(str::trim).collect();
    if segments.len() >= 2 {
        return ParsedName::person(segments[1], segments[0]);
    }

    let mut tokens = name.split_whitespace();
    let first = tokens.next().unwrap_or_default();
    let last = tokens.collect::<Vec<_>>().join(" ");
    ParsedName::person(first, last)
}

/// Role hint for a contact held in a custom field, from the field's label.
pub fn classify_custom_field(label: &str) -> PersonRole {
    let lowered = label.to_lowercase();
    FIELD_LABEL_RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(_, role)| *role)
        .unwrap_or(PersonRole::Other)
}

fn contact_candidate(
    source: String,
    role: PersonRole,
    display_name: &str,
    parsed_name: ParsedName,
    external_id: Option<&str>,
    email: Option<String>,
) -> CandidateEntity {
    CandidateEntity {
        source,
        kind: PersonKind::Contact,
        role,
        external_contact_id: clean_text(external_id).map(str::to_string),
        external_user_id: None,
        display_name: display_name.to_string(),
        parsed_name,
        email,
        is_primary: false,
        company_only: false,
        should_create_record: true,
        should_add_as_participant: true,
        participant_role: ParticipantRole::ThirdParty,
        should_set_as_client: false,
        should_set_as_coordinator: false,
        snapshot: None,
    }
}

fn account_candidate(record: &RawCaseRecord) -> Option<CandidateEntity> {
    let account = record.account_ref.as_ref()?;
    let email = clean_email(account.email_address.as_deref());
    let display_name = clean_text(account.reference_name())
        .map(str::to_string)
        .or_else(|| email.clone())?;

    // An account carrying only a company name is a company.
    let parsed_name = match (clean_text(account.display_name.as_deref()), clean_text(account.company_name.as_deref())) {
        (None, Some(company)) => ParsedName::company(company),
        _ => parse_name(&display_name),
    };

    let mut candidate = contact_candidate(
        "account_ref".to_string(),
        PersonRole::Client,
        &display_name,
        parsed_name,
        account.id.as_deref(),
        email,
    );
    candidate.is_primary = true;
    candidate.participant_role = ParticipantRole::Client;
    candidate.should_set_as_client = true;
    candidate.snapshot = snapshot_of(account);
    Some(candidate)
}

fn user_candidate(index: usize, user: &UserRef) -> Option<CandidateEntity> {
    let email = clean_email(user.email_address.as_deref());
    let display_name = clean_text(user.display_name.as_deref())
        .map(str::to_string)
        .or_else(|| email.clone())?;
    Some(CandidateEntity {
        source: format!("assigned_to_users[{index}]"),
        kind: PersonKind::User,
        role: PersonRole::Coordinator,
        external_contact_id: None,
        external_user_id: clean_text(user.id.as_deref()).map(str::to_string),
        parsed_name: parse_name(&display_name),
        display_name,
        email,
        is_primary: false,
        company_only: false,
        should_create_record: true,
        should_add_as_participant: true,
        participant_role: ParticipantRole::ThirdParty,
        should_set_as_client: false,
        should_set_as_coordinator: true,
        snapshot: snapshot_of(user),
    })
}

fn custom_field_candidate(index: usize, label: &str, contact: &ContactRef) -> Option<CandidateEntity> {
    let email = clean_email(contact.email_address.as_deref());
    let display_name = clean_text(contact.display_name.as_deref())
        .map(str::to_string)
        .or_else(|| email.clone())?;
    let mut candidate = contact_candidate(
        format!("custom_field_values[{index}].contact_ref"),
        classify_custom_field(label),
        &display_name,
        parse_name(&display_name),
        contact.id.as_deref(),
        email,
    );
    candidate.snapshot = snapshot_of(contact);
    Some(candidate)
}

fn free_text_candidates(record: &RawCaseRecord) -> Vec<CandidateEntity> {
    let mut candidates = Vec::new();

    for (source, value, role) in [
        ("buyer_names", record.buyer_names.as_deref(), PersonRole::Buyer),
        ("seller_names", record.seller_names.as_deref(), PersonRole::Seller),
    ] {
        if let Some(name) = clean_text(value) {
            candidates.push(contact_candidate(
                source.to_string(),
                role,
                name,
                parse_name(name),
                None,
                None,
            ));
        }
    }

    if let Some(name) = clean_text(record.referral_source.as_deref()) {
        candidates.push(contact_candidate(
            "referral_source".to_string(),
            PersonRole::Referral,
            name,
            parse_name(name),
            None,
            clean_email(record.referral_email.as_deref()),
        ));
    }

    if let Some(name) = clean_text(record.bank_name.as_deref()) {
        let mut candidate = contact_candidate(
            "bank_name".to_string(),
            PersonRole::Organization,
            name,
            ParsedName::company(name),
            None,
            None,
        );
        candidate.company_only = true;
        candidate.should_add_as_participant = false;
        candidates.push(candidate);
    }

    candidates
}

/// Derive candidate entities from one raw case record.
///
/// Pure and deterministic. Rules run in a fixed order: primary account,
/// assigned users, custom-field contacts, then free-text fields. Sub-records
/// that cannot yield a name are skipped.
pub fn extract(record: &RawCaseRecord) -> Vec<CandidateEntity> {
    let mut candidates = Vec::new();

    candidates.extend(account_candidate(record));

    candidates.extend(
        record
            .assigned_to_users
            .iter()
            .enumerate()
            .filter_map(|(index, user)| user_candidate(index, user)),
    );

    candidates.extend(
        record
            .custom_field_values
            .iter()
            .enumerate()
            .filter_map(|(index, field)| match field.content() {
                FieldContent::Contact(contact) => custom_field_candidate(index, field.label(), contact),
                FieldContent::Text(_) | FieldContent::Absent => None,
            }),
    );

    candidates.extend(free_text_candidates(record));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: JsonValue) -> RawCaseRecord {
        RawCaseRecord::from_json(&value)
    }

    #[test]
    fn name_parsing_examples() {
        assert_eq!(
            parse_name("Acme Title & Escrow LLC"),
            ParsedName::company("Acme Title & Escrow LLC")
        );
        assert_eq!(parse_name("Smith, John"), ParsedName::person("John", "Smith"));
        assert_eq!(parse_name("John Smith"), ParsedName::person("John", "Smith"));
        assert_eq!(parse_name("Prince"), ParsedName::person("Prince", ""));
        assert_eq!(parse_name("Maria de la Cruz"), ParsedName::person("Maria", "de la Cruz"));
        assert_eq!(parse_name("   "), ParsedName::default());
    }

    #[test]
    fn organization_indicators_are_case_insensitive() {
        assert!(is_organization_name("FIRST NATIONAL BANK"));
        assert!(is_organization_name("Riverside Holdings"));
        assert!(is_organization_name("Smith Holdings, Inc."));
        assert!(!is_organization_name("Priya Patel"));
        assert!(!is_organization_name("Lawrence Prince"));
    }

    #[test]
    fn custom_field_labels_follow_priority_order() {
        assert_eq!(classify_custom_field("Escrow Officer"), PersonRole::SettlementAgent);
        assert_eq!(classify_custom_field("Settlement Agent"), PersonRole::SettlementAgent);
        assert_eq!(classify_custom_field("Buyer's Lawyer"), PersonRole::Attorney);
        assert_eq!(classify_custom_field("Internal Credit Contact"), PersonRole::Internal);
        assert_eq!(classify_custom_field("Lead Source"), PersonRole::Referral);
        assert_eq!(classify_custom_field("Referral Attorney"), PersonRole::Attorney);
        assert_eq!(classify_custom_field("Appraiser"), PersonRole::Other);
        assert_eq!(classify_custom_field(""), PersonRole::Other);
    }

    #[test]
    fn placeholder_free_text_produces_no_candidates() {
        for placeholder in PLACEHOLDER_VALUES {
            let raw = record(json!({
                "buyer_names": placeholder,
                "seller_names": placeholder,
                "referral_source": placeholder,
                "bank_name": placeholder,
            }));
            assert!(extract(&raw).is_empty(), "placeholder {placeholder:?} produced a candidate");
        }

        let raw = record(json!({"buyer_names": "Carlos Rivera"}));
        let candidates = extract(&raw);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].role, PersonRole::Buyer);
        assert_eq!(candidates[0].participant_role, ParticipantRole::ThirdParty);
    }

    #[test]
    fn rules_apply_in_fixed_order() {
        let raw = record(json!({
            "id": "m-100",
            "account_ref": {"id": "acct-7", "display_name": "Patel, Priya", "email_address": " Priya@Example.com "},
            "assigned_to_users": [
                {"id": "u-1", "display_name": "Maria Garcia", "email_address": "maria@example.com"},
                {"id": "u-2", "display_name": "Robert Chen"}
            ],
            "custom_field_values": [
                {"custom_field_ref": {"label": "Escrow Officer"}, "contact_ref": {"id": "c-1", "display_name": "Dana Whitfield"}},
                {"custom_field_ref": {"label": "Notes"}, "value_string": "call after 5"}
            ],
            "seller_names": "Tom Baker",
            "referral_source": "Carlos Rivera",
            "referral_email": "CARLOS@example.com",
            "bank_name": "First Federal Bank"
        }));

        let candidates = extract(&raw);
        let sources: Vec<&str> = candidates.iter().map(|c| c.source.as_str()).collect();
        assert_eq!(
            sources,
            vec![
                "account_ref",
                "assigned_to_users[0]",
                "assigned_to_users[1]",
                "custom_field_values[0].contact_ref",
                "seller_names",
                "referral_source",
                "bank_name",
            ]
        );

        let client = &candidates[0];
        assert_eq!(client.kind, PersonKind::Contact);
        assert!(client.is_primary && client.should_set_as_client);
        assert_eq!(client.participant_role, ParticipantRole::Client);
        assert_eq!(client.external_contact_id.as_deref(), Some("acct-7"));
        assert_eq!(client.email.as_deref(), Some("priya@example.com"));
        assert_eq!(client.parsed_name, ParsedName::person("Priya", "Patel"));

        let coordinator = &candidates[1];
        assert_eq!(coordinator.kind, PersonKind::User);
        assert_eq!(coordinator.role, PersonRole::Coordinator);
        assert_eq!(coordinator.participant_role, ParticipantRole::ThirdParty);
        assert!(coordinator.should_set_as_coordinator);
        assert_eq!(coordinator.external_user_id.as_deref(), Some("u-1"));
        assert!(coordinator.external_contact_id.is_none());

        assert_eq!(candidates[3].role, PersonRole::SettlementAgent);
        assert_eq!(candidates[5].email.as_deref(), Some("carlos@example.com"));

        let bank = &candidates[6];
        assert!(bank.company_only);
        assert!(!bank.should_add_as_participant);
        assert_eq!(bank.parsed_name.company_name.as_deref(), Some("First Federal Bank"));
    }

    #[test]
    fn extraction_is_deterministic() {
        let raw = record(json!({
            "account_ref": {"company_name": "Harbor Point Holdings"},
            "assigned_to_users": [{"display_name": "Maria Garcia"}],
            "buyer_names": "Smith, John"
        }));
        let first = extract(&raw);
        let second = extract(&raw);
        assert_eq!(first, second);
        assert_eq!(first[0].parsed_name, ParsedName::company("Harbor Point Holdings"));
        assert_eq!(first[2].parsed_name, ParsedName::person("John", "Smith"));
    }

    #[test]
    fn unnamed_references_are_skipped() {
        let raw = record(json!({
            "account_ref": {"id": "acct-1"},
            "assigned_to_users": [{"id": "u-9"}, {"id": "u-10", "email_address": "ops@example.com"}],
            "custom_field_values": [{"custom_field_ref": {"label": "Attorney"}, "contact_ref": {"display_name": "null"}}]
        }));
        let candidates = extract(&raw);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].display_name, "ops@example.com");
    }
}
