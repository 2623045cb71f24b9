use serde::{Deserialize, Serialize};

use crate::fields::{EXPECTED_FIELD_COUNT, FIELDS, Source};
use crate::record::{FieldState, PlayerMatchRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Present,
    /// No supplier of the field has run for this match yet.
    MissingPending,
    /// A supplier ran but could not read the field (blocked, absent from the page).
    MissingUnavailable,
    /// The field has no meaning for this match.
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletenessPolicy {
    /// Present fields required for MVP readiness.
    pub min_present_fields: usize,
    /// No field owned by these sources may be pending or unavailable.
    /// A not-applicable field has nothing to collect and does not block.
    pub mandatory_sources: Vec<Source>,
}

impl Default for CompletenessPolicy {
    fn default() -> Self {
        Self {
            min_present_fields: 28,
            mandatory_sources: vec![Source::Fbref],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletenessReport {
    pub statuses: Vec<(&'static str, FieldStatus)>,
    pub present: usize,
    pub pending: usize,
    pub unavailable: usize,
    pub not_applicable: usize,
    pub score: f64,
    pub missing_mandatory: Vec<&'static str>,
    pub mvp_ready: bool,
    pub incomplete: bool,
}

impl CompletenessReport {
    pub fn status(&self, field: &str) -> Option<FieldStatus> {
        self.statuses
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, status)| *status)
    }

    pub fn fields_with(&self, status: FieldStatus) -> Vec<&'static str> {
        self.statuses
            .iter()
            .filter(|(_, s)| *s == status)
            .map(|(name, _)| *name)
            .collect()
    }
}

pub fn field_status(record: &PlayerMatchRecord, field: &str) -> FieldStatus {
    match record.entry(field).map(|e| &e.state) {
        None => FieldStatus::MissingPending,
        Some(FieldState::Present(_)) => FieldStatus::Present,
        Some(FieldState::Unavailable) => FieldStatus::MissingUnavailable,
        Some(FieldState::NotApplicable) => FieldStatus::NotApplicable,
    }
}

/// Classifies all 35 catalog fields and scores the record. Records that fail
/// the policy are still returned with `incomplete` set; nothing is dropped here.
pub fn assess(record: &PlayerMatchRecord, policy: &CompletenessPolicy) -> CompletenessReport {
    let statuses: Vec<(&'static str, FieldStatus)> = FIELDS
        .iter()
        .map(|spec| (spec.name, field_status(record, spec.name)))
        .collect();

    let count = |status: FieldStatus| statuses.iter().filter(|(_, s)| *s == status).count();
    let present = count(FieldStatus::Present);
    let pending = count(FieldStatus::MissingPending);
    let unavailable = count(FieldStatus::MissingUnavailable);
    let not_applicable = count(FieldStatus::NotApplicable);

    let score = present as f64 / EXPECTED_FIELD_COUNT as f64;

    let missing_mandatory: Vec<&'static str> = FIELDS
        .iter()
        .zip(&statuses)
        .filter(|(spec, _)| policy.mandatory_sources.contains(&spec.owner))
        .filter(|(_, (_, status))| {
            matches!(
                status,
                FieldStatus::MissingPending | FieldStatus::MissingUnavailable
            )
        })
        .map(|(spec, _)| spec.name)
        .collect();

    let mvp_ready = present >= policy.min_present_fields && missing_mandatory.is_empty();
    let incomplete = present < EXPECTED_FIELD_COUNT;

    CompletenessReport {
        statuses,
        present,
        pending,
        unavailable,
        not_applicable,
        score,
        missing_mandatory,
        mvp_ready,
        incomplete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::fields::fields_owned_by;
    use crate::record::{CanonicalKey, FieldEntry, Provenance};

    fn record_with(sources: &[Source], skip: &[&str]) -> PlayerMatchRecord {
        let mut record = PlayerMatchRecord::new(CanonicalKey::new("pl-1", "mt-1"));
        for source in sources {
            for spec in fields_owned_by(*source) {
                if skip.contains(&spec.name) {
                    continue;
                }
                record.fields.insert(
                    spec.name.to_string(),
                    FieldEntry {
                        state: FieldState::Present(json!(1)),
                        provenance: Provenance {
                            source: *source,
                            collected_at: Utc.with_ymd_and_hms(2023, 5, 2, 10, 0, 0).unwrap(),
                        },
                    },
                );
            }
        }
        record
    }

    #[test]
    fn fbref_only_is_mvp_ready_but_incomplete() {
        let report = assess(&record_with(&[Source::Fbref], &[]), &CompletenessPolicy::default());
        assert_eq!(report.present, 28);
        assert_eq!(report.pending, 7);
        assert_eq!(report.score, 0.8);
        assert!(report.mvp_ready);
        assert!(report.incomplete);
    }

    #[test]
    fn missing_fbref_field_blocks_mvp_whatever_else_is_present() {
        let record = record_with(&[Source::Fbref, Source::Whoscored], &["fouls"]);
        let policy = CompletenessPolicy {
            min_present_fields: 1,
            ..CompletenessPolicy::default()
        };
        let report = assess(&record, &policy);
        assert_eq!(report.present, 34);
        assert_eq!(report.missing_mandatory, vec!["fouls"]);
        assert!(!report.mvp_ready);
    }

    #[test]
    fn not_applicable_counts_against_the_score() {
        let mut record = record_with(&[Source::Fbref, Source::Whoscored], &[]);
        if let Some(entry) = record.fields.get_mut("red_cards") {
            entry.state = FieldState::NotApplicable;
        }
        let report = assess(&record, &CompletenessPolicy::default());
        assert_eq!(report.present, 34);
        assert_eq!(report.not_applicable, 1);
        assert_eq!(report.score, 34.0 / 35.0);
        assert!(report.incomplete);
        assert!(report.missing_mandatory.is_empty());
        assert!(report.mvp_ready);
        assert_eq!(report.status("red_cards"), Some(FieldStatus::NotApplicable));
        assert_eq!(report.fields_with(FieldStatus::NotApplicable), vec!["red_cards"]);
    }

    #[test]
    fn not_applicable_does_not_help_reach_the_threshold() {
        let mut record = record_with(&[Source::Fbref], &[]);
        for name in ["red_cards", "yellow_cards"] {
            if let Some(entry) = record.fields.get_mut(name) {
                entry.state = FieldState::NotApplicable;
            }
        }
        let report = assess(&record, &CompletenessPolicy::default());
        assert_eq!(report.present, 26);
        assert!(report.missing_mandatory.is_empty());
        assert!(!report.mvp_ready, "26 present fields are below the 28 threshold");
    }

    #[test]
    fn empty_record_is_all_pending() {
        let report = assess(&record_with(&[], &[]), &CompletenessPolicy::default());
        assert_eq!(report.pending, 35);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.missing_mandatory.len(), 28);
        assert!(report.incomplete);
    }
}
