use std::collections::BTreeMap;

use crate::fields::{FIELDS, Source, field_spec, fields_owned_by};
use crate::record::{
    CanonicalKey, FieldEntry, FieldState, PlayerMatchRecord, Provenance, SourceRecord,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: &'static str,
    pub before: Option<FieldState>,
    pub after: FieldState,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownField,
    NotSuppliedBySource,
    KindMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedField {
    pub field: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub record: PlayerMatchRecord,
    pub changes: Vec<FieldChange>,
    pub rejected: Vec<RejectedField>,
}

/// Merges one source's partial record into the existing record for `key`.
///
/// Only fields the incoming source may supply are touched. Owned fields the
/// source did not mention become unavailable (the source ran). Where a field
/// has more than one supplier, a higher-priority value already present is kept.
/// A present or not-applicable value is never replaced by an unavailable report.
pub fn merge_source_record(
    existing: Option<PlayerMatchRecord>,
    key: &CanonicalKey,
    incoming: &SourceRecord,
) -> MergeOutcome {
    let mut record = existing.unwrap_or_else(|| PlayerMatchRecord::new(key.clone()));
    let (states, rejected) = incoming_states(incoming);
    let provenance = Provenance {
        source: incoming.source,
        collected_at: incoming.collected_at,
    };

    let mut changes = Vec::new();
    for (name, state) in states {
        let current = record.fields.get(name);
        if !should_apply(current, &state, &provenance) {
            continue;
        }
        let before = current.map(|e| e.state.clone());
        if before.as_ref() != Some(&state) {
            changes.push(FieldChange {
                field: name,
                before,
                after: state.clone(),
                source: incoming.source,
            });
        }
        record.fields.insert(
            name.to_string(),
            FieldEntry {
                state,
                provenance: provenance.clone(),
            },
        );
    }

    for rejection in &rejected {
        tracing::warn!(
            key = %key,
            source = %incoming.source,
            field = %rejection.field,
            reason = ?rejection.reason,
            "rejected incoming field"
        );
    }
    tracing::debug!(key = %key, source = %incoming.source, changed = changes.len(), "merged source record");

    MergeOutcome {
        record,
        changes,
        rejected,
    }
}

fn incoming_states(incoming: &SourceRecord) -> (BTreeMap<&'static str, FieldState>, Vec<RejectedField>) {
    let mut states: BTreeMap<&'static str, FieldState> = BTreeMap::new();
    let mut rejected = Vec::new();

    let admit = |name: &str, rejected: &mut Vec<RejectedField>| {
        let Some(spec) = field_spec(name) else {
            rejected.push(RejectedField {
                field: name.to_string(),
                reason: RejectReason::UnknownField,
            });
            return None;
        };
        if !spec.accepts_source(incoming.source) {
            rejected.push(RejectedField {
                field: name.to_string(),
                reason: RejectReason::NotSuppliedBySource,
            });
            return None;
        }
        Some(spec)
    };

    for name in &incoming.unavailable {
        if let Some(spec) = admit(name, &mut rejected) {
            states.insert(spec.name, FieldState::Unavailable);
        }
    }
    for name in &incoming.not_applicable {
        if let Some(spec) = admit(name, &mut rejected) {
            states.insert(spec.name, FieldState::NotApplicable);
        }
    }
    for (name, value) in &incoming.fields {
        let Some(spec) = admit(name, &mut rejected) else {
            continue;
        };
        if value.is_null() {
            states.entry(spec.name).or_insert(FieldState::Unavailable);
        } else if spec.kind.accepts(value) {
            states.insert(spec.name, FieldState::Present(value.clone()));
        } else {
            rejected.push(RejectedField {
                field: name.clone(),
                reason: RejectReason::KindMismatch,
            });
        }
    }

    for spec in fields_owned_by(incoming.source) {
        let rejected_here = rejected.iter().any(|r| r.field == spec.name);
        if !rejected_here {
            states.entry(spec.name).or_insert(FieldState::Unavailable);
        }
    }

    (states, rejected)
}

/// Whether `incoming`, collected as `provenance`, may replace what the record holds.
pub fn should_apply(current: Option<&FieldEntry>, incoming: &FieldState, provenance: &Provenance) -> bool {
    let Some(current) = current else {
        return true;
    };
    if current.state.is_resolved() && matches!(incoming, FieldState::Unavailable) {
        return false;
    }
    let holder = &current.provenance;
    if holder.source == provenance.source {
        // A value fills a gap whatever the timestamps; between two values the
        // newer scrape wins.
        if incoming.is_resolved() && matches!(current.state, FieldState::Unavailable) {
            return true;
        }
        return provenance.collected_at >= holder.collected_at;
    }
    !(holder.source.outranks(provenance.source) && current.state.is_resolved())
}

/// Names of every catalog field the record has not heard about yet.
pub fn pending_fields(record: &PlayerMatchRecord) -> Vec<&'static str> {
    FIELDS
        .iter()
        .filter(|spec| !record.fields.contains_key(spec.name))
        .map(|spec| spec.name)
        .collect()
}
