use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fields::Source;
use crate::identity::{MatchDescriptor, PlayerDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub player_id: String,
    pub match_id: String,
}

impl CanonicalKey {
    pub fn new(player_id: impl Into<String>, match_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            match_id: match_id.into(),
        }
    }

    /// Rejects keys the store must never persist.
    pub fn validate(&self) -> Result<(), String> {
        check_id_part("player_id", &self.player_id)?;
        check_id_part("match_id", &self.match_id)?;
        Ok(())
    }
}

fn check_id_part(label: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{label} is empty"));
    }
    if value.len() > 64 {
        return Err(format!("{label} longer than 64 bytes"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!("{label} has invalid characters: {value:?}"));
    }
    Ok(())
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.player_id, self.match_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: Source,
    pub collected_at: DateTime<Utc>,
}

/// State of a field some source has reported on. A field no source has
/// reported on yet is simply absent from the record (pending).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldState {
    Present(Value),
    Unavailable,
    NotApplicable,
}

impl FieldState {
    pub fn is_present(&self) -> bool {
        matches!(self, FieldState::Present(_))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, FieldState::Present(_) | FieldState::NotApplicable)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            FieldState::Present(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub state: FieldState,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMatchRecord {
    pub key: CanonicalKey,
    pub fields: BTreeMap<String, FieldEntry>,
}

impl PlayerMatchRecord {
    pub fn new(key: CanonicalKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
        }
    }

    pub fn entry(&self, name: &str) -> Option<&FieldEntry> {
        self.fields.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).and_then(|e| e.state.value())
    }

    pub fn present_count(&self) -> usize {
        self.fields.values().filter(|e| e.state.is_present()).count()
    }

    /// Sources that currently back at least one field, in priority order.
    pub fn contributing_sources(&self) -> Vec<Source> {
        let mut out: Vec<Source> = self.fields.values().map(|e| e.provenance.source).collect();
        out.sort_by_key(|s| s.priority());
        out.dedup();
        out
    }

    pub fn last_collected_at(&self) -> Option<DateTime<Utc>> {
        self.fields.values().map(|e| e.provenance.collected_at).max()
    }
}

/// One collector's output for one player in one match. This is the only
/// shape the reconciliation core accepts from a scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source: Source,
    pub player: PlayerDescriptor,
    #[serde(rename = "match")]
    pub match_info: MatchDescriptor,
    pub collected_at: DateTime<Utc>,
    /// `null` values mean the source ran but could not read the field.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub unavailable: Vec<String>,
    #[serde(default)]
    pub not_applicable: Vec<String>,
}

impl SourceRecord {
    pub fn new(
        source: Source,
        player: PlayerDescriptor,
        match_info: MatchDescriptor,
        collected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            player,
            match_info,
            collected_at,
            fields: BTreeMap::new(),
            unavailable: Vec::new(),
            not_applicable: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_not_applicable(mut self, name: &str) -> Self {
        self.not_applicable.push(name.to_string());
        self
    }

    /// True for the placeholder a blocked or exhausted collector leaves behind.
    /// Merging it marks every field the source owns unavailable.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.unavailable.is_empty() && self.not_applicable.is_empty()
    }
}

pub fn parse_source_records_jsonl(raw: &str) -> Vec<Result<SourceRecord, String>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(idx, line)| {
            serde_json::from_str::<SourceRecord>(line.trim())
                .map_err(|err| format!("line {}: {err}", idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation_rejects_blank_and_odd_ids() {
        assert!(CanonicalKey::new("pl-abc", "mt-def").validate().is_ok());
        assert!(CanonicalKey::new("", "mt-def").validate().is_err());
        assert!(CanonicalKey::new("pl-abc", "mt def").validate().is_err());
        assert!(CanonicalKey::new("pl-abc", "mt-'; drop").validate().is_err());
    }

    #[test]
    fn field_entry_round_trips_through_json() {
        let entry = FieldEntry {
            state: FieldState::Present(serde_json::json!(2)),
            provenance: Provenance {
                source: Source::Fbref,
                collected_at: DateTime::parse_from_rfc3339("2023-05-02T10:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["state"]["kind"], "present");
        assert_eq!(json["state"]["value"], 2);
        assert_eq!(json["provenance"]["source"], "fbref");

        let back: FieldEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn jsonl_skips_blank_and_comment_lines() {
        let raw = "\n# header\n{\"source\":\"fbref\"}\n";
        let parsed = parse_source_records_jsonl(raw);
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].as_ref().unwrap_err().starts_with("line 3:"));
    }
}
