use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EXPECTED_FIELD_COUNT: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Fbref,
    Sofascore,
    Whoscored,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Fbref, Source::Sofascore, Source::Whoscored];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Fbref => "fbref",
            Source::Sofascore => "sofascore",
            Source::Whoscored => "whoscored",
        }
    }

    /// Lower wins when two sources may supply the same field.
    pub fn priority(self) -> u8 {
        match self {
            Source::Fbref => 0,
            Source::Sofascore => 1,
            Source::Whoscored => 2,
        }
    }

    pub fn outranks(self, other: Source) -> bool {
        self.priority() < other.priority()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fbref" => Ok(Source::Fbref),
            "sofascore" => Ok(Source::Sofascore),
            "whoscored" => Ok(Source::Whoscored),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Date,
    Text,
    Integer,
    Float,
    Bool,
    Json,
}

impl FieldKind {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::Date => value
                .as_str()
                .is_some_and(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok()),
            FieldKind::Text => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Json => !value.is_null(),
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            FieldKind::Date | FieldKind::Text | FieldKind::Json => "TEXT",
            FieldKind::Integer | FieldKind::Bool => "INTEGER",
            FieldKind::Float => "REAL",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub owner: Source,
    pub kind: FieldKind,
    /// Non-owning sources allowed to supply this field. The merger ranks
    /// them against the owner by `Source::priority`.
    pub also_from: &'static [Source],
}

impl FieldSpec {
    pub fn accepts_source(&self, source: Source) -> bool {
        self.owner == source || self.also_from.contains(&source)
    }
}

const fn field(name: &'static str, owner: Source, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        owner,
        kind,
        also_from: &[],
    }
}

const fn shared(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        owner: Source::Fbref,
        kind,
        also_from: &[Source::Sofascore],
    }
}

use FieldKind::{Bool, Date, Float, Integer, Json, Text};
use Source::{Fbref, Whoscored};

pub static FIELDS: [FieldSpec; EXPECTED_FIELD_COUNT] = [
    // FBref match context
    field("date", Fbref, Date),
    field("competition", Fbref, Text),
    field("venue", Fbref, Text),
    field("result", Fbref, Text),
    field("opponent", Fbref, Text),
    field("home_team", Fbref, Text),
    field("away_team", Fbref, Text),
    field("home_goals", Fbref, Integer),
    field("away_goals", Fbref, Integer),
    // FBref player line
    field("starting", Fbref, Bool),
    field("position", Fbref, Text),
    field("minutes", Fbref, Integer),
    field("fouls", Fbref, Integer),
    field("fouled", Fbref, Integer),
    field("tackles", Fbref, Integer),
    field("tackles_def_3rd", Fbref, Integer),
    field("tackles_mid_3rd", Fbref, Integer),
    field("tackles_att_3rd", Fbref, Integer),
    field("challenges", Fbref, Integer),
    field("take_ons", Fbref, Integer),
    field("yellow_cards", Fbref, Integer),
    field("red_cards", Fbref, Integer),
    // FBref team/match totals
    field("team_fouls", Fbref, Integer),
    field("team_fouled", Fbref, Integer),
    // FBref-owned, Sofascore fills them when FBref leaves them blank
    shared("team_possession_pct", Float),
    shared("opponent_possession_pct", Float),
    shared("referee_name", Text),
    shared("attendance", Integer),
    // Whoscored
    field("foul_position", Whoscored, Json),
    field("team_left_attack_pct", Whoscored, Float),
    field("team_mid_attack_pct", Whoscored, Float),
    field("team_right_attack_pct", Whoscored, Float),
    field("opponent_left_attack_pct", Whoscored, Float),
    field("opponent_mid_attack_pct", Whoscored, Float),
    field("opponent_right_attack_pct", Whoscored, Float),
];

pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|spec| spec.name == name)
}

pub fn fields_owned_by(source: Source) -> impl Iterator<Item = &'static FieldSpec> {
    FIELDS.iter().filter(move |spec| spec.owner == source)
}

pub fn owned_field_count(source: Source) -> usize {
    fields_owned_by(source).count()
}

/// Fields a source may write: the ones it owns plus the ones it backs up.
pub fn fields_supplied_by(source: Source) -> impl Iterator<Item = &'static FieldSpec> {
    FIELDS.iter().filter(move |spec| spec.accepts_source(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_has_35_fields_with_sofascore_backing_four() {
        assert_eq!(FIELDS.len(), EXPECTED_FIELD_COUNT);
        assert_eq!(owned_field_count(Source::Fbref), 28);
        assert_eq!(owned_field_count(Source::Whoscored), 7);
        assert_eq!(owned_field_count(Source::Sofascore), 0);
        assert_eq!(fields_supplied_by(Source::Sofascore).count(), 4);
        assert!(fields_supplied_by(Source::Sofascore).all(|f| f.owner == Source::Fbref));
    }

    #[test]
    fn field_names_are_unique() {
        let names: HashSet<_> = FIELDS.iter().map(|f| f.name).collect();
        assert_eq!(names.len(), FIELDS.len());
    }

    #[test]
    fn kinds_check_json_types() {
        assert!(FieldKind::Integer.accepts(&serde_json::json!(2)));
        assert!(!FieldKind::Integer.accepts(&serde_json::json!(2.5)));
        assert!(FieldKind::Float.accepts(&serde_json::json!(65)));
        assert!(FieldKind::Date.accepts(&serde_json::json!("2023-05-01")));
        assert!(!FieldKind::Date.accepts(&serde_json::json!("May 1st")));
        assert!(!FieldKind::Json.accepts(&Value::Null));
    }

    #[test]
    fn priority_order_is_fbref_first() {
        assert!(Source::Fbref.outranks(Source::Sofascore));
        assert!(Source::Sofascore.outranks(Source::Whoscored));
        assert!(!Source::Whoscored.outranks(Source::Fbref));
        assert_eq!("WhoScored".parse::<Source>(), Ok(Source::Whoscored));
    }
}
