use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::{jaro_winkler, normalized_levenshtein};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::error::{ReconcileError, Result};
use crate::fields::Source;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.90;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
}

impl PlayerDescriptor {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Natural key across sources is (date, home, away); no numeric match ID is shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDescriptor {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
    #[serde(default)]
    pub competition: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

impl MatchDescriptor {
    pub fn new(date: NaiveDate, home_team: &str, away_team: &str) -> Self {
        Self {
            date: Some(date),
            home_team: home_team.to_string(),
            away_team: away_team.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Player,
    Team,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::Player => "player",
            IdentityKind::Team => "team",
        }
    }

    fn table(self) -> &'static str {
        match self {
            IdentityKind::Player => "players",
            IdentityKind::Team => "teams",
        }
    }

    fn alias_table(self) -> &'static str {
        match self {
            IdentityKind::Player => "player_aliases",
            IdentityKind::Team => "team_aliases",
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            IdentityKind::Player => "player_id",
            IdentityKind::Team => "team_id",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            IdentityKind::Player => "pl",
            IdentityKind::Team => "tm",
        }
    }

    fn similarity(self, a: &str, b: &str) -> f64 {
        match self {
            IdentityKind::Player => person_name_similarity(a, b),
            IdentityKind::Team => team_name_similarity(a, b),
        }
    }

    fn conflicts(self, a: &str, b: &str, threshold: f64) -> bool {
        match self {
            IdentityKind::Player => given_name_conflict(a, b, threshold),
            IdentityKind::Team => false,
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IdentityKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "player" => Ok(IdentityKind::Player),
            "team" => Ok(IdentityKind::Team),
            other => Err(format!("unknown identity kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchIdentity {
    pub match_id: String,
    pub date: NaiveDate,
    pub home_team_id: String,
    pub away_team_id: String,
}

/// Case-folded, diacritic-stripped, punctuation-free form used for every
/// name comparison. "Kylian Mbappé" and "KYLIAN  MBAPPE" normalize equal.
pub fn normalize_name(raw: &str) -> String {
    let folded: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scores two normalized person names in `[0, 1]`.
///
/// Surname and given name are compared separately and the weaker of the two
/// wins, so a shared surname never carries two different given names over the
/// threshold. A single-letter given name ("l messi") is compatible with any
/// given name starting with that letter. When either side has no given name the
/// surname decides alone.
pub fn person_name_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let ta: Vec<&str> = a.split_whitespace().collect();
    let tb: Vec<&str> = b.split_whitespace().collect();
    let (Some(last_a), Some(last_b)) = (ta.last(), tb.last()) else {
        return 0.0;
    };
    let surname = jaro_winkler(last_a, last_b);
    let given = if ta.len() > 1 && tb.len() > 1 {
        given_name_similarity(ta[0], tb[0])
    } else {
        1.0
    };
    surname.min(given)
}

fn given_name_similarity(a: &str, b: &str) -> f64 {
    if a.chars().count() == 1 || b.chars().count() == 1 {
        return if a.chars().next() == b.chars().next() {
            1.0
        } else {
            0.0
        };
    }
    jaro_winkler(a, b)
}

/// True when both names spell out a given name, the surnames agree and the
/// given names do not: "lucas messi" against "lionel messi".
pub fn given_name_conflict(a: &str, b: &str, threshold: f64) -> bool {
    let ta: Vec<&str> = a.split_whitespace().collect();
    let tb: Vec<&str> = b.split_whitespace().collect();
    if ta.len() < 2 || tb.len() < 2 {
        return false;
    }
    let (given_a, given_b) = (ta[0], tb[0]);
    if given_a.chars().count() == 1 || given_b.chars().count() == 1 {
        return false;
    }
    jaro_winkler(ta[ta.len() - 1], tb[tb.len() - 1]) >= threshold
        && jaro_winkler(given_a, given_b) < threshold
}

/// Scores two normalized club names in `[0, 1]`. An abbreviation of the other
/// name ("psg", "paris s g", "man city") scores 1.0; anything else falls back
/// to normalized Levenshtein. Club names share long prefixes
/// ("manchester city"/"manchester united"), which Jaro-Winkler rewards and edit
/// distance does not.
pub fn team_name_similarity(a: &str, b: &str) -> f64 {
    if a == b || is_abbreviation(a, b) || is_abbreviation(b, a) {
        return 1.0;
    }
    normalized_levenshtein(a, b)
}

/// `short` is the initials of `long` ("psg"), or abbreviates it token by token
/// ("paris s g", "man city").
fn is_abbreviation(short: &str, long: &str) -> bool {
    let long: Vec<&str> = long.split_whitespace().collect();
    let short: Vec<&str> = short.split_whitespace().collect();
    if long.len() < 2 || short.is_empty() {
        return false;
    }
    if let [only] = short.as_slice() {
        let initials: String = long.iter().filter_map(|t| t.chars().next()).collect();
        return *only == initials;
    }
    short.len() == long.len() && short.iter().zip(&long).all(|(s, l)| l.starts_with(s))
}

pub(crate) fn derive_id(prefix: &str, natural_key: &str) -> String {
    let digest = Sha256::digest(natural_key.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{prefix}-{hex}")
}

/// Resolves a player descriptor to a canonical player ID, creating the identity
/// and alias when nothing known matches. Must run inside an IMMEDIATE
/// transaction so concurrent first sightings cannot both create an identity.
pub fn resolve_player(
    tx: &Transaction<'_>,
    source: Source,
    player: &PlayerDescriptor,
    threshold: f64,
) -> Result<String> {
    if player.name.trim().is_empty() {
        return Err(ReconcileError::IdentityResolution(
            "player descriptor has no display name".to_string(),
        ));
    }
    let player_id = resolve(
        tx,
        IdentityKind::Player,
        source,
        &player.name,
        player.source_id.as_deref(),
        threshold,
    )?;
    if let Some(team) = player.team.as_deref().filter(|t| !t.trim().is_empty()) {
        tx.execute(
            "UPDATE players SET current_team = ?1, updated_at = ?2 WHERE player_id = ?3",
            params![team.trim(), Utc::now().to_rfc3339(), player_id],
        )?;
    }
    Ok(player_id)
}

/// Resolves both teams at `team_threshold` and derives the match ID from the
/// date and the unordered team pair.
pub fn resolve_match(
    tx: &Transaction<'_>,
    source: Source,
    descriptor: &MatchDescriptor,
    team_threshold: f64,
) -> Result<MatchIdentity> {
    let Some(date) = descriptor.date else {
        return Err(ReconcileError::IdentityResolution(
            "match descriptor has no date".to_string(),
        ));
    };
    if descriptor.home_team.trim().is_empty() || descriptor.away_team.trim().is_empty() {
        return Err(ReconcileError::IdentityResolution(format!(
            "match on {date} is missing a team name"
        )));
    }

    let home_team_id = resolve(
        tx,
        IdentityKind::Team,
        source,
        &descriptor.home_team,
        None,
        team_threshold,
    )?;
    let away_team_id = resolve(
        tx,
        IdentityKind::Team,
        source,
        &descriptor.away_team,
        None,
        team_threshold,
    )?;
    if home_team_id == away_team_id {
        return Err(ReconcileError::IdentityResolution(format!(
            "'{}' and '{}' resolve to the same team",
            descriptor.home_team, descriptor.away_team
        )));
    }

    // Unordered pair: sources disagreeing on home/away still land on one match.
    let (first, second) = if home_team_id <= away_team_id {
        (&home_team_id, &away_team_id)
    } else {
        (&away_team_id, &home_team_id)
    };
    let match_id = derive_id("mt", &format!("{date}|{first}|{second}"));
    let now = Utc::now().to_rfc3339();
    tx.execute(
        r#"
        INSERT INTO matches (match_id, date, competition, home_team_id, away_team_id, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        ON CONFLICT(match_id) DO UPDATE SET
            competition = COALESCE(excluded.competition, matches.competition),
            updated_at = excluded.updated_at
        "#,
        params![
            match_id,
            date.to_string(),
            descriptor.competition.as_deref().map(str::trim),
            home_team_id,
            away_team_id,
            now
        ],
    )?;
    if let Some(source_ref) = descriptor.source_id.as_deref().filter(|s| !s.trim().is_empty()) {
        let column = match source {
            Source::Fbref => "fbref_url",
            Source::Sofascore => "sofascore_url",
            Source::Whoscored => "whoscored_url",
        };
        tx.execute(
            &format!("UPDATE matches SET {column} = ?1 WHERE match_id = ?2"),
            params![source_ref.trim(), match_id],
        )?;
    }

    Ok(MatchIdentity {
        match_id,
        date,
        home_team_id,
        away_team_id,
    })
}

fn resolve(
    tx: &Transaction<'_>,
    kind: IdentityKind,
    source: Source,
    name: &str,
    source_ref: Option<&str>,
    threshold: f64,
) -> Result<String> {
    let name = name.trim();
    let name_norm = normalize_name(name);
    if name_norm.is_empty() {
        return Err(ReconcileError::IdentityResolution(format!(
            "{kind} name {name:?} has no letters or digits"
        )));
    }
    let source_ref = source_ref.map(str::trim).filter(|s| !s.is_empty());

    if let Some(source_ref) = source_ref
        && let Some(id) = lookup_source_ref(tx, kind, source, source_ref)?
    {
        record_alias(tx, kind, &id, source, Some(source_ref), name, &name_norm)?;
        return Ok(id);
    }

    if let Some(id) = reviewed_decision(tx, kind, source, &name_norm, source_ref)? {
        record_alias(tx, kind, &id, source, source_ref, name, &name_norm)?;
        return Ok(id);
    }

    let exact = exact_matches(tx, kind, &name_norm)?;
    let candidates = if exact.is_empty() {
        fuzzy_matches(tx, kind, &name_norm, threshold)?
    } else {
        exact
    };

    match candidates.as_slice() {
        [] => {
            let id = create_identity(tx, kind, name, &name_norm)?;
            record_alias(tx, kind, &id, source, source_ref, name, &name_norm)?;
            tracing::info!(kind = %kind, %source, name, id = %id, "created canonical identity");
            Ok(id)
        }
        [only] => {
            record_alias(tx, kind, only, source, source_ref, name, &name_norm)?;
            Ok(only.clone())
        }
        _ => {
            tracing::warn!(
                kind = %kind,
                %source,
                name,
                candidates = ?candidates,
                "ambiguous identity, needs manual review"
            );
            Err(ReconcileError::AmbiguousIdentity {
                kind,
                origin: source,
                name: name.to_string(),
                source_ref: source_ref.map(str::to_string),
                candidates,
                review_id: None,
            })
        }
    }
}

fn lookup_source_ref(
    tx: &Transaction<'_>,
    kind: IdentityKind,
    source: Source,
    source_ref: &str,
) -> Result<Option<String>> {
    let sql = format!(
        "SELECT {id} FROM {aliases} WHERE source = ?1 AND source_ref = ?2 LIMIT 1",
        id = kind.id_column(),
        aliases = kind.alias_table()
    );
    let id = tx
        .query_row(&sql, params![source.as_str(), source_ref], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    Ok(id)
}

/// A manual review already settled this exact (source, name, ref) sighting.
fn reviewed_decision(
    tx: &Transaction<'_>,
    kind: IdentityKind,
    source: Source,
    name_norm: &str,
    source_ref: Option<&str>,
) -> Result<Option<String>> {
    let id = tx
        .query_row(
            r#"
            SELECT resolved_id FROM identity_reviews
            WHERE kind = ?1 AND source = ?2 AND name_norm = ?3 AND source_ref = ?4
              AND resolved_id IS NOT NULL
            ORDER BY resolved_at DESC, review_id DESC
            LIMIT 1
            "#,
            params![kind.as_str(), source.as_str(), name_norm, source_ref.unwrap_or_default()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(id)
}

fn exact_matches(tx: &Transaction<'_>, kind: IdentityKind, name_norm: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT {id} FROM {aliases} WHERE name_norm = ?1 ORDER BY {id}",
        id = kind.id_column(),
        aliases = kind.alias_table()
    );
    let mut stmt = tx.prepare(&sql)?;
    let rows = stmt.query_map(params![name_norm], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Every identity with at least one alias scoring at or above `threshold` and
/// no alias contradicting the name. A player known as both "l messi" and
/// "lionel messi" is not a candidate for "lucas messi", even though the
/// initial alias agrees.
fn fuzzy_matches(
    tx: &Transaction<'_>,
    kind: IdentityKind,
    name_norm: &str,
    threshold: f64,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT {id}, name_norm FROM {aliases} ORDER BY {id}",
        id = kind.id_column(),
        aliases = kind.alias_table()
    );
    let mut stmt = tx.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut verdicts: BTreeMap<String, (bool, bool)> = BTreeMap::new();
    for row in rows {
        let (id, alias_norm) = row?;
        let (matched, conflicted) = verdicts.entry(id).or_default();
        *matched |= kind.similarity(name_norm, &alias_norm) >= threshold;
        *conflicted |= kind.conflicts(name_norm, &alias_norm, threshold);
    }
    Ok(verdicts
        .into_iter()
        .filter(|(_, (matched, conflicted))| *matched && !*conflicted)
        .map(|(id, _)| id)
        .collect())
}

/// Inserts a new identity row. The ID is derived from the normalized name; a
/// clash with an existing identity (two people with one name, split by manual
/// review) is salted until the insert lands.
pub(crate) fn create_identity(
    tx: &Transaction<'_>,
    kind: IdentityKind,
    name: &str,
    name_norm: &str,
) -> Result<String> {
    let sql = format!(
        "INSERT OR IGNORE INTO {table} ({id}, name, name_norm, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        table = kind.table(),
        id = kind.id_column()
    );
    let now = Utc::now().to_rfc3339();
    for salt in 0u32..1000 {
        let natural_key = if salt == 0 {
            name_norm.to_string()
        } else {
            format!("{name_norm}#{salt}")
        };
        let id = derive_id(kind.id_prefix(), &natural_key);
        if tx.execute(&sql, params![id, name, name_norm, now])? == 1 {
            return Ok(id);
        }
    }
    Err(ReconcileError::StoreWrite(format!(
        "could not allocate a {kind} id for {name:?}"
    )))
}

pub(crate) fn identity_exists(tx: &Transaction<'_>, kind: IdentityKind, id: &str) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM {table} WHERE {id_col} = ?1",
        table = kind.table(),
        id_col = kind.id_column()
    );
    Ok(tx
        .query_row(&sql, params![id], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Append-only: an alias row is inserted once and never updated.
pub(crate) fn record_alias(
    tx: &Transaction<'_>,
    kind: IdentityKind,
    id: &str,
    source: Source,
    source_ref: Option<&str>,
    name: &str,
    name_norm: &str,
) -> Result<()> {
    let sql = format!(
        "INSERT OR IGNORE INTO {aliases} ({id_col}, source, source_ref, name, name_norm, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        aliases = kind.alias_table(),
        id_col = kind.id_column()
    );
    tx.execute(
        &sql,
        params![
            id,
            source.as_str(),
            source_ref.unwrap_or_default(),
            name,
            name_norm,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}
