use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter,
};
use serde_json::Value;

use crate::completeness::{CompletenessPolicy, CompletenessReport, assess};
use crate::error::{ReconcileError, Result};
use crate::fields::{FIELDS, FieldKind, FieldSpec};
use crate::identity::{derive_id, normalize_name};
use crate::merge::{FieldChange, RejectedField, merge_source_record};
use crate::record::{CanonicalKey, FieldEntry, PlayerMatchRecord, SourceRecord};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Columns written after the 35 field columns, in insert order.
const META_COLUMNS: [&str; 9] = [
    "field_states",
    "sources",
    "present_fields",
    "completeness",
    "incomplete",
    "mvp_ready",
    "first_scraped_at",
    "scraped_at",
    "updated_at",
];

static UPSERT_SQL: Lazy<String> = Lazy::new(build_upsert_sql);

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub key: CanonicalKey,
    pub created: bool,
    pub changes: Vec<FieldChange>,
    pub rejected: Vec<RejectedField>,
    pub report: CompletenessReport,
}

/// A persisted row: the merged record plus the validator's verdict as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: PlayerMatchRecord,
    pub completeness: f64,
    pub present_fields: usize,
    pub incomplete: bool,
    pub mvp_ready: bool,
    pub updated_at: String,
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            ReconcileError::StoreWrite(format!("create db directory {}: {e}", parent.display()))
        })?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS players (
            player_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL,
            current_team TEXT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS player_aliases (
            alias_id INTEGER PRIMARY KEY AUTOINCREMENT,
            player_id TEXT NOT NULL,
            source TEXT NOT NULL,
            source_ref TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (source, source_ref, name_norm, player_id)
        );
        CREATE INDEX IF NOT EXISTS idx_player_aliases_ref
            ON player_aliases(source, source_ref) WHERE source_ref <> '';
        CREATE INDEX IF NOT EXISTS idx_player_aliases_norm ON player_aliases(name_norm);

        CREATE TABLE IF NOT EXISTS teams (
            team_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS team_aliases (
            alias_id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_id TEXT NOT NULL,
            source TEXT NOT NULL,
            source_ref TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (source, source_ref, name_norm, team_id)
        );
        CREATE INDEX IF NOT EXISTS idx_team_aliases_ref
            ON team_aliases(source, source_ref) WHERE source_ref <> '';
        CREATE INDEX IF NOT EXISTS idx_team_aliases_norm ON team_aliases(name_norm);

        CREATE TABLE IF NOT EXISTS referees (
            referee_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS matches (
            match_id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            competition TEXT NULL,
            home_team_id TEXT NOT NULL,
            away_team_id TEXT NOT NULL,
            home_score INTEGER NULL,
            away_score INTEGER NULL,
            attendance INTEGER NULL,
            referee_id TEXT NULL,
            fbref_url TEXT NULL,
            sofascore_url TEXT NULL,
            whoscored_url TEXT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_matches_date ON matches(date);

        CREATE TABLE IF NOT EXISTS identity_reviews (
            review_id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            source TEXT NOT NULL,
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL,
            source_ref TEXT NOT NULL DEFAULT '',
            candidates_json TEXT NOT NULL,
            record_json TEXT NULL,
            created_at TEXT NOT NULL,
            resolved_at TEXT NULL,
            resolved_id TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_identity_reviews_open
            ON identity_reviews(resolved_at, kind, source, name_norm);

        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            records_total INTEGER NOT NULL,
            records_written INTEGER NOT NULL,
            records_incomplete INTEGER NOT NULL,
            records_mvp_ready INTEGER NOT NULL,
            reviews_queued INTEGER NOT NULL,
            failures INTEGER NOT NULL,
            errors_json TEXT NOT NULL
        );
        "#,
    )?;
    conn.execute_batch(&stats_table_sql())?;
    Ok(())
}

fn stats_table_sql() -> String {
    let mut sql = String::from(
        "CREATE TABLE IF NOT EXISTS player_match_stats (\n\
         player_id TEXT NOT NULL CHECK (length(player_id) > 0),\n\
         match_id TEXT NOT NULL CHECK (length(match_id) > 0),\n",
    );
    for spec in FIELDS.iter() {
        let _ = writeln!(sql, "\"{}\" {} NULL,", spec.name, spec.kind.sql_type());
    }
    sql.push_str(
        "field_states TEXT NOT NULL,\n\
         sources TEXT NOT NULL,\n\
         present_fields INTEGER NOT NULL,\n\
         completeness REAL NOT NULL CHECK (completeness >= 0.0 AND completeness <= 1.0),\n\
         incomplete INTEGER NOT NULL,\n\
         mvp_ready INTEGER NOT NULL,\n\
         first_scraped_at TEXT NOT NULL,\n\
         scraped_at TEXT NOT NULL,\n\
         updated_at TEXT NOT NULL,\n\
         PRIMARY KEY (player_id, match_id)\n\
         );\n\
         CREATE INDEX IF NOT EXISTS idx_stats_match ON player_match_stats(match_id);\n\
         CREATE INDEX IF NOT EXISTS idx_stats_incomplete ON player_match_stats(incomplete);\n",
    );
    sql
}

fn build_upsert_sql() -> String {
    let mut columns: Vec<String> = vec!["player_id".to_string(), "match_id".to_string()];
    columns.extend(FIELDS.iter().map(|spec| format!("\"{}\"", spec.name)));
    columns.extend(META_COLUMNS.iter().map(|c| c.to_string()));

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .skip(2)
        .map(|col| {
            if col == "first_scraped_at" {
                "first_scraped_at = min(player_match_stats.first_scraped_at, excluded.first_scraped_at)"
                    .to_string()
            } else {
                format!("{col} = excluded.{col}")
            }
        })
        .collect();

    format!(
        "INSERT INTO player_match_stats ({}) VALUES ({})\n\
         ON CONFLICT(player_id, match_id) DO UPDATE SET {}",
        columns.join(", "),
        placeholders.join(", "),
        updates.join(",\n    ")
    )
}

/// Merges `incoming` into the stored record for `key` and persists the result in
/// its own IMMEDIATE transaction. All or nothing: a failure leaves the stored
/// row exactly as it was.
pub fn upsert_record(
    conn: &mut Connection,
    key: &CanonicalKey,
    incoming: &SourceRecord,
    policy: &CompletenessPolicy,
) -> Result<WriteOutcome> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| ReconcileError::StoreWrite(format!("begin write for {key}: {e}")))?;
    let outcome = write_record(&tx, key, incoming, policy)?;
    tx.commit()
        .map_err(|e| ReconcileError::StoreWrite(format!("commit {key}: {e}")))?;
    Ok(outcome)
}

/// The write step on a caller-owned transaction, so identity resolution and
/// the row upsert can commit together.
pub fn write_record(
    tx: &Transaction<'_>,
    key: &CanonicalKey,
    incoming: &SourceRecord,
    policy: &CompletenessPolicy,
) -> Result<WriteOutcome> {
    key.validate()
        .map_err(|e| ReconcileError::StoreWrite(format!("invalid key {key}: {e}")))?;

    let existing = load_record(tx, key)?;
    let created = existing.is_none();
    let merged = merge_source_record(existing, key, incoming);
    let report = assess(&merged.record, policy);

    upsert_row(tx, &merged.record, &report)
        .map_err(|e| ReconcileError::StoreWrite(format!("upsert {key}: {e}")))?;
    update_match_context(tx, &merged.record)
        .map_err(|e| ReconcileError::StoreWrite(format!("update match for {key}: {e}")))?;

    tracing::info!(
        key = %key,
        source = %incoming.source,
        present = report.present,
        score = report.score,
        mvp_ready = report.mvp_ready,
        changed = merged.changes.len(),
        "record written"
    );

    Ok(WriteOutcome {
        key: key.clone(),
        created,
        changes: merged.changes,
        rejected: merged.rejected,
        report,
    })
}

fn upsert_row(
    tx: &Transaction<'_>,
    record: &PlayerMatchRecord,
    report: &CompletenessReport,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let collected = record
        .last_collected_at()
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| now.clone());
    let first_collected = record
        .fields
        .values()
        .map(|e| e.provenance.collected_at)
        .min()
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| collected.clone());
    let sources = record
        .contributing_sources()
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let mut values: Vec<SqlValue> = Vec::with_capacity(2 + FIELDS.len() + META_COLUMNS.len());
    values.push(SqlValue::Text(record.key.player_id.clone()));
    values.push(SqlValue::Text(record.key.match_id.clone()));
    values.extend(FIELDS.iter().map(|spec| column_value(spec, record)));
    values.push(SqlValue::Text(serde_json::to_string(&record.fields)?));
    values.push(SqlValue::Text(sources));
    values.push(SqlValue::Integer(report.present as i64));
    values.push(SqlValue::Real(report.score));
    values.push(SqlValue::Integer(bool_to_i64(report.incomplete)));
    values.push(SqlValue::Integer(bool_to_i64(report.mvp_ready)));
    values.push(SqlValue::Text(first_collected));
    values.push(SqlValue::Text(collected));
    values.push(SqlValue::Text(now));

    tx.execute(UPSERT_SQL.as_str(), params_from_iter(values))?;
    Ok(())
}

fn column_value(spec: &FieldSpec, record: &PlayerMatchRecord) -> SqlValue {
    let Some(value) = record.value(spec.name) else {
        return SqlValue::Null;
    };
    let converted = match spec.kind {
        FieldKind::Date | FieldKind::Text => value.as_str().map(|s| SqlValue::Text(s.to_string())),
        FieldKind::Integer => value.as_i64().map(SqlValue::Integer),
        FieldKind::Float => value.as_f64().map(SqlValue::Real),
        FieldKind::Bool => value.as_bool().map(|b| SqlValue::Integer(bool_to_i64(b))),
        FieldKind::Json => Some(SqlValue::Text(value.to_string())),
    };
    converted.unwrap_or(SqlValue::Null)
}

/// Pushes match-level facts from the record onto the `matches` and `referees`
/// rows. Only present values are written; a missing one keeps what is stored.
fn update_match_context(tx: &Transaction<'_>, record: &PlayerMatchRecord) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let referee_id = match record.value("referee_name").and_then(Value::as_str) {
        Some(name) if !normalize_name(name).is_empty() => {
            let name_norm = normalize_name(name);
            let referee_id = derive_id("rf", &name_norm);
            tx.execute(
                r#"
                INSERT INTO referees (referee_id, name, name_norm, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(referee_id) DO UPDATE SET
                    name = excluded.name,
                    updated_at = excluded.updated_at
                "#,
                params![referee_id, name.trim(), name_norm, now],
            )?;
            Some(referee_id)
        }
        _ => None,
    };

    tx.execute(
        r#"
        UPDATE matches SET
            home_score = COALESCE(?1, home_score),
            away_score = COALESCE(?2, away_score),
            attendance = COALESCE(?3, attendance),
            referee_id = COALESCE(?4, referee_id),
            updated_at = ?5
        WHERE match_id = ?6
        "#,
        params![
            record.value("home_goals").and_then(Value::as_i64),
            record.value("away_goals").and_then(Value::as_i64),
            record.value("attendance").and_then(Value::as_i64),
            referee_id,
            now,
            record.key.match_id
        ],
    )?;
    Ok(())
}

pub fn load_record(conn: &Connection, key: &CanonicalKey) -> Result<Option<PlayerMatchRecord>> {
    let raw = conn
        .query_row(
            "SELECT field_states FROM player_match_stats WHERE player_id = ?1 AND match_id = ?2",
            params![key.player_id, key.match_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let fields: BTreeMap<String, FieldEntry> = serde_json::from_str(&raw)?;
    Ok(Some(PlayerMatchRecord {
        key: key.clone(),
        fields,
    }))
}

pub fn fetch_stored(conn: &Connection, key: &CanonicalKey) -> Result<Option<StoredRecord>> {
    Ok(query_stored(
        conn,
        "WHERE player_id = ?1 AND match_id = ?2",
        params![key.player_id, key.match_id],
    )?
    .into_iter()
    .next())
}

pub fn fetch_by_player(conn: &Connection, player_id: &str) -> Result<Vec<StoredRecord>> {
    query_stored(
        conn,
        "WHERE player_id = ?1 ORDER BY \"date\" ASC, match_id ASC",
        params![player_id],
    )
}

pub fn fetch_by_match(conn: &Connection, match_id: &str) -> Result<Vec<StoredRecord>> {
    query_stored(
        conn,
        "WHERE match_id = ?1 ORDER BY player_id ASC",
        params![match_id],
    )
}

pub fn fetch_incomplete(conn: &Connection) -> Result<Vec<StoredRecord>> {
    query_stored(
        conn,
        "WHERE incomplete = 1 ORDER BY completeness ASC, player_id ASC, match_id ASC",
        params![],
    )
}

pub fn fetch_by_completeness(conn: &Connection, min_score: f64) -> Result<Vec<StoredRecord>> {
    query_stored(
        conn,
        "WHERE completeness >= ?1 ORDER BY completeness DESC, player_id ASC, match_id ASC",
        params![min_score],
    )
}

pub fn count_records(conn: &Connection) -> Result<usize> {
    let n = conn.query_row("SELECT COUNT(*) FROM player_match_stats", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(n.max(0) as usize)
}

fn query_stored(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<StoredRecord>> {
    let sql = format!(
        "SELECT player_id, match_id, field_states, completeness, present_fields, incomplete, mvp_ready, updated_at
         FROM player_match_stats {filter}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, i64>(5)? != 0,
            row.get::<_, i64>(6)? != 0,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (player_id, match_id, states, completeness, present, incomplete, mvp_ready, updated_at) =
            row?;
        let fields: BTreeMap<String, FieldEntry> = serde_json::from_str(&states)?;
        out.push(StoredRecord {
            record: PlayerMatchRecord {
                key: CanonicalKey::new(player_id, match_id),
                fields,
            },
            completeness,
            present_fields: present.max(0) as usize,
            incomplete,
            mvp_ready,
            updated_at,
        });
    }
    Ok(out)
}

fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}
