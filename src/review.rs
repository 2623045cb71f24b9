use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::{ReconcileError, Result};
use crate::fields::Source;
use crate::identity::{self, IdentityKind, normalize_name};
use crate::record::SourceRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityReview {
    pub review_id: i64,
    pub kind: IdentityKind,
    pub source: Source,
    pub name: String,
    pub source_ref: Option<String>,
    pub candidates: Vec<String>,
    /// The partial record that hit the ambiguity, replayed once resolved.
    pub record: Option<SourceRecord>,
    pub created_at: String,
    pub resolved_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewResolution {
    Existing(String),
    NewIdentity,
}

/// Queues an ambiguous resolution. An identical open review is reused, so
/// re-running a batch does not pile up duplicates. Returns the review ID.
pub fn enqueue_review(
    conn: &Connection,
    ambiguity: &ReconcileError,
    record: Option<&SourceRecord>,
) -> Result<i64> {
    let ReconcileError::AmbiguousIdentity {
        kind,
        origin,
        name,
        source_ref,
        candidates,
        ..
    } = ambiguity
    else {
        return Err(ReconcileError::StoreWrite(format!(
            "only ambiguous identities can be queued for review, got: {ambiguity}"
        )));
    };
    let name_norm = normalize_name(name);
    let source_ref = source_ref.clone().unwrap_or_default();

    let existing = conn
        .query_row(
            r#"
            SELECT review_id FROM identity_reviews
            WHERE kind = ?1 AND source = ?2 AND name_norm = ?3 AND source_ref = ?4
              AND resolved_at IS NULL
            "#,
            params![kind.as_str(), origin.as_str(), name_norm, source_ref],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    if let Some(review_id) = existing {
        return Ok(review_id);
    }

    let record_json = record.map(serde_json::to_string).transpose()?;
    conn.execute(
        r#"
        INSERT INTO identity_reviews (
            kind, source, name, name_norm, source_ref, candidates_json, record_json, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            kind.as_str(),
            origin.as_str(),
            name,
            name_norm,
            source_ref,
            serde_json::to_string(candidates)?,
            record_json,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| ReconcileError::StoreWrite(format!("queue identity review: {e}")))?;
    Ok(conn.last_insert_rowid())
}

pub fn list_open_reviews(conn: &Connection) -> Result<Vec<IdentityReview>> {
    load_reviews(conn, "WHERE resolved_at IS NULL ORDER BY review_id ASC", params![])
}

pub fn load_review(conn: &Connection, review_id: i64) -> Result<Option<IdentityReview>> {
    Ok(load_reviews(conn, "WHERE review_id = ?1", params![review_id])?
        .into_iter()
        .next())
}

fn load_reviews(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<IdentityReview>> {
    let sql = format!(
        "SELECT review_id, kind, source, name, source_ref, candidates_json, record_json, created_at, resolved_id
         FROM identity_reviews {filter}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, String>(7)?,
            row.get::<_, Option<String>>(8)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (review_id, kind, source, name, source_ref, candidates, record, created_at, resolved_id) =
            row?;
        let kind = kind
            .parse::<IdentityKind>()
            .map_err(ReconcileError::IdentityResolution)?;
        let source = source
            .parse::<Source>()
            .map_err(ReconcileError::IdentityResolution)?;
        out.push(IdentityReview {
            review_id,
            kind,
            source,
            name,
            source_ref: Some(source_ref).filter(|s| !s.is_empty()),
            candidates: serde_json::from_str(&candidates)?,
            record: record.as_deref().map(serde_json::from_str).transpose()?,
            created_at,
            resolved_id,
        });
    }
    Ok(out)
}

/// Closes a review by attaching its name as a new alias of an existing
/// identity, or of a freshly created one. Existing aliases are untouched.
pub fn resolve_review(
    conn: &mut Connection,
    review_id: i64,
    resolution: &ReviewResolution,
) -> Result<IdentityReview> {
    let Some(review) = load_review(conn, review_id)? else {
        return Err(ReconcileError::IdentityResolution(format!(
            "no identity review #{review_id}"
        )));
    };
    if review.resolved_id.is_some() {
        return Err(ReconcileError::IdentityResolution(format!(
            "identity review #{review_id} is already resolved"
        )));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let name_norm = normalize_name(&review.name);
    let id = match resolution {
        ReviewResolution::Existing(id) => {
            if !identity::identity_exists(&tx, review.kind, id)? {
                return Err(ReconcileError::IdentityResolution(format!(
                    "{} {id} does not exist",
                    review.kind
                )));
            }
            id.clone()
        }
        ReviewResolution::NewIdentity => {
            identity::create_identity(&tx, review.kind, &review.name, &name_norm)?
        }
    };
    identity::record_alias(
        &tx,
        review.kind,
        &id,
        review.source,
        review.source_ref.as_deref(),
        &review.name,
        &name_norm,
    )?;
    tx.execute(
        "UPDATE identity_reviews SET resolved_at = ?1, resolved_id = ?2 WHERE review_id = ?3",
        params![Utc::now().to_rfc3339(), id, review_id],
    )?;
    tx.commit()?;

    tracing::info!(review_id, kind = %review.kind, name = %review.name, id = %id, "identity review resolved");
    Ok(IdentityReview {
        resolved_id: Some(id),
        ..review
    })
}
