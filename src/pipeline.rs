use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rayon::prelude::*;
use rusqlite::{Connection, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::collect::{Collected, SourceError, collect_with_retry};
use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, Result};
use crate::fields::Source;
use crate::identity::{MatchDescriptor, PlayerDescriptor, resolve_match, resolve_player};
use crate::record::{CanonicalKey, SourceRecord};
use crate::review::{enqueue_review, load_review};
use crate::store::{self, WriteOutcome};

/// One unit of collection work: where to fetch a source's partial record for
/// one player in one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectJob {
    pub source: Source,
    pub player: PlayerDescriptor,
    #[serde(rename = "match")]
    pub match_info: MatchDescriptor,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub run_id: Option<i64>,
    pub records_total: usize,
    pub records_written: usize,
    /// Distinct canonical keys written during the run.
    pub keys_touched: usize,
    /// Touched keys still incomplete once the run finished.
    pub records_incomplete: usize,
    pub records_mvp_ready: usize,
    pub fields_changed: usize,
    pub source_failures: usize,
    pub reviews: Vec<i64>,
    pub errors: Vec<String>,
}

impl RunSummary {
    fn new(records_total: usize) -> Self {
        Self {
            records_total,
            ..Self::default()
        }
    }

    pub fn failures(&self) -> usize {
        self.errors.len()
    }

    fn absorb(
        &mut self,
        idx: usize,
        record: &SourceRecord,
        result: Result<WriteOutcome>,
        touched: &mut BTreeSet<CanonicalKey>,
    ) {
        match result {
            Ok(outcome) => {
                self.records_written += 1;
                self.fields_changed += outcome.changes.len();
                touched.insert(outcome.key);
            }
            Err(err) => {
                if let Some(review_id) = err.review_id()
                    && !self.reviews.contains(&review_id)
                {
                    self.reviews.push(review_id);
                }
                self.errors.push(format!(
                    "record {} ({} '{}'): {err}",
                    idx + 1,
                    record.source,
                    record.player.name
                ));
            }
        }
    }
}

/// Serializes merges per canonical key inside one process. Store transactions
/// serialize across processes.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<CanonicalKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn with_key<T>(&self, key: &CanonicalKey, action: impl FnOnce() -> T) -> T {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
        action()
    }
}

/// Resolves the record's player and match to a canonical key in one IMMEDIATE
/// transaction. An ambiguous name rolls the transaction back, is queued for
/// review, and comes back as `AmbiguousIdentity` carrying the review ID.
pub fn resolve_identities(
    conn: &mut Connection,
    config: &ReconcileConfig,
    record: &SourceRecord,
) -> Result<CanonicalKey> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let resolved = resolve_player(
        &tx,
        record.source,
        &record.player,
        config.similarity_threshold,
    )
    .and_then(|player_id| {
        let m = resolve_match(
            &tx,
            record.source,
            &record.match_info,
            config.team_similarity_threshold,
        )?;
        Ok(CanonicalKey::new(player_id, m.match_id))
    });

    match resolved {
        Ok(key) => {
            tx.commit()?;
            Ok(key)
        }
        Err(err) if err.needs_review() => {
            tx.rollback()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let review_id = enqueue_review(&tx, &err, Some(record))?;
            tx.commit()?;
            Err(err.with_review_id(review_id))
        }
        Err(err) => Err(err),
    }
}

/// Resolves identities, then merges and writes the record under its key lock.
pub fn ingest_record(
    conn: &mut Connection,
    config: &ReconcileConfig,
    record: &SourceRecord,
    locks: &KeyLocks,
) -> Result<WriteOutcome> {
    let key = resolve_identities(conn, config, record)?;
    locks.with_key(&key, || store::upsert_record(conn, &key, record, &config.policy))
}

/// Processes records one by one on a single connection. A failing record is
/// reported in the summary and never stops the batch.
pub fn run_batch(
    conn: &mut Connection,
    config: &ReconcileConfig,
    records: &[SourceRecord],
) -> Result<RunSummary> {
    let mut summary = RunSummary::new(records.len());
    let run_id = start_run(conn, records.len())?;
    summary.run_id = Some(run_id);

    let locks = KeyLocks::default();
    let mut touched = BTreeSet::new();
    for (idx, record) in records.iter().enumerate() {
        let result = ingest_record(conn, config, record, &locks);
        summary.absorb(idx, record, result, &mut touched);
    }

    finish_run(conn, run_id, &mut summary, &touched)?;
    Ok(summary)
}

/// Same contract as `run_batch`, spread over a rayon pool. Each worker owns
/// its own connection to `db_path`.
pub fn run_parallel(
    db_path: &Path,
    config: &ReconcileConfig,
    records: &[SourceRecord],
) -> Result<RunSummary> {
    let conn = store::open_db(db_path)?;
    let mut summary = RunSummary::new(records.len());
    let run_id = start_run(&conn, records.len())?;
    summary.run_id = Some(run_id);

    let locks = KeyLocks::default();
    let pool = build_worker_pool(config.workers);
    let results: Vec<Result<WriteOutcome>> = with_worker_pool(&pool, || {
        records
            .par_iter()
            .map_init(
                || store::open_db(db_path),
                |conn, record| match conn {
                    Ok(conn) => ingest_record(conn, config, record, &locks),
                    Err(err) => Err(ReconcileError::StoreWrite(format!(
                        "worker connection failed: {err}"
                    ))),
                },
            )
            .collect()
    });

    let mut touched = BTreeSet::new();
    for (idx, (record, result)) in records.iter().zip(results).enumerate() {
        summary.absorb(idx, record, result, &mut touched);
    }
    finish_run(&conn, run_id, &mut summary, &touched)?;
    Ok(summary)
}

/// Collects every job across the worker pool with `fetch`, retrying per the
/// config, then ingests what came back. A source that stays down still
/// produces a record, with all its fields unavailable.
pub fn run_collection<F>(
    db_path: &Path,
    config: &ReconcileConfig,
    jobs: &[CollectJob],
    fetch: F,
) -> Result<RunSummary>
where
    F: Fn(&CollectJob, u32) -> std::result::Result<SourceRecord, SourceError> + Sync,
{
    let pool = build_worker_pool(config.workers);
    let collected: Vec<Collected> = with_worker_pool(&pool, || {
        jobs.par_iter()
            .map(|job| {
                collect_with_retry(
                    &config.retry,
                    job.source,
                    &job.player,
                    &job.match_info,
                    |attempt| fetch(job, attempt),
                )
            })
            .collect()
    });

    let mut failures = Vec::new();
    let mut records = Vec::with_capacity(collected.len());
    for (job, item) in jobs.iter().zip(collected) {
        if let Some(err) = item.failure {
            failures.push(format!("{} {}: {err}", job.source, job.url));
        }
        records.push(item.record);
    }

    let mut summary = run_parallel(db_path, config, &records)?;
    summary.source_failures = failures.len();
    summary.errors.extend(failures);
    Ok(summary)
}

/// Re-ingests the record parked on a resolved review.
pub fn replay_review(
    conn: &mut Connection,
    config: &ReconcileConfig,
    review_id: i64,
) -> Result<Option<WriteOutcome>> {
    let Some(review) = load_review(conn, review_id)? else {
        return Err(ReconcileError::IdentityResolution(format!(
            "no identity review #{review_id}"
        )));
    };
    if review.resolved_id.is_none() {
        return Err(ReconcileError::IdentityResolution(format!(
            "identity review #{review_id} is still open"
        )));
    }
    let Some(record) = review.record else {
        return Ok(None);
    };
    let outcome = ingest_record(conn, config, &record, &KeyLocks::default())?;
    Ok(Some(outcome))
}

fn start_run(conn: &Connection, records_total: usize) -> Result<i64> {
    conn.execute(
        "INSERT INTO ingest_runs(started_at, finished_at, records_total, records_written, records_incomplete, records_mvp_ready, reviews_queued, failures, errors_json)
         VALUES (?1, NULL, ?2, 0, 0, 0, 0, 0, '[]')",
        params![Utc::now().to_rfc3339(), records_total as i64],
    )?;
    Ok(conn.last_insert_rowid())
}

fn finish_run(
    conn: &Connection,
    run_id: i64,
    summary: &mut RunSummary,
    touched: &BTreeSet<CanonicalKey>,
) -> Result<()> {
    summary.keys_touched = touched.len();
    for key in touched {
        if let Some(stored) = store::fetch_stored(conn, key)? {
            if stored.incomplete {
                summary.records_incomplete += 1;
            }
            if stored.mvp_ready {
                summary.records_mvp_ready += 1;
            }
        }
    }

    let errors_json = serde_json::to_string(&summary.errors)?;
    conn.execute(
        "UPDATE ingest_runs
         SET finished_at = ?1, records_written = ?2, records_incomplete = ?3, records_mvp_ready = ?4,
             reviews_queued = ?5, failures = ?6, errors_json = ?7
         WHERE run_id = ?8",
        params![
            Utc::now().to_rfc3339(),
            summary.records_written as i64,
            summary.records_incomplete as i64,
            summary.records_mvp_ready as i64,
            summary.reviews.len() as i64,
            summary.failures() as i64,
            errors_json,
            run_id
        ],
    )?;

    tracing::info!(
        run_id,
        total = summary.records_total,
        written = summary.records_written,
        incomplete = summary.records_incomplete,
        mvp_ready = summary.records_mvp_ready,
        reviews = summary.reviews.len(),
        failures = summary.failures(),
        "ingest run finished"
    );
    Ok(())
}

fn build_worker_pool(workers: usize) -> Option<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.clamp(1, 32))
        .build()
        .ok()
}

fn with_worker_pool<T>(pool: &Option<rayon::ThreadPool>, action: impl FnOnce() -> T + Send) -> T
where
    T: Send,
{
    if let Some(pool) = pool.as_ref() {
        pool.install(action)
    } else {
        action()
    }
}
