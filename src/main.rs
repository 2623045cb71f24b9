use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use playerfouls::collect::fetch_over_http;
use playerfouls::config::{self, ReconcileConfig};
use playerfouls::merge::pending_fields;
use playerfouls::pipeline::{self, CollectJob, RunSummary};
use playerfouls::record::parse_source_records_jsonl;
use playerfouls::store::{self, StoredRecord};

const USAGE: &str = "usage:
  playerfouls ingest <file.jsonl>... [--db PATH] [--parallel]
  playerfouls collect <jobs.jsonl> [--db PATH]
  playerfouls player <player_id> [--db PATH]
  playerfouls match <match_id> [--db PATH]
  playerfouls incomplete [--db PATH]
  playerfouls min-score <0..1> [--db PATH]";

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    config::init_logging();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let config = ReconcileConfig::from_env();
    let positional = positional_args(&args);
    let Some((command, rest)) = positional.split_first() else {
        println!("{USAGE}");
        return Ok(());
    };

    let db_path = parse_db_path_arg(&args)
        .or_else(|| config.db_path.clone())
        .context("unable to resolve sqlite path (pass --db or set PLAYERFOULS_DB)")?;

    match command.as_str() {
        "ingest" => cmd_ingest(&db_path, &config, rest, args.iter().any(|a| a == "--parallel")),
        "collect" => cmd_collect(&db_path, &config, rest),
        "player" => {
            let id = rest.first().context("player needs a player_id")?;
            let conn = store::open_db(&db_path)?;
            print_records(&store::fetch_by_player(&conn, id)?);
            Ok(())
        }
        "match" => {
            let id = rest.first().context("match needs a match_id")?;
            let conn = store::open_db(&db_path)?;
            print_records(&store::fetch_by_match(&conn, id)?);
            Ok(())
        }
        "incomplete" => {
            let conn = store::open_db(&db_path)?;
            print_records(&store::fetch_incomplete(&conn)?);
            Ok(())
        }
        "min-score" => {
            let raw = rest.first().context("min-score needs a score between 0 and 1")?;
            let min = raw
                .parse::<f64>()
                .ok()
                .filter(|v| (0.0..=1.0).contains(v))
                .with_context(|| format!("invalid score '{raw}'"))?;
            let conn = store::open_db(&db_path)?;
            print_records(&store::fetch_by_completeness(&conn, min)?);
            Ok(())
        }
        other => Err(anyhow!("unknown command '{other}'\n{USAGE}")),
    }
}

fn cmd_ingest(db_path: &Path, config: &ReconcileConfig, files: &[String], parallel: bool) -> Result<()> {
    if files.is_empty() {
        return Err(anyhow!("ingest needs at least one JSONL file\n{USAGE}"));
    }

    let mut records = Vec::new();
    let mut parse_errors = Vec::new();
    for file in files {
        let raw = std::fs::read_to_string(file).with_context(|| format!("read {file}"))?;
        for parsed in parse_source_records_jsonl(&raw) {
            match parsed {
                Ok(record) => records.push(record),
                Err(err) => parse_errors.push(format!("{file}: {err}")),
            }
        }
    }

    let summary = if parallel {
        pipeline::run_parallel(db_path, config, &records)?
    } else {
        let mut conn = store::open_db(db_path)?;
        pipeline::run_batch(&mut conn, config, &records)?
    };

    println!("Ingest complete");
    println!("DB: {}", db_path.display());
    print_summary(&summary);
    if !parse_errors.is_empty() {
        println!("Unparsable lines: {}", parse_errors.len());
        for err in parse_errors.iter().take(6) {
            println!("   - {err}");
        }
    }
    Ok(())
}

fn cmd_collect(db_path: &Path, config: &ReconcileConfig, files: &[String]) -> Result<()> {
    let file = files.first().context("collect needs a jobs JSONL file")?;
    let raw = std::fs::read_to_string(file).with_context(|| format!("read {file}"))?;
    let mut jobs = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let job: CollectJob = serde_json::from_str(line)
            .with_context(|| format!("{file} line {}: invalid collect job", idx + 1))?;
        jobs.push(job);
    }

    let timeout = config.http_timeout;
    let summary = pipeline::run_collection(db_path, config, &jobs, |job, _attempt| {
        fetch_over_http(timeout, &job.url)
    })?;

    println!("Collection complete");
    println!("DB: {}", db_path.display());
    println!("Jobs: {}", jobs.len());
    println!("Sources unavailable: {}", summary.source_failures);
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Records written: {}/{}",
        summary.records_written, summary.records_total
    );
    println!(
        "Keys: {} (incomplete {}, mvp-ready {})",
        summary.keys_touched, summary.records_incomplete, summary.records_mvp_ready
    );
    println!("Fields changed: {}", summary.fields_changed);
    if !summary.reviews.is_empty() {
        println!("Identity reviews queued: {:?}", summary.reviews);
    }
    if !summary.errors.is_empty() {
        println!("  errors: {}", summary.errors.len());
        for err in summary.errors.iter().take(6) {
            println!("   - {err}");
        }
    }
}

fn print_records(rows: &[StoredRecord]) {
    if rows.is_empty() {
        println!("no records");
        return;
    }
    for row in rows {
        let pending = pending_fields(&row.record);
        println!(
            "{} score={:.2} present={}/35 mvp_ready={} incomplete={} updated={}",
            row.record.key,
            row.completeness,
            row.present_fields,
            yes_no(row.mvp_ready),
            yes_no(row.incomplete),
            row.updated_at
        );
        if !pending.is_empty() {
            println!("  pending: {}", pending.join(", "));
        }
    }
}

fn yes_no(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}

fn positional_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--db" {
            skip_next = true;
            continue;
        }
        if arg.starts_with("--") {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

fn parse_db_path_arg(args: &[String]) -> Option<PathBuf> {
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix("--db=") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == "--db" {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}
