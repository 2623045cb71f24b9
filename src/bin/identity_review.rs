use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use playerfouls::config::{self, ReconcileConfig};
use playerfouls::pipeline::replay_review;
use playerfouls::review::{ReviewResolution, list_open_reviews, resolve_review};
use playerfouls::store;

const USAGE: &str = "usage:
  identity_review list [--db PATH]
  identity_review resolve <review_id> (--existing <id> | --new) [--db PATH]";

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    config::init_logging();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let config = ReconcileConfig::from_env();
    let db_path = parse_db_path_arg(&args)
        .or_else(|| config.db_path.clone())
        .context("unable to resolve sqlite path (pass --db or set PLAYERFOULS_DB)")?;
    let mut conn = store::open_db(&db_path)?;

    match args.first().map(String::as_str) {
        Some("list") => {
            let reviews = list_open_reviews(&conn)?;
            if reviews.is_empty() {
                println!("no open identity reviews");
            }
            for review in reviews {
                println!(
                    "#{} {} '{}' from {}{} created={}",
                    review.review_id,
                    review.kind,
                    review.name,
                    review.source,
                    review
                        .source_ref
                        .as_deref()
                        .map(|r| format!(" (ref {r})"))
                        .unwrap_or_default(),
                    review.created_at
                );
                println!("  candidates: {}", review.candidates.join(", "));
            }
            Ok(())
        }
        Some("resolve") => {
            let review_id = args
                .get(1)
                .and_then(|raw| raw.parse::<i64>().ok())
                .with_context(|| format!("resolve needs a numeric review id\n{USAGE}"))?;
            let resolution = parse_resolution(&args)?;
            let review = resolve_review(&mut conn, review_id, &resolution)?;
            println!(
                "review #{} resolved: '{}' -> {}",
                review.review_id,
                review.name,
                review.resolved_id.as_deref().unwrap_or("n/a")
            );
            match replay_review(&mut conn, &config, review_id)? {
                Some(outcome) => println!(
                    "replayed record {} score={:.2} changed={}",
                    outcome.key,
                    outcome.report.score,
                    outcome.changes.len()
                ),
                None => println!("no parked record to replay"),
            }
            Ok(())
        }
        _ => {
            println!("{USAGE}");
            Ok(())
        }
    }
}

fn parse_resolution(args: &[String]) -> Result<ReviewResolution> {
    if args.iter().any(|a| a == "--new") {
        return Ok(ReviewResolution::NewIdentity);
    }
    for (idx, arg) in args.iter().enumerate() {
        if let Some(id) = arg.strip_prefix("--existing=")
            && !id.trim().is_empty()
        {
            return Ok(ReviewResolution::Existing(id.trim().to_string()));
        }
        if arg == "--existing"
            && let Some(next) = args.get(idx + 1)
        {
            return Ok(ReviewResolution::Existing(next.trim().to_string()));
        }
    }
    Err(anyhow!("pass --existing <id> or --new\n{USAGE}"))
}

fn parse_db_path_arg(args: &[String]) -> Option<PathBuf> {
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix("--db=") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == "--db"
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(PathBuf::from(next));
        }
    }
    None
}
