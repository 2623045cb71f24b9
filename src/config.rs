use std::path::PathBuf;
use std::time::Duration;

use crate::collect::RetryPolicy;
use crate::completeness::CompletenessPolicy;
use crate::http_client::DEFAULT_TIMEOUT_SECS;
use crate::identity::DEFAULT_SIMILARITY_THRESHOLD;

const DATA_DIR: &str = "playerfouls";
const DB_FILE: &str = "playerfouls.sqlite";

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    pub db_path: Option<PathBuf>,
    /// Player-name threshold.
    pub similarity_threshold: f64,
    pub team_similarity_threshold: f64,
    pub policy: CompletenessPolicy,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub workers: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            team_similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            policy: CompletenessPolicy::default(),
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            workers: 4,
        }
    }
}

impl ReconcileConfig {
    /// Reads `PLAYERFOULS_*` variables; anything unset or unparsable keeps its default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let db_path = env_string("PLAYERFOULS_DB")
            .map(PathBuf::from)
            .or(defaults.db_path);
        let similarity_threshold = env_parse::<f64>("PLAYERFOULS_SIMILARITY")
            .filter(|v| (0.0..=1.0).contains(v))
            .unwrap_or(defaults.similarity_threshold);
        let team_similarity_threshold = env_parse::<f64>("PLAYERFOULS_TEAM_SIMILARITY")
            .filter(|v| (0.0..=1.0).contains(v))
            .unwrap_or(defaults.team_similarity_threshold);
        let min_present_fields = env_parse::<usize>("PLAYERFOULS_MVP_MIN_FIELDS")
            .unwrap_or(defaults.policy.min_present_fields)
            .min(crate::fields::EXPECTED_FIELD_COUNT);
        let retry = RetryPolicy {
            max_attempts: env_parse::<u32>("PLAYERFOULS_MAX_RETRIES")
                .unwrap_or(defaults.retry.max_attempts)
                .max(1),
            base_delay: env_parse::<u64>("PLAYERFOULS_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: env_parse::<u64>("PLAYERFOULS_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
            jitter: true,
        };
        let http_timeout = env_parse::<u64>("PLAYERFOULS_HTTP_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);
        let workers = env_parse::<usize>("PLAYERFOULS_WORKERS")
            .unwrap_or(defaults.workers)
            .clamp(1, 32);

        Self {
            db_path,
            similarity_threshold,
            team_similarity_threshold,
            policy: CompletenessPolicy {
                min_present_fields,
                ..defaults.policy
            },
            retry,
            http_timeout,
            workers,
        }
    }
}

pub fn default_db_path() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_DATA_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(DATA_DIR).join(DB_FILE));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(DATA_DIR)
            .join(DB_FILE),
    )
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

/// Installs the stderr subscriber for binaries. `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("playerfouls=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
