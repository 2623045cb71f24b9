use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use thiserror::Error;

use crate::error::ReconcileError;
use crate::fields::Source;
use crate::http_client::http_client;
use crate::identity::{MatchDescriptor, PlayerDescriptor};
use crate::record::SourceRecord;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Timeouts, dropped connections, throttling, 5xx. Worth another attempt.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("blocked by source (http {status})")]
    Blocked { status: u16 },
    /// The response arrived but is not something we can read. Retrying will not help.
    #[error("structural failure: {0}")]
    Structural(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Wait before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let capped = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let jitter = if self.jitter && capped >= 4 {
            rand::thread_rng().gen_range(0..=capped / 4)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

#[derive(Debug)]
pub struct Collected {
    /// On failure this is the empty record for the source, so every field it
    /// owns lands as unavailable on merge.
    pub record: SourceRecord,
    pub attempts: u32,
    pub failure: Option<ReconcileError>,
}

impl Collected {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs `fetch` until it succeeds, hits a non-retryable error, or exhausts
/// the policy. `fetch` receives the 1-based attempt number.
pub fn collect_with_retry<F>(
    policy: &RetryPolicy,
    source: Source,
    player: &PlayerDescriptor,
    match_info: &MatchDescriptor,
    mut fetch: F,
) -> Collected
where
    F: FnMut(u32) -> Result<SourceRecord, SourceError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    let err = loop {
        attempt += 1;
        match fetch(attempt) {
            Ok(record) if record.source == source => {
                tracing::debug!(%source, player = %player.name, attempt, "source collected");
                return Collected {
                    record,
                    attempts: attempt,
                    failure: None,
                };
            }
            Ok(record) => {
                break SourceError::Structural(format!(
                    "expected a {source} record, got {}",
                    record.source
                ));
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let wait = policy.delay_for(attempt);
                tracing::warn!(
                    %source,
                    player = %player.name,
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "collection failed, retrying"
                );
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
            }
            Err(err) => break err,
        }
    };

    tracing::warn!(%source, player = %player.name, attempts = attempt, error = %err, "source unavailable");
    Collected {
        record: SourceRecord::new(source, player.clone(), match_info.clone(), Utc::now()),
        attempts: attempt,
        failure: Some(ReconcileError::SourceUnavailable {
            origin: source,
            attempts: attempt,
            reason: err.to_string(),
        }),
    }
}

pub fn classify_status(status: StatusCode) -> Option<SourceError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    let err = match code {
        401 | 403 | 451 => SourceError::Blocked { status: code },
        408 | 429 => SourceError::Transient(format!("http {code}")),
        _ if status.is_server_error() => SourceError::Transient(format!("http {code}")),
        _ => SourceError::Structural(format!("http {code}")),
    };
    Some(err)
}

fn classify_request_error(err: &reqwest::Error) -> SourceError {
    if err.is_decode() {
        SourceError::Structural(err.to_string())
    } else {
        SourceError::Transient(err.to_string())
    }
}

/// GETs one partial record serialized as JSON.
pub fn fetch_source_record(client: &Client, url: &str) -> Result<SourceRecord, SourceError> {
    let resp = client
        .get(url)
        .send()
        .map_err(|e| classify_request_error(&e))?;
    if let Some(err) = classify_status(resp.status()) {
        return Err(err);
    }
    let body = resp.text().map_err(|e| classify_request_error(&e))?;
    serde_json::from_str::<SourceRecord>(body.trim())
        .map_err(|e| SourceError::Structural(format!("invalid partial record json: {e}")))
}

/// One attempt against `url` using the shared client.
pub fn fetch_over_http(timeout: Duration, url: &str) -> Result<SourceRecord, SourceError> {
    let client =
        http_client(timeout).map_err(|e| SourceError::Structural(format!("http client: {e}")))?;
    fetch_source_record(client, url)
}
