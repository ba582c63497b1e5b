use std::thread;
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use reqwest::StatusCode;

use drama_core::{CancelToken, GenerationConfig};

use crate::error::AdapterError;

const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryConfig {
    pub const fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&GenerationConfig> for RetryConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

/// Retries transient failures with exponential backoff plus a random jitter
/// capped at the base delay. Permanent errors propagate immediately. The
/// delay loop polls the cancel token so an abandoned generation stops instead
/// of finishing in the background.
pub fn call_with_retry<F, T>(
    mut f: F,
    config: &RetryConfig,
    cancel: &CancelToken,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_transient() {
                    return Err(err);
                }

                warn!(
                    "[call_with_retry] attempt {}/{} failed: {}",
                    attempt, config.max_attempts, err
                );

                if attempt < config.max_attempts {
                    let delay = backoff_delay(config, attempt - 1, &err);
                    if sleep_cancellable(delay, cancel) {
                        return Err(AdapterError::Cancelled);
                    }
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(config.max_attempts, err))
}

/// `base * 2^attempt + jitter`, where jitter is uniform in `0..=base`.
/// A rate-limit response carrying an explicit server hint overrides the
/// computed delay.
fn backoff_delay(config: &RetryConfig, attempt: usize, err: &AdapterError) -> Duration {
    if let Some(hint) = server_retry_hint(err) {
        return hint;
    }

    let multiplier = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
    let backoff = config
        .base_delay
        .checked_mul(multiplier)
        .unwrap_or(config.base_delay);
    let jitter_ms = rand::thread_rng().gen_range(0..=config.base_delay.as_millis() as u64);
    backoff + Duration::from_millis(jitter_ms)
}

/// Sleeps for `duration`, returning true early if the token is cancelled.
fn sleep_cancellable(duration: Duration, cancel: &CancelToken) -> bool {
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return true;
        }
        let slice = remaining.min(CANCEL_POLL);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    cancel.is_cancelled()
}

fn server_retry_hint(err: &AdapterError) -> Option<Duration> {
    match err {
        AdapterError::HttpStatus { status, body } if *status == StatusCode::TOO_MANY_REQUESTS => {
            parse_retry_delay(body).map(Duration::from_secs)
        }
        _ => None,
    }
}

/// Extracts a `retryDelay` hint from a rate-limit error body. Gemini puts it
/// under `error.details[].retryDelay` as `"21s"`; a loose regex covers other
/// providers that spell it out in prose.
fn parse_retry_delay(body: &str) -> Option<u64> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(details) = value
            .get("error")
            .and_then(|v| v.get("details"))
            .and_then(|v| v.as_array())
        {
            for detail in details {
                if let Some(delay) = detail
                    .get("retryDelay")
                    .or_else(|| detail.get("retry_delay"))
                {
                    if let Some(parsed) = parse_delay_value(delay) {
                        return Some(parsed);
                    }
                }
            }
        }
    }

    static RETRY_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"retry[_ ]?delay[^0-9]*(\d+)").expect("valid regex for retry delay")
    });

    RETRY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|matched| matched.as_str().parse::<u64>().ok())
}

fn parse_delay_value(value: &serde_json::Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    if let Some(text) = value.as_str() {
        if let Ok(number) = text.trim_end_matches('s').parse::<u64>() {
            return Some(number);
        }
    }
    None
}
