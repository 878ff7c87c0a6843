use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use std::time::Duration;

use crate::error::{DownloadError, TransportFailure};

/// Status codes retried by the request layer:
/// request timeout, too many requests, bad gateway, gateway timeout.
pub const RETRYABLE_STATUS_CODES: [u16; 4] = [408, 429, 502, 504];

/// Per-request retry decisions.
///
/// `exec_count` is the number of executions so far (1 after the first
/// attempt). Once it exceeds `max_retries` nothing is retried.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_retries: u32,
    default_interval: Duration,
    retryable_statuses: Vec<StatusCode>,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(1))
    }
}

impl RetryStrategy {
    pub fn new(max_retries: u32, default_interval: Duration) -> Self {
        let retryable_statuses = RETRYABLE_STATUS_CODES
            .iter()
            .filter_map(|code| StatusCode::from_u16(*code).ok())
            .collect();
        Self {
            max_retries,
            default_interval,
            retryable_statuses,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn should_retry_on_error(
        &self,
        method: &Method,
        error: &DownloadError,
        exec_count: u32,
    ) -> bool {
        if exec_count > self.max_retries {
            return false;
        }
        if Self::is_non_retryable(error) {
            return false;
        }
        is_idempotent(method)
    }

    pub fn should_retry_on_response(
        &self,
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
        exec_count: u32,
    ) -> bool {
        if exec_count > self.max_retries || !is_idempotent(method) {
            return false;
        }
        self.retryable_statuses.contains(&status)
            || parse_retry_after(headers, Utc::now()).is_some_and(|d| !d.is_zero())
    }

    /// Interval before the next execution: the request context wins, then
    /// `Retry-After`, then the configured default.
    pub fn retry_interval(
        &self,
        headers: Option<&HeaderMap>,
        _exec_count: u32,
        context_interval: Option<Duration>,
    ) -> Duration {
        if let Some(interval) = context_interval {
            return interval;
        }
        headers
            .and_then(|h| parse_retry_after(h, Utc::now()))
            .filter(|d| !d.is_zero())
            .unwrap_or(self.default_interval)
    }

    fn is_non_retryable(error: &DownloadError) -> bool {
        match error {
            DownloadError::Cancelled | DownloadError::Shutdown => true,
            DownloadError::Network { .. } => matches!(
                error.transport_failure(),
                Some(TransportFailure::UnknownHost | TransportFailure::Unreachable)
            ),
            _ => false,
        }
    }
}

/// Methods whose repeated execution has the same effect as a single one.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

/// Parse `Retry-After` as delta seconds or an HTTP-date relative to `now`.
///
/// Dates in the past resolve to zero.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((date - now).to_std().unwrap_or(Duration::ZERO))
}
