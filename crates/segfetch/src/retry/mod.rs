//! Retry and backoff policy.
//!
//! `RetryStrategy` decides, per request, whether a failure or a response may
//! be retried and how long to wait. `Backoff` spaces out whole transfer
//! attempts in the transfer manager.

mod backoff;
mod strategy;

pub use backoff::{Backoff, MAX_BACKOFF_SHIFT, sleep_or_cancel};
pub use strategy::{RETRYABLE_STATUS_CODES, RetryStrategy, is_idempotent, parse_retry_after};
