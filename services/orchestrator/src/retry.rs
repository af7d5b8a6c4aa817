//! Retry scheduling and error classification for the task runner.

use std::time::Duration;

use crate::error::StepError;

/// Message fragments that mark an error as retryable.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "econnreset",
    "econnrefused",
    "socket",
    "temporarily",
    "unavailable",
    "rate limit",
    "too many requests",
];

/// Status codes that mark an error as retryable when they appear as a word.
const TRANSIENT_CODES: &[&str] = &["408", "429", "500", "502", "503", "504"];

/// Message fragments that mark an error as fatal.
const PERMANENT_PATTERNS: &[&str] = &[
    "not found",
    "limit",
    "exceeded",
    "forbidden",
    "unauthorized",
    "invalid",
];

const PERMANENT_CODES: &[&str] = &["400", "401", "403", "404", "422"];

/// Exponential backoff: `min(base * 2^retry_count, max)`.
pub fn compute_backoff_ms(retry_count: u32, base_ms: u64, max_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

/// [`compute_backoff_ms`] as a [`Duration`].
pub fn backoff_delay(retry_count: u32, base_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(compute_backoff_ms(retry_count, base_ms, max_ms))
}

/// Returns true if the step should be retried.
///
/// An explicit flag always wins. Otherwise transient patterns are checked
/// before permanent ones ("rate limit exceeded" is a 429, not a quota), and
/// anything unrecognised is treated as transient.
pub fn is_transient_error(err: &StepError) -> bool {
    if let Some(permanent) = err.permanent_flag() {
        return !permanent;
    }

    let message = err.message().to_lowercase();
    // Codes are matched as whole words so digits inside ids do not count.
    let has_code = |codes: &[&str]| {
        message
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| codes.iter().any(|code| *code == word))
    };

    if TRANSIENT_PATTERNS.iter().any(|p| message.contains(p)) || has_code(TRANSIENT_CODES) {
        return true;
    }
    if PERMANENT_PATTERNS.iter().any(|p| message.contains(p)) || has_code(PERMANENT_CODES) {
        return false;
    }
    true
}
