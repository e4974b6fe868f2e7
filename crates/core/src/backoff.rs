//! Adaptive backoff policy for the polling loop.
//!
//! Pure delay computation: empty polls beyond a threshold grow the delay
//! geometrically, consecutive errors double it on top, and a uniform
//! jitter is added so many coordinators polling the same remote endpoint
//! never synchronize. [`BackoffState`] carries the per-job counters.

use std::time::Duration;

use rand::Rng;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound (exclusive) of the random jitter added to every delay.
pub const JITTER_CEILING: Duration = Duration::from_millis(5000);

/// Number of consecutive empty polls tolerated before the delay grows.
pub const DEFAULT_EMPTY_POLL_THRESHOLD: u32 = 3;

/// Consecutive errors after which a job is given up on.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// HTTP status codes that indicate the endpoint itself is throttling or
/// blocking the caller rather than a job-specific failure.
pub const THROTTLE_STATUS_CODES: [u16; 3] = [403, 429, 503];

/// Message fragments that mark a throttled/blocked response regardless of
/// status code.
const THROTTLE_MESSAGE_MARKERS: &[&str] =
    &["rate limit", "too many requests", "temporarily blocked", "quota exceeded"];

/// Caps on the growth exponents so the arithmetic cannot overflow long
/// before the delay hits `max_interval` anyway.
const MAX_EMPTY_EXPONENT: u32 = 16;
const MAX_ERROR_EXPONENT: u32 = 10;

// ---------------------------------------------------------------------------
// BackoffConfig
// ---------------------------------------------------------------------------

/// Tunable parameters for the backoff policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay between polls while a job is active.
    pub base_interval: Duration,
    /// Upper bound on the computed delay (before jitter).
    pub max_interval: Duration,
    /// Factor by which the delay grows per empty poll past the threshold.
    pub multiplier: f64,
    /// Empty polls tolerated at the base interval.
    pub empty_poll_threshold: u32,
    /// Consecutive errors before giving up on a job.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
            multiplier: 1.5,
            empty_poll_threshold: DEFAULT_EMPTY_POLL_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

// ---------------------------------------------------------------------------
// Delay computation
// ---------------------------------------------------------------------------

/// Compute the deterministic (pre-jitter) delay for the given counters.
///
/// Empty polls at or past the threshold grow the delay geometrically:
/// `base * multiplier^(empty - threshold + 1)`, capped at `max_interval`.
/// Errors double the result per consecutive error; the two factors compose
/// multiplicatively and the cap is applied to the product.
pub fn scheduled_delay(
    config: &BackoffConfig,
    consecutive_errors: u32,
    consecutive_empty_polls: u32,
) -> Duration {
    let mut delay_ms = config.base_interval.as_millis() as f64;

    if consecutive_empty_polls >= config.empty_poll_threshold {
        let exponent =
            (consecutive_empty_polls - config.empty_poll_threshold + 1).min(MAX_EMPTY_EXPONENT);
        delay_ms *= config.multiplier.powi(exponent as i32);
    }

    if consecutive_errors > 0 {
        let exponent = consecutive_errors.min(MAX_ERROR_EXPONENT);
        delay_ms *= 2u64.pow(exponent) as f64;
    }

    Duration::from_millis(delay_ms as u64).min(config.max_interval)
}

/// Add uniform random jitter in `[0, JITTER_CEILING)` to a delay.
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter_ms = rand::rng().random_range(0..JITTER_CEILING.as_millis() as u64);
    delay + Duration::from_millis(jitter_ms)
}

/// Whether a job should be abandoned after this many consecutive errors.
///
/// A terminal signal, not merely a long delay: the job transitions to
/// `Failed` and polling stops for it specifically.
pub fn give_up(consecutive_errors: u32, max_retries: u32) -> bool {
    consecutive_errors >= max_retries
}

// ---------------------------------------------------------------------------
// Throttle classification
// ---------------------------------------------------------------------------

/// Whether an HTTP status code marks a throttled/blocked response.
pub fn is_throttle_status(code: u16) -> bool {
    THROTTLE_STATUS_CODES.contains(&code)
}

/// Whether an error message marks a throttled/blocked response.
pub fn is_throttle_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    THROTTLE_MESSAGE_MARKERS.iter().any(|m| lower.contains(m))
}

// ---------------------------------------------------------------------------
// BackoffState
// ---------------------------------------------------------------------------

/// Per-job backoff counters and the resulting desired delay.
///
/// Reset to baseline whenever a non-empty, non-error result is observed:
/// activity resets cadence.
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub consecutive_errors: u32,
    pub consecutive_empty_polls: u32,
    current_interval: Duration,
}

impl BackoffState {
    /// Fresh state at the baseline interval.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            consecutive_errors: 0,
            consecutive_empty_polls: 0,
            current_interval: config.base_interval,
        }
    }

    /// A non-empty, non-error result was observed: reset to baseline.
    pub fn record_activity(&mut self, config: &BackoffConfig) {
        self.consecutive_errors = 0;
        self.consecutive_empty_polls = 0;
        self.current_interval = config.base_interval;
    }

    /// A poll returned no new information.
    pub fn record_empty(&mut self, config: &BackoffConfig) {
        self.consecutive_empty_polls += 1;
        self.recompute(config);
    }

    /// A poll failed (transport, remote status, or throttled).
    pub fn record_error(&mut self, config: &BackoffConfig) {
        self.consecutive_errors += 1;
        self.recompute(config);
    }

    /// The deterministic delay this job wants before its next poll.
    pub fn desired_delay(&self) -> Duration {
        self.current_interval
    }

    /// Whether this job has exhausted its retries.
    pub fn should_give_up(&self, config: &BackoffConfig) -> bool {
        give_up(self.consecutive_errors, config.max_retries)
    }

    fn recompute(&mut self, config: &BackoffConfig) {
        self.current_interval =
            scheduled_delay(config, self.consecutive_errors, self.consecutive_empty_polls);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
