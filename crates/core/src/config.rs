//! Coordinator configuration loaded from environment variables.

use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Configuration for the coordinator and its remote client.
///
/// All fields have defaults suitable for local development; override via
/// environment variables in production.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Base URL of the remote processing API.
    pub base_url: String,
    /// Scope key (domain/tenant) for bulk polls and the idle probe.
    pub scope_key: String,
    /// Baseline delay between active-mode cycles.
    pub base_interval: Duration,
    /// Ceiling on the backed-off cycle delay (before jitter).
    pub max_interval: Duration,
    /// Delay between idle-mode "any active jobs?" probes.
    pub idle_interval: Duration,
    /// Timeout applied to each unary remote request.
    pub request_timeout: Duration,
    /// Geometric growth factor for empty-poll backoff.
    pub backoff_multiplier: f64,
    /// Empty polls tolerated before the delay grows.
    pub empty_poll_threshold: u32,
    /// Consecutive errors before a job is failed.
    pub max_retries: u32,
    /// Consecutive whole-cycle failures (e.g. the bulk poll itself
    /// failing) before the coordinator stops entirely.
    pub max_cycle_failures: u32,
    /// Number of active pull-mode jobs at which a cycle switches from
    /// per-job status checks to a single bulk poll.
    pub bulk_poll_threshold: usize,
    /// Retention window for the stale-entry sweep.
    pub retention: Duration,
    /// Interval multiplier applied while the host signals it is
    /// backgrounded.
    pub background_factor: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            scope_key: "default".into(),
            base_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
            idle_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            backoff_multiplier: 1.5,
            empty_poll_threshold: 3,
            max_retries: 5,
            max_cycle_failures: 5,
            bulk_poll_threshold: 3,
            retention: Duration::from_secs(24 * 60 * 60),
            background_factor: 2.0,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                 |
    /// |--------------------------------|-------------------------|
    /// | `HARVEST_REMOTE_URL`           | `http://localhost:8080` |
    /// | `HARVEST_SCOPE_KEY`            | `default`               |
    /// | `HARVEST_BASE_INTERVAL_SECS`   | `5`                     |
    /// | `HARVEST_MAX_INTERVAL_SECS`    | `120`                   |
    /// | `HARVEST_IDLE_INTERVAL_SECS`   | `30`                    |
    /// | `HARVEST_REQUEST_TIMEOUT_SECS` | `30`                    |
    /// | `HARVEST_BACKOFF_MULTIPLIER`   | `1.5`                   |
    /// | `HARVEST_EMPTY_POLL_THRESHOLD` | `3`                     |
    /// | `HARVEST_MAX_RETRIES`          | `5`                     |
    /// | `HARVEST_MAX_CYCLE_FAILURES`   | `5`                     |
    /// | `HARVEST_BULK_POLL_THRESHOLD`  | `3`                     |
    /// | `HARVEST_RETENTION_HOURS`      | `24`                    |
    /// | `HARVEST_BACKGROUND_FACTOR`    | `2.0`                   |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            base_url: std::env::var("HARVEST_REMOTE_URL").unwrap_or(defaults.base_url),
            scope_key: std::env::var("HARVEST_SCOPE_KEY").unwrap_or(defaults.scope_key),
            base_interval: env_secs("HARVEST_BASE_INTERVAL_SECS", defaults.base_interval),
            max_interval: env_secs("HARVEST_MAX_INTERVAL_SECS", defaults.max_interval),
            idle_interval: env_secs("HARVEST_IDLE_INTERVAL_SECS", defaults.idle_interval),
            request_timeout: env_secs("HARVEST_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            backoff_multiplier: env_parse(
                "HARVEST_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            ),
            empty_poll_threshold: env_parse(
                "HARVEST_EMPTY_POLL_THRESHOLD",
                defaults.empty_poll_threshold,
            ),
            max_retries: env_parse("HARVEST_MAX_RETRIES", defaults.max_retries),
            max_cycle_failures: env_parse(
                "HARVEST_MAX_CYCLE_FAILURES",
                defaults.max_cycle_failures,
            ),
            bulk_poll_threshold: env_parse(
                "HARVEST_BULK_POLL_THRESHOLD",
                defaults.bulk_poll_threshold,
            ),
            retention: env_parse("HARVEST_RETENTION_HOURS", 24u64)
                .checked_mul(3600)
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            background_factor: env_parse("HARVEST_BACKGROUND_FACTOR", defaults.background_factor),
        }
    }

    /// Derive the backoff policy parameters from this configuration.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_interval: self.base_interval,
            max_interval: self.max_interval,
            multiplier: self.backoff_multiplier,
            empty_poll_threshold: self.empty_poll_threshold,
            max_retries: self.max_retries,
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.base_interval, Duration::from_secs(5));
        assert_eq!(config.idle_interval, Duration::from_secs(30));
        assert!(config.max_interval > config.base_interval);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retention, Duration::from_secs(86_400));
    }

    #[test]
    fn backoff_config_mirrors_coordinator_config() {
        let config = CoordinatorConfig {
            base_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 3.0,
            empty_poll_threshold: 5,
            max_retries: 7,
            ..Default::default()
        };
        let backoff = config.backoff();
        assert_eq!(backoff.base_interval, Duration::from_secs(2));
        assert_eq!(backoff.max_interval, Duration::from_secs(60));
        assert_eq!(backoff.multiplier, 3.0);
        assert_eq!(backoff.empty_poll_threshold, 5);
        assert_eq!(backoff.max_retries, 7);
    }
}
