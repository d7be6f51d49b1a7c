//! Agent configuration
//!
//! Everything tunable about the engine lives here. `Default` gives
//! production-reasonable values; `from_env` layers `TRACELINE_*` overrides
//! on top for deployments that configure through the environment.

use std::time::Duration;

/// What to do with a new trace when the batch queue is full.
///
/// Both variants are O(1) and never block the recording thread; every
/// trace lost either way increments the dropped counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued trace to make room for the new one.
    DropOldest,
    /// Admit one of every `n` overflowing traces (evicting the oldest to
    /// make room), drop the rest. `Sample(1)` behaves like `DropOldest`.
    Sample(u32),
}

/// Configuration for the engine and its background reporter.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Collector base URL; the report is POSTed to `{url}/report`
    pub collector_url: String,
    /// Optional bearer token sent with each report
    pub auth_token: Option<String>,
    /// How often the reporter wakes without a high-water nudge
    pub report_interval: Duration,
    /// Maximum traces held in the batch queue
    pub queue_capacity: usize,
    /// Queue occupancy that wakes the reporter early
    pub high_water_mark: usize,
    /// Behavior when the queue is full
    pub overflow_policy: OverflowPolicy,
    /// Total send attempts per batch (first try + retries)
    pub max_send_attempts: u32,
    /// Backoff after the first failed attempt; doubles per retry
    pub retry_base_delay: Duration,
    /// Ceiling for the backoff delay
    pub retry_max_delay: Duration,
    /// Cap on how long an operation may stay open before its context is
    /// considered leaked and discarded
    pub max_operation_duration: Duration,
    /// Deadline for the final drain-and-send during shutdown
    pub shutdown_flush_timeout: Duration,
    /// When true, `start_span` with no active operation begins an
    /// anonymous operation rooted at that span
    pub implicit_operations: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collector_url: "http://localhost:9441".to_string(),
            auth_token: None,
            report_interval: Duration::from_secs(5),
            queue_capacity: 500,
            high_water_mark: 250,
            overflow_policy: OverflowPolicy::DropOldest,
            max_send_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(5),
            max_operation_duration: Duration::from_secs(120),
            shutdown_flush_timeout: Duration::from_secs(2),
            implicit_operations: false,
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by any `TRACELINE_*` environment variables.
    /// Unparseable values are ignored in favor of the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("TRACELINE_COLLECTOR_URL") {
            if !url.is_empty() {
                config.collector_url = url;
            }
        }
        if let Ok(token) = std::env::var("TRACELINE_AUTH_TOKEN") {
            if !token.is_empty() {
                config.auth_token = Some(token);
            }
        }
        if let Some(secs) = env_u64("TRACELINE_REPORT_INTERVAL_SECS") {
            config.report_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_u64("TRACELINE_QUEUE_CAPACITY") {
            config.queue_capacity = capacity as usize;
            config.high_water_mark = (capacity as usize / 2).max(1);
        }
        if let Some(attempts) = env_u64("TRACELINE_MAX_SEND_ATTEMPTS") {
            config.max_send_attempts = attempts as u32;
        }
        if let Some(ms) = env_u64("TRACELINE_RETRY_BASE_DELAY_MS") {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("TRACELINE_MAX_OPERATION_SECS") {
            config.max_operation_duration = Duration::from_secs(secs);
        }

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();

        assert_eq!(config.queue_capacity, 500);
        assert!(config.high_water_mark < config.queue_capacity);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert!(config.max_send_attempts > 0);
        assert!(!config.implicit_operations);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("TRACELINE_QUEUE_CAPACITY", "64");
        std::env::set_var("TRACELINE_MAX_SEND_ATTEMPTS", "7");
        std::env::set_var("TRACELINE_REPORT_INTERVAL_SECS", "not-a-number");

        let config = AgentConfig::from_env();
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.high_water_mark, 32);
        assert_eq!(config.max_send_attempts, 7);
        // Bad value falls back to the default.
        assert_eq!(config.report_interval, Duration::from_secs(5));

        std::env::remove_var("TRACELINE_QUEUE_CAPACITY");
        std::env::remove_var("TRACELINE_MAX_SEND_ATTEMPTS");
        std::env::remove_var("TRACELINE_REPORT_INTERVAL_SECS");
    }
}
