//! Scheduler configuration.

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Default minimum period accepted by the platform (15 minutes).
const DEFAULT_MIN_PERIOD_MS: i64 = 15 * 60 * 1000;

/// Default minimum flex accepted by the platform (5 minutes).
const DEFAULT_MIN_FLEX_MS: i64 = 5 * 60 * 1000;

/// Default tolerance added to one-off deadlines before a task counts as expired.
const DEFAULT_DEADLINE_SLACK_MS: i64 = 1000;

/// Environment variable for the global "ignore background tasks" override.
pub const IGNORE_BACKGROUND_TASKS_ENV: &str = "LULL_IGNORE_BACKGROUND_TASKS";

const MIN_PERIOD_ENV: &str = "LULL_MIN_PERIOD_MS";
const MIN_FLEX_ENV: &str = "LULL_MIN_FLEX_MS";
const DEADLINE_SLACK_ENV: &str = "LULL_DEADLINE_SLACK_MS";

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
pub fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

/// Platform timing limits used when building requests and checking expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingPolicy {
    /// Periodic intervals below this are clamped up to it.
    pub min_period_ms: i64,
    /// Periodic flex below this is clamped up to it; also the flex used when none is given.
    pub min_flex_ms: i64,
    /// Slack added to one-off deadlines in the expiration check.
    pub deadline_slack_ms: i64,
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            min_period_ms: DEFAULT_MIN_PERIOD_MS,
            min_flex_ms: DEFAULT_MIN_FLEX_MS,
            deadline_slack_ms: DEFAULT_DEADLINE_SLACK_MS,
        }
    }
}

impl TimingPolicy {
    /// Interval actually handed to the platform.
    pub fn effective_interval(&self, interval_ms: i64) -> i64 {
        interval_ms.max(self.min_period_ms)
    }

    /// Flex actually handed to the platform. Absent flex means the minimum.
    pub fn effective_flex(&self, flex_ms: Option<i64>) -> i64 {
        flex_ms.map_or(self.min_flex_ms, |flex| flex.max(self.min_flex_ms))
    }
}

/// Configuration for the scheduling core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Skip all scheduling and report success. Only for startup measurement runs.
    pub ignore_background_tasks: bool,
    /// Platform timing limits.
    pub timing: TimingPolicy,
}

impl SchedulerConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, SchedulerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SchedulerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(IGNORE_BACKGROUND_TASKS_ENV) {
            config.ignore_background_tasks =
                parse_bool_env(&raw).map_err(SchedulerError::InvalidConfig)?;
        }
        if let Some(raw) = lookup(MIN_PERIOD_ENV) {
            config.timing.min_period_ms = parse_millis(MIN_PERIOD_ENV, &raw)?;
        }
        if let Some(raw) = lookup(MIN_FLEX_ENV) {
            config.timing.min_flex_ms = parse_millis(MIN_FLEX_ENV, &raw)?;
        }
        if let Some(raw) = lookup(DEADLINE_SLACK_ENV) {
            config.timing.deadline_slack_ms = parse_millis(DEADLINE_SLACK_ENV, &raw)?;
        }

        Ok(config)
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<i64, SchedulerError> {
    match raw.trim().parse::<i64>() {
        Ok(value) if value >= 0 => Ok(value),
        _ => Err(SchedulerError::InvalidConfig(format!(
            "{key} must be a non-negative integer, got '{raw}'"
        ))),
    }
}
