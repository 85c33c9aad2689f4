//! Task descriptor types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Prefix reserved for keys the platform adapter writes into job extras.
pub const RESERVED_EXTRAS_PREFIX: &str = "_background_task_";

/// Primitive-only key/value bag carried with a task.
pub type Extras = BTreeMap<String, ExtraValue>;

/// A value that a platform job service can persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
    Bundle(Extras),
}

impl ExtraValue {
    /// Integer payload, if this value holds one.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Nested bundle payload, if this value holds one.
    pub fn as_bundle(&self) -> Option<&Extras> {
        match self {
            Self::Bundle(b) => Some(b),
            _ => None,
        }
    }
}

impl From<bool> for ExtraValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ExtraValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for ExtraValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for ExtraValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ExtraValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Network connectivity a task needs before it may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// No network requirement.
    #[default]
    None,
    /// Any connected network.
    Any,
    /// An unmetered network such as Wi-Fi.
    Unmetered,
    /// Any network that is not roaming.
    NotRoaming,
    /// A cellular network.
    Cellular,
}

/// A single bounded execution window.
///
/// Times are relative to the moment the task is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneOffInfo {
    /// Earliest start, `None` meaning no delay.
    pub window_start_ms: Option<i64>,
    /// Deadline.
    pub window_end_ms: i64,
    /// Skip the task if it is delivered after the window closed.
    pub expires_after_window_end: bool,
}

impl OneOffInfo {
    /// Window ending `window_end_ms` after scheduling, with no delay.
    pub fn new(window_end_ms: i64) -> Self {
        Self {
            window_start_ms: None,
            window_end_ms,
            expires_after_window_end: false,
        }
    }

    pub fn window_start(mut self, window_start_ms: i64) -> Self {
        self.window_start_ms = Some(window_start_ms);
        self
    }

    pub fn expires_after_window_end(mut self, expires: bool) -> Self {
        self.expires_after_window_end = expires;
        self
    }

    /// Window start with the "no delay" default applied.
    pub fn effective_window_start_ms(&self) -> i64 {
        self.window_start_ms.unwrap_or(0)
    }
}

/// A recurring interval with optional flex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicInfo {
    pub interval_ms: i64,
    pub flex_ms: Option<i64>,
    /// Skip a run delivered later than one interval plus flex after scheduling.
    pub expires_after_window_end: bool,
}

impl PeriodicInfo {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            flex_ms: None,
            expires_after_window_end: false,
        }
    }

    pub fn flex(mut self, flex_ms: i64) -> Self {
        self.flex_ms = Some(flex_ms);
        self
    }

    pub fn expires_after_window_end(mut self, expires: bool) -> Self {
        self.expires_after_window_end = expires;
        self
    }
}

/// When a task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimingInfo {
    OneOff(OneOffInfo),
    Periodic(PeriodicInfo),
}

impl TimingInfo {
    pub fn expires_after_window_end(&self) -> bool {
        match self {
            Self::OneOff(info) => info.expires_after_window_end,
            Self::Periodic(info) => info.expires_after_window_end,
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OneOff(_) => "one_off",
            Self::Periodic(_) => "periodic",
        }
    }
}

/// Platform-independent description of a unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Stable identifier, namespaced by the caller.
    pub task_id: u32,
    pub timing: TimingInfo,
    pub required_network: NetworkType,
    pub requires_charging: bool,
    /// Survive a device reboot.
    pub is_persisted: bool,
    /// Replace an equivalent pending request instead of keeping it.
    pub update_current: bool,
    pub is_user_initiated: bool,
    pub extras: Extras,
}

impl TaskInfo {
    /// Create a one-off task with default constraints.
    pub fn one_off(task_id: u32, info: OneOffInfo) -> Self {
        Self::with_timing(task_id, TimingInfo::OneOff(info))
    }

    /// Create a periodic task with default constraints.
    pub fn periodic(task_id: u32, info: PeriodicInfo) -> Self {
        Self::with_timing(task_id, TimingInfo::Periodic(info))
    }

    fn with_timing(task_id: u32, timing: TimingInfo) -> Self {
        Self {
            task_id,
            timing,
            required_network: NetworkType::None,
            requires_charging: false,
            is_persisted: false,
            update_current: false,
            is_user_initiated: false,
            extras: Extras::new(),
        }
    }

    pub fn network(mut self, network: NetworkType) -> Self {
        self.required_network = network;
        self
    }

    pub fn requires_charging(mut self, requires: bool) -> Self {
        self.requires_charging = requires;
        self
    }

    pub fn persisted(mut self, persisted: bool) -> Self {
        self.is_persisted = persisted;
        self
    }

    pub fn update_current(mut self, update: bool) -> Self {
        self.update_current = update;
        self
    }

    pub fn user_initiated(mut self, user_initiated: bool) -> Self {
        self.is_user_initiated = user_initiated;
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<ExtraValue>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Check the descriptor invariants.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.task_id == 0 {
            return Err(SchedulerError::InvalidTask(
                "task id must be positive".to_string(),
            ));
        }

        match &self.timing {
            TimingInfo::OneOff(info) => {
                let start = info.effective_window_start_ms();
                if start < 0 || info.window_end_ms < 0 {
                    return Err(SchedulerError::InvalidTask(format!(
                        "task {}: window times must be non-negative",
                        self.task_id
                    )));
                }
                if info.window_end_ms < start {
                    return Err(SchedulerError::InvalidTask(format!(
                        "task {}: window end {} before window start {}",
                        self.task_id, info.window_end_ms, start
                    )));
                }
            }
            TimingInfo::Periodic(info) => {
                if info.interval_ms <= 0 {
                    return Err(SchedulerError::InvalidTask(format!(
                        "task {}: interval must be positive",
                        self.task_id
                    )));
                }
                if let Some(flex) = info.flex_ms
                    && (flex < 0 || flex > info.interval_ms)
                {
                    return Err(SchedulerError::InvalidTask(format!(
                        "task {}: flex {} outside 0..={}",
                        self.task_id, flex, info.interval_ms
                    )));
                }
            }
        }

        if let Some(key) = self
            .extras
            .keys()
            .find(|k| k.starts_with(RESERVED_EXTRAS_PREFIX))
        {
            return Err(SchedulerError::InvalidTask(format!(
                "task {}: extras key '{}' uses a reserved prefix",
                self.task_id, key
            )));
        }

        Ok(())
    }
}

/// What a running task sees about the job it was started for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParameters {
    pub task_id: u32,
    pub extras: Extras,
}
