//! Expiration checks for tasks that opted into skipping stale runs.

use crate::{TimingInfo, TimingPolicy};

/// Expiration data written into a job at schedule time and read back when the
/// platform delivers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationContext {
    pub schedule_time_ms: i64,
    pub timing: TimingInfo,
}

impl ExpirationContext {
    pub fn is_expired(&self, now_ms: i64, policy: &TimingPolicy) -> bool {
        is_expired(self.schedule_time_ms, &self.timing, now_ms, policy)
    }
}

/// Decide whether a task delivered at `now_ms` should be skipped.
///
/// `schedule_time_ms` is the wall-clock time the task was scheduled at. The
/// caller supplies `now_ms`; this function never reads the clock.
pub fn is_expired(
    schedule_time_ms: i64,
    timing: &TimingInfo,
    now_ms: i64,
    policy: &TimingPolicy,
) -> bool {
    match timing {
        TimingInfo::OneOff(info) => {
            if !info.expires_after_window_end {
                return false;
            }
            let window = info
                .window_end_ms
                .saturating_sub(info.effective_window_start_ms());
            let deadline = schedule_time_ms
                .saturating_add(window)
                .saturating_add(policy.deadline_slack_ms);
            now_ms > deadline
        }
        TimingInfo::Periodic(info) => {
            if !info.expires_after_window_end {
                return false;
            }
            let interval = policy.effective_interval(info.interval_ms);
            let flex = policy.effective_flex(info.flex_ms);
            now_ms > schedule_time_ms.saturating_add(interval).saturating_add(flex)
        }
    }
}
