//! Delegate that drives a [`JobService`].

use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    END_TIME_KEY, FLEX_TIME_KEY, INTERVAL_TIME_KEY, JobParams, JobService, PeriodicParams,
    SCHEDULE_TIME_KEY, SchedulerDelegate, TASK_EXTRAS_KEY,
};
use crate::expiration::ExpirationContext;
use crate::{
    Clock, ExtraValue, Extras, OneOffInfo, PeriodicInfo, SchedulerError, TaskInfo,
    TaskParameters, TimingInfo, TimingPolicy,
};

/// Adapter from task descriptors to platform jobs.
pub struct JobServiceDelegate {
    service: Arc<dyn JobService>,
    clock: Arc<dyn Clock>,
    policy: TimingPolicy,
}

impl JobServiceDelegate {
    pub fn new(service: Arc<dyn JobService>, clock: Arc<dyn Clock>, policy: TimingPolicy) -> Self {
        Self {
            service,
            clock,
            policy,
        }
    }

    /// Build the platform job for `task` scheduled at `schedule_time_ms`.
    pub fn build_job(&self, task: &TaskInfo, schedule_time_ms: i64) -> JobParams {
        let mut extras = Extras::new();
        extras.insert(
            TASK_EXTRAS_KEY.to_string(),
            ExtraValue::Bundle(task.extras.clone()),
        );

        let user_initiated = task.is_user_initiated && self.service.supports_user_initiated();
        if task.is_user_initiated && !user_initiated {
            warn!(
                task_id = task.task_id,
                "user-initiated jobs unsupported by job service, scheduling as regular job"
            );
        }

        let mut job = JobParams {
            job_id: task.task_id,
            min_latency_ms: None,
            override_deadline_ms: None,
            periodic: None,
            network: task.required_network,
            requires_charging: task.requires_charging,
            persisted: task.is_persisted,
            user_initiated,
            extras,
        };

        match &task.timing {
            TimingInfo::OneOff(info) => {
                let start = info.effective_window_start_ms();
                if start > 0 {
                    job.min_latency_ms = Some(start);
                }
                job.override_deadline_ms = Some(info.window_end_ms);

                if info.expires_after_window_end {
                    job.extras
                        .insert(SCHEDULE_TIME_KEY.to_string(), schedule_time_ms.into());
                    job.extras
                        .insert(END_TIME_KEY.to_string(), info.window_end_ms.into());
                }
            }
            TimingInfo::Periodic(info) => {
                let interval_ms = self.policy.effective_interval(info.interval_ms);
                let flex_ms = self.policy.effective_flex(info.flex_ms);
                job.periodic = Some(PeriodicParams {
                    interval_ms,
                    flex_ms,
                });

                if info.expires_after_window_end {
                    job.extras
                        .insert(SCHEDULE_TIME_KEY.to_string(), schedule_time_ms.into());
                    job.extras
                        .insert(INTERVAL_TIME_KEY.to_string(), interval_ms.into());
                    job.extras
                        .insert(FLEX_TIME_KEY.to_string(), flex_ms.into());
                }
            }
        }

        job
    }
}

impl SchedulerDelegate for JobServiceDelegate {
    fn schedule(&mut self, task: &TaskInfo) -> Result<bool, SchedulerError> {
        task.validate()?;

        if !task.update_current
            && self.service.pending_job(task.task_id)?.is_some()
        {
            debug!(
                task_id = task.task_id,
                "equivalent job already pending, keeping it"
            );
            return Ok(true);
        }

        let job = self.build_job(task, self.clock.now_ms());
        self.service.schedule(job)?;
        Ok(true)
    }

    fn cancel(&mut self, task_id: u32) -> Result<(), SchedulerError> {
        self.service.cancel(task_id)?;
        Ok(())
    }
}

/// Recover what a task implementation sees from a delivered job.
pub fn task_parameters(job: &JobParams) -> TaskParameters {
    let extras = job
        .extras
        .get(TASK_EXTRAS_KEY)
        .and_then(ExtraValue::as_bundle)
        .cloned()
        .unwrap_or_default();

    TaskParameters {
        task_id: job.job_id,
        extras,
    }
}

/// Recover the expiration data written at schedule time.
///
/// Returns `None` for jobs that did not opt into expiration.
pub fn expiration_context(job: &JobParams) -> Option<ExpirationContext> {
    let long = |key: &str| job.extras.get(key).and_then(ExtraValue::as_long);

    let schedule_time_ms = long(SCHEDULE_TIME_KEY)?;

    let timing = if let Some(interval_ms) = long(INTERVAL_TIME_KEY) {
        let mut info = PeriodicInfo::new(interval_ms).expires_after_window_end(true);
        info.flex_ms = long(FLEX_TIME_KEY);
        TimingInfo::Periodic(info)
    } else if let Some(end_ms) = long(END_TIME_KEY) {
        let mut info = OneOffInfo::new(end_ms).expires_after_window_end(true);
        info.window_start_ms = job.min_latency_ms;
        TimingInfo::OneOff(info)
    } else {
        warn!(
            job_id = job.job_id,
            "job has a schedule time but no window, ignoring expiration"
        );
        return None;
    };

    Some(ExpirationContext {
        schedule_time_ms,
        timing,
    })
}
