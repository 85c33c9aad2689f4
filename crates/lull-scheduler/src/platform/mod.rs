//! Platform job service boundary.
//!
//! The scheduling core only talks to the platform through [`SchedulerDelegate`].
//! [`JobServiceDelegate`] is the adapter that maps task descriptors onto a
//! [`JobService`], the narrow view of the OS job scheduler this crate needs.

mod job_service;
mod memory;

use serde::{Deserialize, Serialize};

use crate::{Extras, NetworkType, PlatformError, SchedulerError, TaskInfo};

pub use job_service::{JobServiceDelegate, expiration_context, task_parameters};
pub use memory::InMemoryJobService;

/// Extras key for the wall-clock time the task was scheduled at.
pub const SCHEDULE_TIME_KEY: &str = "_background_task_schedule_time";
/// Extras key for a one-off task's window end.
pub const END_TIME_KEY: &str = "_background_task_end_time";
/// Extras key for a periodic task's interval.
pub const INTERVAL_TIME_KEY: &str = "_background_task_interval_time";
/// Extras key for a periodic task's flex.
pub const FLEX_TIME_KEY: &str = "_background_task_flex_time";
/// Extras key under which the caller's own extras are nested.
pub const TASK_EXTRAS_KEY: &str = "_background_task_extras";

/// Converts task descriptors into platform requests.
pub trait SchedulerDelegate: Send {
    /// Ask the platform to run `task`. `Ok(false)` means the platform declined.
    fn schedule(&mut self, task: &TaskInfo) -> Result<bool, SchedulerError>;

    /// Remove a pending request for `task_id`.
    fn cancel(&mut self, task_id: u32) -> Result<(), SchedulerError>;
}

/// Periodic part of a platform job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicParams {
    pub interval_ms: i64,
    pub flex_ms: i64,
}

/// A job as the platform job service sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub job_id: u32,
    /// Delay before the job may run.
    pub min_latency_ms: Option<i64>,
    /// Run no later than this long after scheduling.
    pub override_deadline_ms: Option<i64>,
    pub periodic: Option<PeriodicParams>,
    pub network: NetworkType,
    pub requires_charging: bool,
    pub persisted: bool,
    pub user_initiated: bool,
    pub extras: Extras,
}

/// The OS job scheduler.
pub trait JobService: Send + Sync {
    fn schedule(&self, job: JobParams) -> Result<(), PlatformError>;

    fn cancel(&self, job_id: u32) -> Result<(), PlatformError>;

    /// The pending job registered under `job_id`, if any.
    fn pending_job(&self, job_id: u32) -> Result<Option<JobParams>, PlatformError>;

    /// Tell the platform a started job is done.
    fn job_finished(&self, job_id: u32, needs_reschedule: bool);

    /// Whether user-initiated jobs are available on this platform.
    fn supports_user_initiated(&self) -> bool {
        false
    }
}
