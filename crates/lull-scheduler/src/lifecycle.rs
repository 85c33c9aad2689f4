//! Job lifecycle manager.
//!
//! Tracks which task implementation is running for each platform job,
//! dispatches start and stop signals to it, and makes sure the running entry
//! for a job is removed exactly once, whether the task finishes on its own or
//! the platform stops it first.
//!
//! Every entry carries a generation number. Completion callbacks are bound to
//! the generation they were created for, so a callback that fires after its
//! entry was stopped (or replaced by a re-delivered start) is recognised as
//! stale and ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::platform::{JobParams, JobService, expiration_context, task_parameters};
use crate::{Clock, TaskMetrics, TaskParameters, TimingPolicy};

/// What a task sees about the job it runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub job_id: u32,
    pub started_at_ms: i64,
}

/// A unit of background work.
///
/// Both hooks run on the scheduler's single execution context and must return
/// quickly. Long work belongs on a separate task that reports back through the
/// [`TaskFinishedCallback`].
pub trait BackgroundTask: Send {
    /// Start the work. Return `true` if it continues asynchronously and will
    /// report through `callback`, `false` if it is already done.
    fn on_start(
        &mut self,
        context: &TaskContext,
        params: &TaskParameters,
        callback: TaskFinishedCallback,
    ) -> bool;

    /// The platform wants the work stopped. Return whether it should be rescheduled.
    fn on_stop(&mut self, context: &TaskContext, params: &TaskParameters) -> bool;
}

/// Resolves task ids to fresh task implementations.
pub trait TaskFactory: Send {
    fn resolve(&self, task_id: u32) -> Option<Box<dyn BackgroundTask>>;
}

type TaskBuilder = Box<dyn Fn() -> Box<dyn BackgroundTask> + Send + Sync>;

/// A [`TaskFactory`] backed by a table of constructors.
#[derive(Default)]
pub struct TaskRegistry {
    builders: HashMap<u32, TaskBuilder>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `task_id`, replacing any previous one.
    pub fn register<T, F>(mut self, task_id: u32, builder: F) -> Self
    where
        T: BackgroundTask + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.builders.insert(
            task_id,
            Box::new(move || Box::new(builder()) as Box<dyn BackgroundTask>),
        );
        self
    }

    pub fn contains(&self, task_id: u32) -> bool {
        self.builders.contains_key(&task_id)
    }
}

impl TaskFactory for TaskRegistry {
    fn resolve(&self, task_id: u32) -> Option<Box<dyn BackgroundTask>> {
        self.builders.get(&task_id).map(|build| build())
    }
}

/// Completion report sent from a task back to the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedSignal {
    pub job_id: u32,
    pub generation: u64,
    pub needs_reschedule: bool,
}

/// Handed to a task on start; bound to that specific run.
#[derive(Debug, Clone)]
pub struct TaskFinishedCallback {
    job_id: u32,
    generation: u64,
    tx: mpsc::UnboundedSender<FinishedSignal>,
}

impl TaskFinishedCallback {
    pub fn job_id(&self) -> u32 {
        self.job_id
    }

    /// Report that the task is done. Safe to call from any thread.
    pub fn task_finished(&self, needs_reschedule: bool) {
        let signal = FinishedSignal {
            job_id: self.job_id,
            generation: self.generation,
            needs_reschedule,
        };
        if self.tx.send(signal).is_err() {
            warn!(job_id = self.job_id, "scheduler gone, dropping task finished signal");
        }
    }
}

struct RunningTask {
    generation: u64,
    context: TaskContext,
    params: TaskParameters,
    task: Box<dyn BackgroundTask>,
}

/// Bookkeeping for running jobs.
pub struct JobLifecycle {
    factory: Box<dyn TaskFactory>,
    service: Arc<dyn JobService>,
    clock: Arc<dyn Clock>,
    policy: TimingPolicy,
    running: HashMap<u32, RunningTask>,
    next_generation: u64,
    finished_tx: mpsc::UnboundedSender<FinishedSignal>,
    /// Tokio task that first drove a transition; every later one must match.
    owner: Option<tokio::task::Id>,
}

impl JobLifecycle {
    /// Create a lifecycle manager and the receiver its completion callbacks feed.
    pub fn new(
        factory: Box<dyn TaskFactory>,
        service: Arc<dyn JobService>,
        clock: Arc<dyn Clock>,
        policy: TimingPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<FinishedSignal>) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            factory,
            service,
            clock,
            policy,
            running: HashMap::new(),
            next_generation: 1,
            finished_tx,
            owner: None,
        };
        (lifecycle, finished_rx)
    }

    /// Job ids with a running entry, sorted.
    pub fn running_jobs(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_running(&self, job_id: u32) -> bool {
        self.running.contains_key(&job_id)
    }

    fn assert_context(&mut self) {
        let current = tokio::task::try_id();
        match self.owner {
            None => self.owner = current,
            Some(owner) => debug_assert_eq!(
                Some(owner),
                current,
                "job lifecycle driven from outside its scheduler task"
            ),
        }
    }

    /// Platform start signal. Returns `true` if the job keeps running
    /// asynchronously, `false` if it was rejected or already completed.
    #[tracing::instrument(skip(self, job, metrics), fields(job_id = job.job_id))]
    pub fn start_job(&mut self, job: &JobParams, metrics: &mut TaskMetrics) -> bool {
        self.assert_context();
        let job_id = job.job_id;

        let Some(task) = self.factory.resolve(job_id) else {
            warn!("no task registered for job, cancelling it");
            metrics.report_task_not_found(job_id);
            if let Err(e) = self.service.cancel(job_id) {
                error!(error = %e, "failed to cancel unknown job");
            }
            return false;
        };

        let now_ms = self.clock.now_ms();
        let expired = expiration_context(job)
            .filter(|expiration| expiration.is_expired(now_ms, &self.policy));
        if let Some(expiration) = expired {
            info!(
                scheduled_at = expiration.schedule_time_ms,
                now = now_ms,
                "job expired, not starting task"
            );
            metrics.report_task_expired(job_id);
            return false;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let context = TaskContext {
            job_id,
            started_at_ms: now_ms,
        };
        let params = task_parameters(job);
        let callback = TaskFinishedCallback {
            job_id,
            generation,
            tx: self.finished_tx.clone(),
        };

        if self
            .running
            .insert(
                job_id,
                RunningTask {
                    generation,
                    context,
                    params,
                    task,
                },
            )
            .is_some()
        {
            warn!("start delivered while job still running, replacing previous instance");
        }

        metrics.report_task_started(job_id);

        let keep_running = match self.running.get_mut(&job_id) {
            Some(entry) => entry.task.on_start(&entry.context, &entry.params, callback),
            None => false,
        };

        if !keep_running {
            debug!("task completed synchronously");
            self.running.remove(&job_id);
        }
        keep_running
    }

    /// Platform stop signal. Returns whether the job should be rescheduled.
    #[tracing::instrument(skip(self, metrics))]
    pub fn stop_job(&mut self, job_id: u32, metrics: &mut TaskMetrics) -> bool {
        self.assert_context();
        let Some(mut entry) = self.running.remove(&job_id) else {
            warn!("stop requested for job that is not running");
            return false;
        };

        metrics.report_task_stopped(job_id);
        let reschedule = entry.task.on_stop(&entry.context, &entry.params);
        info!(reschedule, "stopped task");
        reschedule
    }

    /// Apply a completion report. Returns `false` for stale or duplicate reports.
    #[tracing::instrument(skip(self, signal, metrics), fields(job_id = signal.job_id, generation = signal.generation))]
    pub fn task_finished(&mut self, signal: FinishedSignal, metrics: &TaskMetrics) -> bool {
        self.assert_context();
        let current = self
            .running
            .get(&signal.job_id)
            .map(|entry| entry.generation);

        if current != Some(signal.generation) {
            warn!(current = ?current, "ignoring stale task finished signal");
            return false;
        }

        let Some(entry) = self.running.remove(&signal.job_id) else {
            return false;
        };

        self.service
            .job_finished(signal.job_id, signal.needs_reschedule);

        let elapsed_ms = (self.clock.now_ms() - entry.context.started_at_ms).max(0);
        metrics.report_task_finished(signal.job_id, Duration::from_millis(elapsed_ms as u64));
        true
    }
}
