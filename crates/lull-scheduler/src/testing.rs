//! Test doubles for scheduler users and this crate's own tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::platform::{InMemoryJobService, JobParams, JobServiceDelegate, SchedulerDelegate};
use crate::{
    BackgroundTask, ManualClock, MetricsSink, PlatformError, SchedulerError, TaskContext,
    TaskFinishedCallback, TaskInfo, TaskParameters, TimingPolicy,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build the job a default-policy platform would deliver for `task`.
pub fn job_params(task: &TaskInfo, schedule_time_ms: i64) -> JobParams {
    let delegate = JobServiceDelegate::new(
        Arc::new(InMemoryJobService::new()),
        Arc::new(ManualClock::new(schedule_time_ms)),
        TimingPolicy::default(),
    );
    delegate.build_job(task, schedule_time_ms)
}

/// Metrics sink that keeps every sample.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sparse: Mutex<Vec<(String, i32)>>,
    durations: Mutex<Vec<(String, Duration)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sparse_samples(&self) -> Vec<(String, i32)> {
        lock(&self.sparse).clone()
    }

    /// How many samples of `event` with `value` were recorded.
    pub fn sparse_count(&self, event: &str, value: i32) -> usize {
        lock(&self.sparse)
            .iter()
            .filter(|(e, v)| e == event && *v == value)
            .count()
    }

    pub fn durations(&self) -> Vec<(String, Duration)> {
        lock(&self.durations).clone()
    }
}

impl MetricsSink for RecordingSink {
    fn record_sparse(&self, event: &str, value: i32) {
        lock(&self.sparse).push((event.to_string(), value));
    }

    fn record_duration(&self, event: &str, elapsed: Duration) {
        lock(&self.durations).push((event.to_string(), elapsed));
    }
}

#[derive(Debug, Default)]
struct DelegateState {
    scheduled: Vec<u32>,
    cancelled: Vec<u32>,
    fail_schedule: bool,
    decline_schedule: bool,
    fail_cancel: bool,
}

/// Scriptable [`SchedulerDelegate`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeDelegate {
    state: Arc<Mutex<DelegateState>>,
}

impl FakeDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task ids the delegate accepted.
    pub fn scheduled(&self) -> Vec<u32> {
        lock(&self.state).scheduled.clone()
    }

    /// Task ids cancel was called for, including failed calls.
    pub fn cancelled(&self) -> Vec<u32> {
        lock(&self.state).cancelled.clone()
    }

    pub fn fail_schedule(&self, fail: bool) {
        lock(&self.state).fail_schedule = fail;
    }

    /// Make schedule return `Ok(false)`.
    pub fn decline_schedule(&self, decline: bool) {
        lock(&self.state).decline_schedule = decline;
    }

    pub fn fail_cancel(&self, fail: bool) {
        lock(&self.state).fail_cancel = fail;
    }
}

impl SchedulerDelegate for FakeDelegate {
    fn schedule(&mut self, task: &TaskInfo) -> Result<bool, SchedulerError> {
        let mut state = lock(&self.state);
        if state.fail_schedule {
            return Err(PlatformError::Unavailable("fake delegate failure".to_string()).into());
        }
        if state.decline_schedule {
            return Ok(false);
        }
        state.scheduled.push(task.task_id);
        Ok(true)
    }

    fn cancel(&mut self, task_id: u32) -> Result<(), SchedulerError> {
        let mut state = lock(&self.state);
        state.cancelled.push(task_id);
        if state.fail_cancel {
            return Err(PlatformError::Unavailable("fake delegate failure".to_string()).into());
        }
        state.scheduled.retain(|id| *id != task_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    starts: usize,
    stops: usize,
    callbacks: Vec<TaskFinishedCallback>,
    params: Vec<TaskParameters>,
}

/// Observes every [`ScriptedTask`] built from the same script.
#[derive(Debug, Clone, Default)]
pub struct TaskProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl TaskProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }

    /// Callback handed to the `index`th start.
    pub fn callback(&self, index: usize) -> Option<TaskFinishedCallback> {
        lock(&self.state).callbacks.get(index).cloned()
    }

    /// Parameters passed to the most recent start.
    pub fn last_params(&self) -> Option<TaskParameters> {
        lock(&self.state).params.last().cloned()
    }

    /// Complete the most recent run. Does nothing if no run started.
    pub fn finish(&self, needs_reschedule: bool) {
        let callback = lock(&self.state).callbacks.last().cloned();
        if let Some(callback) = callback {
            callback.task_finished(needs_reschedule);
        }
    }
}

/// A [`BackgroundTask`] whose answers are fixed up front.
#[derive(Debug, Clone)]
pub struct ScriptedTask {
    probe: TaskProbe,
    keep_running: bool,
    reschedule_on_stop: bool,
    finish_during_start: Option<bool>,
}

impl ScriptedTask {
    /// Keeps running after start until someone calls [`TaskProbe::finish`].
    pub fn asynchronous() -> Self {
        Self {
            probe: TaskProbe::new(),
            keep_running: true,
            reschedule_on_stop: false,
            finish_during_start: None,
        }
    }

    /// Completes inside `on_start`.
    pub fn synchronous() -> Self {
        Self {
            keep_running: false,
            ..Self::asynchronous()
        }
    }

    pub fn reschedule_on_stop(mut self, reschedule: bool) -> Self {
        self.reschedule_on_stop = reschedule;
        self
    }

    /// Fire the completion callback before `on_start` returns.
    pub fn finish_during_start(mut self, needs_reschedule: bool) -> Self {
        self.finish_during_start = Some(needs_reschedule);
        self
    }

    pub fn probe(&self) -> TaskProbe {
        self.probe.clone()
    }
}

impl BackgroundTask for ScriptedTask {
    fn on_start(
        &mut self,
        _context: &TaskContext,
        params: &TaskParameters,
        callback: TaskFinishedCallback,
    ) -> bool {
        {
            let mut state = lock(&self.probe.state);
            state.starts += 1;
            state.params.push(params.clone());
            state.callbacks.push(callback.clone());
        }
        if let Some(needs_reschedule) = self.finish_during_start {
            callback.task_finished(needs_reschedule);
        }
        self.keep_running
    }

    fn on_stop(&mut self, _context: &TaskContext, _params: &TaskParameters) -> bool {
        lock(&self.probe.state).stops += 1;
        self.reschedule_on_stop
    }
}
