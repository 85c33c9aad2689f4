//! SchedulerCoordinator actor.
//!
//! Scheduling calls, platform start/stop signals and task completion reports
//! all mutate the same bookkeeping. The coordinator owns that state and
//! applies every change from one task, so none of it needs locking.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::lifecycle::FinishedSignal;
use crate::platform::JobParams;
use crate::{BackgroundTaskScheduler, CachedUmaEntry, JobLifecycle, SchedulerError, TaskInfo};

/// Channel buffer size for the coordinator.
const COORDINATOR_CHANNEL_SIZE: usize = 100;

/// Operations that can be sent to the SchedulerCoordinator.
pub enum SchedulerOp {
    Schedule {
        task: Box<TaskInfo>,
        response: oneshot::Sender<bool>,
    },
    Cancel {
        task_id: u32,
        response: oneshot::Sender<()>,
    },
    /// Replay cached telemetry.
    DoMaintenance {
        response: oneshot::Sender<Result<u64, SchedulerError>>,
    },
    RemoveCachedStats {
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
    CachedStats {
        response: oneshot::Sender<Vec<CachedUmaEntry>>,
    },
    /// Platform start signal.
    StartJob {
        job: Box<JobParams>,
        response: oneshot::Sender<bool>,
    },
    /// Platform stop signal.
    StopJob {
        job_id: u32,
        response: oneshot::Sender<bool>,
    },
    RunningJobs {
        response: oneshot::Sender<Vec<u32>>,
    },
    /// Shutdown the coordinator.
    Shutdown,
}

/// Owns the scheduling facade and the job lifecycle manager.
pub struct SchedulerCoordinator {
    scheduler: BackgroundTaskScheduler,
    lifecycle: JobLifecycle,
    op_rx: mpsc::Receiver<SchedulerOp>,
    finished_rx: mpsc::UnboundedReceiver<FinishedSignal>,
}

impl SchedulerCoordinator {
    /// Create a coordinator. `finished_rx` is the receiver returned by
    /// [`JobLifecycle::new`].
    pub fn new(
        scheduler: BackgroundTaskScheduler,
        lifecycle: JobLifecycle,
        finished_rx: mpsc::UnboundedReceiver<FinishedSignal>,
    ) -> (Self, SchedulerHandle) {
        let (op_tx, op_rx) = mpsc::channel(COORDINATOR_CHANNEL_SIZE);
        let coordinator = Self {
            scheduler,
            lifecycle,
            op_rx,
            finished_rx,
        };
        (coordinator, SchedulerHandle { op_tx })
    }

    /// Run the coordinator event loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        debug!("scheduler coordinator started");

        loop {
            tokio::select! {
                biased;

                Some(signal) = self.finished_rx.recv() => {
                    trace!(job_id = signal.job_id, "processing task finished signal");
                    self.lifecycle.task_finished(signal, self.scheduler.metrics());
                }
                op = self.op_rx.recv() => {
                    match op {
                        Some(SchedulerOp::Shutdown) => {
                            debug!("scheduler coordinator received shutdown");
                            break;
                        }
                        Some(op) => self.handle(op),
                        None => break,
                    }
                }
            }
        }

        let running = self.lifecycle.running_jobs();
        if !running.is_empty() {
            warn!(?running, "scheduler coordinator stopped with jobs still running");
        }
        debug!("scheduler coordinator stopped");
    }

    fn handle(&mut self, op: SchedulerOp) {
        match op {
            SchedulerOp::Schedule { task, response } => {
                trace!(task_id = task.task_id, "processing schedule op");
                let _ = response.send(self.scheduler.schedule(&task));
            }
            SchedulerOp::Cancel { task_id, response } => {
                trace!(task_id, "processing cancel op");
                self.scheduler.cancel(task_id);
                let _ = response.send(());
            }
            SchedulerOp::DoMaintenance { response } => {
                let _ = response.send(self.scheduler.do_maintenance());
            }
            SchedulerOp::RemoveCachedStats { response } => {
                let _ = response.send(self.scheduler.remove_cached_stats());
            }
            SchedulerOp::CachedStats { response } => {
                let _ = response.send(self.scheduler.metrics().cache().entries());
            }
            SchedulerOp::StartJob { job, response } => {
                trace!(job_id = job.job_id, "processing start op");
                let started = self
                    .lifecycle
                    .start_job(&job, self.scheduler.metrics_mut());
                let _ = response.send(started);
            }
            SchedulerOp::StopJob { job_id, response } => {
                trace!(job_id, "processing stop op");
                let reschedule = self
                    .lifecycle
                    .stop_job(job_id, self.scheduler.metrics_mut());
                let _ = response.send(reschedule);
            }
            SchedulerOp::RunningJobs { response } => {
                let _ = response.send(self.lifecycle.running_jobs());
            }
            SchedulerOp::Shutdown => {}
        }
    }

    /// Spawn the coordinator as a background task.
    pub fn spawn(
        scheduler: BackgroundTaskScheduler,
        lifecycle: JobLifecycle,
        finished_rx: mpsc::UnboundedReceiver<FinishedSignal>,
    ) -> SchedulerHandle {
        let (coordinator, handle) = Self::new(scheduler, lifecycle, finished_rx);
        tokio::spawn(async move {
            coordinator.run().await;
        });
        handle
    }
}

/// Handle for sending operations to the SchedulerCoordinator.
///
/// Cheaply cloneable; errors only when the coordinator has stopped.
#[derive(Clone)]
pub struct SchedulerHandle {
    op_tx: mpsc::Sender<SchedulerOp>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        op: impl FnOnce(oneshot::Sender<T>) -> SchedulerOp,
    ) -> Result<T, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.op_tx
            .send(op(response_tx))
            .await
            .map_err(|_| SchedulerError::CoordinatorClosed)?;
        response_rx
            .await
            .map_err(|_| SchedulerError::CoordinatorClosed)
    }

    /// Schedule a task. `Ok(false)` means the platform did not accept it.
    pub async fn schedule(&self, task: TaskInfo) -> Result<bool, SchedulerError> {
        self.request(|response| SchedulerOp::Schedule {
            task: Box::new(task),
            response,
        })
        .await
    }

    pub async fn cancel(&self, task_id: u32) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerOp::Cancel { task_id, response })
            .await
    }

    /// Replay cached telemetry, returning how many samples were recorded.
    pub async fn do_maintenance(&self) -> Result<u64, SchedulerError> {
        self.request(|response| SchedulerOp::DoMaintenance { response })
            .await?
    }

    pub async fn remove_cached_stats(&self) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerOp::RemoveCachedStats { response })
            .await?
    }

    /// Telemetry waiting in the cache.
    pub async fn cached_stats(&self) -> Result<Vec<CachedUmaEntry>, SchedulerError> {
        self.request(|response| SchedulerOp::CachedStats { response })
            .await
    }

    /// Deliver a platform start signal for `job`.
    pub async fn start_job(&self, job: JobParams) -> Result<bool, SchedulerError> {
        self.request(|response| SchedulerOp::StartJob {
            job: Box::new(job),
            response,
        })
        .await
    }

    /// Deliver a platform stop signal. Returns whether the job wants a reschedule.
    pub async fn stop_job(&self, job_id: u32) -> Result<bool, SchedulerError> {
        self.request(|response| SchedulerOp::StopJob { job_id, response })
            .await
    }

    pub async fn running_jobs(&self) -> Result<Vec<u32>, SchedulerError> {
        self.request(|response| SchedulerOp::RunningJobs { response })
            .await
    }

    /// Shutdown the coordinator.
    ///
    /// After calling this, no more operations can be sent.
    pub async fn shutdown(&self) {
        if let Err(e) = self.op_tx.send(SchedulerOp::Shutdown).await {
            warn!(error = %e, "failed to send shutdown to coordinator");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.op_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::platform::{InMemoryJobService, JobServiceDelegate};
    use crate::testing::{RecordingSink, ScriptedTask, TaskProbe};
    use crate::{
        ManualClock, MemoryPrefs, MetricsCache, OneOffInfo, SchedulerConfig, TaskMetrics,
        TaskRegistry, TimingPolicy, events,
    };

    const TASK_ID: u32 = 3;
    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        handle: SchedulerHandle,
        service: Arc<InMemoryJobService>,
        sink: Arc<RecordingSink>,
        probe: TaskProbe,
    }

    fn fixture(task: ScriptedTask) -> Fixture {
        let probe = task.probe();
        let service = Arc::new(InMemoryJobService::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let sink = Arc::new(RecordingSink::new());

        let delegate =
            JobServiceDelegate::new(service.clone(), clock.clone(), TimingPolicy::default());
        let metrics = TaskMetrics::new(MetricsCache::new(MemoryPrefs::new()), sink.clone());
        let scheduler =
            BackgroundTaskScheduler::new(Box::new(delegate), metrics, SchedulerConfig::default());

        let registry = TaskRegistry::new().register(TASK_ID, move || task.clone());
        let (lifecycle, finished_rx) = JobLifecycle::new(
            Box::new(registry),
            service.clone(),
            clock,
            TimingPolicy::default(),
        );

        let handle = SchedulerCoordinator::spawn(scheduler, lifecycle, finished_rx);
        Fixture {
            handle,
            service,
            sink,
            probe,
        }
    }

    async fn wait_until_idle(handle: &SchedulerHandle) {
        for _ in 0..100 {
            if handle.running_jobs().await.unwrap().is_empty() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("jobs still running");
    }

    #[tokio::test]
    async fn test_coordinator_spawn_and_shutdown() {
        let f = fixture(ScriptedTask::asynchronous());
        assert!(!f.handle.is_closed());

        f.handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.handle.is_closed());
        assert!(matches!(
            f.handle.running_jobs().await,
            Err(SchedulerError::CoordinatorClosed)
        ));
    }

    #[tokio::test]
    async fn test_schedule_start_and_complete() {
        let f = fixture(ScriptedTask::asynchronous());
        let task = TaskInfo::one_off(TASK_ID, OneOffInfo::new(60_000));

        assert!(f.handle.schedule(task).await.unwrap());
        let job = f.service.pending_jobs().remove(0);

        assert!(f.handle.start_job(job).await.unwrap());
        assert_eq!(f.handle.running_jobs().await.unwrap(), vec![TASK_ID]);

        f.probe.finish(false);
        wait_until_idle(&f.handle).await;

        assert_eq!(f.service.finished_calls(), vec![(TASK_ID, false)]);
        assert!(f.service.pending_jobs().is_empty());
        assert_eq!(f.sink.durations().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_during_start_is_applied_once() {
        let f = fixture(ScriptedTask::asynchronous().finish_during_start(true));
        let task = TaskInfo::one_off(TASK_ID, OneOffInfo::new(60_000));
        f.handle.schedule(task).await.unwrap();
        let job = f.service.pending_jobs().remove(0);

        assert!(f.handle.start_job(job).await.unwrap());
        wait_until_idle(&f.handle).await;

        assert_eq!(f.service.finished_calls(), vec![(TASK_ID, true)]);
        assert_eq!(f.service.pending_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_wins_over_late_completion() {
        let f = fixture(ScriptedTask::asynchronous().reschedule_on_stop(true));
        let task = TaskInfo::one_off(TASK_ID, OneOffInfo::new(60_000));
        f.handle.schedule(task).await.unwrap();
        let job = f.service.pending_jobs().remove(0);

        f.handle.start_job(job).await.unwrap();
        assert!(f.handle.stop_job(TASK_ID).await.unwrap());

        f.probe.finish(false);
        wait_until_idle(&f.handle).await;
        // Round trip so the late signal has been drained.
        f.handle.running_jobs().await.unwrap();

        assert!(f.service.finished_calls().is_empty());
        assert!(!f.handle.stop_job(TASK_ID).await.unwrap());
    }

    #[tokio::test]
    async fn test_cached_stats_and_maintenance() {
        let f = fixture(ScriptedTask::asynchronous());
        f.handle
            .schedule(TaskInfo::one_off(TASK_ID, OneOffInfo::new(60_000)))
            .await
            .unwrap();
        f.handle.cancel(TASK_ID).await.unwrap();

        let cached = f.handle.cached_stats().await.unwrap();
        assert_eq!(cached.len(), 3);
        assert!(f.sink.sparse_samples().is_empty());

        assert_eq!(f.handle.do_maintenance().await.unwrap(), 3);
        assert_eq!(f.sink.sparse_count(events::TASK_CANCELED, TASK_ID as i32), 1);
        assert!(f.handle.cached_stats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_cached_stats() {
        let f = fixture(ScriptedTask::asynchronous());
        f.handle.cancel(TASK_ID).await.unwrap();
        f.handle.remove_cached_stats().await.unwrap();

        assert_eq!(f.handle.do_maintenance().await.unwrap(), 0);
        assert!(f.sink.sparse_samples().is_empty());
    }
}
