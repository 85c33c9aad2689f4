//! Scheduling facade.

use tracing::{debug, error, info, warn};

use crate::platform::SchedulerDelegate;
use crate::{SchedulerConfig, SchedulerError, TaskInfo, TaskMetrics};

/// Entry point for scheduling and cancelling background work.
///
/// Never fails towards its caller: platform failures turn into a `false`
/// return or a log line.
pub struct BackgroundTaskScheduler {
    delegate: Box<dyn SchedulerDelegate>,
    metrics: TaskMetrics,
    config: SchedulerConfig,
}

impl BackgroundTaskScheduler {
    pub fn new(
        delegate: Box<dyn SchedulerDelegate>,
        metrics: TaskMetrics,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            delegate,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut TaskMetrics {
        &mut self.metrics
    }

    /// Schedule `task`. Returns whether the platform accepted it.
    #[tracing::instrument(skip(self, task), fields(task_id = task.task_id, timing = task.timing.kind()))]
    pub fn schedule(&mut self, task: &TaskInfo) -> bool {
        if self.config.ignore_background_tasks {
            debug!("ignoring background task scheduling");
            return true;
        }

        let success = match self.delegate.schedule(task) {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "failed to schedule task");
                false
            }
        };

        self.metrics.report_task_scheduled(task.task_id, success);
        self.metrics.report_task_created(task.task_id, &task.timing);

        if success {
            info!("scheduled task");
        }
        success
    }

    /// Cancel a pending, not yet started request for `task_id`. Best-effort.
    #[tracing::instrument(skip(self))]
    pub fn cancel(&mut self, task_id: u32) {
        self.metrics.report_task_canceled(task_id);

        match self.delegate.cancel(task_id) {
            Ok(()) => info!("cancelled task"),
            Err(e) => warn!(error = %e, "failed to cancel task"),
        }
    }

    /// Replay cached telemetry now that the metrics sink is available.
    pub fn do_maintenance(&mut self) -> Result<u64, SchedulerError> {
        self.metrics.flush()
    }

    /// Drop cached telemetry without replaying it.
    pub fn remove_cached_stats(&mut self) -> Result<(), SchedulerError> {
        self.metrics.remove_cached_stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{FakeDelegate, RecordingSink};
    use crate::{MemoryPrefs, MetricsCache, OneOffInfo, PeriodicInfo, events};

    fn scheduler(
        delegate: FakeDelegate,
        config: SchedulerConfig,
    ) -> (BackgroundTaskScheduler, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let metrics = TaskMetrics::new(MetricsCache::new(MemoryPrefs::new()), sink.clone());
        (
            BackgroundTaskScheduler::new(Box::new(delegate), metrics, config),
            sink,
        )
    }

    fn task() -> TaskInfo {
        TaskInfo::one_off(11, OneOffInfo::new(60_000).expires_after_window_end(true))
    }

    #[test]
    fn test_schedule_success_records_events() {
        let delegate = FakeDelegate::new();
        let (mut scheduler, sink) = scheduler(delegate.clone(), SchedulerConfig::default());

        assert!(scheduler.schedule(&task()));
        assert_eq!(delegate.scheduled(), vec![11]);

        scheduler.do_maintenance().unwrap();
        assert_eq!(sink.sparse_count(events::TASK_SCHEDULED_SUCCESS, 11), 1);
        assert_eq!(sink.sparse_count(events::TASK_CREATED_WITH_EXPIRATION, 11), 1);
        assert_eq!(sink.sparse_count(events::TASK_SCHEDULED_FAILURE, 11), 0);
    }

    #[test]
    fn test_schedule_failure_returns_false() {
        let delegate = FakeDelegate::new();
        delegate.fail_schedule(true);
        let (mut scheduler, sink) = scheduler(delegate.clone(), SchedulerConfig::default());

        let periodic = TaskInfo::periodic(12, PeriodicInfo::new(3_600_000));
        assert!(!scheduler.schedule(&periodic));

        scheduler.do_maintenance().unwrap();
        assert_eq!(sink.sparse_count(events::TASK_SCHEDULED_FAILURE, 12), 1);
        assert_eq!(sink.sparse_count(events::TASK_CREATED_WITHOUT_EXPIRATION, 12), 1);
    }

    #[test]
    fn test_declined_schedule_counts_as_failure() {
        let delegate = FakeDelegate::new();
        delegate.decline_schedule(true);
        let (mut scheduler, sink) = scheduler(delegate, SchedulerConfig::default());

        assert!(!scheduler.schedule(&task()));
        scheduler.do_maintenance().unwrap();
        assert_eq!(sink.sparse_count(events::TASK_SCHEDULED_FAILURE, 11), 1);
    }

    #[test]
    fn test_ignore_override_skips_delegate() {
        let delegate = FakeDelegate::new();
        let config = SchedulerConfig {
            ignore_background_tasks: true,
            ..SchedulerConfig::default()
        };
        let (mut scheduler, _) = scheduler(delegate.clone(), config);

        assert!(scheduler.schedule(&task()));
        assert!(delegate.scheduled().is_empty());
        assert!(scheduler.metrics().cache().entries().is_empty());
    }

    #[test]
    fn test_cancel_swallows_delegate_errors() {
        let delegate = FakeDelegate::new();
        delegate.fail_cancel(true);
        let (mut scheduler, sink) = scheduler(delegate.clone(), SchedulerConfig::default());

        scheduler.cancel(11);
        assert_eq!(delegate.cancelled(), vec![11]);

        scheduler.do_maintenance().unwrap();
        assert_eq!(sink.sparse_count(events::TASK_CANCELED, 11), 1);
    }

    #[test]
    fn test_schedule_then_cancel_caches_one_of_each() {
        let delegate = FakeDelegate::new();
        let (mut scheduler, _) = scheduler(delegate, SchedulerConfig::default());

        scheduler.schedule(&task());
        scheduler.cancel(11);

        let entries = scheduler.metrics().cache().entries();
        let count = |event: &str| {
            entries
                .iter()
                .filter(|e| e.event == event && e.value == 11)
                .map(|e| e.count)
                .sum::<u32>()
        };
        assert_eq!(count(events::TASK_SCHEDULED_SUCCESS), 1);
        assert_eq!(count(events::TASK_CANCELED), 1);
    }

    #[test]
    fn test_remove_cached_stats() {
        let (mut scheduler, sink) = scheduler(FakeDelegate::new(), SchedulerConfig::default());
        scheduler.schedule(&task());
        scheduler.remove_cached_stats().unwrap();

        assert_eq!(scheduler.do_maintenance().unwrap(), 0);
        assert!(sink.sparse_samples().is_empty());
    }
}
