//! Usage telemetry for scheduling decisions and task lifecycles.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::{MetricsCache, SchedulerError, TimingInfo};

/// Event names recorded by the scheduler. Names never contain `:`.
pub mod events {
    pub const TASK_SCHEDULED_SUCCESS: &str = "BackgroundTaskScheduler.TaskScheduled.Success";
    pub const TASK_SCHEDULED_FAILURE: &str = "BackgroundTaskScheduler.TaskScheduled.Failure";
    pub const TASK_CREATED_WITH_EXPIRATION: &str =
        "BackgroundTaskScheduler.TaskCreated.WithExpiration";
    pub const TASK_CREATED_WITHOUT_EXPIRATION: &str =
        "BackgroundTaskScheduler.TaskCreated.WithoutExpiration";
    pub const TASK_CANCELED: &str = "BackgroundTaskScheduler.TaskCanceled";
    pub const TASK_STARTED: &str = "BackgroundTaskScheduler.TaskStarted";
    pub const TASK_STOPPED: &str = "BackgroundTaskScheduler.TaskStopped";
    pub const TASK_EXPIRED: &str = "BackgroundTaskScheduler.TaskExpired";
    pub const TASK_NOT_FOUND: &str = "BackgroundTaskScheduler.TaskNotFound";
    pub const TASK_FINISHED_DURATION: &str = "BackgroundTaskScheduler.TaskFinished.Duration";
}

/// The real metrics backend.
pub trait MetricsSink: Send + Sync {
    /// Record one sample of a sparse (enumerated) metric.
    fn record_sparse(&self, event: &str, value: i32);

    /// Record one timing sample.
    fn record_duration(&self, event: &str, elapsed: Duration);
}

/// Sink that emits samples as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_sparse(&self, event: &str, value: i32) {
        info!(target: "lull_scheduler::metrics", event, value, "metric sample");
    }

    fn record_duration(&self, event: &str, elapsed: Duration) {
        info!(
            target: "lull_scheduler::metrics",
            event,
            elapsed_ms = elapsed.as_millis() as u64,
            "metric timing"
        );
    }
}

/// Scheduler telemetry. Counters go through the deferred cache; timings go
/// straight to the sink.
pub struct TaskMetrics {
    cache: MetricsCache,
    sink: Arc<dyn MetricsSink>,
}

impl TaskMetrics {
    pub fn new(cache: MetricsCache, sink: Arc<dyn MetricsSink>) -> Self {
        Self { cache, sink }
    }

    pub fn cache(&self) -> &MetricsCache {
        &self.cache
    }

    pub fn report_task_scheduled(&mut self, task_id: u32, success: bool) {
        let event = if success {
            events::TASK_SCHEDULED_SUCCESS
        } else {
            events::TASK_SCHEDULED_FAILURE
        };
        self.cache_event(event, task_id);
    }

    pub fn report_task_created(&mut self, task_id: u32, timing: &TimingInfo) {
        let expires = match timing {
            TimingInfo::OneOff(info) => info.expires_after_window_end,
            TimingInfo::Periodic(info) => info.expires_after_window_end,
        };
        let event = if expires {
            events::TASK_CREATED_WITH_EXPIRATION
        } else {
            events::TASK_CREATED_WITHOUT_EXPIRATION
        };
        self.cache_event(event, task_id);
    }

    pub fn report_task_canceled(&mut self, task_id: u32) {
        self.cache_event(events::TASK_CANCELED, task_id);
    }

    pub fn report_task_started(&mut self, task_id: u32) {
        self.cache_event(events::TASK_STARTED, task_id);
    }

    pub fn report_task_stopped(&mut self, task_id: u32) {
        self.cache_event(events::TASK_STOPPED, task_id);
    }

    pub fn report_task_expired(&mut self, task_id: u32) {
        self.cache_event(events::TASK_EXPIRED, task_id);
    }

    pub fn report_task_not_found(&mut self, task_id: u32) {
        self.cache_event(events::TASK_NOT_FOUND, task_id);
    }

    pub fn report_task_finished(&self, task_id: u32, elapsed: Duration) {
        info!(task_id, elapsed_ms = elapsed.as_millis() as u64, "task finished");
        self.sink
            .record_duration(events::TASK_FINISHED_DURATION, elapsed);
    }

    /// Replay the cached counters into the sink.
    pub fn flush(&mut self) -> Result<u64, SchedulerError> {
        self.cache.flush_stats(self.sink.as_ref())
    }

    pub fn remove_cached_stats(&mut self) -> Result<(), SchedulerError> {
        self.cache.remove_cached_stats()
    }

    fn cache_event(&mut self, event: &str, task_id: u32) {
        let value = i32::try_from(task_id).unwrap_or(i32::MAX);
        if let Err(e) = self.cache.cache_event(event, value) {
            warn!(event, task_id, error = %e, "failed to cache metrics event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use crate::{MemoryPrefs, OneOffInfo, PeriodicInfo};

    fn metrics() -> (TaskMetrics, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let metrics = TaskMetrics::new(MetricsCache::new(MemoryPrefs::new()), sink.clone());
        (metrics, sink)
    }

    #[test]
    fn test_event_names_avoid_separator() {
        for name in [
            events::TASK_SCHEDULED_SUCCESS,
            events::TASK_SCHEDULED_FAILURE,
            events::TASK_CREATED_WITH_EXPIRATION,
            events::TASK_CREATED_WITHOUT_EXPIRATION,
            events::TASK_CANCELED,
            events::TASK_STARTED,
            events::TASK_STOPPED,
            events::TASK_EXPIRED,
            events::TASK_NOT_FOUND,
        ] {
            assert!(!name.contains(':'), "{name}");
        }
    }

    #[test]
    fn test_counters_are_cached_until_flush() {
        let (mut metrics, sink) = metrics();
        metrics.report_task_scheduled(5, true);
        metrics.report_task_scheduled(5, false);
        metrics.report_task_canceled(5);

        assert!(sink.sparse_samples().is_empty());
        assert_eq!(metrics.cache().entries().len(), 3);

        assert_eq!(metrics.flush().unwrap(), 3);
        assert_eq!(sink.sparse_count(events::TASK_SCHEDULED_SUCCESS, 5), 1);
        assert_eq!(sink.sparse_count(events::TASK_SCHEDULED_FAILURE, 5), 1);
        assert_eq!(sink.sparse_count(events::TASK_CANCELED, 5), 1);
    }

    #[test]
    fn test_task_created_distinguishes_expiration() {
        let (mut metrics, sink) = metrics();
        metrics.report_task_created(
            1,
            &TimingInfo::OneOff(OneOffInfo::new(10).expires_after_window_end(true)),
        );
        metrics.report_task_created(2, &TimingInfo::Periodic(PeriodicInfo::new(10)));
        metrics.flush().unwrap();

        assert_eq!(sink.sparse_count(events::TASK_CREATED_WITH_EXPIRATION, 1), 1);
        assert_eq!(sink.sparse_count(events::TASK_CREATED_WITHOUT_EXPIRATION, 2), 1);
    }

    #[test]
    fn test_finished_goes_straight_to_sink() {
        let (metrics, sink) = metrics();
        metrics.report_task_finished(9, Duration::from_secs(3));

        assert_eq!(
            sink.durations(),
            vec![(
                events::TASK_FINISHED_DURATION.to_string(),
                Duration::from_secs(3)
            )]
        );
        assert!(metrics.cache().entries().is_empty());
    }
}
