//! End-to-end scheduling scenarios through the coordinator, with a manual
//! clock standing in for wall time and the in-memory job service standing in
//! for the platform.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use lull_scheduler::platform::{InMemoryJobService, JobServiceDelegate};
use lull_scheduler::testing::{RecordingSink, ScriptedTask, TaskProbe};
use lull_scheduler::{
    BackgroundTaskScheduler, FilePrefs, JobLifecycle, ManualClock, MetricsCache, OneOffInfo,
    PeriodicInfo, SchedulerConfig, SchedulerCoordinator, SchedulerHandle, TaskInfo, TaskMetrics,
    TaskRegistry, events,
};

const MINUTE: i64 = 60 * 1000;
const NOW: i64 = 1_700_000_000_000;
const SYNC_TASK: u32 = 1;
const PERIODIC_TASK: u32 = 2;

struct World {
    handle: SchedulerHandle,
    service: Arc<InMemoryJobService>,
    clock: ManualClock,
    sink: Arc<RecordingSink>,
    probe: TaskProbe,
    periodic_probe: TaskProbe,
}

fn world_with(config: SchedulerConfig, prefs: FilePrefs) -> World {
    let clock = ManualClock::new(NOW);
    let service = Arc::new(InMemoryJobService::new());
    let sink = Arc::new(RecordingSink::new());

    let task = ScriptedTask::asynchronous();
    let periodic = ScriptedTask::asynchronous();
    let probe = task.probe();
    let periodic_probe = periodic.probe();
    let registry = TaskRegistry::new()
        .register(SYNC_TASK, move || task.clone())
        .register(PERIODIC_TASK, move || periodic.clone());

    let delegate = JobServiceDelegate::new(
        service.clone(),
        Arc::new(clock.clone()),
        config.timing,
    );
    let metrics = TaskMetrics::new(MetricsCache::new(prefs), sink.clone());
    let (lifecycle, finished_rx) = JobLifecycle::new(
        Box::new(registry),
        service.clone(),
        Arc::new(clock.clone()),
        config.timing,
    );
    let scheduler = BackgroundTaskScheduler::new(Box::new(delegate), metrics, config);
    let handle = SchedulerCoordinator::spawn(scheduler, lifecycle, finished_rx);

    World {
        handle,
        service,
        clock,
        sink,
        probe,
        periodic_probe,
    }
}

fn world(dir: &tempfile::TempDir) -> World {
    let prefs = FilePrefs::open(dir.path().join("prefs.json")).unwrap();
    world_with(SchedulerConfig::default(), prefs)
}

async fn settle(handle: &SchedulerHandle) {
    for _ in 0..100 {
        if handle.running_jobs().await.unwrap().is_empty() {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_one_off_runs_inside_window() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(&dir);
    let task = TaskInfo::one_off(
        SYNC_TASK,
        OneOffInfo::new(200 * MINUTE).expires_after_window_end(true),
    )
    .extra("payload", "hello");

    assert!(w.handle.schedule(task).await.unwrap());
    let job = w.service.pending_jobs().remove(0);

    w.clock.advance(90 * MINUTE);
    assert!(w.handle.start_job(job).await.unwrap());
    assert_eq!(
        w.probe.last_params().unwrap().extras.get("payload"),
        Some(&"hello".into())
    );

    w.clock.advance(2 * MINUTE);
    w.probe.finish(false);
    settle(&w.handle).await;

    assert_eq!(w.service.finished_calls(), vec![(SYNC_TASK, false)]);
    assert_eq!(
        w.sink.durations(),
        vec![(
            events::TASK_FINISHED_DURATION.to_string(),
            Duration::from_millis(2 * MINUTE as u64)
        )]
    );
}

#[tokio::test]
async fn test_expired_periodic_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(&dir);
    let task = TaskInfo::periodic(
        PERIODIC_TASK,
        PeriodicInfo::new(200 * MINUTE).expires_after_window_end(true),
    );

    assert!(w.handle.schedule(task).await.unwrap());
    let job = w.service.pending_jobs().remove(0);

    w.clock.advance(400 * MINUTE);
    assert!(!w.handle.start_job(job).await.unwrap());
    assert_eq!(w.periodic_probe.starts(), 0);
    assert!(w.handle.running_jobs().await.unwrap().is_empty());

    w.handle.do_maintenance().await.unwrap();
    assert_eq!(
        w.sink
            .sparse_count(events::TASK_EXPIRED, PERIODIC_TASK as i32),
        1
    );
}

#[tokio::test]
async fn test_duplicate_completion_reports_once() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(&dir);
    w.handle
        .schedule(TaskInfo::one_off(SYNC_TASK, OneOffInfo::new(MINUTE)))
        .await
        .unwrap();
    let job = w.service.pending_jobs().remove(0);

    assert!(w.handle.start_job(job).await.unwrap());
    w.probe.finish(false);
    w.probe.finish(false);
    settle(&w.handle).await;
    w.handle.running_jobs().await.unwrap();

    assert_eq!(w.service.finished_calls(), vec![(SYNC_TASK, false)]);
    assert_eq!(w.sink.durations().len(), 1);
}

#[tokio::test]
async fn test_schedule_then_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(&dir);
    w.handle
        .schedule(TaskInfo::one_off(SYNC_TASK, OneOffInfo::new(MINUTE)))
        .await
        .unwrap();
    w.handle.cancel(SYNC_TASK).await.unwrap();

    assert!(w.service.pending_jobs().is_empty());

    let cached = w.handle.cached_stats().await.unwrap();
    let count = |event: &str| {
        cached
            .iter()
            .filter(|e| e.event == event && e.value == SYNC_TASK as i32)
            .map(|e| e.count)
            .sum::<u32>()
    };
    assert_eq!(count(events::TASK_SCHEDULED_SUCCESS), 1);
    assert_eq!(count(events::TASK_CANCELED), 1);
}

#[tokio::test]
async fn test_cached_stats_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let w = world(&dir);
        w.handle.cancel(SYNC_TASK).await.unwrap();
        w.handle.cancel(SYNC_TASK).await.unwrap();
        w.handle.shutdown().await;
    }

    let w = world(&dir);
    let cached = w.handle.cached_stats().await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].count, 2);

    assert_eq!(w.handle.do_maintenance().await.unwrap(), 2);
    assert_eq!(
        w.sink.sparse_count(events::TASK_CANCELED, SYNC_TASK as i32),
        2
    );
    assert!(w.handle.cached_stats().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ignore_override_schedules_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let prefs = FilePrefs::open(dir.path().join("prefs.json")).unwrap();
    let config = SchedulerConfig {
        ignore_background_tasks: true,
        ..SchedulerConfig::default()
    };
    let w = world_with(config, prefs);

    assert!(
        w.handle
            .schedule(TaskInfo::one_off(SYNC_TASK, OneOffInfo::new(MINUTE)))
            .await
            .unwrap()
    );
    assert!(w.service.pending_jobs().is_empty());
    assert!(w.handle.cached_stats().await.unwrap().is_empty());
}
