//! One CLI invocation's view of the scheduler.
//!
//! Pending platform jobs live in `jobs.json` and cached metrics in
//! `prefs.json` under the state directory. A session loads both, runs the
//! coordinator for the duration of the command, and writes the jobs back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::Result;
use tokio::task::JoinHandle;
use tracing::debug;

use lull_scheduler::platform::{InMemoryJobService, JobService, JobServiceDelegate};
use lull_scheduler::{
    BackgroundTaskScheduler, FilePrefs, JobLifecycle, MetricsCache, SchedulerConfig,
    SchedulerCoordinator, SchedulerHandle, SystemClock, TaskMetrics, TracingSink,
};

use crate::tasks;

const JOBS_FILE: &str = "jobs.json";
const PREFS_FILE: &str = "prefs.json";

pub struct Session {
    handle: SchedulerHandle,
    service: Arc<InMemoryJobService>,
    jobs_path: PathBuf,
    coordinator: JoinHandle<()>,
}

impl Session {
    pub fn open(state_dir: &Path, config: SchedulerConfig) -> Result<Self> {
        let jobs_path = state_dir.join(JOBS_FILE);
        let service = Arc::new(
            InMemoryJobService::load(&jobs_path)
                .map_err(|e| miette::miette!("failed to load {}: {}", jobs_path.display(), e))?
                .with_user_initiated(true),
        );

        let prefs_path = state_dir.join(PREFS_FILE);
        let prefs = FilePrefs::open(&prefs_path)
            .map_err(|e| miette::miette!("failed to load {}: {}", prefs_path.display(), e))?;

        let clock = Arc::new(SystemClock);
        let delegate = JobServiceDelegate::new(service.clone(), clock.clone(), config.timing);
        let metrics = TaskMetrics::new(MetricsCache::new(prefs), Arc::new(TracingSink));
        let (lifecycle, finished_rx) = JobLifecycle::new(
            Box::new(tasks::registry()),
            service.clone(),
            clock,
            config.timing,
        );
        let scheduler = BackgroundTaskScheduler::new(Box::new(delegate), metrics, config);

        let (coordinator, handle) = SchedulerCoordinator::new(scheduler, lifecycle, finished_rx);
        let coordinator = tokio::spawn(coordinator.run());

        debug!(state_dir = %state_dir.display(), "session opened");
        Ok(Self {
            handle,
            service,
            jobs_path,
            coordinator,
        })
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    pub fn service(&self) -> &InMemoryJobService {
        &self.service
    }

    /// Deliver pending job `job_id` as the platform would.
    ///
    /// Returns whether the job keeps running. A job that doesn't is done as far
    /// as the job service is concerned, so a one-off is retired from the
    /// pending set while a periodic job stays for its next interval.
    pub async fn start_job(&self, job_id: u32) -> Result<bool> {
        let job = self
            .service
            .pending_jobs()
            .into_iter()
            .find(|job| job.job_id == job_id)
            .ok_or_else(|| miette::miette!("no pending job {}", job_id))?;

        let running = self
            .handle
            .start_job(job)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        if !running {
            debug!(job_id, "job not kept running, reporting it done");
            self.service.job_finished(job_id, false);
        }
        Ok(running)
    }

    /// Stop the coordinator and persist pending jobs.
    pub async fn close(self) -> Result<()> {
        self.handle.shutdown().await;
        self.coordinator
            .await
            .map_err(|e| miette::miette!("scheduler coordinator failed: {}", e))?;

        self.service
            .save(&self.jobs_path)
            .map_err(|e| miette::miette!("failed to save {}: {}", self.jobs_path.display(), e))
    }
}
