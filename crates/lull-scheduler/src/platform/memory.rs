//! In-process job service.
//!
//! Keeps pending jobs in memory and records what the scheduler asked of it.
//! The pending set can be snapshotted to a JSON file, which the CLI uses as a
//! stand-in for an OS job scheduler that persists across runs.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{JobParams, JobService};
use crate::{PlatformError, SchedulerError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    pending: BTreeMap<u32, JobParams>,
}

#[derive(Debug, Default)]
struct State {
    pending: BTreeMap<u32, JobParams>,
    finished: Vec<(u32, bool)>,
    cancelled: Vec<u32>,
    unavailable: bool,
}

/// Job service backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryJobService {
    state: Mutex<State>,
    user_initiated: bool,
}

impl InMemoryJobService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise support for user-initiated jobs.
    pub fn with_user_initiated(mut self, supported: bool) -> Self {
        self.user_initiated = supported;
        self
    }

    /// Load pending jobs from a snapshot file. A missing file means no jobs.
    pub fn load(path: &Path) -> Result<Self, SchedulerError> {
        let service = Self::new();
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            debug!(count = snapshot.pending.len(), "loaded pending jobs");
            service.state().pending = snapshot.pending;
        }
        Ok(service)
    }

    /// Write pending jobs to a snapshot file.
    pub fn save(&self, path: &Path) -> Result<(), SchedulerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let snapshot = Snapshot {
            version: 1,
            pending: self.state().pending.clone(),
        };
        let content = serde_json::to_string_pretty(&snapshot)?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Make every subsequent call fail as if the service were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn pending_jobs(&self) -> Vec<JobParams> {
        self.state().pending.values().cloned().collect()
    }

    /// Every `job_finished` call received, in order.
    pub fn finished_calls(&self) -> Vec<(u32, bool)> {
        self.state().finished.clone()
    }

    /// Every successful `cancel` call received, in order.
    pub fn cancelled(&self) -> Vec<u32> {
        self.state().cancelled.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(state: &State) -> Result<(), PlatformError> {
        if state.unavailable {
            return Err(PlatformError::Unavailable(
                "in-memory job service disabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl JobService for InMemoryJobService {
    fn schedule(&self, job: JobParams) -> Result<(), PlatformError> {
        let mut state = self.state();
        Self::check_available(&state)?;

        if job.user_initiated && !self.user_initiated {
            return Err(PlatformError::Rejected(format!(
                "job {} is user-initiated but the capability is missing",
                job.job_id
            )));
        }

        debug!(job_id = job.job_id, "job registered");
        state.pending.insert(job.job_id, job);
        Ok(())
    }

    fn cancel(&self, job_id: u32) -> Result<(), PlatformError> {
        let mut state = self.state();
        Self::check_available(&state)?;
        state.pending.remove(&job_id);
        state.cancelled.push(job_id);
        Ok(())
    }

    fn pending_job(&self, job_id: u32) -> Result<Option<JobParams>, PlatformError> {
        let state = self.state();
        Self::check_available(&state)?;
        Ok(state.pending.get(&job_id).cloned())
    }

    fn job_finished(&self, job_id: u32, needs_reschedule: bool) {
        let mut state = self.state();
        state.finished.push((job_id, needs_reschedule));

        // One-off jobs are consumed unless the task asked to run again.
        let one_off = state
            .pending
            .get(&job_id)
            .is_some_and(|job| job.periodic.is_none());
        if one_off && !needs_reschedule {
            state.pending.remove(&job_id);
        }
    }

    fn supports_user_initiated(&self) -> bool {
        self.user_initiated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PeriodicParams;
    use crate::{Extras, NetworkType};
    use tempfile::tempdir;

    fn job(job_id: u32, periodic: bool) -> JobParams {
        JobParams {
            job_id,
            min_latency_ms: None,
            override_deadline_ms: (!periodic).then_some(60_000),
            periodic: periodic.then_some(PeriodicParams {
                interval_ms: 900_000,
                flex_ms: 300_000,
            }),
            network: NetworkType::None,
            requires_charging: false,
            persisted: true,
            user_initiated: false,
            extras: Extras::new(),
        }
    }

    #[test]
    fn test_schedule_and_cancel() {
        let service = InMemoryJobService::new();
        service.schedule(job(1, false)).unwrap();
        assert_eq!(service.pending_jobs().len(), 1);

        service.cancel(1).unwrap();
        assert!(service.pending_jobs().is_empty());
        assert_eq!(service.cancelled(), vec![1]);
    }

    #[test]
    fn test_job_finished_consumes_one_off_only() {
        let service = InMemoryJobService::new();
        service.schedule(job(1, false)).unwrap();
        service.schedule(job(2, true)).unwrap();
        service.schedule(job(3, false)).unwrap();

        service.job_finished(1, false);
        service.job_finished(2, false);
        service.job_finished(3, true);

        let ids: Vec<u32> = service.pending_jobs().iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(service.finished_calls(), vec![(1, false), (2, false), (3, true)]);
    }

    #[test]
    fn test_unavailable_service_fails() {
        let service = InMemoryJobService::new();
        service.set_unavailable(true);

        assert!(matches!(
            service.schedule(job(1, false)),
            Err(PlatformError::Unavailable(_))
        ));
        assert!(service.cancel(1).is_err());
        assert!(service.pending_job(1).is_err());
    }

    #[test]
    fn test_user_initiated_rejected_without_capability() {
        let mut user_job = job(1, false);
        user_job.user_initiated = true;

        assert!(matches!(
            InMemoryJobService::new().schedule(user_job.clone()),
            Err(PlatformError::Rejected(_))
        ));
        assert!(
            InMemoryJobService::new()
                .with_user_initiated(true)
                .schedule(user_job)
                .is_ok()
        );
    }

    #[test]
    fn test_snapshot_persists_pending_jobs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let service = InMemoryJobService::new();
        service.schedule(job(1, false)).unwrap();
        service.schedule(job(2, true)).unwrap();
        service.save(&path).unwrap();

        let restored = InMemoryJobService::load(&path).unwrap();
        assert_eq!(restored.pending_jobs(), service.pending_jobs());
        assert!(restored.finished_calls().is_empty());
    }

    #[test]
    fn test_load_missing_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        let service = InMemoryJobService::load(&dir.path().join("absent.json")).unwrap();
        assert!(service.pending_jobs().is_empty());
    }
}
