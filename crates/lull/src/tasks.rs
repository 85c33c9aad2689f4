//! Built-in demo tasks the CLI can dispatch.

use std::time::Duration;

use lull_scheduler::{
    BackgroundTask, ExtraValue, TaskContext, TaskFinishedCallback, TaskParameters, TaskRegistry,
};
use tracing::info;

/// Logs its extras and finishes after `duration_ms` (default 200ms).
pub const SLEEP_TASK_ID: u32 = 1;
/// Logs its extras and finishes inside `on_start`.
pub const ECHO_TASK_ID: u32 = 2;

const DEFAULT_SLEEP_MS: i64 = 200;

/// Registry of every task id the CLI knows how to run.
pub fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .register(SLEEP_TASK_ID, SleepTask::default)
        .register(ECHO_TASK_ID, || EchoTask)
}

#[derive(Default)]
pub struct SleepTask {
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl BackgroundTask for SleepTask {
    fn on_start(
        &mut self,
        context: &TaskContext,
        params: &TaskParameters,
        callback: TaskFinishedCallback,
    ) -> bool {
        let sleep_ms = params
            .extras
            .get("duration_ms")
            .and_then(ExtraValue::as_long)
            .unwrap_or(DEFAULT_SLEEP_MS)
            .max(0);
        let reschedule = matches!(params.extras.get("reschedule"), Some(ExtraValue::Bool(true)));

        info!(job_id = context.job_id, sleep_ms, "sleep task started");
        self.worker = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(sleep_ms as u64)).await;
            callback.task_finished(reschedule);
        }));
        true
    }

    fn on_stop(&mut self, context: &TaskContext, _params: &TaskParameters) -> bool {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        info!(job_id = context.job_id, "sleep task stopped");
        true
    }
}

pub struct EchoTask;

impl BackgroundTask for EchoTask {
    fn on_start(
        &mut self,
        context: &TaskContext,
        params: &TaskParameters,
        _callback: TaskFinishedCallback,
    ) -> bool {
        for (key, value) in &params.extras {
            info!(job_id = context.job_id, key = %key, value = ?value, "echo");
        }
        false
    }

    fn on_stop(&mut self, _context: &TaskContext, _params: &TaskParameters) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lull_scheduler::TaskFactory;

    #[test]
    fn test_registry_knows_demo_tasks() {
        let registry = registry();
        assert!(registry.contains(SLEEP_TASK_ID));
        assert!(registry.contains(ECHO_TASK_ID));
        assert!(registry.resolve(99).is_none());
    }
}
