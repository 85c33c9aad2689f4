//! Background task scheduling core for lull.
//!
//! This crate provides the pieces that sit between callers describing deferred
//! work and a platform job service that actually runs it:
//! - Task descriptors for one-off windows and periodic intervals
//! - A scheduling facade that drives a pluggable platform delegate
//! - Declarative expiration checks evaluated at dispatch time
//! - A job lifecycle manager guarding start/stop/completion races
//! - A persisted metrics cache that survives restarts until it is flushed
//!
//! All state transitions run on one [`SchedulerCoordinator`] actor; callers
//! talk to it through a cloneable [`SchedulerHandle`].

mod cache;
mod clock;
mod config;
mod coordinator;
mod error;
mod expiration;
mod lifecycle;
mod metrics;
pub mod platform;
mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod types;

pub use cache::{CachedUmaEntry, FilePrefs, MemoryPrefs, MetricsCache, PrefsStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SchedulerConfig, TimingPolicy, parse_bool_env};
pub use coordinator::{SchedulerCoordinator, SchedulerHandle};
pub use error::{PlatformError, SchedulerError};
pub use expiration::{ExpirationContext, is_expired};
pub use lifecycle::{
    BackgroundTask, FinishedSignal, JobLifecycle, TaskContext, TaskFactory, TaskFinishedCallback,
    TaskRegistry,
};
pub use metrics::{MetricsSink, TaskMetrics, TracingSink, events};
pub use scheduler::BackgroundTaskScheduler;
pub use types::{
    ExtraValue, Extras, NetworkType, OneOffInfo, PeriodicInfo, TaskInfo, TaskParameters,
    TimingInfo,
};
