//! Lull: background task scheduler CLI
//!
//! Drives the scheduling core against a file-backed job service:
//! - `schedule-once` / `schedule-periodic` / `cancel`: manage pending jobs
//! - `pending`: list what the job service holds
//! - `dispatch`: deliver a platform start (and optionally stop) signal
//! - `stats` / `flush` / `reset-stats`: inspect the deferred metrics cache

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lull_scheduler::{
    ExtraValue, NetworkType, OneOffInfo, PeriodicInfo, SchedulerConfig, TaskInfo, parse_bool_env,
};

mod session;
mod tasks;

use session::Session;

#[derive(Parser)]
#[command(name = "lull")]
#[command(about = "Background task scheduler", long_about = None)]
struct Cli {
    /// Directory holding pending jobs and cached metrics
    #[arg(long, env = "LULL_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Report success for every schedule call without scheduling anything.
    /// Overrides LULL_IGNORE_BACKGROUND_TASKS when given.
    #[arg(long, value_parser = parse_bool_env, global = true)]
    ignore_background_tasks: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule a task to run once inside a time window
    ScheduleOnce {
        task_id: u32,

        /// Earliest start, relative to now
        #[arg(long)]
        window_start_ms: Option<i64>,

        /// Latest start, relative to now
        #[arg(long)]
        window_end_ms: i64,

        #[command(flatten)]
        options: TaskOptions,
    },

    /// Schedule a task to repeat
    SchedulePeriodic {
        task_id: u32,

        #[arg(long)]
        interval_ms: i64,

        /// Window at the end of each interval in which the task may run
        #[arg(long)]
        flex_ms: Option<i64>,

        #[command(flatten)]
        options: TaskOptions,
    },

    /// Cancel a pending task
    Cancel { task_id: u32 },

    /// List pending jobs
    Pending,

    /// Deliver a start signal for a pending job and wait for it to finish
    Dispatch {
        job_id: u32,

        /// Deliver a stop signal after this many milliseconds instead of waiting
        #[arg(long)]
        stop_after_ms: Option<u64>,

        /// Give up waiting for completion after this many milliseconds
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,
    },

    /// Show cached metrics
    Stats,

    /// Replay cached metrics into the log and clear them
    Flush,

    /// Drop cached metrics without replaying them
    ResetStats,
}

#[derive(Args)]
struct TaskOptions {
    /// Skip the run if it is delivered after its window
    #[arg(long)]
    expires: bool,

    #[arg(long, value_enum, default_value = "none")]
    network: NetworkArg,

    #[arg(long)]
    requires_charging: bool,

    /// Keep the job across restarts of the job service
    #[arg(long)]
    persisted: bool,

    /// Replace a pending job with the same id
    #[arg(long)]
    update_current: bool,

    #[arg(long)]
    user_initiated: bool,

    /// Extra passed to the task, as key=value (repeatable)
    #[arg(long = "extra", value_parser = parse_extra)]
    extras: Vec<(String, ExtraValue)>,
}

impl TaskOptions {
    fn apply(self, task: TaskInfo) -> TaskInfo {
        self.extras.into_iter().fold(
            task.network(self.network.into())
                .requires_charging(self.requires_charging)
                .persisted(self.persisted)
                .update_current(self.update_current)
                .user_initiated(self.user_initiated),
            |task, (key, value)| task.extra(key, value),
        )
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum NetworkArg {
    None,
    Any,
    Unmetered,
    NotRoaming,
    Cellular,
}

impl From<NetworkArg> for NetworkType {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::None => NetworkType::None,
            NetworkArg::Any => NetworkType::Any,
            NetworkArg::Unmetered => NetworkType::Unmetered,
            NetworkArg::NotRoaming => NetworkType::NotRoaming,
            NetworkArg::Cellular => NetworkType::Cellular,
        }
    }
}

/// Parse a `key=value` extra. Values that look like integers, floats or
/// booleans keep that type; everything else is a string.
fn parse_extra(s: &str) -> Result<(String, ExtraValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid extra '{}', expected key=value", s))?;
    if key.is_empty() {
        return Err(format!("invalid extra '{}', key is empty", s));
    }

    let value = if let Ok(long) = value.parse::<i64>() {
        ExtraValue::Long(long)
    } else if let Ok(double) = value.parse::<f64>() {
        ExtraValue::Double(double)
    } else if let Ok(flag) = value.parse::<bool>() {
        ExtraValue::Bool(flag)
    } else {
        ExtraValue::String(value.to_string())
    };
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "lull=info,lull_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = SchedulerConfig::from_env().map_err(|e| miette::miette!("{}", e))?;
    if let Some(ignore) = cli.ignore_background_tasks {
        config.ignore_background_tasks = ignore;
    }

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .map(|dir| dir.join("lull"))
            .ok_or_else(|| miette::miette!("no data directory available, pass --state-dir"))?,
    };

    let session = Session::open(&state_dir, config)?;
    let result = run(&session, cli.command).await;
    session.close().await?;
    result
}

async fn run(session: &Session, command: Commands) -> Result<()> {
    let handle = session.handle();

    match command {
        Commands::ScheduleOnce {
            task_id,
            window_start_ms,
            window_end_ms,
            options,
        } => {
            let mut timing = OneOffInfo::new(window_end_ms).expires_after_window_end(options.expires);
            if let Some(start) = window_start_ms {
                timing = timing.window_start(start);
            }
            let task = options.apply(TaskInfo::one_off(task_id, timing));
            schedule(session, task).await
        }

        Commands::SchedulePeriodic {
            task_id,
            interval_ms,
            flex_ms,
            options,
        } => {
            let mut timing = PeriodicInfo::new(interval_ms).expires_after_window_end(options.expires);
            if let Some(flex) = flex_ms {
                timing = timing.flex(flex);
            }
            let task = options.apply(TaskInfo::periodic(task_id, timing));
            schedule(session, task).await
        }

        Commands::Cancel { task_id } => {
            handle
                .cancel(task_id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("cancelled {}", task_id);
            Ok(())
        }

        Commands::Pending => {
            let jobs = session.service().pending_jobs();
            if jobs.is_empty() {
                println!("no pending jobs");
            }
            for job in jobs {
                let kind = match job.periodic {
                    Some(periodic) => format!(
                        "periodic interval={}ms flex={}ms",
                        periodic.interval_ms, periodic.flex_ms
                    ),
                    None => format!(
                        "one-off latency={}ms deadline={}ms",
                        job.min_latency_ms.unwrap_or(0),
                        job.override_deadline_ms.unwrap_or(0)
                    ),
                };
                println!("{}\t{}\tnetwork={:?}", job.job_id, kind, job.network);
            }
            Ok(())
        }

        Commands::Dispatch {
            job_id,
            stop_after_ms,
            timeout_ms,
        } => dispatch(session, job_id, stop_after_ms, timeout_ms).await,

        Commands::Stats => {
            let entries = handle
                .cached_stats()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            if entries.is_empty() {
                println!("no cached metrics");
            }
            for entry in entries {
                println!("{}\t{}\t{}", entry.event, entry.value, entry.count);
            }
            Ok(())
        }

        Commands::Flush => {
            let recorded = handle
                .do_maintenance()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("flushed {} samples", recorded);
            Ok(())
        }

        Commands::ResetStats => {
            handle
                .remove_cached_stats()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("cached metrics cleared");
            Ok(())
        }
    }
}

async fn schedule(session: &Session, task: TaskInfo) -> Result<()> {
    let task_id = task.task_id;
    let accepted = session
        .handle()
        .schedule(task)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    if !accepted {
        return Err(miette::miette!("task {} was not scheduled", task_id));
    }
    println!("scheduled {}", task_id);
    Ok(())
}

async fn dispatch(
    session: &Session,
    job_id: u32,
    stop_after_ms: Option<u64>,
    timeout_ms: u64,
) -> Result<()> {
    let handle = session.handle();
    if !session.start_job(job_id).await? {
        println!("job {} did not keep running", job_id);
        return Ok(());
    }

    if let Some(delay) = stop_after_ms {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let reschedule = handle
            .stop_job(job_id)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        println!("stopped {} (reschedule={})", job_id, reschedule);
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let running = handle
            .running_jobs()
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        if !running.contains(&job_id) {
            info!(job_id, "job finished");
            println!("finished {}", job_id);
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(job_id, "timed out waiting for job, stopping it");
            handle
                .stop_job(job_id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            return Err(miette::miette!("job {} did not finish in {}ms", job_id, timeout_ms));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
