use crate::config::Config;
use crate::core::gpu::{find_matching, GpuProbe, GpuStatus, NvmlProbe};
use crate::core::protocol::SubmitParams;
use crate::core::runner::TaskRunner;
use crate::core::store::{TaskStats, TaskStore};
use crate::core::task::{GpuRequirement, Task, TaskStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

pub type SharedState = Arc<RwLock<Scheduler>>;

/// Payload of the `status` action.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub uptime_seconds: f64,
    pub tasks: TaskStats,
    pub gpus: Vec<GpuStatus>,
    pub last_check: Option<DateTime<Utc>>,
    pub config: ScheduleConfigInfo,
}

#[derive(Debug, Serialize)]
pub struct ScheduleConfigInfo {
    pub check_interval: f64,
    pub max_concurrent_tasks: usize,
}

/// The reconciliation core: reaps finished children and admits pending tasks
/// against live GPU telemetry, persisting every transition through the store.
///
/// The scheduler is the only writer of status transitions; request handlers
/// reach it through `SharedState`, so a tick and a cancel serialize on the
/// write lock and observe each other's transitions atomically.
pub struct Scheduler {
    config: Config,
    probe: Box<dyn GpuProbe>,
    store: TaskStore,
    runner: TaskRunner,
    started_at: DateTime<Utc>,
    last_check: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_probe(config, Box::new(NvmlProbe::new()))
    }

    /// Build a scheduler around an injected probe. Tests use this with a mock
    /// instead of real NVML.
    pub fn with_probe(config: Config, probe: Box<dyn GpuProbe>) -> Result<Self> {
        let store = TaskStore::new(&config.data_dir())?;
        let runner = TaskRunner::new(config.logs_dir())?;
        Ok(Self {
            config,
            probe,
            store,
            runner,
            started_at: Utc::now(),
            last_check: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// One reconciliation pass: reap, then admit. Freed concurrency slots are
    /// visible to admission within the same tick.
    pub fn tick(&mut self) {
        self.reap_running();
        self.admit_pending();
        self.last_check = Some(Utc::now());
    }

    fn reap_running(&mut self) {
        for mut task in self.store.running() {
            let Some(code) = self.runner.check(&task) else {
                continue;
            };

            task.exit_code = Some(code);
            task.finished_at = Some(Utc::now());
            if code == 0 {
                task.status = TaskStatus::Completed;
                tracing::info!("task {} completed successfully", task.id);
            } else {
                task.status = TaskStatus::Failed;
                task.error_message = format!("Process exited with code {code}");
                tracing::warn!("task {} failed: {}", task.id, task.error_message);
            }
            if let Err(e) = self.store.update(&task) {
                tracing::error!("failed to persist task {}: {e:#}", task.id);
            }
        }
    }

    fn admit_pending(&mut self) {
        let max = self.config.max_concurrent_tasks;
        let mut running = self.store.running().len();
        if running >= max {
            tracing::debug!("max concurrent tasks reached, skipping admission");
            return;
        }

        let pending = self.store.pending();
        if pending.is_empty() {
            return;
        }
        tracing::debug!("{} pending task(s)", pending.len());

        for mut task in pending {
            if running >= max {
                break;
            }

            // Re-consult the probe for every candidate; an earlier admission
            // in this tick may have changed what is available.
            let gpus = self.probe.snapshot();
            let Some(assigned) = find_matching(&task.requirements, &gpus) else {
                tracing::debug!("no suitable GPUs for task {}", task.id);
                continue;
            };

            tracing::info!(
                "scheduling task {} ('{}') on GPUs {:?}",
                task.id,
                task.display_name(),
                assigned
            );
            let started = self.runner.start(&mut task, &assigned);
            // Both outcomes mutated the record (running, or failed with an
            // error message), so persist either way.
            if let Err(e) = self.store.update(&task) {
                tracing::error!("failed to persist task {}: {e:#}", task.id);
            }
            if started {
                running += 1;
            } else {
                tracing::error!("failed to start task {}", task.id);
            }
        }
    }

    /// Append a new pending task built from the submit parameters, filling
    /// unset requirements from the configured defaults.
    pub fn submit(&self, params: SubmitParams) -> Result<String> {
        let requirements = GpuRequirement {
            // An empty restriction list means "any device".
            gpu_ids: params.gpu_ids.filter(|ids| !ids.is_empty()),
            min_free_memory_gb: params
                .min_free_memory_gb
                .unwrap_or(self.config.default_min_memory_gb),
            max_util_percent: params
                .max_util_percent
                .unwrap_or(self.config.default_max_util_percent),
            gpu_count: params
                .gpu_count
                .unwrap_or(self.config.default_gpu_count)
                .max(1),
        };
        let task = Task {
            name: params.name,
            command: params.command,
            working_dir: params.working_dir,
            env: params.env,
            requirements,
            priority: params.priority,
            ..Task::default()
        };
        self.store.add(task)
    }

    /// Cancel a task. Returns `None` when the id is unknown, `Some(true)` on
    /// a pending→cancelled or running→cancelled transition, `Some(false)` for
    /// a task already terminal.
    ///
    /// A cancelled task stays cancelled: the reap phase only looks at tasks
    /// still marked running, so a later real exit code never reclassifies it.
    pub fn cancel(&mut self, task_id: &str) -> Option<bool> {
        let task = self.store.get(task_id)?;
        match task.status {
            TaskStatus::Running => {
                self.runner.kill(&task);
                let mut task = task;
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(Utc::now());
                if let Err(e) = self.store.update(&task) {
                    tracing::error!("failed to persist task {}: {e:#}", task.id);
                    return Some(false);
                }
                tracing::info!("cancelled running task {}", task.id);
                Some(true)
            }
            TaskStatus::Pending => Some(self.store.cancel_pending(task_id).unwrap_or_else(|e| {
                tracing::error!("failed to cancel task {task_id}: {e:#}");
                false
            })),
            _ => Some(false),
        }
    }

    pub fn logs(&self, task_id: &str, tail: usize) -> String {
        match self.store.get(task_id) {
            Some(task) => self.runner.log_content(&task, tail),
            None => "Task not found".to_string(),
        }
    }

    pub fn list(&self, status_filter: Option<TaskStatus>) -> Vec<Task> {
        match status_filter {
            Some(status) => self.store.by_status(status),
            None => self.store.all(),
        }
    }

    pub fn status(&mut self) -> StatusReport {
        StatusReport {
            running: true,
            uptime_seconds: (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0,
            tasks: self.store.statistics(),
            gpus: self.probe.snapshot(),
            last_check: self.last_check,
            config: ScheduleConfigInfo {
                check_interval: self.config.check_interval,
                max_concurrent_tasks: self.config.max_concurrent_tasks,
            },
        }
    }

    pub fn cleanup_old_tasks(&self, max_age_days: i64) -> Result<usize> {
        self.store.cleanup_old(max_age_days)
    }

    /// Terminate every tracked child. Called once at daemon shutdown.
    pub fn shutdown(&mut self) {
        self.runner.cleanup();
    }
}

/// Scheduler loop: tick every `check_interval` seconds until shutdown flips,
/// then terminate the tracked children.
pub async fn run(state: SharedState, mut shutdown: watch::Receiver<bool>) {
    let period = {
        let scheduler = state.read().await;
        Duration::from_secs_f64(scheduler.config().check_interval.max(0.1))
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let mut scheduler = state.write().await;
        scheduler.tick();
    }

    let mut scheduler = state.write().await;
    scheduler.shutdown();
    tracing::info!("scheduler stopped");
}
