use crate::core::task::{Task, TaskStatus};
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Queue statistics as reported by the `status` action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Durable task collection backed by `<data_dir>/tasks.json`.
///
/// Every mutation is read-modify-write under an exclusive advisory lock;
/// reads take the shared lock. The lock lives on a sidecar file because the
/// data file itself is replaced by rename on every write, which would leave
/// the lock attached to a dead inode.
pub struct TaskStore {
    tasks_file: PathBuf,
    lock_file: PathBuf,
}

impl TaskStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
        let store = Self {
            tasks_file: data_dir.join("tasks.json"),
            lock_file: data_dir.join("tasks.json.lock"),
        };
        if !store.tasks_file.exists() {
            store.mutate(|_| ())?;
        }
        Ok(store)
    }

    pub fn tasks_file(&self) -> &Path {
        &self.tasks_file
    }

    fn lock_handle(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_file)
            .with_context(|| format!("failed to open lock file {}", self.lock_file.display()))
    }

    /// Read the task array without taking a lock. A missing or malformed
    /// file is treated as an empty collection; the next write restores it.
    fn read_unlocked(&self) -> Vec<Task> {
        let bytes = match std::fs::read(&self.tasks_file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!("error reading {}: {e}", self.tasks_file.display());
                return Vec::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(
                    "malformed tasks file {}: {e}, treating as empty",
                    self.tasks_file.display()
                );
                Vec::new()
            }
        }
    }

    /// Write the task array via temp file + atomic rename. The caller must
    /// hold the exclusive lock.
    fn write_unlocked(&self, tasks: &[Task]) -> Result<()> {
        let dir = self
            .tasks_file
            .parent()
            .context("tasks file has no parent directory")?;
        let tmp_path = dir.join(format!("tasks.json.tmp.{}", std::process::id()));

        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        let data = serde_json::to_vec_pretty(tasks).context("failed to serialize tasks")?;
        tmp.write_all(&data)?;
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.tasks_file)
            .with_context(|| format!("failed to replace {}", self.tasks_file.display()))?;
        Ok(())
    }

    /// Run `f` over the task list under the exclusive lock, persisting the
    /// result. The lock is released when the handle drops.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Task>) -> T) -> Result<T> {
        let guard = self.lock_handle()?;
        guard.lock_exclusive().context("failed to lock tasks file")?;
        let mut tasks = self.read_unlocked();
        let out = f(&mut tasks);
        self.write_unlocked(&tasks)?;
        Ok(out)
    }

    /// Snapshot the task list under the shared lock.
    fn load(&self) -> Vec<Task> {
        let guard = match self.lock_handle() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("error loading tasks: {e:#}, returning empty list");
                return Vec::new();
            }
        };
        if let Err(e) = guard.lock_shared() {
            tracing::warn!("failed to lock tasks file: {e}, returning empty list");
            return Vec::new();
        }
        self.read_unlocked()
    }

    pub fn add(&self, task: Task) -> Result<String> {
        let id = task.id.clone();
        let name = task.name.clone();
        self.mutate(|tasks| tasks.push(task))?;
        tracing::info!("added task {id}: {name}");
        Ok(id)
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.load().into_iter().find(|t| t.id == task_id)
    }

    /// Replace the record with matching id; no-op if absent.
    pub fn update(&self, task: &Task) -> Result<()> {
        self.mutate(|tasks| {
            if let Some(slot) = tasks.iter_mut().find(|t| t.id == task.id) {
                *slot = task.clone();
            }
        })?;
        tracing::debug!("updated task {}", task.id);
        Ok(())
    }

    pub fn remove(&self, task_id: &str) -> Result<bool> {
        let removed = self.mutate(|tasks| {
            let before = tasks.len();
            tasks.retain(|t| t.id != task_id);
            tasks.len() < before
        })?;
        if removed {
            tracing::info!("removed task {task_id}");
        }
        Ok(removed)
    }

    pub fn all(&self) -> Vec<Task> {
        self.load()
    }

    /// Pending tasks in admission order: higher priority first, ties broken
    /// by older submission.
    pub fn pending(&self) -> Vec<Task> {
        let mut pending: Vec<Task> = self
            .load()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        pending
    }

    pub fn running(&self) -> Vec<Task> {
        self.by_status(TaskStatus::Running)
    }

    pub fn by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.load()
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    /// Cancel a task iff it is still pending. Running tasks go through the
    /// scheduler so the child gets signalled first.
    pub fn cancel_pending(&self, task_id: &str) -> Result<bool> {
        let cancelled = self.mutate(|tasks| {
            match tasks
                .iter_mut()
                .find(|t| t.id == task_id && t.status == TaskStatus::Pending)
            {
                Some(task) => {
                    task.status = TaskStatus::Cancelled;
                    task.finished_at = Some(Utc::now());
                    true
                }
                None => false,
            }
        })?;
        if cancelled {
            tracing::info!("cancelled task {task_id}");
        }
        Ok(cancelled)
    }

    pub fn statistics(&self) -> TaskStats {
        let tasks = self.load();
        let mut stats = TaskStats {
            total: tasks.len(),
            ..TaskStats::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Drop terminal records whose `finished_at` is older than the cutoff.
    /// Returns the number of removed records.
    pub fn cleanup_old(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let removed = self.mutate(|tasks| {
            let before = tasks.len();
            tasks.retain(|t| {
                !t.status.is_terminal() || t.finished_at.is_some_and(|at| at > cutoff)
            });
            before - tasks.len()
        })?;
        if removed > 0 {
            tracing::info!("cleaned up {removed} old task(s)");
        }
        Ok(removed)
    }
}
