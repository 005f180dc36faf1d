use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumIter, EnumString};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TaskStatus {
    /// Waiting to be scheduled
    Pending,
    /// Currently running
    Running,
    /// Finished successfully
    Completed,
    /// Execution failed
    Failed,
    /// Cancelled by user
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        // pending → running → completed
        //    │         ├──> failed
        //    │         └──> cancelled
        //    ├──> failed (spawn error)
        //    └──> cancelled
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// GPU resource requirements attached to a task at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuRequirement {
    /// Restrict matching to these device indices (None = any device).
    pub gpu_ids: Option<Vec<u32>>,
    /// Minimum free memory per device, in GB.
    pub min_free_memory_gb: f64,
    /// Maximum allowed utilization per device, in percent.
    pub max_util_percent: f64,
    /// Number of devices that must match simultaneously.
    pub gpu_count: usize,
}

impl Default for GpuRequirement {
    fn default() -> Self {
        Self {
            gpu_ids: None,
            min_free_memory_gb: 0.0,
            max_util_percent: 100.0,
            gpu_count: 1,
        }
    }
}

/// A user-submitted shell command tracked through the scheduler.
///
/// Fields up to `priority` are fixed at submission; the rest are managed by
/// the scheduler and runner. The record is persisted as one entry of the
/// JSON array in `tasks.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub command: String,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub requirements: GpuRequirement,

    pub status: TaskStatus,
    /// Higher value = earlier admission.
    pub priority: i32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Device indices chosen at admission, in assignment order.
    pub assigned_gpus: Vec<u32>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub error_message: String,
    pub log_file: String,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: super::short_task_id(),
            name: String::new(),
            command: String::new(),
            working_dir: String::new(),
            env: HashMap::new(),
            requirements: GpuRequirement::default(),
            status: TaskStatus::Pending,
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            assigned_gpus: Vec::new(),
            pid: None,
            exit_code: None,
            error_message: String::new(),
            log_file: String::new(),
        }
    }
}

impl Task {
    /// Display name: the user-supplied name, or the id when unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}
