use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One newline-framed request: `{"action": ..., "params": {...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One newline-framed response: `{"success": ..., "data"?: ..., "error"?: ...}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                error: None,
            },
            Err(e) => Self::err(format!("failed to encode response: {e}")),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitParams {
    pub command: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub gpu_ids: Option<Vec<u32>>,
    #[serde(default)]
    pub min_free_memory_gb: Option<f64>,
    #[serde(default)]
    pub max_util_percent: Option<f64>,
    #[serde(default)]
    pub gpu_count: Option<usize>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_status_filter")]
    pub status_filter: String,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            status_filter: default_status_filter(),
        }
    }
}

fn default_status_filter() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsParams {
    pub task_id: String,
    #[serde(default = "default_tail")]
    pub tail: usize,
    #[serde(default)]
    pub follow: bool,
}

fn default_tail() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupParams {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
}

impl Default for CleanupParams {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

fn default_max_age_days() -> i64 {
    7
}
