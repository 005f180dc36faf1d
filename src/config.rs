use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration, loaded from `<base_dir>/config.yaml`.
///
/// Every key is optional in the file; missing keys fall back to the defaults
/// below. The derived paths (`data_dir`, `logs_dir`, `socket_path`) default
/// to locations under `base_dir` when not set explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,

    /// Scheduler tick period in seconds.
    pub check_interval: f64,
    pub max_concurrent_tasks: usize,

    pub log_level: String,
    pub log_max_size_mb: u64,
    pub log_backup_count: u32,

    /// Defaults applied to submissions that leave requirements unset.
    pub default_gpu_count: usize,
    pub default_min_memory_gb: f64,
    pub default_max_util_percent: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            data_dir: None,
            logs_dir: None,
            socket_path: None,
            check_interval: 10.0,
            max_concurrent_tasks: 4,
            log_level: "info".to_string(),
            log_max_size_mb: 10,
            log_backup_count: 5,
            default_gpu_count: 1,
            default_min_memory_gb: 0.0,
            default_max_util_percent: 100.0,
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".gpu-grab"))
        .unwrap_or_else(|| PathBuf::from(".gpu-grab"))
}

impl Config {
    /// Load configuration from `config_path`, or from the default
    /// `<base_dir>/config.yaml` when no path is given. A missing file yields
    /// the default configuration.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let default_path;
        let path = match config_path {
            Some(path) => path,
            None => {
                default_path = default_base_dir().join("config.yaml");
                &default_path
            }
        };

        if !path.exists() {
            if config_path.is_some() {
                tracing::warn!("config file {} not found, using defaults", path.display());
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Persist the tunable keys to `config_path`, or to the default
    /// `<base_dir>/config.yaml`. Path keys are not written; they stay
    /// derived from `base_dir` on the next load.
    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let default_path;
        let path = match config_path {
            Some(path) => path,
            None => {
                default_path = self.base_dir.join("config.yaml");
                &default_path
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let data = serde_yaml::to_string(&TunableConfig {
            check_interval: self.check_interval,
            max_concurrent_tasks: self.max_concurrent_tasks,
            log_level: &self.log_level,
            log_max_size_mb: self.log_max_size_mb,
            log_backup_count: self.log_backup_count,
            default_gpu_count: self.default_gpu_count,
            default_min_memory_gb: self.default_min_memory_gb,
            default_max_util_percent: self.default_max_util_percent,
        })
        .context("failed to serialize config")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("data"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("logs"))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("gpu-grab.sock"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.base_dir, &self.data_dir(), &self.logs_dir()] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// The subset of keys `save` writes back to disk.
#[derive(Serialize)]
struct TunableConfig<'a> {
    check_interval: f64,
    max_concurrent_tasks: usize,
    log_level: &'a str,
    log_max_size_mb: u64,
    log_backup_count: u32,
    default_gpu_count: usize,
    default_min_memory_gb: f64,
    default_max_util_percent: f64,
}
