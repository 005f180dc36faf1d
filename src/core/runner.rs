use crate::core::task::{Task, TaskStatus};
use crate::utils::tail_lines;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Owns the lifecycle of spawned task processes: the in-memory process table,
/// per-task log files, and process-group signalling.
///
/// The process table is authoritative for "can we wait on this child?"; after
/// a daemon restart it is empty and liveness falls back to probing the
/// persisted pid with signal 0.
pub struct TaskRunner {
    logs_dir: PathBuf,
    processes: HashMap<String, Child>,
}

impl TaskRunner {
    pub fn new(logs_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;
        Ok(Self {
            logs_dir,
            processes: HashMap::new(),
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.processes.len()
    }

    /// Spawn `task.command` pinned to `gpu_ids` and record the outcome on the
    /// task. Returns whether the spawn succeeded; the caller persists the
    /// mutated record either way.
    pub fn start(&mut self, task: &mut Task, gpu_ids: &[u32]) -> bool {
        match self.spawn(task, gpu_ids) {
            Ok(child) => {
                task.pid = child.id();
                task.assigned_gpus = gpu_ids.to_vec();
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                tracing::info!(
                    "started task {} (pid: {:?}) on GPUs {:?}",
                    task.id,
                    task.pid,
                    gpu_ids
                );
                self.processes.insert(task.id.clone(), child);
                true
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.error_message = format!("{e:#}");
                task.finished_at = Some(Utc::now());
                tracing::error!("failed to start task {}: {e:#}", task.id);
                false
            }
        }
    }

    fn spawn(&self, task: &mut Task, gpu_ids: &[u32]) -> Result<Child> {
        let log_path = self.logs_dir.join(format!("task_{}.log", task.id));
        task.log_file = log_path.display().to_string();

        let mut log = std::fs::File::create(&log_path)
            .with_context(|| format!("failed to create log file {}", log_path.display()))?;
        write_log_header(&mut log, task, gpu_ids)
            .with_context(|| format!("failed to write log header {}", log_path.display()))?;

        let devices = gpu_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&task.command)
            .envs(&task.env)
            .env("CUDA_VISIBLE_DEVICES", &devices)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        if !task.working_dir.is_empty() {
            cmd.current_dir(&task.working_dir);
        }
        // New session so a group-wide SIGTERM reaches descendants without
        // touching the daemon.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        cmd.spawn()
            .with_context(|| format!("failed to spawn `{}`", task.command))
    }

    /// Check whether the task's child has exited.
    ///
    /// Returns `None` while the child is alive, and the exit code once it is
    /// gone. An untracked pid (daemon restarted) that no longer exists is
    /// reported as `-1`; a child killed by signal N as `-N`.
    pub fn check(&mut self, task: &Task) -> Option<i32> {
        if let Some(child) = self.processes.get_mut(&task.id) {
            return match child.try_wait() {
                Ok(Some(status)) => {
                    let code = exit_code(status);
                    self.processes.remove(&task.id);
                    tracing::debug!("task {} exited with code {code}", task.id);
                    Some(code)
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("error polling task {}: {e}", task.id);
                    self.processes.remove(&task.id);
                    Some(-1)
                }
            };
        }

        // No handle for this task; probe the persisted pid.
        match task.pid {
            Some(pid) if process_alive(pid) => None,
            Some(pid) => {
                tracing::debug!("task {} process {pid} no longer exists", task.id);
                Some(-1)
            }
            None => Some(-1),
        }
    }

    /// SIGTERM the task's process group. Does not wait for the child; the
    /// next `check` observes the termination.
    pub fn kill(&mut self, task: &Task) -> bool {
        let pid = match self.processes.remove(&task.id) {
            Some(child) => child.id().or(task.pid),
            None => task.pid,
        };
        let Some(pid) = pid else {
            tracing::warn!("cannot kill task {}: no pid recorded", task.id);
            return false;
        };

        match terminate_group(pid) {
            Ok(()) => {
                tracing::info!("killed task {} (pid: {pid})", task.id);
                true
            }
            Err(e) => {
                tracing::warn!("could not kill task {}: {e}", task.id);
                false
            }
        }
    }

    /// Read the task's accumulated log, trimmed to the last `tail` lines when
    /// `tail > 0`.
    pub fn log_content(&self, task: &Task, tail: usize) -> String {
        if task.log_file.is_empty() {
            return "No log file available".to_string();
        }
        let path = Path::new(&task.log_file);
        if !path.exists() {
            return "Log file not found".to_string();
        }
        match std::fs::read_to_string(path) {
            Ok(content) if tail > 0 => tail_lines(&content, tail),
            Ok(content) => content,
            Err(e) => format!("Error reading log: {e}"),
        }
    }

    /// SIGTERM every tracked process group and clear the table. Used at
    /// daemon shutdown; exit statuses are not collected.
    pub fn cleanup(&mut self) {
        for (task_id, child) in self.processes.drain() {
            let Some(pid) = child.id() else { continue };
            match terminate_group(pid) {
                Ok(()) => tracing::info!("terminated process for task {task_id}"),
                Err(e) => tracing::warn!("error terminating task {task_id}: {e}"),
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// SIGTERM the process group led by `pid` (the child called setsid, so pid ==
/// pgid unless the group leader already changed). ESRCH means the group is
/// already gone and counts as success.
fn terminate_group(pid: u32) -> std::io::Result<()> {
    let pid = pid as libc::pid_t;
    unsafe {
        let pgid = libc::getpgid(pid);
        let target = if pgid > 0 { pgid } else { pid };
        if libc::killpg(target, libc::SIGTERM) == 0 {
            return Ok(());
        }
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

fn write_log_header(log: &mut std::fs::File, task: &Task, gpu_ids: &[u32]) -> std::io::Result<()> {
    let working_dir = if task.working_dir.is_empty() {
        std::env::current_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_default()
    } else {
        task.working_dir.clone()
    };
    writeln!(log, "=== Task: {} ===", task.display_name())?;
    writeln!(log, "Command: {}", task.command)?;
    writeln!(log, "Working dir: {working_dir}")?;
    writeln!(log, "GPUs: {gpu_ids:?}")?;
    writeln!(log, "Started: {}", Utc::now().to_rfc3339())?;
    writeln!(log, "{}", "=".repeat(50))?;
    writeln!(log)?;
    log.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_runner() -> (TaskRunner, TempDir) {
        let temp = TempDir::new().unwrap();
        let runner = TaskRunner::new(temp.path().to_path_buf()).unwrap();
        (runner, temp)
    }

    fn task_for(command: &str) -> Task {
        Task {
            name: "test".to_string(),
            command: command.to_string(),
            ..Task::default()
        }
    }

    async fn wait_for_exit(runner: &mut TaskRunner, task: &Task) -> i32 {
        for _ in 0..500 {
            if let Some(code) = runner.check(task) {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not exit in time", task.id);
    }

    #[tokio::test]
    async fn test_start_records_runtime_fields() {
        let (mut runner, _temp) = create_test_runner();
        let mut task = task_for("true");

        assert!(runner.start(&mut task, &[0]));
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.pid.is_some());
        assert!(task.started_at.is_some());
        assert_eq!(task.assigned_gpus, vec![0]);
        assert!(task.log_file.ends_with(&format!("task_{}.log", task.id)));

        assert_eq!(wait_for_exit(&mut runner, &task).await, 0);
        assert_eq!(runner.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_child_sees_cuda_visible_devices() {
        let (mut runner, _temp) = create_test_runner();
        let mut task = task_for("echo gpus=$CUDA_VISIBLE_DEVICES");
        task.env
            .insert("CUDA_VISIBLE_DEVICES".to_string(), "9".to_string());

        assert!(runner.start(&mut task, &[1, 3]));
        wait_for_exit(&mut runner, &task).await;

        // The admission pin overrides anything in the task env.
        let content = std::fs::read_to_string(&task.log_file).unwrap();
        assert!(content.contains("gpus=1,3"), "log was: {content}");
    }

    #[tokio::test]
    async fn test_task_env_overrides_inherited() {
        let (mut runner, _temp) = create_test_runner();
        std::env::set_var("GPU_GRAB_TEST_MARKER", "inherited");
        let mut task = task_for("echo marker=$GPU_GRAB_TEST_MARKER");
        task.env
            .insert("GPU_GRAB_TEST_MARKER".to_string(), "override".to_string());

        assert!(runner.start(&mut task, &[0]));
        wait_for_exit(&mut runner, &task).await;

        let content = std::fs::read_to_string(&task.log_file).unwrap();
        assert!(content.contains("marker=override"), "log was: {content}");
    }

    #[tokio::test]
    async fn test_log_header_and_merged_streams() {
        let (mut runner, _temp) = create_test_runner();
        let mut task = task_for("echo out; echo err >&2");
        task.name = "header-check".to_string();

        assert!(runner.start(&mut task, &[0]));
        wait_for_exit(&mut runner, &task).await;

        let content = std::fs::read_to_string(&task.log_file).unwrap();
        assert!(content.starts_with("=== Task: header-check ===\n"));
        assert!(content.contains(&"=".repeat(50)));
        assert!(content.contains("out\n"));
        assert!(content.contains("err\n"));
    }

    #[tokio::test]
    async fn test_failed_command_exit_code() {
        let (mut runner, _temp) = create_test_runner();
        let mut task = task_for("exit 3");

        assert!(runner.start(&mut task, &[0]));
        assert_eq!(wait_for_exit(&mut runner, &task).await, 3);
    }

    #[tokio::test]
    async fn test_bad_working_dir_fails_spawn() {
        let (mut runner, _temp) = create_test_runner();
        let mut task = task_for("true");
        task.working_dir = "/nonexistent/path/for/sure".to_string();

        assert!(!runner.start(&mut task, &[0]));
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.error_message.is_empty());
        assert!(task.finished_at.is_some());
        assert_eq!(runner.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_terminates_process_group() {
        let (mut runner, _temp) = create_test_runner();
        let mut task = task_for("sleep 600");

        assert!(runner.start(&mut task, &[0]));
        assert!(runner.kill(&task));
        assert_eq!(runner.tracked_count(), 0);

        // The pid is no longer tracked, so check falls back to the liveness
        // probe and eventually reports the process gone.
        for _ in 0..500 {
            if runner.check(&task) == Some(-1) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("killed task still alive");
    }

    #[tokio::test]
    async fn test_check_untracked_pid() {
        let (mut runner, _temp) = create_test_runner();

        // Our own pid is alive.
        let mut task = task_for("true");
        task.pid = Some(std::process::id());
        assert_eq!(runner.check(&task), None);

        // A pid without a live process reports unknown failure.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        task.pid = Some(dead_pid);
        assert_eq!(runner.check(&task), Some(-1));

        // No pid at all.
        task.pid = None;
        assert_eq!(runner.check(&task), Some(-1));
    }

    #[tokio::test]
    async fn test_log_content_tail() {
        let (runner, temp) = create_test_runner();

        let mut task = task_for("true");
        assert_eq!(runner.log_content(&task, 10), "No log file available");

        task.log_file = temp
            .path()
            .join("missing.log")
            .display()
            .to_string();
        assert_eq!(runner.log_content(&task, 10), "Log file not found");

        let log_path = temp.path().join("task_x.log");
        std::fs::write(&log_path, "one\ntwo\nthree\n").unwrap();
        task.log_file = log_path.display().to_string();
        assert_eq!(runner.log_content(&task, 2), "two\nthree\n");
        assert_eq!(runner.log_content(&task, 0), "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_cleanup_clears_table() {
        let (mut runner, _temp) = create_test_runner();
        let mut a = task_for("sleep 600");
        let mut b = task_for("sleep 600");
        assert!(runner.start(&mut a, &[0]));
        assert!(runner.start(&mut b, &[1]));
        assert_eq!(runner.tracked_count(), 2);

        runner.cleanup();
        assert_eq!(runner.tracked_count(), 0);
    }
}
