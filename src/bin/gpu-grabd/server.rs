use anyhow::{Context, Result};
use gpu_grab::config::Config;
use gpu_grab::core::protocol::{
    CancelParams, CleanupParams, ListParams, LogsParams, Request, Response, SubmitParams,
};
use gpu_grab::core::scheduler::{self, Scheduler, SharedState};
use gpu_grab::core::task::TaskStatus;
use std::os::unix::fs::PermissionsExt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, RwLock};

/// Bind the IPC endpoint, start the scheduler loop, and serve requests until
/// SIGTERM/SIGINT.
pub async fn run(config: Config) -> Result<()> {
    let socket_path = config.socket_path();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
    }
    // Failure to bind is the one fatal startup error.
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to set permissions on {}", socket_path.display()))?;
    tracing::info!("listening on {}", socket_path.display());

    let state: SharedState = Arc::new(RwLock::new(Scheduler::new(config)?));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler::run(state.clone(), shutdown_rx.clone()));

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut shutdown = shutdown_rx;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state).await {
                            tracing::warn!("connection error: {e:#}");
                        }
                    });
                }
                Err(e) => tracing::warn!("accept error: {e}"),
            }
        }
    }

    // The scheduler loop observes the same flag, ticks out, and terminates
    // the tracked children before returning.
    scheduler_handle
        .await
        .context("scheduler task panicked")?;

    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("GPU Grab daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}

/// Read one framed request, dispatch it, write one framed response.
async fn handle_connection(stream: UnixStream, state: SharedState) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(line) = lines.next_line().await.context("failed to read request")? else {
        return Ok(());
    };

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => dispatch(request, &state).await,
        Err(_) => Response::err("Invalid JSON"),
    };

    let mut payload = serde_json::to_vec(&response).context("failed to encode response")?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .context("failed to send response")?;
    Ok(())
}

async fn dispatch(request: Request, state: &SharedState) -> Response {
    let Some(action) = request.action else {
        return Response::err("Missing 'action' field");
    };
    // An omitted params object behaves like an empty one.
    let params = match request.params {
        serde_json::Value::Null => serde_json::json!({}),
        params => params,
    };

    match action.as_str() {
        "submit" => match serde_json::from_value::<SubmitParams>(params) {
            Ok(params) => {
                let scheduler = state.read().await;
                match scheduler.submit(params) {
                    Ok(task_id) => Response::ok(serde_json::json!({ "task_id": task_id })),
                    Err(e) => Response::err(format!("{e:#}")),
                }
            }
            Err(e) => Response::err(format!("{e}")),
        },
        "status" => {
            let mut scheduler = state.write().await;
            Response::ok(scheduler.status())
        }
        "list" => match serde_json::from_value::<ListParams>(params) {
            Ok(params) => {
                let filter = match params.status_filter.as_str() {
                    "all" => None,
                    other => match TaskStatus::from_str(other) {
                        Ok(status) => Some(status),
                        Err(_) => {
                            return Response::err(format!("Unknown status filter: {other}"))
                        }
                    },
                };
                let scheduler = state.read().await;
                Response::ok(serde_json::json!({ "tasks": scheduler.list(filter) }))
            }
            Err(e) => Response::err(format!("{e}")),
        },
        "cancel" => match serde_json::from_value::<CancelParams>(params) {
            Ok(params) => {
                let mut scheduler = state.write().await;
                match scheduler.cancel(&params.task_id) {
                    Some(cancelled) => {
                        Response::ok(serde_json::json!({ "cancelled": cancelled }))
                    }
                    None => Response::ok(
                        serde_json::json!({ "cancelled": false, "error": "Task not found" }),
                    ),
                }
            }
            Err(e) => Response::err(format!("{e}")),
        },
        "logs" => match serde_json::from_value::<LogsParams>(params) {
            Ok(params) => {
                let scheduler = state.read().await;
                let logs = scheduler.logs(&params.task_id, params.tail);
                Response::ok(serde_json::json!({ "logs": logs }))
            }
            Err(e) => Response::err(format!("{e}")),
        },
        "cleanup" => match serde_json::from_value::<CleanupParams>(params) {
            Ok(params) => {
                let scheduler = state.read().await;
                match scheduler.cleanup_old_tasks(params.max_age_days) {
                    Ok(removed) => Response::ok(serde_json::json!({ "removed": removed })),
                    Err(e) => Response::err(format!("{e:#}")),
                }
            }
            Err(e) => Response::err(format!("{e}")),
        },
        other => Response::err(format!("Unknown action: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_grab::core::gpu::{GpuProbe, GpuStatus};
    use tempfile::TempDir;

    /// Fixed-inventory probe; the real NVML one needs hardware.
    struct StaticProbe(Vec<GpuStatus>);

    impl GpuProbe for StaticProbe {
        fn device_count(&mut self) -> anyhow::Result<u32> {
            Ok(self.0.len() as u32)
        }

        fn device_status(&mut self, index: u32) -> anyhow::Result<GpuStatus> {
            self.0
                .iter()
                .find(|g| g.index == index)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such device {index}"))
        }

        fn snapshot(&mut self) -> Vec<GpuStatus> {
            self.0.clone()
        }
    }

    fn test_state(temp: &TempDir) -> SharedState {
        let config = Config {
            base_dir: temp.path().to_path_buf(),
            ..Config::default()
        };
        let probe = StaticProbe(vec![GpuStatus {
            index: 0,
            name: "Test GPU".to_string(),
            total_memory_mb: 24_000,
            used_memory_mb: 0,
            free_memory_mb: 24_000,
            utilization_percent: 0,
            temperature: 35,
        }]);
        let scheduler = Scheduler::with_probe(config, Box::new(probe)).unwrap();
        Arc::new(RwLock::new(scheduler))
    }

    fn request(action: &str, params: serde_json::Value) -> Request {
        Request {
            action: Some(action.to_string()),
            params,
        }
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = dispatch(request("frobnicate", serde_json::json!({})), &state).await;
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Unknown action"));
    }

    #[tokio::test]
    async fn test_missing_action() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = dispatch(
            Request {
                action: None,
                params: serde_json::json!({}),
            },
            &state,
        )
        .await;
        assert_eq!(response.error.as_deref(), Some("Missing 'action' field"));
    }

    #[tokio::test]
    async fn test_submit_requires_command() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = dispatch(request("submit", serde_json::json!({"name": "x"})), &state).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("command"));
    }

    #[tokio::test]
    async fn test_submit_list_cancel_flow() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = dispatch(
            request("submit", serde_json::json!({"command": "true", "name": "smoke"})),
            &state,
        )
        .await;
        assert!(response.success);
        let task_id = response.data.unwrap()["task_id"].as_str().unwrap().to_string();

        let response = dispatch(
            request("list", serde_json::json!({"status_filter": "pending"})),
            &state,
        )
        .await;
        let tasks = response.data.unwrap()["tasks"].as_array().unwrap().len();
        assert_eq!(tasks, 1);

        let response = dispatch(
            request("cancel", serde_json::json!({"task_id": task_id})),
            &state,
        )
        .await;
        assert_eq!(response.data.unwrap()["cancelled"], true);

        let response = dispatch(
            request("cancel", serde_json::json!({"task_id": "missing"})),
            &state,
        )
        .await;
        let data = response.data.unwrap();
        assert_eq!(data["cancelled"], false);
        assert_eq!(data["error"], "Task not found");
    }

    #[tokio::test]
    async fn test_status_reports_gpus() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = dispatch(request("status", serde_json::json!({})), &state).await;
        let data = response.data.unwrap();
        assert_eq!(data["running"], true);
        assert_eq!(data["gpus"].as_array().unwrap().len(), 1);
        assert_eq!(data["config"]["max_concurrent_tasks"], 4);
    }

    #[tokio::test]
    async fn test_logs_unknown_task() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = dispatch(
            request("logs", serde_json::json!({"task_id": "missing"})),
            &state,
        )
        .await;
        assert_eq!(response.data.unwrap()["logs"], "Task not found");
    }

    #[tokio::test]
    async fn test_list_rejects_bad_filter() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = dispatch(
            request("list", serde_json::json!({"status_filter": "sleeping"})),
            &state,
        )
        .await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_cleanup_action() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = dispatch(request("cleanup", serde_json::json!({})), &state).await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["removed"], 0);
    }
}
