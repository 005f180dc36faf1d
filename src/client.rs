use crate::config::Config;
use crate::core::protocol::{Request, Response, SubmitParams};
use crate::core::task::Task;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Client side of the daemon's Unix-socket protocol: one newline-framed JSON
/// request per connection, one framed response back.
#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    pub fn build(config: &Config) -> Self {
        Self {
            socket_path: config.socket_path(),
        }
    }

    /// Send one request and return the `data` payload of a successful
    /// response; a `success: false` response becomes an error.
    pub async fn request(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to {}. Is the daemon running?",
                    self.socket_path.display()
                )
            })?;
        let (reader, mut writer) = stream.into_split();

        let request = Request {
            action: Some(action.to_string()),
            params,
        };
        let mut payload = serde_json::to_vec(&request).context("failed to encode request")?;
        payload.push(b'\n');
        writer
            .write_all(&payload)
            .await
            .context("failed to send request")?;

        let mut line = String::new();
        BufReader::new(reader)
            .read_line(&mut line)
            .await
            .context("failed to read response")?;
        let response: Response =
            serde_json::from_str(line.trim_end()).context("failed to parse response")?;

        if response.success {
            Ok(response.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(anyhow!(response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string())))
        }
    }

    pub async fn submit(&self, params: &SubmitParams) -> Result<String> {
        let data = self
            .request("submit", serde_json::to_value(params)?)
            .await?;
        data["task_id"]
            .as_str()
            .map(str::to_string)
            .context("daemon response missing task_id")
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        self.request("status", serde_json::json!({})).await
    }

    pub async fn list(&self, status_filter: &str) -> Result<Vec<Task>> {
        let data = self
            .request("list", serde_json::json!({ "status_filter": status_filter }))
            .await?;
        serde_json::from_value(data["tasks"].clone()).context("failed to parse task list")
    }

    /// Returns whether the task was actually cancelled (false when it was
    /// already terminal).
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let data = self
            .request("cancel", serde_json::json!({ "task_id": task_id }))
            .await?;
        if let Some(error) = data["error"].as_str() {
            return Err(anyhow!("{error}"));
        }
        Ok(data["cancelled"].as_bool().unwrap_or(false))
    }

    pub async fn logs(&self, task_id: &str, tail: usize, follow: bool) -> Result<String> {
        let data = self
            .request(
                "logs",
                serde_json::json!({ "task_id": task_id, "tail": tail, "follow": follow }),
            )
            .await?;
        Ok(data["logs"].as_str().unwrap_or_default().to_string())
    }

    pub async fn cleanup(&self, max_age_days: i64) -> Result<usize> {
        let data = self
            .request("cleanup", serde_json::json!({ "max_age_days": max_age_days }))
            .await?;
        Ok(data["removed"].as_u64().unwrap_or(0) as usize)
    }
}
