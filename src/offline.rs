// Offline Download Module
// Remote fetch-by-URL tasks queued on the backend, landing in a temp folder

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::providers::transport::{id_string, id_value, ApiRequest};
use crate::providers::{Open123Provider, ProviderError, RemoteEntry};

const OFFLINE_ADD_PATH: &str = "/api/v1/offline/download";
const OFFLINE_LIST_PATH: &str = "/api/v1/offline/download/list";
const OFFLINE_DELETE_PATH: &str = "/api/v1/offline/download/delete";

/// Status text reported for a task the backend no longer knows
pub const TASK_DELETED: &str = "the task has been deleted";

/// Offline task as the backend reports it
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineTask {
    #[serde(alias = "taskID", alias = "taskId", alias = "info_hash", deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, alias = "process")]
    pub percent: f64,
    /// 0 running, 1 failed, 2 done, 3 retrying
    #[serde(default)]
    pub status: i64,
}

impl OfflineTask {
    pub fn is_done(&self) -> bool {
        self.status == 2
    }

    pub fn is_failed(&self) -> bool {
        self.status == 1
    }

    pub fn status_text(&self) -> &'static str {
        match self.status {
            0 => "downloading",
            1 => "failed",
            2 => "succeed",
            3 => "retrying",
            _ => "unknown",
        }
    }
}

fn de_id<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(id_string(&value))
}

#[derive(Debug, Deserialize)]
struct AddResp {
    #[serde(alias = "taskID", alias = "taskId", deserialize_with = "de_id")]
    task_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct TaskList {
    #[serde(default, alias = "tasks", alias = "items")]
    list: Vec<OfflineTask>,
}

/// Host-facing view of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    /// Percentage in `[0, 100]`
    pub progress: f64,
    pub completed: bool,
    pub status: String,
    pub total_bytes: u64,
    /// Set when the task failed or is gone
    pub error: Option<String>,
}

impl Open123Provider {
    /// Queue backend-side downloads of `urls` into `dir`, returning one task
    /// id per URL.
    pub async fn offline_download(&self, urls: &[&str], dir: &RemoteEntry) -> Result<Vec<String>, ProviderError> {
        let mut ids = Vec::with_capacity(urls.len());
        for url in urls {
            let resp: AddResp = self
                .api()
                .call(ApiRequest::post(
                    OFFLINE_ADD_PATH,
                    json!({ "url": url, "dirID": id_value(&dir.id) }),
                ))
                .await?;
            debug!("[123open] offline task {} queued for {}", resp.task_id, url);
            ids.push(resp.task_id);
        }
        Ok(ids)
    }

    pub async fn offline_list(&self) -> Result<Vec<OfflineTask>, ProviderError> {
        let tasks: TaskList = self
            .api()
            .call(ApiRequest::post(OFFLINE_LIST_PATH, json!({})))
            .await?;
        Ok(tasks.list)
    }

    pub async fn delete_offline_tasks(&self, task_ids: &[&str], delete_files: bool) -> Result<(), ProviderError> {
        let ids: Vec<Value> = task_ids.iter().map(|id| id_value(id)).collect();
        self.api()
            .call_unit(ApiRequest::post(
                OFFLINE_DELETE_PATH,
                json!({ "taskIDs": ids, "deleteFiles": delete_files }),
            ))
            .await
    }
}

/// Offline download entry point for a host application.
///
/// Tasks land in the mount's configured temp folder, which is created on
/// first use.
pub struct OfflineDownloadTool {
    provider: Arc<Open123Provider>,
    temp_dir: Option<String>,
}

impl OfflineDownloadTool {
    pub fn new(provider: Arc<Open123Provider>) -> Self {
        let temp_dir = provider.config().offline_temp_dir.clone();
        Self { provider, temp_dir }
    }

    /// Use a temp folder other than the configured one
    pub fn with_temp_dir(mut self, path: &str) -> Self {
        self.temp_dir = Some(path.to_string());
        self
    }

    pub fn is_ready(&self) -> bool {
        self.temp_dir.as_deref().is_some_and(|dir| !dir.trim().is_empty())
    }

    fn temp_dir(&self) -> Result<&str, ProviderError> {
        self.temp_dir
            .as_deref()
            .filter(|dir| !dir.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidConfig("offline temp folder is not configured".to_string()))
    }

    /// Queue a download of `url`, returning its task id.
    pub async fn add_url(&self, url: &str) -> Result<String, ProviderError> {
        let dir = self.provider.ensure_dir(self.temp_dir()?).await?;
        let ids = self.provider.offline_download(&[url], &dir).await?;
        let id = ids
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ParseError("backend returned no task id".to_string()))?;
        info!("[123open] offline download {} -> {} (task {})", url, dir.path, id);
        Ok(id)
    }

    /// Progress of a task; a task the backend no longer lists reports an error.
    pub async fn status(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let tasks = self.provider.offline_list().await?;
        let status = match tasks.into_iter().find(|t| t.id == task_id) {
            Some(task) => TaskStatus {
                progress: task.percent.clamp(0.0, 100.0),
                completed: task.is_done(),
                status: task.status_text().to_string(),
                total_bytes: task.size,
                error: task.is_failed().then(|| task.status_text().to_string()),
            },
            None => TaskStatus {
                progress: 0.0,
                completed: false,
                status: TASK_DELETED.to_string(),
                total_bytes: 0,
                error: Some(TASK_DELETED.to_string()),
            },
        };
        Ok(status)
    }

    /// Cancel a task, keeping whatever it already downloaded.
    pub async fn remove(&self, task_id: &str) -> Result<(), ProviderError> {
        self.provider.delete_offline_tasks(&[task_id], false).await
    }
}
