use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::downloader::models::TaskStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 落盘的任务快照。除 id 外所有字段都是可选的：
/// put 的入参是一次"部分更新"，缺失字段不会覆盖已有值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_size: Option<u64>,
    /// 仅在任务完成时写入
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_downloaded_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub itag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_part_of_list: Option<bool>,
    /// 最近一次写入时间，每次 put 都会刷新
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// 合并一次部分更新：入参里为 Some 的字段覆盖，None 的保留原值
    pub fn merge_from(&mut self, patch: TaskSnapshot) {
        macro_rules! take {
            ($field:ident) => {
                if patch.$field.is_some() {
                    self.$field = patch.$field;
                }
            };
        }
        take!(url);
        take!(filename);
        take!(status);
        take!(thumbnail);
        take!(filesize);
        take!(downloaded_size);
        take!(stop_time);
        take!(audio_filesize);
        take!(audio_downloaded_size);
        take!(duration);
        take!(format);
        take!(itag);
        take!(download_name);
        take!(is_part_of_list);
        self.timestamp = Some(Utc::now());
    }
}

/// 持久化引擎的契约：单键读-改-写，不承诺多键事务
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<TaskSnapshot>, StoreError>;
    /// 与已有记录合并后写回，返回合并结果
    async fn put(&self, patch: TaskSnapshot) -> Result<TaskSnapshot, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn get_all(&self) -> Result<Vec<TaskSnapshot>, StoreError>;
}

/// 基于单个 JSON 状态文件的实现
pub struct JsonStateStore {
    state_file: PathBuf,
    cache: Mutex<HashMap<String, TaskSnapshot>>,
}

impl JsonStateStore {
    /// 打开状态文件；不存在时初始化为空列表
    pub async fn open(state_file: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
        let state_file = state_file.as_ref().to_path_buf();
        let mut cache = HashMap::new();

        match tokio::fs::read(&state_file).await {
            Ok(data) => {
                let snapshots: Vec<TaskSnapshot> = serde_json::from_slice(&data)?;
                for snap in snapshots {
                    cache.insert(snap.id.clone(), snap);
                }
                debug!("从状态文件加载了 {} 条任务记录", cache.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&state_file, "[]").await?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Arc::new(Self {
            state_file,
            cache: Mutex::new(cache),
        }))
    }

    async fn flush(&self, cache: &HashMap<String, TaskSnapshot>) -> Result<(), StoreError> {
        let mut snapshots: Vec<&TaskSnapshot> = cache.values().collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        let data = serde_json::to_vec_pretty(&snapshots)?;
        tokio::fs::write(&self.state_file, data).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for JsonStateStore {
    async fn get(&self, id: &str) -> Result<Option<TaskSnapshot>, StoreError> {
        Ok(self.cache.lock().await.get(id).cloned())
    }

    async fn put(&self, patch: TaskSnapshot) -> Result<TaskSnapshot, StoreError> {
        let mut cache = self.cache.lock().await;
        let entry = cache
            .entry(patch.id.clone())
            .or_insert_with(|| TaskSnapshot::new(&patch.id));
        entry.merge_from(patch);
        let merged = entry.clone();
        self.flush(&cache).await?;
        Ok(merged)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().await;
        cache.remove(id);
        self.flush(&cache).await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<TaskSnapshot>, StoreError> {
        Ok(self.cache.lock().await.values().cloned().collect())
    }
}

/// 纯内存实现，测试用
#[derive(Default)]
pub struct MemoryStore {
    cache: Mutex<HashMap<String, TaskSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<TaskSnapshot>, StoreError> {
        Ok(self.cache.lock().await.get(id).cloned())
    }

    async fn put(&self, patch: TaskSnapshot) -> Result<TaskSnapshot, StoreError> {
        let mut cache = self.cache.lock().await;
        let entry = cache
            .entry(patch.id.clone())
            .or_insert_with(|| TaskSnapshot::new(&patch.id));
        entry.merge_from(patch);
        Ok(entry.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.cache.lock().await.remove(id);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<TaskSnapshot>, StoreError> {
        Ok(self.cache.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_merges_with_existing() {
        let store = MemoryStore::new();

        let mut first = TaskSnapshot::new("t1");
        first.url = Some("https://youtu.be/abc".to_string());
        first.filename = Some("video".to_string());
        first.status = Some(TaskStatus::Downloading);
        store.put(first).await.unwrap();

        // 第二次只带进度字段，文件名等不应丢失
        let mut patch = TaskSnapshot::new("t1");
        patch.downloaded_size = Some(1024);
        patch.status = Some(TaskStatus::Downloading);
        let merged = store.put(patch).await.unwrap();

        assert_eq!(merged.filename.as_deref(), Some("video"));
        assert_eq!(merged.url.as_deref(), Some("https://youtu.be/abc"));
        assert_eq!(merged.downloaded_size, Some(1024));
        assert!(merged.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_resubmit_overwrites_fields() {
        let store = MemoryStore::new();

        let mut first = TaskSnapshot::new("t1");
        first.status = Some(TaskStatus::Failed);
        store.put(first).await.unwrap();

        let mut again = TaskSnapshot::new("t1");
        again.status = Some(TaskStatus::Starting);
        store.put(again).await.unwrap();

        let got = store.get("t1").await.unwrap().unwrap();
        assert_eq!(got.status, Some(TaskStatus::Starting));
        // 同一 id 只保留一条记录
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.put(TaskSnapshot::new("t1")).await.unwrap();
        store.delete("t1").await.unwrap();
        assert!(store.get("t1").await.unwrap().is_none());
    }
}
