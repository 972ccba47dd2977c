pub mod error;
pub mod itag;
pub mod merge;
pub mod models;
pub mod registry;
pub mod sampler;
pub mod stream;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use error::DownloadError;

/// 文件交付能力：把装配好的字节以指定名字交给用户侧。
/// 每个成功任务恰好调用一次
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, DownloadError>;
}

/// 写到输出目录的默认实现
pub struct DiskSink {
    output_dir: PathBuf,
}

impl DiskSink {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl FileSink for DiskSink {
    async fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(filename);
        tokio::fs::write(&path, bytes).await?;
        info!("文件已保存: {:?} ({} 字节)", path, bytes.len());
        Ok(path)
    }
}
