use std::fmt;

#[derive(Debug)]
pub enum DownloadError {
    HttpError(reqwest::Error),
    IoError(std::io::Error),
    InvalidUrl(String),
    TaskNotFound(String),
    StreamError(String),
    /// 流首块携带的 [ERROR] 标记，服务端在流内上报的失败
    ServerError(String),
    MuxError(String),
    FfmpegNotFound,
    Cancelled,
    SemaphoreError,
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::HttpError(e) => write!(f, "HTTP错误: {}", e),
            DownloadError::IoError(e) => write!(f, "IO错误: {}", e),
            DownloadError::InvalidUrl(url) => write!(f, "无效的URL: {}", url),
            DownloadError::TaskNotFound(id) => write!(f, "任务未找到: {}", id),
            DownloadError::StreamError(msg) => write!(f, "流错误: {}", msg),
            DownloadError::ServerError(msg) => write!(f, "服务端错误: {}", msg),
            DownloadError::MuxError(msg) => write!(f, "合并错误: {}", msg),
            DownloadError::FfmpegNotFound => write!(f, "未检测到 ffmpeg"),
            DownloadError::Cancelled => write!(f, "任务已取消"),
            DownloadError::SemaphoreError => write!(f, "信号量错误"),
        }
    }
}

impl std::error::Error for DownloadError {}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        DownloadError::HttpError(error)
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(error: std::io::Error) -> Self {
        DownloadError::IoError(error)
    }
}

impl From<crate::api::error::ApiError> for DownloadError {
    fn from(error: crate::api::error::ApiError) -> Self {
        match error {
            crate::api::error::ApiError::Reqwest(e) => DownloadError::HttpError(e),
            crate::api::error::ApiError::HttpStatus(code) => {
                DownloadError::StreamError(format!("HTTP状态码: {}", code))
            }
            crate::api::error::ApiError::InvalidResponse(msg) => DownloadError::StreamError(msg),
        }
    }
}
