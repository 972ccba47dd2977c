use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("请求错误: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("HTTP状态错误: {0}")]
    HttpStatus(u16),
    #[error("无效的响应: {0}")]
    InvalidResponse(String),
}
