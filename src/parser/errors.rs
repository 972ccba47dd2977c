use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("无效的URL")]
    InvalidUrl,
    #[error("不支持的平台: {0}")]
    UnsupportedPlatform(String),
    #[error("解析错误: {0}")]
    ParseError(String),
}

impl From<url::ParseError> for ParseError {
    fn from(_: url::ParseError) -> Self {
        ParseError::InvalidUrl
    }
}
