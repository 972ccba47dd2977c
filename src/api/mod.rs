pub mod error;
pub mod models;

use std::time::Duration;

use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_DISPOSITION, USER_AGENT};
use reqwest::{Client, ClientBuilder, Response};
use serde_json::json;
use tracing::debug;

use error::ApiError;
use models::{DownloadMeta, DownloadRequest, ListResponse};

/// 已经打开的下载响应，连同从响应头里解析出来的信息
pub struct StreamHandle {
    /// Content-Disposition 里携带的建议文件名
    pub filename: Option<String>,
    /// 服务端确认的输出格式（format 响应头）
    pub format: Option<String>,
    /// X-Download-URL 响应头里的下载 ID
    pub download_id: Option<String>,
    pub response: Response,
}

/// 与后端三个接口打交道的客户端
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        headers.insert(USER_AGENT, reqwest::header::HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
        ));

        Self {
            inner: match ClientBuilder::new()
                .connect_timeout(Duration::from_secs(10))
                .default_headers(headers)
                .build()
            {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("Error creating client: {}", e);
                    panic!("Failed to create client");
                }
            },
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// 打开一个分块下载流（不读 body，消费交给 StreamConsumer）
    pub async fn download_stream(&self, req: &DownloadRequest) -> Result<StreamHandle, ApiError> {
        let response = self
            .inner
            .post(format!("{}/download", self.base_url))
            .json(req)
            .send()
            .await?;

        let status = response.status();
        debug!("Response Status: {}", status);
        if !status.is_success() {
            return Err(ApiError::HttpStatus(status.as_u16()));
        }

        let headers = response.headers();
        let filename = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split("filename=").nth(1))
            .map(|v| v.trim_matches('"').to_string());
        let format = headers
            .get("format")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let download_id = headers
            .get("X-Download-URL")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        Ok(StreamHandle {
            filename,
            format,
            download_id,
            response,
        })
    }

    /// 拉取标题/文件名/时长等元数据，失败不影响下载本身
    pub async fn fetch_meta(&self, url: &str, itag: Option<&str>) -> Result<DownloadMeta, ApiError> {
        let response = self
            .inner
            .post(format!("{}/download-meta", self.base_url))
            .json(&json!({ "url": url, "itag": itag }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus(status.as_u16()));
        }

        response
            .json::<DownloadMeta>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// 展开播放列表，返回按序排列的条目
    pub async fn expand_list(&self, list_url: &str) -> Result<ListResponse, ApiError> {
        let response = self
            .inner
            .post(format!("{}/list", self.base_url))
            .json(&json!({ "listUrl": list_url }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus(status.as_u16()));
        }

        let list: ListResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        if list.songs.is_empty() {
            return Err(ApiError::InvalidResponse("播放列表为空".to_string()));
        }
        Ok(list)
    }
}
