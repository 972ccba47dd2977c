use serde::{Deserialize, Serialize};

/// 下载接口的请求体，字段与服务端约定保持一致
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRequest {
    pub itag: Option<String>,
    pub id: String,
    pub url: String,
    pub start_byte: u64,
    pub format: Option<String>,
    pub ext: Option<String>,
}

impl DownloadRequest {
    pub fn new(id: &str, url: &str, itag: Option<&str>) -> Self {
        Self {
            itag: itag.map(|s| s.to_string()),
            id: id.to_string(),
            url: url.to_string(),
            start_byte: 0,
            format: None,
            ext: None,
        }
    }
}

/// 元数据接口的响应，只用来改善展示名称，不参与进度计算
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadMeta {
    pub title: Option<String>,
    pub filename: Option<String>,
    pub ext: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
}

/// 列表展开接口返回的单个条目
#[derive(Debug, Clone, Deserialize)]
pub struct ListItem {
    pub title: Option<String>,
    pub url: String,
    #[serde(default)]
    pub itag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse {
    pub count: usize,
    pub songs: Vec<ListItem>,
    pub playlist_name: String,
}
