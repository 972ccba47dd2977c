pub mod errors;

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use errors::ParseError;

/// 支持的媒体平台
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Youtube,
    Instagram,
    Tiktok,
    Facebook,
    Twitter,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Facebook => "facebook",
            Platform::Twitter => "twitter",
        }
    }
}

lazy_static! {
    // 各种 YouTube 链接形式中提取 11 位视频 ID
    static ref YOUTUBE_ID_RE: Regex = Regex::new(
        r#"(?:youtu\.be/|youtube\.com/(?:embed/|watch\?v=|v/|shorts/)?|src="(?:https://www\.youtube\.com/embed/))([\w-]{11})"#
    )
    .unwrap();
    static ref WATCH_PARAM_RE: Regex = Regex::new(r"[?&]v=([^&]+)").unwrap();
}

/// 根据域名识别媒体平台
pub fn identify_platform(input: &str) -> Result<Platform, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::InvalidUrl);
    }
    let url = Url::parse(input)?;
    let domain = url.host_str().ok_or(ParseError::InvalidUrl)?.to_lowercase();

    if domain.contains("youtube") || domain.contains("youtu.be") {
        Ok(Platform::Youtube)
    } else if domain.contains("instagram") {
        Ok(Platform::Instagram)
    } else if domain.contains("tiktok") {
        Ok(Platform::Tiktok)
    } else if domain.contains("facebook") || domain.contains("fb.watch") {
        Ok(Platform::Facebook)
    } else if domain.contains("twitter") || domain.contains("x.com") {
        Ok(Platform::Twitter)
    } else {
        Err(ParseError::UnsupportedPlatform(domain))
    }
}

/// 把各种形式的 YouTube 链接归一化为标准 watch 链接
pub fn normalize_youtube_url(input: &str) -> Option<String> {
    if input.is_empty() {
        return None;
    }
    YOUTUBE_ID_RE
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|id| format!("https://www.youtube.com/watch?v={}", id.as_str()))
}

/// 提取视频 ID；非链接输入视为已经是 ID，原样返回
pub fn extract_video_id(input: &str) -> Option<String> {
    if input.contains("https://") {
        return WATCH_PARAM_RE
            .captures(input)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
    }
    Some(input.to_string())
}

/// 在拿到元数据之前给任务一个可展示的文件名
pub fn suggest_filename(url: &str, platform: Platform) -> String {
    let candidate = Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segs| segs.next_back().map(|s| s.to_string()))
            .filter(|s| !s.is_empty())
    });

    match candidate {
        Some(name) => name
            .split('.')
            .next()
            .unwrap_or(&name)
            .replace(char::is_whitespace, "-")
            .to_lowercase(),
        None => format!("{}-download", platform.as_str()),
    }
}
