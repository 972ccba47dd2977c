/// 常见的纯音频 itag，来自 YouTube 的格式表
pub const AUDIO_ITAGS: [&str; 6] = ["251", "140", "250", "249", "234", "233"];

/// 拆分组合格式标识。"<video>+<audio>" 且恰好一个分隔符、两侧非空时
/// 返回两个子标识；其余情况一律按单一标识透传，不做任何校验，
/// 畸形标识留给下游的拉取去失败
pub fn split_itag(itag: &str) -> Option<(String, String)> {
    let mut parts = itag.split('+');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(video), Some(audio), None) if !video.is_empty() && !audio.is_empty() => {
            Some((video.to_string(), audio.to_string()))
        }
        _ => None,
    }
}

pub fn is_audio_itag(itag: &str) -> bool {
    AUDIO_ITAGS.contains(&itag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_combined() {
        assert_eq!(
            split_itag("313+140"),
            Some(("313".to_string(), "140".to_string()))
        );
        assert_eq!(
            split_itag("247+251"),
            Some(("247".to_string(), "251".to_string()))
        );
    }

    #[test]
    fn test_single_passes_through() {
        assert_eq!(split_itag("18"), None);
        assert_eq!(split_itag("best"), None);
    }

    #[test]
    fn test_malformed_passes_through() {
        // 多个分隔符或空侧都按单一标识处理
        assert_eq!(split_itag("1+2+3"), None);
        assert_eq!(split_itag("18+"), None);
        assert_eq!(split_itag("+140"), None);
        assert_eq!(split_itag("+"), None);
    }

    #[test]
    fn test_audio_itag_table() {
        assert!(is_audio_itag("140"));
        assert!(is_audio_itag("251"));
        assert!(!is_audio_itag("313"));
    }
}
