use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 滑动平均窗口大小
pub const MAX_SAMPLES: usize = 5;
/// 两次快照之间的最小间隔，更快到达的分块会被合并掉
pub const MIN_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(500);
/// 速度非正时 ETA 的占位文案
pub const CALCULATING: &str = "计算中...";

const MB: f64 = 1024.0 * 1024.0;

/// 一次进度快照
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedSnapshot {
    /// 0-100，按总大小截断
    pub progress: f64,
    /// 滑动平均速度，MB/s
    pub speed: f64,
    pub speed_text: String,
    pub eta_text: String,
    pub total_size: u64,
    pub downloaded: u64,
}

/// 把不规则到达的分块观测变成平滑的速度与 ETA。
/// 纯计算单元，除了有界的采样窗口不持有别的状态
pub struct ProgressSampler {
    /// 权威大小到达前先用估计值，避免进度栏一片空白
    total_size: u64,
    samples: VecDeque<f64>,
    last_update: Instant,
    last_downloaded: u64,
}

impl ProgressSampler {
    pub fn new(size_hint: u64, now: Instant) -> Self {
        Self {
            total_size: size_hint,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            last_update: now,
            last_downloaded: 0,
        }
    }

    /// 流首块解析出权威大小后调用
    pub fn set_total_size(&mut self, total: u64) {
        self.total_size = total;
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 喂入一次观测（当前时刻 + 累计字节数）。
    /// 距上次快照不足 500ms 时返回 None
    pub fn observe(&mut self, now: Instant, downloaded: u64) -> Option<SpeedSnapshot> {
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed < MIN_SNAPSHOT_INTERVAL {
            return None;
        }

        let size_diff = downloaded.saturating_sub(self.last_downloaded) as f64;
        let instant_speed = size_diff / elapsed.as_secs_f64() / MB;

        self.samples.push_back(instant_speed);
        if self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        let avg_speed = self.samples.iter().sum::<f64>() / self.samples.len() as f64;

        // 声明的大小在拿到权威值前只是估计，进度必须截断
        let progress = if self.total_size > 0 {
            (downloaded as f64 / self.total_size as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let eta_text = if avg_speed > 0.0 {
            let remaining = self.total_size.saturating_sub(downloaded) as f64;
            format_eta(remaining / (avg_speed * MB))
        } else {
            CALCULATING.to_string()
        };

        self.last_update = now;
        self.last_downloaded = downloaded;

        Some(SpeedSnapshot {
            progress,
            speed: avg_speed,
            speed_text: format_speed(avg_speed),
            eta_text,
            total_size: self.total_size,
            downloaded,
        })
    }
}

/// 按量级渲染速度：1MB/s 以上用 MB/s，1KB/s 以上用 KB/s，其余整数 B/s
pub fn format_speed(speed_mbps: f64) -> String {
    if speed_mbps > 1.0 {
        format!("{:.2} MB/s", speed_mbps)
    } else if speed_mbps > 0.001 {
        format!("{:.2} KB/s", speed_mbps * 1024.0)
    } else {
        format!("{:.0} B/s", speed_mbps * MB)
    }
}

/// 秒数渲染为 HH:MM:SS，非正或非有限值按零处理
pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "00:00:00".to_string();
    }
    let total = seconds as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesces_fast_intervals() {
        let start = Instant::now();
        let mut sampler = ProgressSampler::new(1000, start);

        // 100ms 内的观测被合并，不产生快照
        assert!(sampler.observe(start + Duration::from_millis(100), 10).is_none());
        // 够 500ms 后产生
        assert!(sampler.observe(start + Duration::from_millis(600), 100).is_some());
        // 又一个不足间隔的观测
        assert!(sampler.observe(start + Duration::from_millis(700), 200).is_none());
    }

    #[test]
    fn test_moving_average_window() {
        let start = Instant::now();
        let mut sampler = ProgressSampler::new(u64::MAX, start);

        // 每秒 1MB，速度应收敛到 1.0 MB/s
        let mut now = start;
        let mut downloaded = 0u64;
        let mut last = None;
        for _ in 0..8 {
            now += Duration::from_secs(1);
            downloaded += 1024 * 1024;
            last = sampler.observe(now, downloaded);
        }
        let snap = last.unwrap();
        assert!((snap.speed - 1.0).abs() < 1e-9);
        assert_eq!(sampler.samples.len(), MAX_SAMPLES);
    }

    #[test]
    fn test_progress_clamped_at_100() {
        let start = Instant::now();
        // 估计值偏小：已下载超过声明大小时进度停在 100
        let mut sampler = ProgressSampler::new(100, start);
        let snap = sampler.observe(start + Duration::from_secs(1), 500).unwrap();
        assert_eq!(snap.progress, 100.0);
    }

    #[test]
    fn test_zero_total_size_gives_zero_progress() {
        let start = Instant::now();
        let mut sampler = ProgressSampler::new(0, start);
        let snap = sampler.observe(start + Duration::from_secs(1), 500).unwrap();
        assert_eq!(snap.progress, 0.0);
    }

    #[test]
    fn test_eta_calculating_when_stalled() {
        let start = Instant::now();
        let mut sampler = ProgressSampler::new(1000, start);
        // 没有新字节，速度为 0，ETA 给占位文案
        let snap = sampler.observe(start + Duration::from_secs(1), 0).unwrap();
        assert_eq!(snap.eta_text, CALCULATING);
    }

    #[test]
    fn test_format_speed_units() {
        assert_eq!(format_speed(2.5), "2.50 MB/s");
        assert_eq!(format_speed(0.5), "512.00 KB/s");
        assert_eq!(format_speed(0.0005), "524 B/s");
        assert_eq!(format_speed(0.0), "0 B/s");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0.0), "00:00:00");
        assert_eq!(format_eta(-5.0), "00:00:00");
        assert_eq!(format_eta(f64::INFINITY), "00:00:00");
        assert_eq!(format_eta(61.0), "00:01:01");
        assert_eq!(format_eta(3661.0), "01:01:01");
    }

    #[test]
    fn test_authoritative_size_overrides_hint() {
        let start = Instant::now();
        let mut sampler = ProgressSampler::new(10, start);
        sampler.set_total_size(1000);
        let snap = sampler.observe(start + Duration::from_secs(1), 500).unwrap();
        assert_eq!(snap.total_size, 1000);
        assert_eq!(snap.progress, 50.0);
    }
}
