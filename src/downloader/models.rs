use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::models::DownloadMeta;

/// 任务状态机。状态一律显式标注，绝不从字段相等之类的巧合推断
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Starting,
    Processing,
    Downloading,
    /// 仅出现在持久化快照里，活动编排器不会主动进入
    Paused,
    /// 会话恢复时，没有完成标记的历史任务一律归为中断
    Interrupted,
    Merging,
    Completed,
    Failed,
    MergeFailed,
    Cancelled,
}

impl TaskStatus {
    /// 终态之后进度与速度字段全部冻结
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::MergeFailed
                | TaskStatus::Cancelled
        )
    }
}

/// 合并任务的两个半边
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfRole {
    Video,
    Audio,
}

impl HalfRole {
    pub fn tag(&self) -> &'static str {
        match self {
            HalfRole::Video => "video",
            HalfRole::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalfStatus {
    Downloading,
    Completed,
    Failed,
}

/// 提交一个下载任务所需的全部输入
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// 调用方提供的任务 ID；缺省时生成 uuid v4
    pub id: Option<String>,
    pub url: String,
    pub itag: String,
    pub ext: Option<String>,
    pub format: Option<String>,
    /// 续传偏移，原样转发给下载接口
    pub start_byte: u64,
    pub thumbnail: Option<String>,
    pub part_of_list: bool,
}

impl TaskRequest {
    pub fn new(url: &str, itag: &str) -> Self {
        Self {
            id: None,
            url: url.to_string(),
            itag: itag.to_string(),
            ext: None,
            format: None,
            start_byte: 0,
            thumbnail: None,
            part_of_list: false,
        }
    }
}

/// 注册表里的一条任务记录。所有修改都经由注册表的事件循环，
/// 消费者只向上报告事件，从不直接改这里
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub id: String,
    /// 注册代号，同一 ID 重新提交时更换。事件循环据此丢弃
    /// 旧一代消费者迟到的事件
    pub generation: u64,
    pub url: String,
    pub itag: String,
    pub filename: String,
    pub ext: String,
    pub status: TaskStatus,
    /// 0-100，Downloading 期间单调不减
    pub progress: f64,
    pub speed_text: String,
    /// MB/s
    pub speed: f64,
    pub eta_text: String,
    pub total_size: u64,
    pub downloaded: u64,
    pub thumbnail: Option<String>,
    pub needs_merge: bool,
    pub video_status: Option<HalfStatus>,
    pub audio_status: Option<HalfStatus>,
    /// 音频半边的进度字段单独存放，避免与视频互相覆盖
    pub audio_progress: f64,
    pub audio_speed_text: String,
    pub audio_eta_text: String,
    pub audio_total_size: u64,
    pub audio_downloaded: u64,
    /// 合并进度，与下载进度互相独立
    pub merge_progress: u8,
    pub duration: Option<f64>,
    pub part_of_list: bool,
    pub created_at: DateTime<Utc>,
    /// 完成或失败的时刻
    pub stopped_at: Option<DateTime<Utc>>,
    pub fail_reason: Option<String>,
}

impl TaskEntry {
    pub fn new(id: &str, url: &str, itag: &str, filename: &str, ext: &str) -> Self {
        Self {
            id: id.to_string(),
            generation: 0,
            url: url.to_string(),
            itag: itag.to_string(),
            filename: filename.to_string(),
            ext: ext.to_string(),
            status: TaskStatus::Starting,
            progress: 0.0,
            speed_text: "0 B/s".to_string(),
            speed: 0.0,
            eta_text: crate::downloader::sampler::CALCULATING.to_string(),
            total_size: 0,
            downloaded: 0,
            thumbnail: None,
            needs_merge: false,
            video_status: None,
            audio_status: None,
            audio_progress: 0.0,
            audio_speed_text: "0 B/s".to_string(),
            audio_eta_text: crate::downloader::sampler::CALCULATING.to_string(),
            audio_total_size: 0,
            audio_downloaded: 0,
            merge_progress: 0,
            duration: None,
            part_of_list: false,
            created_at: Utc::now(),
            stopped_at: None,
            fail_reason: None,
        }
    }
}

/// 一次进度快照，按角色打标后并入任务记录
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// None 表示单流任务
    pub role: Option<HalfRole>,
    pub progress: f64,
    pub speed: f64,
    pub speed_text: String,
    pub eta_text: String,
    pub total_size: u64,
    pub downloaded: u64,
}

/// 消费者与合并协调器向注册表上报的事件。
/// 单通道串行消费，保证同一任务的持久化写不会交叠。
/// 每个事件带发出方的注册代号，与当前记录不符的直接丢弃，
/// 重新提交的任务不会被被取消的旧一代污染
#[derive(Debug)]
pub enum TaskEvent {
    Progress {
        id: String,
        generation: u64,
        update: ProgressUpdate,
    },
    /// 元数据接口带外返回，仅修饰展示名称
    MetaResolved {
        id: String,
        generation: u64,
        meta: DownloadMeta,
    },
    /// 单流任务下载完成
    StreamCompleted {
        id: String,
        generation: u64,
        bytes: Vec<u8>,
        size: u64,
    },
    StreamFailed {
        id: String,
        generation: u64,
        reason: String,
    },
    /// 合并任务的一个半边完成
    HalfCompleted {
        id: String,
        generation: u64,
        role: HalfRole,
        bytes: Vec<u8>,
        size: u64,
    },
    HalfFailed {
        id: String,
        generation: u64,
        role: HalfRole,
        reason: String,
    },
    MergeProgress {
        id: String,
        generation: u64,
        percent: u8,
    },
    MergeFinished {
        id: String,
        generation: u64,
        bytes: Vec<u8>,
    },
    MergeFailed {
        id: String,
        generation: u64,
        reason: String,
    },
}
