use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::DownloadError;
use super::models::{HalfRole, TaskEvent};

/// 合并进度回调，0-100
pub type MuxProgressFn = Box<dyn Fn(u8) + Send + Sync>;

/// 外部的音视频混流能力。核心只认这个契约：
/// 给两段共享时间轴的已编码缓冲，产出一个容器；可能失败；
/// 对每个任务可安全地重复调用，不得在任务之间泄漏状态
#[async_trait]
pub trait MuxCapability: Send + Sync {
    async fn mux(
        &self,
        task_id: &str,
        video: &[u8],
        audio: &[u8],
        duration: Option<f64>,
        progress: MuxProgressFn,
    ) -> Result<Vec<u8>, DownloadError>;
}

/// 一个已完成半边的载荷，在合并消费它之前由半边独占
#[derive(Debug)]
pub struct HalfPayload {
    pub bytes: Vec<u8>,
    pub size: u64,
}

/// 待合并记录：任务 ID 与两个半边之间的临时关联。
/// 只存在于"两个半边已发起"到"合并出结果"之间，从不落盘；
/// 进程重启即丢失，任务需要重新提交
#[derive(Debug)]
pub struct PendingMerge {
    pub filename: String,
    pub ext: String,
    video: Option<HalfPayload>,
    audio: Option<HalfPayload>,
    merge_started: bool,
}

impl PendingMerge {
    pub fn new(filename: &str, ext: &str) -> Self {
        Self {
            filename: filename.to_string(),
            ext: ext.to_string(),
            video: None,
            audio: None,
            merge_started: false,
        }
    }

    /// 记录一个完成的半边。重复信号返回 false 并丢弃入参
    pub fn store_half(&mut self, role: HalfRole, payload: HalfPayload) -> bool {
        let slot = match role {
            HalfRole::Video => &mut self.video,
            HalfRole::Audio => &mut self.audio,
        };
        if slot.is_some() {
            warn!("半边 {} 的完成信号重复，已忽略", role.tag());
            return false;
        }
        *slot = Some(payload);
        true
    }

    /// 两个半边是否都已就位。完成检测只看占位状态，
    /// 与两个完成事件的到达顺序无关
    pub fn both_ready(&self) -> bool {
        self.video.is_some() && self.audio.is_some()
    }

    /// 第一次调用取走两个半边并锁住记录；之后永远返回 None，
    /// 保证同一任务至多发起一次合并
    pub fn begin_merge(&mut self) -> Option<(HalfPayload, HalfPayload)> {
        if self.merge_started || !self.both_ready() {
            return None;
        }
        self.merge_started = true;
        Some((self.video.take().unwrap(), self.audio.take().unwrap()))
    }
}

/// 合并协调器：纯粹的交接工作——布置输入、把进度回调接到事件
/// 通道、取回输出。输入缓冲归本函数所有，无论成败都在返回时释放
pub struct MergeCoordinator {
    muxer: Arc<dyn MuxCapability>,
}

impl MergeCoordinator {
    pub fn new(muxer: Arc<dyn MuxCapability>) -> Self {
        Self { muxer }
    }

    pub async fn run(
        &self,
        task_id: String,
        generation: u64,
        video: HalfPayload,
        audio: HalfPayload,
        duration: Option<f64>,
        events: UnboundedSender<TaskEvent>,
        cancel: CancellationToken,
    ) {
        debug!(
            "任务 {} 开始合并: 视频 {} 字节, 音频 {} 字节",
            task_id, video.size, audio.size
        );

        if cancel.is_cancelled() {
            let _ = events.send(TaskEvent::MergeFailed {
                id: task_id,
                generation,
                reason: DownloadError::Cancelled.to_string(),
            });
            return;
        }

        let progress_events = events.clone();
        let progress_id = task_id.clone();
        let progress: MuxProgressFn = Box::new(move |percent| {
            let _ = progress_events.send(TaskEvent::MergeProgress {
                id: progress_id.clone(),
                generation,
                percent,
            });
        });

        let result = self
            .muxer
            .mux(&task_id, &video.bytes, &audio.bytes, duration, progress)
            .await;

        // video/audio 在这里离开作用域，两个输入缓冲随之释放
        match result {
            Ok(bytes) => {
                let _ = events.send(TaskEvent::MergeFinished {
                    id: task_id,
                    generation,
                    bytes,
                });
            }
            Err(e) => {
                let _ = events.send(TaskEvent::MergeFailed {
                    id: task_id,
                    generation,
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: usize) -> HalfPayload {
        HalfPayload {
            bytes: vec![0u8; n],
            size: n as u64,
        }
    }

    #[test]
    fn test_both_ready_order_independent() {
        let mut a = PendingMerge::new("f", "mp4");
        assert!(a.store_half(HalfRole::Audio, payload(1)));
        assert!(!a.both_ready());
        assert!(a.store_half(HalfRole::Video, payload(2)));
        assert!(a.both_ready());

        let mut b = PendingMerge::new("f", "mp4");
        assert!(b.store_half(HalfRole::Video, payload(2)));
        assert!(!b.both_ready());
        assert!(b.store_half(HalfRole::Audio, payload(1)));
        assert!(b.both_ready());
    }

    #[test]
    fn test_duplicate_half_ignored() {
        let mut pm = PendingMerge::new("f", "mp4");
        assert!(pm.store_half(HalfRole::Video, payload(2)));
        // 同一半边的重复信号不覆盖也不报错
        assert!(!pm.store_half(HalfRole::Video, payload(99)));
        assert!(!pm.both_ready());
    }

    #[test]
    fn test_begin_merge_at_most_once() {
        let mut pm = PendingMerge::new("f", "mp4");
        pm.store_half(HalfRole::Video, payload(2));
        assert!(pm.begin_merge().is_none());

        pm.store_half(HalfRole::Audio, payload(1));
        let pair = pm.begin_merge();
        assert!(pair.is_some());
        // 第二次触发拿不到缓冲，合并不会重复发起
        assert!(pm.begin_merge().is_none());
    }
}
