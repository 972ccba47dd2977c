use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::models::{DownloadMeta, DownloadRequest};
use crate::api::ApiClient;
use crate::parser;
use crate::persist::{SnapshotStore, StoreError, TaskSnapshot};

use super::error::DownloadError;
use super::itag::{is_audio_itag, split_itag};
use super::merge::{HalfPayload, MergeCoordinator, MuxCapability, PendingMerge};
use super::models::{
    HalfRole, HalfStatus, ProgressUpdate, TaskEntry, TaskEvent, TaskRequest, TaskStatus,
};
use super::sampler;
use super::stream::consume_stream;
use super::FileSink;

/// 任务注册表：状态机的宿主，每个任务 ID 一条记录。
/// 任务表是唯一的共享可变状态，全部修改都经由这里的操作；
/// 消费者与合并协调器只通过事件通道向上报告，由单一事件循环
/// 串行应用并持久化，同一任务的落盘写不会交叠
pub struct TaskRegistry {
    tasks: Arc<Mutex<DashMap<String, Arc<Mutex<TaskEntry>>>>>,
    pending_merges: Arc<Mutex<HashMap<String, PendingMerge>>>,
    cancel_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    store: Arc<dyn SnapshotStore>,
    muxer: Arc<dyn MuxCapability>,
    sink: Arc<dyn FileSink>,
    client: ApiClient,
    semaphore: Arc<Semaphore>, // 控制并发数
    events_tx: UnboundedSender<TaskEvent>,
    /// 注册代号发生器。重新提交换新代号，旧一代的事件全部作废
    next_generation: AtomicU64,
}

impl TaskRegistry {
    pub fn new(
        client: ApiClient,
        store: Arc<dyn SnapshotStore>,
        muxer: Arc<dyn MuxCapability>,
        sink: Arc<dyn FileSink>,
        max_concurrent: usize,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            tasks: Arc::new(Mutex::new(DashMap::new())),
            pending_merges: Arc::new(Mutex::new(HashMap::new())),
            cancel_tokens: Arc::new(Mutex::new(HashMap::new())),
            store,
            muxer,
            sink,
            client,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            events_tx,
            next_generation: AtomicU64::new(1),
        });

        let looper = Arc::clone(&registry);
        tokio::spawn(async move {
            looper.event_loop(events_rx).await;
        });

        registry
    }

    /// 消费者与协调器向上报告事件的通道
    pub fn event_sender(&self) -> UnboundedSender<TaskEvent> {
        self.events_tx.clone()
    }

    /// 注册一个任务：同步校验、立即赋予建议文件名、建立半边与
    /// 待合并记录。不发起任何网络请求
    pub async fn register(&self, req: &TaskRequest) -> Result<String, DownloadError> {
        let (task_id, _generation) = self.register_inner(req).await?;
        Ok(task_id)
    }

    async fn register_inner(&self, req: &TaskRequest) -> Result<(String, u64), DownloadError> {
        // 输入错误同步失败，绝不重试
        if req.url.trim().is_empty() {
            return Err(DownloadError::InvalidUrl("URL 不能为空".to_string()));
        }
        let platform = parser::identify_platform(&req.url)
            .map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;

        let task_id = req
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // 同一 ID 重新提交视为覆盖：停掉旧的在途工作再重建。
        // 旧一代消费者被取消后还会吐出失败/进度事件，
        // 新记录换了代号，那些事件到了事件循环会被丢弃
        if let Some(old) = self.cancel_tokens.lock().await.remove(&task_id) {
            warn!("任务 {} 重新提交，取消旧的在途下载", task_id);
            old.cancel();
        }
        self.pending_merges.lock().await.remove(&task_id);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // YouTube 链接先归一化成标准 watch 形式
        let canonical_url = match platform {
            parser::Platform::Youtube => {
                parser::normalize_youtube_url(&req.url).unwrap_or_else(|| req.url.clone())
            }
            _ => req.url.clone(),
        };

        // 元数据到达之前 UI 就要有可展示的名字；YouTube 用视频 ID，
        // 路径末段对 watch 链接只会是 "watch"
        let filename = match platform {
            parser::Platform::Youtube => parser::extract_video_id(&canonical_url)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| parser::suggest_filename(&canonical_url, platform)),
            _ => parser::suggest_filename(&canonical_url, platform),
        };
        let ext = req.ext.clone().unwrap_or_else(|| "mp4".to_string());

        let mut entry = TaskEntry::new(&task_id, &canonical_url, &req.itag, &filename, &ext);
        entry.generation = generation;
        entry.thumbnail = req.thumbnail.clone();
        entry.part_of_list = req.part_of_list;

        if let Some((video_itag, audio_itag)) = split_itag(&req.itag) {
            debug!(
                "任务 {} 为组合格式: 视频 {} + 音频 {}",
                task_id, video_itag, audio_itag
            );
            if !is_audio_itag(&audio_itag) {
                warn!("音频侧 {} 不在常见的纯音频 itag 表里", audio_itag);
            }
            entry.needs_merge = true;
            entry.video_status = Some(HalfStatus::Downloading);
            entry.audio_status = Some(HalfStatus::Downloading);
            self.pending_merges
                .lock()
                .await
                .insert(task_id.clone(), PendingMerge::new(&filename, &ext));
        }

        {
            let tasks = self.tasks.lock().await;
            tasks.insert(task_id.clone(), Arc::new(Mutex::new(entry)));
        }
        self.cancel_tokens
            .lock()
            .await
            .insert(task_id.clone(), CancellationToken::new());

        let mut patch = TaskSnapshot::new(&task_id);
        patch.url = Some(canonical_url);
        patch.filename = Some(filename);
        patch.status = Some(TaskStatus::Starting);
        patch.itag = Some(req.itag.clone());
        patch.format = Some(ext);
        patch.thumbnail = req.thumbnail.clone();
        patch.is_part_of_list = Some(req.part_of_list);
        self.persist(patch).await;

        Ok((task_id, generation))
    }

    /// 提交并启动一个任务：注册后拆分 itag，发起一路或两路并发
    /// 的流消费，同时带外拉取元数据
    pub async fn start(self: &Arc<Self>, req: TaskRequest) -> Result<String, DownloadError> {
        let (task_id, generation) = self.register_inner(&req).await?;

        let registry = Arc::clone(self);
        let id = task_id.clone();
        tokio::spawn(async move {
            registry.orchestrate(id, generation, req).await;
        });

        Ok(task_id)
    }

    /// 展开播放列表并逐条提交
    pub async fn start_list(
        self: &Arc<Self>,
        list_url: &str,
        itag: &str,
    ) -> Result<Vec<String>, DownloadError> {
        let list = self.client.expand_list(list_url).await?;
        info!("播放列表《{}》共 {} 条", list.playlist_name, list.count);

        let mut ids = Vec::with_capacity(list.songs.len());
        for item in list.songs {
            let mut req = TaskRequest::new(&item.url, item.itag.as_deref().unwrap_or(itag));
            req.part_of_list = true;
            ids.push(self.start(req).await?);
        }
        Ok(ids)
    }

    async fn orchestrate(self: Arc<Self>, task_id: String, generation: u64, req: TaskRequest) {
        // 并发额度拿到后才真正开始
        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let _ = self.events_tx.send(TaskEvent::StreamFailed {
                    id: task_id,
                    generation,
                    reason: DownloadError::SemaphoreError.to_string(),
                });
                return;
            }
        };

        let cancel = match self.cancel_tokens.lock().await.get(&task_id) {
            Some(token) => token.clone(),
            None => return, // 注册后立即被覆盖或取消
        };

        self.set_status(&task_id, generation, TaskStatus::Processing)
            .await;

        // 元数据走带外：无论何时返回，只修饰展示名称，不影响进度
        {
            let registry = Arc::clone(&self);
            let id = task_id.clone();
            let url = req.url.clone();
            let itag = req.itag.clone();
            tokio::spawn(async move {
                match registry.client.fetch_meta(&url, Some(&itag)).await {
                    Ok(meta) => {
                        let _ = registry.events_tx.send(TaskEvent::MetaResolved {
                            id,
                            generation,
                            meta,
                        });
                    }
                    Err(e) => debug!("任务 {} 元数据获取失败（忽略）: {}", id, e),
                }
            });
        }

        self.set_status(&task_id, generation, TaskStatus::Downloading)
            .await;

        match split_itag(&req.itag) {
            Some((video_itag, audio_itag)) => {
                // 两个半边必须重叠传输，串行会把时延翻倍
                let video = tokio::spawn(Arc::clone(&self).run_consumer(
                    task_id.clone(),
                    generation,
                    req.clone(),
                    Some(video_itag),
                    Some(HalfRole::Video),
                    cancel.clone(),
                ));
                let audio = tokio::spawn(Arc::clone(&self).run_consumer(
                    task_id.clone(),
                    generation,
                    req.clone(),
                    Some(audio_itag),
                    Some(HalfRole::Audio),
                    cancel.clone(),
                ));
                let _ = tokio::join!(video, audio);
            }
            None => {
                Arc::clone(&self)
                    .run_consumer(task_id.clone(), generation, req, None, None, cancel)
                    .await;
            }
        }
    }

    /// 驱动一条流到终点，结果以事件形式上报
    async fn run_consumer(
        self: Arc<Self>,
        task_id: String,
        generation: u64,
        req: TaskRequest,
        sub_itag: Option<String>,
        role: Option<HalfRole>,
        cancel: CancellationToken,
    ) {
        let mut dreq = DownloadRequest::new(&task_id, &req.url, None);
        dreq.itag = sub_itag.or_else(|| Some(req.itag.clone()));
        dreq.start_byte = req.start_byte;
        dreq.format = req.format.clone();
        dreq.ext = req.ext.clone();

        let result = async {
            let handle = self.client.download_stream(&dreq).await?;

            // 响应头可能带服务端确认的文件名与格式
            if matches!(role, None | Some(HalfRole::Video))
                && (handle.filename.is_some() || handle.format.is_some())
            {
                let _ = self.events_tx.send(TaskEvent::MetaResolved {
                    id: task_id.clone(),
                    generation,
                    meta: DownloadMeta {
                        filename: handle.filename.clone(),
                        ext: handle.format.clone(),
                        ..Default::default()
                    },
                });
            }

            let size_hint = handle.response.content_length().unwrap_or(0);
            let stream = handle.response.bytes_stream();
            consume_stream(
                stream,
                &task_id,
                generation,
                role,
                size_hint,
                &self.events_tx,
                &cancel,
            )
            .await
        }
        .await;

        let event = match (result, role) {
            (Ok(out), Some(role)) => TaskEvent::HalfCompleted {
                id: task_id,
                generation,
                role,
                bytes: out.bytes,
                size: out.size,
            },
            (Ok(out), None) => TaskEvent::StreamCompleted {
                id: task_id,
                generation,
                bytes: out.bytes,
                size: out.size,
            },
            (Err(e), Some(role)) => TaskEvent::HalfFailed {
                id: task_id,
                generation,
                role,
                reason: e.to_string(),
            },
            (Err(e), None) => TaskEvent::StreamFailed {
                id: task_id,
                generation,
                reason: e.to_string(),
            },
        };
        let _ = self.events_tx.send(event);
    }

    // ------------------------------------------------------------------
    // 事件循环：所有任务状态的单一写入方
    // ------------------------------------------------------------------

    async fn event_loop(self: Arc<Self>, mut events_rx: UnboundedReceiver<TaskEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                TaskEvent::Progress {
                    id,
                    generation,
                    update,
                } => self.on_progress(&id, generation, update).await,
                TaskEvent::MetaResolved {
                    id,
                    generation,
                    meta,
                } => self.on_meta(&id, generation, meta).await,
                TaskEvent::StreamCompleted {
                    id,
                    generation,
                    bytes,
                    size,
                } => self.finalize(&id, generation, bytes, size).await,
                TaskEvent::StreamFailed {
                    id,
                    generation,
                    reason,
                } => self.fail(&id, generation, None, reason, false).await,
                TaskEvent::HalfCompleted {
                    id,
                    generation,
                    role,
                    bytes,
                    size,
                } => self.on_half_complete(&id, generation, role, bytes, size).await,
                TaskEvent::HalfFailed {
                    id,
                    generation,
                    role,
                    reason,
                } => self.fail(&id, generation, Some(role), reason, false).await,
                TaskEvent::MergeProgress {
                    id,
                    generation,
                    percent,
                } => self.on_merge_progress(&id, generation, percent).await,
                TaskEvent::MergeFinished {
                    id,
                    generation,
                    bytes,
                } => {
                    let size = bytes.len() as u64;
                    self.finalize(&id, generation, bytes, size).await
                }
                TaskEvent::MergeFailed {
                    id,
                    generation,
                    reason,
                } => self.fail(&id, generation, None, reason, true).await,
            }
        }
    }

    /// 按角色并入一次进度快照。视频与音频各写各的字段组，
    /// 两边以任意顺序到达结果相同
    async fn on_progress(&self, task_id: &str, generation: u64, update: ProgressUpdate) {
        let Some(lock) = self.entry_arc(task_id).await else {
            return;
        };

        let patch = {
            let mut entry = lock.lock().await;
            // 终态冻结：迟到或旧一代的快照一律丢弃
            if entry.generation != generation || entry.status.is_terminal() {
                return;
            }
            if !matches!(entry.status, TaskStatus::Downloading | TaskStatus::Merging) {
                entry.status = TaskStatus::Downloading;
            }

            match update.role {
                None | Some(HalfRole::Video) => {
                    // Downloading 期间进度单调不减
                    entry.progress = entry.progress.max(update.progress);
                    entry.speed = update.speed;
                    entry.speed_text = update.speed_text;
                    entry.eta_text = update.eta_text;
                    entry.total_size = update.total_size;
                    entry.downloaded = update.downloaded;
                }
                Some(HalfRole::Audio) => {
                    entry.audio_progress = entry.audio_progress.max(update.progress);
                    entry.audio_speed_text = update.speed_text;
                    entry.audio_eta_text = update.eta_text;
                    entry.audio_total_size = update.total_size;
                    entry.audio_downloaded = update.downloaded;
                }
            }

            let mut patch = TaskSnapshot::new(task_id);
            patch.status = Some(entry.status.clone());
            patch.filesize = Some(entry.total_size);
            patch.downloaded_size = Some(entry.downloaded);
            if entry.needs_merge {
                patch.audio_filesize = Some(entry.audio_total_size);
                patch.audio_downloaded_size = Some(entry.audio_downloaded);
            }
            patch
        };

        self.persist(patch).await;
    }

    /// 元数据（或响应头）到达，修饰展示名称
    async fn on_meta(&self, task_id: &str, generation: u64, meta: DownloadMeta) {
        let Some(lock) = self.entry_arc(task_id).await else {
            return;
        };

        let patch = {
            let mut entry = lock.lock().await;
            if entry.generation != generation || entry.status.is_terminal() {
                return;
            }
            if let Some(name) = meta.title.or(meta.filename) {
                if !name.is_empty() {
                    entry.filename = name;
                }
            }
            if let Some(ext) = meta.ext {
                if !ext.is_empty() {
                    entry.ext = ext;
                }
            }
            if meta.duration.is_some() {
                entry.duration = meta.duration;
            }
            if meta.thumbnail.is_some() {
                entry.thumbnail = meta.thumbnail;
            }

            let mut patch = TaskSnapshot::new(task_id);
            patch.filename = Some(entry.filename.clone());
            patch.format = Some(entry.ext.clone());
            patch.download_name = Some(format!("{}.{}", entry.filename, entry.ext));
            patch.duration = entry.duration;
            patch.thumbnail = entry.thumbnail.clone();
            patch
        };

        self.persist(patch).await;
    }

    /// 一个半边完成。完成检测看两个半边的占位状态而不是
    /// "第二个事件"，同一拍到达或重复信号都不会把合并触发两次
    async fn on_half_complete(
        &self,
        task_id: &str,
        generation: u64,
        role: HalfRole,
        bytes: Vec<u8>,
        size: u64,
    ) {
        let Some(lock) = self.entry_arc(task_id).await else {
            return;
        };

        let duration = {
            let mut entry = lock.lock().await;
            if entry.generation != generation || entry.status.is_terminal() {
                return;
            }
            match role {
                HalfRole::Video => {
                    entry.video_status = Some(HalfStatus::Completed);
                    entry.progress = 100.0;
                    entry.total_size = size;
                    entry.downloaded = size;
                }
                HalfRole::Audio => {
                    entry.audio_status = Some(HalfStatus::Completed);
                    entry.audio_progress = 100.0;
                    entry.audio_total_size = size;
                    entry.audio_downloaded = size;
                }
            }
            entry.duration
        };
        debug!("任务 {} 的 {} 半边完成: {} 字节", task_id, role.tag(), size);

        let pair = {
            let mut pendings = self.pending_merges.lock().await;
            let Some(pending) = pendings.get_mut(task_id) else {
                warn!("任务 {} 没有待合并记录，忽略半边完成", task_id);
                return;
            };
            pending.store_half(role, HalfPayload { bytes, size });
            pending.begin_merge()
        };

        let Some((video, audio)) = pair else {
            // 另一半还没到，或合并已经发起过
            return;
        };

        self.set_status(task_id, generation, TaskStatus::Merging).await;

        let cancel = self
            .cancel_tokens
            .lock()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        let coordinator = MergeCoordinator::new(Arc::clone(&self.muxer));
        let events = self.events_tx.clone();
        let id = task_id.to_string();
        tokio::spawn(async move {
            coordinator
                .run(id, generation, video, audio, duration, events, cancel)
                .await;
        });
    }

    async fn on_merge_progress(&self, task_id: &str, generation: u64, percent: u8) {
        let Some(lock) = self.entry_arc(task_id).await else {
            return;
        };
        let mut entry = lock.lock().await;
        if entry.generation != generation || entry.status.is_terminal() {
            return;
        }
        // 合并进度与下载进度互不相干
        entry.merge_progress = percent.min(100);
    }

    /// 收尾：冻结进度与速度字段、落盘带停止时间的最终快照、
    /// 把文件交付出去。交付恰好一次，重复事件被终态检查挡住
    async fn finalize(&self, task_id: &str, generation: u64, bytes: Vec<u8>, size: u64) {
        let Some(lock) = self.entry_arc(task_id).await else {
            return;
        };

        let (patch, delivery_name) = {
            let mut entry = lock.lock().await;
            if entry.generation != generation || entry.status.is_terminal() {
                return;
            }
            entry.status = TaskStatus::Completed;
            entry.progress = 100.0;
            entry.speed = 0.0;
            entry.speed_text = "0 B/s".to_string();
            entry.eta_text = sampler::format_eta(0.0);
            if entry.needs_merge {
                entry.merge_progress = 100;
            } else {
                entry.total_size = size;
                entry.downloaded = size;
            }
            entry.stopped_at = Some(Utc::now());

            let mut patch = TaskSnapshot::new(task_id);
            patch.status = Some(TaskStatus::Completed);
            patch.filesize = Some(entry.total_size);
            patch.downloaded_size = Some(entry.downloaded);
            if entry.needs_merge {
                patch.audio_filesize = Some(entry.audio_total_size);
                patch.audio_downloaded_size = Some(entry.audio_downloaded);
            }
            patch.stop_time = entry.stopped_at;
            patch.download_name = Some(format!("{}.{}", entry.filename, entry.ext));
            (patch, format!("{}.{}", entry.filename, entry.ext))
        };

        // 待合并记录与取消令牌都到了寿命终点
        self.pending_merges.lock().await.remove(task_id);
        self.cancel_tokens.lock().await.remove(task_id);

        self.persist(patch).await;

        match self.sink.deliver(&delivery_name, &bytes).await {
            Ok(path) => info!("✅ 任务 {} 完成: {:?}", task_id, path),
            Err(e) => error!("❌ 任务 {} 文件交付失败: {}", task_id, e),
        }
    }

    /// 失败：整个任务失败（组合任务不交付缺音频或缺视频的半成品），
    /// 最后一次进度保留用于诊断，半边缓冲全部释放
    async fn fail(
        &self,
        task_id: &str,
        generation: u64,
        role: Option<HalfRole>,
        reason: String,
        merge_phase: bool,
    ) {
        let Some(lock) = self.entry_arc(task_id).await else {
            return;
        };

        let patch = {
            let mut entry = lock.lock().await;
            if entry.generation != generation || entry.status.is_terminal() {
                return;
            }
            entry.status = if merge_phase {
                TaskStatus::MergeFailed
            } else {
                TaskStatus::Failed
            };
            match role {
                Some(HalfRole::Video) => entry.video_status = Some(HalfStatus::Failed),
                Some(HalfRole::Audio) => entry.audio_status = Some(HalfStatus::Failed),
                None => {}
            }
            entry.fail_reason = Some(reason.clone());
            // 进度保留用于诊断，速度与 ETA 随终态归零
            entry.speed = 0.0;
            entry.speed_text = "0 B/s".to_string();
            entry.eta_text = sampler::format_eta(0.0);
            entry.stopped_at = Some(Utc::now());

            let mut patch = TaskSnapshot::new(task_id);
            patch.status = Some(entry.status.clone());
            patch
        };

        error!("❌ 任务 {} 失败: {}", task_id, reason);

        // 另一个半边立即停，缓冲随待合并记录一起释放
        if let Some(token) = self.cancel_tokens.lock().await.remove(task_id) {
            token.cancel();
        }
        self.pending_merges.lock().await.remove(task_id);

        self.persist(patch).await;
    }

    // ------------------------------------------------------------------
    // 对外查询与控制
    // ------------------------------------------------------------------

    /// 显式取消（终态 cancelled），令牌会同时停掉两路流与混流调用
    pub async fn cancel(&self, task_id: &str) -> Result<(), DownloadError> {
        let lock = self
            .entry_arc(task_id)
            .await
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))?;

        {
            let mut entry = lock.lock().await;
            if entry.status.is_terminal() {
                return Ok(());
            }
            entry.status = TaskStatus::Cancelled;
            entry.speed = 0.0;
            entry.speed_text = "0 B/s".to_string();
            entry.eta_text = sampler::format_eta(0.0);
            entry.stopped_at = Some(Utc::now());
        }

        if let Some(token) = self.cancel_tokens.lock().await.remove(task_id) {
            token.cancel();
        }
        self.pending_merges.lock().await.remove(task_id);

        let mut patch = TaskSnapshot::new(task_id);
        patch.status = Some(TaskStatus::Cancelled);
        self.persist(patch).await;

        info!("任务 {} 已取消", task_id);
        Ok(())
    }

    pub async fn get_status(&self, task_id: &str) -> Option<TaskStatus> {
        let lock = self.entry_arc(task_id).await?;
        let status = lock.lock().await.status.clone();
        Some(status)
    }

    /// 当前任务记录的一份拷贝，UI 轮询用
    pub async fn get_task(&self, task_id: &str) -> Option<TaskEntry> {
        let lock = self.entry_arc(task_id).await?;
        let entry = lock.lock().await.clone();
        Some(entry)
    }

    /// 轮询直到任务进入终态
    pub async fn wait_for_terminal(&self, task_id: &str) -> Result<TaskStatus, DownloadError> {
        loop {
            match self.get_status(task_id).await {
                Some(status) if status.is_terminal() => return Ok(status),
                Some(_) => tokio::time::sleep(Duration::from_millis(200)).await,
                None => return Err(DownloadError::TaskNotFound(task_id.to_string())),
            }
        }
    }

    /// 会话恢复：没有完成标记的历史任务一律归为中断。
    /// 返回被标记的任务 ID
    pub async fn reconcile_interrupted(&self) -> Result<Vec<String>, StoreError> {
        let mut marked = Vec::new();
        for snapshot in self.store.get_all().await? {
            let terminal = matches!(
                snapshot.status,
                Some(TaskStatus::Completed)
                    | Some(TaskStatus::Failed)
                    | Some(TaskStatus::MergeFailed)
                    | Some(TaskStatus::Cancelled)
                    | Some(TaskStatus::Interrupted)
            );
            if terminal || snapshot.stop_time.is_some() {
                continue;
            }
            let mut patch = TaskSnapshot::new(&snapshot.id);
            patch.status = Some(TaskStatus::Interrupted);
            self.store.put(patch).await?;
            marked.push(snapshot.id);
        }
        if !marked.is_empty() {
            info!("上次会话有 {} 个任务被标记为中断", marked.len());
        }
        Ok(marked)
    }

    // ------------------------------------------------------------------

    async fn entry_arc(&self, task_id: &str) -> Option<Arc<Mutex<TaskEntry>>> {
        let tasks = self.tasks.lock().await;
        tasks.get(task_id).map(|entry| Arc::clone(entry.value()))
    }

    async fn set_status(&self, task_id: &str, generation: u64, status: TaskStatus) {
        let Some(lock) = self.entry_arc(task_id).await else {
            return;
        };
        {
            let mut entry = lock.lock().await;
            if entry.generation != generation || entry.status.is_terminal() {
                return;
            }
            entry.status = status.clone();
        }
        let mut patch = TaskSnapshot::new(task_id);
        patch.status = Some(status);
        self.persist(patch).await;
    }

    /// 落盘失败只记日志不中断下载，内存里的任务状态才是权威
    async fn persist(&self, patch: TaskSnapshot) {
        if let Err(e) = self.store.put(patch).await {
            warn!("持久化快照失败（已忽略）: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopMuxer;

    #[async_trait]
    impl MuxCapability for NoopMuxer {
        async fn mux(
            &self,
            _task_id: &str,
            video: &[u8],
            audio: &[u8],
            _duration: Option<f64>,
            _progress: super::super::merge::MuxProgressFn,
        ) -> Result<Vec<u8>, DownloadError> {
            let mut out = video.to_vec();
            out.extend_from_slice(audio);
            Ok(out)
        }
    }

    #[derive(Default)]
    struct CountingSink {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl super::super::FileSink for CountingSink {
        async fn deliver(&self, filename: &str, _bytes: &[u8]) -> Result<PathBuf, DownloadError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from(filename))
        }
    }

    fn test_registry() -> (Arc<TaskRegistry>, Arc<MemoryStore>) {
        let store = MemoryStore::new();
        let registry = TaskRegistry::new(
            ApiClient::new("http://127.0.0.1:1/api"),
            store.clone(),
            Arc::new(NoopMuxer),
            Arc::new(CountingSink::default()),
            4,
        );
        (registry, store)
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let (registry, _store) = test_registry();

        // 空 URL 同步失败
        let req = TaskRequest::new("", "18");
        assert!(registry.register(&req).await.is_err());

        // 不支持的平台同样在发起任何 IO 之前失败
        let req = TaskRequest::new("https://example.com/v/1", "18");
        assert!(registry.register(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_register_single_format() {
        let (registry, store) = test_registry();

        let mut req = TaskRequest::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "18");
        req.id = Some("t-single".to_string());
        let id = registry.register(&req).await.unwrap();
        assert_eq!(id, "t-single");

        let task = registry.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Starting);
        assert!(!task.needs_merge);
        assert!(task.video_status.is_none());
        assert!(task.audio_status.is_none());
        // 注册即有可展示的文件名
        assert!(!task.filename.is_empty());

        let snap = store.get(&id).await.unwrap().unwrap();
        assert_eq!(snap.status, Some(TaskStatus::Starting));
        assert_eq!(snap.itag.as_deref(), Some("18"));
    }

    #[tokio::test]
    async fn test_register_combined_format_creates_halves() {
        let (registry, _store) = test_registry();

        let mut req = TaskRequest::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "313+140");
        req.id = Some("t-combined".to_string());
        let id = registry.register(&req).await.unwrap();

        let task = registry.get_task(&id).await.unwrap();
        assert!(task.needs_merge);
        assert_eq!(task.video_status, Some(HalfStatus::Downloading));
        assert_eq!(task.audio_status, Some(HalfStatus::Downloading));
    }

    #[tokio::test]
    async fn test_cancel_reaches_terminal_state() {
        let (registry, store) = test_registry();

        let mut req = TaskRequest::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "313+140");
        req.id = Some("t-cancel".to_string());
        let id = registry.register(&req).await.unwrap();

        registry.cancel(&id).await.unwrap();
        let task = registry.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.speed, 0.0);

        // 取消是幂等的
        registry.cancel(&id).await.unwrap();
        let snap = store.get(&id).await.unwrap().unwrap();
        assert_eq!(snap.status, Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_reconcile_marks_unfinished_as_interrupted() {
        let (registry, store) = test_registry();

        // 上次会话留下的记录：一条下载中、一条已完成
        let mut left_over = TaskSnapshot::new("t-old");
        left_over.status = Some(TaskStatus::Downloading);
        store.put(left_over).await.unwrap();

        let mut done = TaskSnapshot::new("t-done");
        done.status = Some(TaskStatus::Completed);
        done.stop_time = Some(Utc::now());
        store.put(done).await.unwrap();

        let marked = registry.reconcile_interrupted().await.unwrap();
        assert_eq!(marked, vec!["t-old".to_string()]);

        let snap = store.get("t-old").await.unwrap().unwrap();
        assert_eq!(snap.status, Some(TaskStatus::Interrupted));
        let snap = store.get("t-done").await.unwrap().unwrap();
        assert_eq!(snap.status, Some(TaskStatus::Completed));
    }
}
