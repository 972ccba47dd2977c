use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use uni_downloader::api::ApiClient;
use uni_downloader::common::logger::PrettyLogger;
use uni_downloader::downloader::models::{TaskRequest, TaskStatus};
use uni_downloader::downloader::registry::TaskRegistry;
use uni_downloader::downloader::DiskSink;
use uni_downloader::persist::JsonStateStore;
use uni_downloader::post_process::FfmpegMuxer;

mod cli;

/// 轮询一个任务直到终态，期间用进度条展示下载/合并进度
async fn watch_task(registry: &Arc<TaskRegistry>, task_id: &str) -> anyhow::Result<TaskStatus> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    loop {
        let Some(task) = registry.get_task(task_id).await else {
            anyhow::bail!("任务不存在: {}", task_id);
        };

        match task.status {
            TaskStatus::Merging => {
                pb.set_position(task.merge_progress as u64);
                pb.set_message(format!("合并中 ({})", task.filename));
            }
            _ => {
                // 组合任务取两个半边中较慢的一路展示
                let progress = if task.needs_merge {
                    task.progress.min(task.audio_progress)
                } else {
                    task.progress
                };
                pb.set_position(progress as u64);
                pb.set_message(format!("{} | {}", task.speed_text, task.eta_text));
            }
        }

        if task.status.is_terminal() {
            match &task.status {
                TaskStatus::Completed => pb.finish_with_message("下载完成"),
                _ => pb.abandon_with_message(format!(
                    "任务终止: {}",
                    task.fail_reason.unwrap_or_else(|| "未知原因".to_string())
                )),
            }
            return Ok(task.status);
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = cli::Cli::parse();
    info!("开始下载: {}", args.url);

    // 打开状态文件并收拾上次会话留下的残局
    let store = JsonStateStore::open(&args.state_file).await?;
    let client = ApiClient::new(&args.base_url);
    let registry = TaskRegistry::new(
        client,
        store,
        Arc::new(FfmpegMuxer),
        Arc::new(DiskSink::new(&args.output_dir)),
        args.concurrency,
    );

    let interrupted = registry.reconcile_interrupted().await?;
    if !interrupted.is_empty() {
        PrettyLogger::warning(format!(
            "有 {} 个任务在上次会话中中断，需重新提交",
            interrupted.len()
        ));
    }

    let task_ids = if args.list {
        registry.start_list(&args.url, &args.itag).await?
    } else {
        let mut req = TaskRequest::new(&args.url, &args.itag);
        req.id = args.id.clone();
        req.ext = args.ext.clone();
        req.start_byte = args.start_byte;
        vec![registry.start(req).await?]
    };

    let mut completed = Vec::new();
    let mut failed = 0usize;
    for task_id in &task_ids {
        PrettyLogger::separator();
        PrettyLogger::task_status(task_id, "开始");
        match watch_task(&registry, task_id).await? {
            TaskStatus::Completed => completed.push(task_id.clone()),
            status => {
                failed += 1;
                PrettyLogger::error(format!("任务 {} 结束于 {:?}", task_id, status));
            }
        }
    }

    if !completed.is_empty() {
        PrettyLogger::completion_summary(completed);
    }
    if failed > 0 {
        anyhow::bail!("{} 个任务未成功", failed);
    }
    Ok(())
}
