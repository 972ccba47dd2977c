use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::downloader::error::DownloadError;
use crate::downloader::merge::{MuxCapability, MuxProgressFn};

/// 基于系统 FFmpeg 的混流实现：视频流拷贝，音频转码到固定码率，
/// fastart 布局，输出截断到较短的一路。
/// 每次调用独立布置临时目录，任务之间不共享任何可变状态
pub struct FfmpegMuxer;

impl FfmpegMuxer {
    /// 获取 ffmpeg 路径（支持环境变量），并确认可用
    async fn locate_ffmpeg() -> Result<String, DownloadError> {
        let ffmpeg_cmd = std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string());

        let ffmpeg_check = Command::new(&ffmpeg_cmd)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        if ffmpeg_check.is_err() || !ffmpeg_check.unwrap().success() {
            error!("❌ 未检测到 ffmpeg，请确保系统中已安装并配置了 ffmpeg 可执行路径。");
            error!("或者设置环境变量 FFMPEG_PATH 指向 ffmpeg 可执行文件路径");
            return Err(DownloadError::FfmpegNotFound);
        }
        Ok(ffmpeg_cmd)
    }

    async fn run_mux(
        ffmpeg_cmd: &str,
        video_path: &PathBuf,
        audio_path: &PathBuf,
        output_path: &PathBuf,
        duration: Option<f64>,
        progress: &MuxProgressFn,
    ) -> Result<Vec<u8>, DownloadError> {
        let mut child = Command::new(ffmpeg_cmd)
            .arg("-i")
            .arg(video_path)
            .arg("-i")
            .arg(audio_path)
            .arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg("192k")
            .arg("-movflags")
            .arg("+faststart")
            .arg("-shortest")
            .arg("-y")
            .arg("-progress")
            .arg("pipe:1")
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // 进度按 ffmpeg 自身的上报节奏透传，不做额外节流
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(value) = line.strip_prefix("out_time_us=") {
                    if let (Ok(us), Some(total)) = (value.trim().parse::<i64>(), duration) {
                        if total > 0.0 && us >= 0 {
                            let percent =
                                ((us as f64 / 1_000_000.0) / total * 100.0).min(99.0) as u8;
                            progress(percent);
                        }
                    }
                }
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            error!("❌ ffmpeg 混流失败，错误日志如下：\n{}", err_msg);
            return Err(DownloadError::MuxError(err_msg.to_string()));
        }
        progress(100);

        let merged = tokio::fs::read(output_path).await?;
        Ok(merged)
    }
}

#[async_trait]
impl MuxCapability for FfmpegMuxer {
    async fn mux(
        &self,
        task_id: &str,
        video: &[u8],
        audio: &[u8],
        duration: Option<f64>,
        progress: MuxProgressFn,
    ) -> Result<Vec<u8>, DownloadError> {
        let ffmpeg_cmd = Self::locate_ffmpeg().await?;

        let tmp_dir = std::env::temp_dir().join(format!("unidl-mux-{}", task_id));
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let video_path = tmp_dir.join("input_video.mp4");
        let audio_path = tmp_dir.join("input_audio.m4a");
        let output_path = tmp_dir.join("output.mp4");

        // 无论成败，临时输入输出都要在每条退出路径上清掉
        let result = async {
            tokio::fs::write(&video_path, video).await?;
            tokio::fs::write(&audio_path, audio).await?;

            debug!(
                "任务 {} 开始混流: 视频 {} 字节, 音频 {} 字节",
                task_id,
                video.len(),
                audio.len()
            );
            Self::run_mux(
                &ffmpeg_cmd,
                &video_path,
                &audio_path,
                &output_path,
                duration,
                &progress,
            )
            .await
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&tmp_dir).await {
            debug!("清理临时目录失败: {}", e);
        }

        match &result {
            Ok(bytes) => info!(
                "✅ 任务 {} 混流成功，输出 {} 字节",
                task_id,
                bytes.len()
            ),
            Err(e) => error!("任务 {} 混流失败: {}", task_id, e),
        }
        result
    }
}
