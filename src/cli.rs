use clap::Parser;
use std::path::PathBuf;

/// 多平台视频下载器
#[derive(Parser, Debug)]
#[command(name = "unidl")]
#[command(version = "0.1")]
#[command(about = "一个多平台视频下载与合流工具", long_about = None)]
pub struct Cli {
    /// 媒体链接 (支持 YouTube / TikTok / Instagram / Facebook / X)
    #[arg(long, value_name = "URL")]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub url: String,

    /// 格式标识，形如 "18" 或组合格式 "313+140"
    #[arg(long, value_name = "ITAG")]
    #[arg(default_value = "best")]
    #[arg(help = "组合格式会拆成视频+音频两路并发下载后合并")]
    pub itag: String,

    /// 任务 ID (可选，重新提交同一 ID 会覆盖旧记录)
    #[arg(long, value_name = "ID")]
    pub id: Option<String>,

    /// 后端服务地址
    #[arg(long, value_name = "URL")]
    #[arg(default_value = "http://127.0.0.1:8000/api")]
    pub base_url: String,

    /// 文件保存目录
    #[arg(long, value_name = "DIR")]
    #[arg(default_value = ".")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// 输出扩展名 (可选)
    #[arg(long, value_name = "EXT")]
    pub ext: Option<String>,

    /// 续传偏移字节数
    #[arg(long, value_name = "BYTES", default_value_t = 0)]
    pub start_byte: u64,

    /// 将 URL 作为播放列表展开并批量下载
    #[arg(long)]
    pub list: bool,

    /// 状态文件路径
    #[arg(long, value_name = "FILE")]
    #[arg(default_value = "state.json")]
    pub state_file: PathBuf,

    #[arg(long, value_name = "并发数", default_value_t = 3)]
    pub concurrency: usize,
}
