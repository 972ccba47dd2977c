use std::time::Instant;

use futures_util::{Stream, StreamExt};
use lazy_static::lazy_static;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::DownloadError;
use super::models::{HalfRole, ProgressUpdate, TaskEvent};
use super::sampler::ProgressSampler;

lazy_static! {
    // 流首块可能以带外标记开头，紧跟真正的载荷
    static ref CONTENT_LENGTH_RE: regex::bytes::Regex =
        regex::bytes::Regex::new(r"^\[CONTENT-LENGTH:(\d+)\]").unwrap();
    static ref SERVER_ERROR_RE: regex::bytes::Regex =
        regex::bytes::Regex::new(r"^\[ERROR\]").unwrap();
}

/// 一条流消费完毕后的产物
#[derive(Debug)]
pub struct StreamOutcome {
    pub bytes: Vec<u8>,
    pub size: u64,
}

/// 把一条分块 HTTP 响应体消费到底。
///
/// 首块要做两件事：识别并剥掉 `[CONTENT-LENGTH:<n>]` 前缀（含括号，
/// 剥完剩下的就是载荷），以及识别服务端在流内上报的 `[ERROR]` 标记。
/// 之后的每一块都累加进缓冲并喂给采样器，采样器吐出的快照按角色
/// 打标后经事件通道上报。任何流错误立即终止，半成品字节直接丢弃。
pub async fn consume_stream<S, B, E>(
    mut stream: S,
    task_id: &str,
    generation: u64,
    role: Option<HalfRole>,
    size_hint: u64,
    events: &UnboundedSender<TaskEvent>,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, DownloadError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut sampler = ProgressSampler::new(size_hint, Instant::now());
    let mut buffer: Vec<u8> = Vec::new();
    let mut downloaded: u64 = 0;
    let mut is_first_chunk = true;

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let chunk = chunk.map_err(|e| DownloadError::StreamError(e.to_string()))?;
        let mut payload: &[u8] = chunk.as_ref();

        if is_first_chunk {
            is_first_chunk = false;

            if SERVER_ERROR_RE.is_match(payload) {
                let msg = String::from_utf8_lossy(&payload[7..]).into_owned();
                return Err(DownloadError::ServerError(msg));
            }

            // 只在每条流的首块检查一次长度标记
            if let Some(caps) = CONTENT_LENGTH_RE.captures(payload) {
                let whole = caps.get(0).unwrap();
                let digits = String::from_utf8_lossy(&caps[1]).into_owned();
                if let Ok(total) = digits.parse::<u64>() {
                    debug!("任务 {} 首块携带权威大小: {}", task_id, total);
                    sampler.set_total_size(total);
                }
                // 恰好剥掉匹配到的前缀，剩余部分仍是本块载荷
                payload = &payload[whole.end()..];
            }
        }

        downloaded += payload.len() as u64;
        buffer.extend_from_slice(payload);

        if let Some(snap) = sampler.observe(Instant::now(), downloaded) {
            let _ = events.send(TaskEvent::Progress {
                id: task_id.to_string(),
                generation,
                update: ProgressUpdate {
                    role,
                    progress: snap.progress,
                    speed: snap.speed,
                    speed_text: snap.speed_text,
                    eta_text: snap.eta_text,
                    total_size: snap.total_size,
                    downloaded: snap.downloaded,
                },
            });
        }
    }

    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    debug!("任务 {} 流消费完成，共 {} 字节", task_id, downloaded);
    Ok(StreamOutcome {
        bytes: buffer,
        size: downloaded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::sync::mpsc;

    type ChunkResult = Result<Vec<u8>, std::io::Error>;

    fn chunks(parts: Vec<&[u8]>) -> impl Stream<Item = ChunkResult> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(p.to_vec())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_marker_stripped_exactly_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let first = b"[CONTENT-LENGTH:10]hello".to_vec();
        let s = chunks(vec![&first, b"world"]);
        let out = consume_stream(s, "t1", 0, None, 0, &tx, &cancel).await.unwrap();

        // 标记不出现在装配结果里，载荷完整
        assert_eq!(out.bytes, b"helloworld");
        assert_eq!(out.size, 10);
    }

    #[tokio::test]
    async fn test_no_marker_first_chunk_untouched() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let s = chunks(vec![b"hello", b"world"]);
        let out = consume_stream(s, "t1", 0, None, 0, &tx, &cancel).await.unwrap();

        assert_eq!(out.bytes, b"helloworld");
        assert_eq!(out.size, 10);
    }

    #[tokio::test]
    async fn test_marker_only_checked_on_first_chunk() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // 第二块里的同样前缀属于载荷，不得剥掉
        let s = chunks(vec![b"abc", b"[CONTENT-LENGTH:5]def"]);
        let out = consume_stream(s, "t1", 0, None, 0, &tx, &cancel).await.unwrap();

        assert_eq!(out.bytes, b"abc[CONTENT-LENGTH:5]def");
    }

    #[tokio::test]
    async fn test_total_bytes_match_sum() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let parts: Vec<Vec<u8>> = vec![vec![1u8; 7], vec![2u8; 13], vec![3u8; 80]];
        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        let out = consume_stream(chunks(refs), "t1", 0, None, 0, &tx, &cancel)
            .await
            .unwrap();

        assert_eq!(out.size, 100);
        assert_eq!(out.bytes.len(), 100);
    }

    #[tokio::test]
    async fn test_server_error_marker_fails_stream() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let s = chunks(vec![b"[ERROR]format not available"]);
        let err = consume_stream(s, "t1", 0, None, 0, &tx, &cancel)
            .await
            .unwrap_err();

        match err {
            DownloadError::ServerError(msg) => assert_eq!(msg, "format not available"),
            other => panic!("意外的错误类型: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_error_discards_partial_bytes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let items: Vec<ChunkResult> = vec![
            Ok(b"partial".to_vec()),
            Err(std::io::Error::other("connection reset")),
        ];
        let err = consume_stream(stream::iter(items), "t1", 0, None, 0, &tx, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::StreamError(_)));
    }

    #[tokio::test]
    async fn test_cancelled_stream_aborts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let s = chunks(vec![b"hello"]);
        let err = consume_stream(s, "t1", 0, None, 0, &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }
}
