//! 实时事件流
//!
//! 把 SSE 长连接适配为显式的订阅对象：消费方通过 [`EventSubscription::next`] 按服务端
//! 发出的顺序读取事件，`close()` 幂等，drop 时自动关闭；生产方 [`EventFeed`] 能感知关闭，
//! 关闭后不再投递任何消息。

use std::fmt::Display;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::StageEvent;
use crate::{AppError, AppResult};

/// 订阅中的一项：事件或流错误
pub type StreamItem = AppResult<StageEvent>;

/// 订阅的生产方
pub struct EventFeed {
    trace_id: String,
    sender: mpsc::Sender<StreamItem>,
    closed: CancellationToken,
}

impl EventFeed {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// 投递一项；订阅已关闭时返回 false
    pub async fn send(&self, item: StreamItem) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            res = self.sender.send(item) => res.is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// 等待订阅被关闭
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// 关闭订阅的句柄，可在不持有订阅本身时关闭它
#[derive(Debug, Clone)]
pub struct SubscriptionCloser(CancellationToken);

impl SubscriptionCloser {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// trace id 对应的事件订阅
pub struct EventSubscription {
    trace_id: String,
    receiver: mpsc::Receiver<StreamItem>,
    closed: CancellationToken,
}

impl EventSubscription {
    /// 创建一对生产方/订阅
    pub fn channel(trace_id: impl Into<String>, buffer: usize) -> (EventFeed, Self) {
        let trace_id = trace_id.into();
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let closed = CancellationToken::new();

        let feed = EventFeed {
            trace_id: trace_id.clone(),
            sender,
            closed: closed.clone(),
        };
        let subscription = Self {
            trace_id,
            receiver,
            closed,
        };
        (feed, subscription)
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// 下一项；订阅关闭或流结束后返回 `None`
    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            item = self.receiver.recv() => item,
        }
    }

    /// 关闭订阅，可重复调用
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closer(&self) -> SubscriptionCloser {
        SubscriptionCloser(self.closed.clone())
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// 增量 SSE 解码器，只关心 `data` 字段
///
/// 多行 `data:` 以 `\n` 拼接，空行分发一条消息；注释行与 `event`/`id`/`retry` 字段忽略。
/// 未完成的行与未分发的 data 合计超过上限后 [`SseDecoder::overflowed`] 为真。
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
    limit: usize,
}

/// 单条未完成消息允许缓存的最大字节数
pub const MAX_PENDING_BYTES: usize = 256 * 1024;

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            data: Vec::new(),
            data_len: 0,
            limit,
        }
    }

    /// 缓存的未完成数据是否已超过上限
    pub fn overflowed(&self) -> bool {
        self.buffer.len() + self.data_len > self.limit
    }

    /// 输入一段字节，返回其中完整消息的 data 负载
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    messages.push(self.data.join("\n"));
                    self.data.clear();
                    self.data_len = 0;
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            if field == "data" {
                self.data_len += value.len();
                self.data.push(value.to_string());
            }
        }

        messages
    }
}

/// 在后台任务中把字节流解码为事件并投递到新订阅
///
/// 非 JSON 消息跳过；传输错误或超长消息作为 [`AppError::Stream`] 投递后结束；
/// 订阅关闭时立即停止读取并释放连接。
pub(crate) fn spawn_sse_pump<S, B, E>(trace_id: &str, stream: S, buffer: usize) -> EventSubscription
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (feed, subscription) = EventSubscription::channel(trace_id, buffer);
    tokio::spawn(pump(feed, stream, SseDecoder::new()));
    subscription
}

async fn pump<S, B, E>(feed: EventFeed, stream: S, mut decoder: SseDecoder)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut stream = Box::pin(stream);

    loop {
        let chunk = tokio::select! {
            biased;
            _ = feed.closed() => break,
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for payload in decoder.feed(bytes.as_ref()) {
                    match serde_json::from_str::<StageEvent>(&payload) {
                        Ok(event) => {
                            if !feed.send(Ok(event)).await {
                                return;
                            }
                        }
                        Err(e) => warn!(
                            "Skipping malformed message on stream {}: {}",
                            feed.trace_id, e
                        ),
                    }
                }
                if decoder.overflowed() {
                    warn!("Event stream {} sent an oversized message", feed.trace_id);
                    let message = format!("message exceeds {} bytes", decoder.limit);
                    let _ = feed.send(Err(AppError::Stream(message))).await;
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("Event stream {} failed: {}", feed.trace_id, e);
                let _ = feed.send(Err(AppError::Stream(e.to_string()))).await;
                break;
            }
            None => {
                debug!("Event stream {} ended", feed.trace_id);
                break;
            }
        }
    }
}
