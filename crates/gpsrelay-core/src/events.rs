//! 会话事件总线
//!
//! 基于 `tokio::sync::broadcast` 的有界总线：
//! - 每个订阅者都收到全部事件，同一订阅者内保持发布顺序
//! - `publish` 从不阻塞；落后的订阅者会丢失最旧的事件（记录警告日志）
//! - 不回放：订阅之前发布的事件不会送达
//!
//! 订阅的生命周期由订阅者持有的 [`EventStream`] 决定，丢弃即退订。

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use log::{trace, warn};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::ble::SessionError;
use crate::stream::GpsRecord;

/// 默认容量
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// 开始连接
    Connecting { address: String },
    /// 底层连接建立
    Connected,
    /// 服务发现完成
    ServicesDiscovered,
    /// 通知已启用，进入 Streaming
    NotificationsEnabled,
    /// 原始通知负载
    DataReceived(Vec<u8>),
    /// 解析出的定位记录
    FixReceived(GpsRecord),
    /// 主动断开中
    Disconnecting,
    Disconnected,
    Error(SessionError),
}

impl SessionEvent {
    /// 用于终端回显的文本
    pub fn display_text(&self) -> String {
        match self {
            SessionEvent::Connecting { address } => format!("Connecting to {}", address),
            SessionEvent::Connected => "Connected".to_string(),
            SessionEvent::ServicesDiscovered => "Services Discovered".to_string(),
            SessionEvent::NotificationsEnabled => "Notifications Enabled".to_string(),
            SessionEvent::DataReceived(data) => String::from_utf8_lossy(data).into_owned(),
            SessionEvent::FixReceived(record) => format!(
                "{} lat={:.6} lon={:.6}",
                record.name, record.latitude, record.longitude
            ),
            SessionEvent::Disconnecting => "Disconnecting".to_string(),
            SessionEvent::Disconnected => "Disconnected".to_string(),
            SessionEvent::Error(e) => format!("Error: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn publish(&self, event: SessionEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!("No subscribers for {:?}", event);
                0
            }
        }
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.tx.subscribe()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// 单个订阅者的事件流
pub struct EventStream {
    inner: BroadcastStream<SessionEvent>,
}

impl EventStream {
    /// 等待下一个事件；总线关闭后返回 `None`
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        futures_util::StreamExt::next(self).await
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!("Event subscriber lagged, {} oldest event(s) dropped", skipped);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
