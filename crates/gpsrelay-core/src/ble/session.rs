//! 会话状态机
//!
//! 流程:
//! 1. 连接目标外设 (Connecting)
//! 2. 发现服务 (ServiceDiscovery)
//! 3. 找到通知特征并写 CCCD 启用通知 (SubscribingNotifications)
//! 4. 接收通知 → 分帧 → 解析 → 事件总线 / 持久化队列 (Streaming)
//!
//! 每个会话是一个独立的 tokio 任务，调用方命令与传输层回调都通过
//! 通道汇入该任务，所以状态转换天然串行。当前状态通过 `watch`
//! 发布，[`Session::state`] 是同步查询。
//!
//! 任何失败都进入 `Failed` 并释放连接，不会自动重试；
//! 丢弃 [`Session`] 等同于调用 [`Session::close`]。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::ble::transport::{DescriptorRef, GattService, LinkEvent, Transport};
use crate::ble::{
    CCCD_UUID, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, UART_SERVICE_UUID,
    UART_TX_CHAR_UUID, is_valid_address,
};
use crate::events::{EventBus, EventStream, SessionEvent};
use crate::persistence::PersistenceQueue;
use crate::stream::{DEFAULT_MAX_BUFFER, FrameError, Framer, Framing, ParseError, record};

/// 会话错误
///
/// `Frame` 和 `Record` 是流级错误，只上报不终止会话；其余错误都会让会话进入 `Failed`。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Bluetooth radio is unavailable")]
    RadioUnavailable,

    #[error("Invalid peripheral address: {0:?}")]
    InvalidAddress(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryError(String),

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Enabling notifications failed: {0}")]
    SubscriptionFailed(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Record(#[from] ParseError),
}

impl SessionError {
    /// 是否会终止会话
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Frame(_) | SessionError::Record(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    SubscribingNotifications,
    Streaming,
    Disconnecting,
    Disconnected,
    Failed(SessionError),
}

impl SessionState {
    /// `Disconnected` 与 `Failed` 是终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Scanning => write!(f, "scanning"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::ServiceDiscovery => write!(f, "service-discovery"),
            SessionState::SubscribingNotifications => write!(f, "subscribing"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Disconnecting => write!(f, "disconnecting"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Failed(e) => write!(f, "failed ({})", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 等待连接回调的上限
    pub connect_timeout: Duration,
    /// 服务发现与启用通知各自的上限
    pub discovery_timeout: Duration,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub framing: Framing,
    pub max_frame_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(15),
            service_uuid: UART_SERVICE_UUID,
            characteristic_uuid: UART_TX_CHAR_UUID,
            framing: Framing::default(),
            max_frame_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

enum Command {
    Close(oneshot::Sender<()>),
}

/// 一个活动会话的句柄
pub struct Session {
    address: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    bus: EventBus,
}

impl Session {
    /// 打开会话
    ///
    /// 地址非法或无线电不可用时立即失败且没有任何副作用；
    /// 否则进入 `Connecting` 并在后台推进状态机，进度通过 `bus` 上报。
    pub async fn open<T: Transport>(
        transport: Arc<T>,
        address: &str,
        config: SessionConfig,
        bus: EventBus,
        persistence: Option<PersistenceQueue>,
    ) -> Result<Self, SessionError> {
        if !is_valid_address(address) {
            return Err(SessionError::InvalidAddress(address.to_string()));
        }
        if !transport.radio_available().await {
            return Err(SessionError::RadioUnavailable);
        }

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (command_tx, command_rx) = mpsc::channel(8);

        info!("Opening session to {}", address);
        bus.publish(SessionEvent::Connecting {
            address: address.to_string(),
        });

        let driver = Driver {
            framer: Framer::new(config.framing, config.max_frame_buffer),
            transport,
            address: address.to_string(),
            config,
            bus: bus.clone(),
            persistence,
            state: state_tx,
            commands: command_rx,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            address: address.to_string(),
            commands: command_tx,
            state: state_rx,
            bus,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// 状态变化通知
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// 等待状态满足条件；会话任务已退出时返回最后的状态
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(&SessionState) -> bool,
    ) -> SessionState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| predicate(s)).await.map(|s| s.clone());
        reached.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// 关闭会话
    ///
    /// 任何状态下都可调用且幂等。返回后连接已释放，不会再有事件发出。
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack_tx)).await.is_err() {
            trace!("Session {} already finished", self.address);
            return;
        }
        let _ = ack_rx.await;
    }
}

enum Interrupt {
    /// 调用方关闭；`None` 表示所有句柄都已丢弃
    Close(Option<oneshot::Sender<()>>),
    PeerDisconnected,
}

enum Halt {
    Failed(SessionError),
    Interrupted(Interrupt),
}

type LinkEvents = BoxStream<'static, LinkEvent>;

struct Driver<T: Transport> {
    transport: Arc<T>,
    address: String,
    config: SessionConfig,
    bus: EventBus,
    persistence: Option<PersistenceQueue>,
    framer: Framer,
    state: watch::Sender<SessionState>,
    commands: mpsc::Receiver<Command>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        match self.establish().await {
            Ok((link, events)) => self.stream(link, events).await,
            Err((Halt::Failed(err), link)) => self.fail(err, link).await,
            Err((Halt::Interrupted(Interrupt::Close(ack)), link)) => {
                self.shutdown(link, ack).await;
            }
            Err((Halt::Interrupted(Interrupt::PeerDisconnected), link)) => {
                self.peer_disconnected(link).await;
            }
        }
    }

    /// Connecting → ServiceDiscovery → SubscribingNotifications → Streaming
    async fn establish(&mut self) -> Result<(T::Link, LinkEvents), (Halt, Option<T::Link>)> {
        let transport = self.transport.clone();

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            transport.connect(&self.address),
        );
        let link = match interruptible(&mut self.commands, None, connect).await {
            Err(interrupt) => return Err((Halt::Interrupted(interrupt), None)),
            Ok(Err(_)) => {
                let err = SessionError::ConnectTimeout(self.config.connect_timeout);
                return Err((Halt::Failed(err), None));
            }
            Ok(Ok(Err(e))) => {
                return Err((Halt::Failed(SessionError::ConnectFailed(e.to_string())), None));
            }
            Ok(Ok(Ok(link))) => link,
        };

        let mut events = match transport.link_events(&link).await {
            Ok(events) => events,
            Err(e) => {
                let err = SessionError::ConnectFailed(e.to_string());
                return Err((Halt::Failed(err), Some(link)));
            }
        };
        self.transition(SessionState::ServiceDiscovery, SessionEvent::Connected);

        let discover = tokio::time::timeout(
            self.config.discovery_timeout,
            transport.discover_services(&link),
        );
        let services = match interruptible(&mut self.commands, Some(&mut events), discover).await {
            Err(interrupt) => return Err((Halt::Interrupted(interrupt), Some(link))),
            Ok(Err(_)) => {
                let err = SessionError::ServiceDiscoveryError(format!(
                    "timed out after {:?}",
                    self.config.discovery_timeout
                ));
                return Err((Halt::Failed(err), Some(link)));
            }
            Ok(Ok(Err(e))) => {
                let err = SessionError::ServiceDiscoveryError(e.to_string());
                return Err((Halt::Failed(err), Some(link)));
            }
            Ok(Ok(Ok(services))) => services,
        };
        debug!("{}: discovered {} service(s)", self.address, services.len());
        self.transition(
            SessionState::SubscribingNotifications,
            SessionEvent::ServicesDiscovered,
        );

        let Some((target, value)) = notification_target(&services, &self.config) else {
            let err = SessionError::CharacteristicNotFound {
                service: self.config.service_uuid,
                characteristic: self.config.characteristic_uuid,
            };
            return Err((Halt::Failed(err), Some(link)));
        };

        let subscribe = tokio::time::timeout(
            self.config.discovery_timeout,
            transport.write_descriptor(&link, target, &value),
        );
        match interruptible(&mut self.commands, Some(&mut events), subscribe).await {
            Err(interrupt) => return Err((Halt::Interrupted(interrupt), Some(link))),
            Ok(Err(_)) => {
                let err = SessionError::SubscriptionFailed(format!(
                    "descriptor write timed out after {:?}",
                    self.config.discovery_timeout
                ));
                return Err((Halt::Failed(err), Some(link)));
            }
            Ok(Ok(Err(e))) => {
                return Err((
                    Halt::Failed(SessionError::SubscriptionFailed(e.to_string())),
                    Some(link),
                ));
            }
            Ok(Ok(Ok(()))) => {}
        }
        self.transition(SessionState::Streaming, SessionEvent::NotificationsEnabled);

        Ok((link, events))
    }

    async fn stream(mut self, link: T::Link, mut events: LinkEvents) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let ack = command.map(|Command::Close(ack)| ack);
                    self.shutdown(Some(link), ack).await;
                    return;
                }
                event = events.next() => match event {
                    Some(LinkEvent::Notification { characteristic, value }) => {
                        if characteristic == self.config.characteristic_uuid {
                            self.on_notification(value);
                        } else {
                            trace!("Ignoring notification from {}", characteristic);
                        }
                    }
                    Some(LinkEvent::Disconnected) | None => {
                        self.peer_disconnected(Some(link)).await;
                        return;
                    }
                }
            }
        }
    }

    fn on_notification(&mut self, value: Vec<u8>) {
        trace!("{}: notification ({} bytes)", self.address, value.len());
        self.bus.publish(SessionEvent::DataReceived(value.clone()));

        let outcome = self.framer.feed(&value);
        let observed_at = now_millis();
        for frame in outcome.frames {
            match record::parse(&frame, observed_at) {
                Ok(record) => {
                    debug!(
                        "Fix from {}: {} ({}, {})",
                        self.address, record.name, record.latitude, record.longitude
                    );
                    if let Some(queue) = &self.persistence {
                        queue.enqueue(record.clone());
                    }
                    self.bus.publish(SessionEvent::FixReceived(record));
                }
                Err(e) => {
                    warn!("{}: {}", self.address, e);
                    self.bus.publish(SessionEvent::Error(e.into()));
                }
            }
        }

        if let Some(overflow) = outcome.overflow {
            self.bus.publish(SessionEvent::Error(overflow.into()));
        }
    }

    async fn shutdown(mut self, link: Option<T::Link>, ack: Option<oneshot::Sender<()>>) {
        if ack.is_none() {
            debug!("All handles to session {} dropped, tearing down", self.address);
        }
        self.transition(SessionState::Disconnecting, SessionEvent::Disconnecting);
        self.release(link).await;
        self.transition(SessionState::Disconnected, SessionEvent::Disconnected);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn peer_disconnected(mut self, link: Option<T::Link>) {
        info!("Peripheral {} disconnected", self.address);
        self.release(link).await;
        self.transition(SessionState::Disconnected, SessionEvent::Disconnected);
    }

    async fn fail(mut self, err: SessionError, link: Option<T::Link>) {
        warn!("Session {} failed: {}", self.address, err);
        self.release(link).await;
        self.transition(SessionState::Failed(err.clone()), SessionEvent::Error(err));
    }

    async fn release(&mut self, link: Option<T::Link>) {
        let Some(link) = link else {
            return;
        };
        match tokio::time::timeout(self.config.connect_timeout, self.transport.disconnect(&link))
            .await
        {
            Ok(Ok(())) => debug!("Released link to {}", self.address),
            Ok(Err(e)) => debug!("Disconnect from {} reported: {}", self.address, e),
            Err(_) => warn!("Disconnect from {} timed out", self.address),
        }
    }

    fn transition(&mut self, next: SessionState, event: SessionEvent) {
        let previous = self.state.send_replace(next.clone());
        info!("Session {}: {} -> {}", self.address, previous, next);
        self.bus.publish(event);
    }
}

/// 在等待 `fut` 的同时监听关闭命令与链路事件
///
/// Streaming 之前到达的通知会被丢弃。
async fn interruptible<F: Future>(
    commands: &mut mpsc::Receiver<Command>,
    mut events: Option<&mut LinkEvents>,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Ok(output),
            command = commands.recv() => {
                return Err(Interrupt::Close(command.map(|Command::Close(ack)| ack)));
            }
            event = next_link_event(&mut events) => match event {
                Some(LinkEvent::Notification { characteristic, .. }) => {
                    debug!(
                        "Dropping notification from {} received before streaming",
                        characteristic
                    );
                }
                Some(LinkEvent::Disconnected) | None => return Err(Interrupt::PeerDisconnected),
            }
        }
    }
}

async fn next_link_event(events: &mut Option<&mut LinkEvents>) -> Option<LinkEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn notification_target(
    services: &[GattService],
    config: &SessionConfig,
) -> Option<(DescriptorRef, [u8; 2])> {
    let characteristic = services
        .iter()
        .filter(|s| s.uuid == config.service_uuid)
        .flat_map(|s| &s.characteristics)
        .find(|c| c.uuid == config.characteristic_uuid)?;

    let value = if characteristic.notify {
        ENABLE_NOTIFICATION_VALUE
    } else if characteristic.indicate {
        ENABLE_INDICATION_VALUE
    } else {
        warn!(
            "Characteristic {} supports neither notify nor indicate",
            characteristic.uuid
        );
        return None;
    };

    Some((
        DescriptorRef {
            service: config.service_uuid,
            characteristic: config.characteristic_uuid,
            descriptor: CCCD_UUID,
        },
        value,
    ))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::GattCharacteristic;

    fn service(uuid: Uuid, characteristic: GattCharacteristic) -> GattService {
        GattService {
            uuid,
            characteristics: vec![characteristic],
        }
    }

    fn characteristic(notify: bool, indicate: bool) -> GattCharacteristic {
        GattCharacteristic {
            uuid: UART_TX_CHAR_UUID,
            notify,
            indicate,
            descriptors: vec![CCCD_UUID],
        }
    }

    #[test]
    fn test_notification_target_prefers_notify() {
        let services = vec![service(UART_SERVICE_UUID, characteristic(true, true))];
        let (target, value) = notification_target(&services, &SessionConfig::default()).unwrap();
        assert_eq!(target.descriptor, CCCD_UUID);
        assert_eq!(value, ENABLE_NOTIFICATION_VALUE);
    }

    #[test]
    fn test_notification_target_falls_back_to_indicate() {
        let services = vec![service(UART_SERVICE_UUID, characteristic(false, true))];
        let (_, value) = notification_target(&services, &SessionConfig::default()).unwrap();
        assert_eq!(value, ENABLE_INDICATION_VALUE);
    }

    #[test]
    fn test_notification_target_requires_matching_service() {
        let other = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
        let services = vec![service(other, characteristic(true, false))];
        assert!(notification_target(&services, &SessionConfig::default()).is_none());

        let services = vec![service(UART_SERVICE_UUID, characteristic(false, false))];
        assert!(notification_target(&services, &SessionConfig::default()).is_none());
    }

    #[test]
    fn test_stream_errors_are_not_fatal() {
        let overflow: SessionError = FrameError::FrameOverflow {
            buffered: 10,
            limit: 5,
        }
        .into();
        assert!(!overflow.is_fatal());
        assert!(!SessionError::Record(ParseError::MalformedRecord("x".into())).is_fatal());
        assert!(SessionError::ConnectTimeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Disconnected.is_terminal());
        assert!(SessionState::Failed(SessionError::RadioUnavailable).is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
    }
}
