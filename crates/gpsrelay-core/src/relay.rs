//! 中继工作流
//!
//! 高层 API 封装完整的中继流程:
//! 1. 限时扫描附近的外设
//! 2. 选定地址后停止扫描并打开会话
//! 3. 会话把定位记录发布到事件总线，并交给持久化队列
//!
//! 同一时刻最多一个会话；打开新会话会先关闭旧会话。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{Mutex, watch};

use crate::ble::{
    ScanCoordinator, ScanError, ScanStream, Session, SessionConfig, SessionError, SessionState,
    Transport,
};
use crate::config::RelaySettings;
use crate::events::{EventBus, EventStream};
use crate::persistence::PersistenceQueue;

pub struct Relay<T: Transport> {
    transport: Arc<T>,
    bus: EventBus,
    scanner: ScanCoordinator<T>,
    session_config: SessionConfig,
    scan_timeout: Duration,
    persistence: Option<PersistenceQueue>,
    session: Mutex<Option<Session>>,
    /// 当前会话的状态，`connect` / `close` 持锁期间也能读取
    current: watch::Sender<Option<watch::Receiver<SessionState>>>,
}

impl<T: Transport> Relay<T> {
    pub fn new(transport: Arc<T>, session_config: SessionConfig, bus: EventBus) -> Self {
        Self {
            scanner: ScanCoordinator::new(transport.clone()),
            transport,
            bus,
            session_config,
            scan_timeout: Duration::from_secs(10),
            persistence: None,
            session: Mutex::new(None),
            current: watch::Sender::new(None),
        }
    }

    /// 按配置构造，包括持久化队列
    pub fn from_settings(transport: Arc<T>, settings: &RelaySettings) -> anyhow::Result<Self> {
        let bus = EventBus::new(settings.session.event_capacity);
        let mut relay = Self::new(transport, settings.session_config(), bus)
            .with_scan_timeout(settings.scan_timeout());

        if let Some(sink) = settings.persistence_sink()? {
            // 所有队列句柄随 Relay 与会话释放后，写入任务自行退出
            let (queue, _worker) = PersistenceQueue::spawn(
                sink,
                settings.store_layout(),
                settings.persistence.queue_capacity,
            );
            relay = relay.with_persistence(queue);
        }
        Ok(relay)
    }

    pub fn with_persistence(mut self, queue: PersistenceQueue) -> Self {
        self.persistence = Some(queue);
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// 当前状态
    ///
    /// 有会话时返回会话状态；否则扫描中为 `Scanning`，其余为 `Idle`。
    /// 不会等待进行中的 `connect` 或 `close`。
    pub fn state(&self) -> SessionState {
        if let Some(state) = self.current.borrow().as_ref() {
            return state.borrow().clone();
        }
        if self.scanner.is_scanning() {
            SessionState::Scanning
        } else {
            SessionState::Idle
        }
    }

    pub async fn start_scan(&self) -> Result<ScanStream, ScanError> {
        self.scanner.start_scan(self.scan_timeout).await
    }

    pub async fn start_scan_for(&self, timeout: Duration) -> Result<ScanStream, ScanError> {
        self.scanner.start_scan(timeout).await
    }

    /// 停止扫描；没有进行中的扫描时返回 `false`
    pub async fn stop_scan(&self) -> bool {
        self.scanner.stop_scan().await
    }

    /// 连接外设
    ///
    /// 先停止进行中的扫描并关闭已有会话，再打开新会话。
    pub async fn connect(&self, address: &str) -> Result<(), SessionError> {
        let mut slot = self.session.lock().await;

        if self.scanner.stop_scan().await {
            info!("Stopped scan before connecting to {}", address);
        }
        if let Some(previous) = slot.take() {
            debug!("Closing previous session to {}", previous.address());
            previous.close().await;
            self.current.send_replace(None);
        }

        let session = Session::open(
            self.transport.clone(),
            address,
            self.session_config.clone(),
            self.bus.clone(),
            self.persistence.clone(),
        )
        .await?;
        self.current.send_replace(Some(session.watch_state()));
        *slot = Some(session);
        Ok(())
    }

    /// 关闭当前会话；没有会话时什么都不做
    pub async fn close(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.close().await;
            self.current.send_replace(None);
        }
    }

    pub async fn session_address(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.address().to_string())
    }

    /// 等待当前会话进入终态并返回该状态；没有会话时返回 `Idle`
    pub async fn wait_until_finished(&self) -> SessionState {
        let rx = self.session.lock().await.as_ref().map(Session::watch_state);
        let Some(mut rx) = rx else {
            return SessionState::Idle;
        };
        let reached = rx.wait_for(SessionState::is_terminal).await.map(|s| s.clone());
        reached.unwrap_or_else(|_| rx.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fake::FakeTransport;

    fn relay(transport: FakeTransport) -> Relay<FakeTransport> {
        Relay::new(
            Arc::new(transport),
            SessionConfig::default(),
            EventBus::default(),
        )
    }

    async fn wait_streaming(relay: &Relay<FakeTransport>) {
        let slot = relay.session.lock().await;
        let state = slot
            .as_ref()
            .unwrap()
            .wait_for_state(|s| *s == SessionState::Streaming || s.is_terminal())
            .await;
        assert_eq!(state, SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_state_reports_scanning_then_idle() {
        let relay = relay(FakeTransport::new());
        assert_eq!(relay.state(), SessionState::Idle);

        let _scan = relay.start_scan_for(Duration::from_secs(30)).await.unwrap();
        assert_eq!(relay.state(), SessionState::Scanning);

        assert!(relay.stop_scan().await);
        assert_eq!(relay.state(), SessionState::Idle);
        assert!(!relay.stop_scan().await);
    }

    #[tokio::test]
    async fn test_connect_stops_active_scan() {
        let relay = relay(FakeTransport::new());
        let _scan = relay.start_scan_for(Duration::from_secs(30)).await.unwrap();

        relay.connect("AA:BB:CC:DD:EE:FF").await.unwrap();

        assert!(!relay.transport().is_scanning());
        assert_eq!(relay.transport().scans_stopped(), 1);
        assert_eq!(
            relay.session_address().await.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        relay.close().await;
    }

    #[tokio::test]
    async fn test_second_connect_closes_previous_session() {
        let relay = relay(FakeTransport::new());

        relay.connect("AA:BB:CC:DD:EE:01").await.unwrap();
        wait_streaming(&relay).await;
        relay.connect("AA:BB:CC:DD:EE:02").await.unwrap();
        wait_streaming(&relay).await;

        assert_eq!(relay.transport().disconnects(), 1);
        assert_eq!(
            relay.session_address().await.as_deref(),
            Some("AA:BB:CC:DD:EE:02")
        );

        relay.close().await;
        assert_eq!(relay.state(), SessionState::Idle);
        assert_eq!(relay.transport().disconnects(), 2);
    }

    #[tokio::test]
    async fn test_state_readable_while_session_slot_is_held() {
        let relay = relay(FakeTransport::new());
        relay.connect("AA:BB:CC:DD:EE:01").await.unwrap();
        wait_streaming(&relay).await;

        // connect/close 关闭旧会话时会一直持有该锁
        let slot = relay.session.lock().await;
        assert_eq!(relay.state(), SessionState::Streaming);
        relay.transport().drop_link();
        drop(slot);

        assert_eq!(relay.wait_until_finished().await, SessionState::Disconnected);
        assert_eq!(relay.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_without_session_is_noop() {
        let relay = relay(FakeTransport::new());
        relay.close().await;
        assert_eq!(relay.state(), SessionState::Idle);
        assert_eq!(relay.wait_until_finished().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_address_leaves_relay_idle() {
        let relay = relay(FakeTransport::new());
        let result = relay.connect("not-an-address").await;
        assert_eq!(
            result,
            Err(SessionError::InvalidAddress("not-an-address".to_string()))
        );
        assert_eq!(relay.state(), SessionState::Idle);
        assert_eq!(relay.transport().connects(), 0);
    }
}
