//! 扫描协调器
//!
//! 限时扫描，按地址去重后把外设实时推送给调用方：
//! - 同一时刻只有一个扫描；重复 `start_scan` 返回 `AlreadyInProgress`
//! - 超时或 `stop_scan` 都会停止底层扫描，`Stopped` 信号只发一次
//! - 无线电不可用时立即失败，不产生任何副作用

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::ble::transport::{PeripheralHandle, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("Bluetooth radio is unavailable")]
    RadioUnavailable,

    #[error("Scanning is already in progress")]
    AlreadyInProgress,

    #[error("Failed to start scan: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStopReason {
    Timeout,
    /// `stop_scan` 或调用方丢弃了扫描流
    Cancelled,
    /// 底层扫描流自行结束
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Discovered(PeripheralHandle),
    Stopped(ScanStopReason),
}

pub type ScanStream = UnboundedReceiverStream<ScanEvent>;

struct ActiveScan {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveScan {
    /// 扫描任务在底层扫描停止后会自行取消令牌
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

pub struct ScanCoordinator<T: Transport> {
    transport: Arc<T>,
    active: Mutex<Option<ActiveScan>>,
    /// 当前扫描的令牌，供不加锁的状态查询
    current: watch::Sender<Option<CancellationToken>>,
}

impl<T: Transport> ScanCoordinator<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            active: Mutex::new(None),
            current: watch::Sender::new(None),
        }
    }

    /// 是否正在扫描，不等待进行中的 `start_scan` / `stop_scan`
    pub fn is_scanning(&self) -> bool {
        self.current
            .borrow()
            .as_ref()
            .is_some_and(|cancel| !cancel.is_cancelled())
    }

    /// 开始扫描，`timeout` 到期后自动停止
    pub async fn start_scan(&self, timeout: Duration) -> Result<ScanStream, ScanError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(ActiveScan::is_running) {
            info!("Scanning is already in progress");
            return Err(ScanError::AlreadyInProgress);
        }

        if !self.transport.radio_available().await {
            return Err(ScanError::RadioUnavailable);
        }

        let discoveries = self.transport.start_scan().await?;
        info!("Starting BLE scan for {} seconds", timeout.as_secs_f32());

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_scan(
            self.transport.clone(),
            discoveries,
            timeout,
            cancel.clone(),
            tx,
        ));
        self.current.send_replace(Some(cancel.clone()));
        *active = Some(ActiveScan { cancel, task });

        Ok(UnboundedReceiverStream::new(rx))
    }

    /// 停止扫描
    ///
    /// 返回时底层扫描已经停止。没有进行中的扫描时返回 `false`。
    pub async fn stop_scan(&self) -> bool {
        let mut active = self.active.lock().await;
        let Some(scan) = active.take() else {
            debug!("No ongoing scanning to stop");
            return false;
        };
        if !scan.is_running() {
            debug!("No ongoing scanning to stop");
            return false;
        }

        scan.cancel.cancel();
        self.current.send_replace(None);
        if let Err(e) = scan.task.await {
            warn!("Scan task ended abnormally: {}", e);
        }
        true
    }
}

async fn run_scan<T: Transport>(
    transport: Arc<T>,
    mut discoveries: BoxStream<'static, PeripheralHandle>,
    timeout: Duration,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<ScanEvent>,
) {
    let mut seen = HashSet::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let reason = loop {
        tokio::select! {
            biased;
            () = &mut deadline => break ScanStopReason::Timeout,
            () = cancel.cancelled() => break ScanStopReason::Cancelled,
            found = discoveries.next() => match found {
                Some(handle) => {
                    if !seen.insert(handle.address.clone()) {
                        trace!("Already reported {}", handle.address);
                        continue;
                    }
                    debug!(
                        "Peripheral found: addr={}, name='{}'",
                        handle.address,
                        handle.display_name()
                    );
                    if tx.send(ScanEvent::Discovered(handle)).is_err() {
                        debug!("Scan consumer went away");
                        break ScanStopReason::Cancelled;
                    }
                }
                None => break ScanStopReason::Ended,
            }
        }
    };

    drop(discoveries);
    if let Err(e) = transport.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
    cancel.cancel();

    info!(
        "Scan stopped ({:?}): found {} peripheral(s)",
        reason,
        seen.len()
    );
    let _ = tx.send(ScanEvent::Stopped(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fake::FakeTransport;

    fn handle(address: &str) -> PeripheralHandle {
        PeripheralHandle::new(address, Some(format!("dev {}", address)))
    }

    async fn collect(mut stream: ScanStream) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_duplicates_reported_once_and_timeout_stops_scan() {
        let transport = Arc::new(FakeTransport::new().with_peripherals(vec![
            handle("AA:BB:CC:DD:EE:01"),
            handle("AA:BB:CC:DD:EE:02"),
            handle("AA:BB:CC:DD:EE:01"),
        ]));
        let scanner = ScanCoordinator::new(transport.clone());

        let stream = scanner.start_scan(Duration::from_millis(50)).await.unwrap();
        let events = collect(stream).await;

        assert_eq!(
            events,
            vec![
                ScanEvent::Discovered(handle("AA:BB:CC:DD:EE:01")),
                ScanEvent::Discovered(handle("AA:BB:CC:DD:EE:02")),
                ScanEvent::Stopped(ScanStopReason::Timeout),
            ]
        );
        assert!(!transport.is_scanning());
        assert_eq!(transport.scans_stopped(), 1);
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_second_start_reports_already_in_progress() {
        let transport = Arc::new(FakeTransport::new());
        let scanner = ScanCoordinator::new(transport.clone());

        let _stream = scanner.start_scan(Duration::from_secs(30)).await.unwrap();
        let second = scanner.start_scan(Duration::from_secs(30)).await;

        assert_eq!(second.err(), Some(ScanError::AlreadyInProgress));
        assert_eq!(transport.scans_started(), 1);
        assert!(scanner.stop_scan().await);
    }

    #[tokio::test]
    async fn test_stop_scan_emits_single_stopped_signal() {
        let transport = Arc::new(FakeTransport::new());
        let scanner = ScanCoordinator::new(transport.clone());

        let stream = scanner.start_scan(Duration::from_secs(30)).await.unwrap();
        assert!(transport.advertise(handle("AA:BB:CC:DD:EE:03")));

        // 等待外设被转发后再停止
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scanner.stop_scan().await);
        assert!(!scanner.stop_scan().await);
        assert!(!transport.is_scanning());

        let events = collect(stream).await;
        assert_eq!(
            events,
            vec![
                ScanEvent::Discovered(handle("AA:BB:CC:DD:EE:03")),
                ScanEvent::Stopped(ScanStopReason::Cancelled),
            ]
        );
    }

    #[tokio::test]
    async fn test_nothing_emitted_after_timeout() {
        let transport = Arc::new(FakeTransport::new());
        let scanner = ScanCoordinator::new(transport.clone());

        let mut stream = scanner.start_scan(Duration::from_millis(20)).await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(ScanEvent::Stopped(ScanStopReason::Timeout))
        );

        assert!(!transport.advertise(handle("AA:BB:CC:DD:EE:04")));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_radio_off_fails_without_side_effects() {
        let transport = Arc::new(FakeTransport::new().with_radio(false));
        let scanner = ScanCoordinator::new(transport.clone());

        let result = scanner.start_scan(Duration::from_secs(1)).await;
        assert_eq!(result.err(), Some(ScanError::RadioUnavailable));
        assert_eq!(transport.scans_started(), 0);
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_restart_after_timeout() {
        let transport = Arc::new(FakeTransport::new());
        let scanner = ScanCoordinator::new(transport.clone());

        let first = scanner.start_scan(Duration::from_millis(10)).await.unwrap();
        collect(first).await;

        let second = scanner.start_scan(Duration::from_millis(10)).await;
        assert!(second.is_ok());
        assert_eq!(transport.scans_started(), 2);
    }
}
