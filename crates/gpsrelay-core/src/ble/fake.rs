//! 可编程的合成传输层
//!
//! 用于测试和 `gpsrelay demo`：连接、服务发现、启用通知每一步都可以
//! 设定为成功、失败或挂起，通知负载与对端断开由调用方注入。

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::ble::transport::{
    DescriptorRef, GattCharacteristic, GattService, LinkEvent, PeripheralHandle, Transport,
    TransportError,
};
use crate::ble::{CCCD_UUID, DISABLE_NOTIFICATION_VALUE, UART_SERVICE_UUID, UART_TX_CHAR_UUID};
use crate::stream::GpsRecord;

/// 单个步骤的预设行为
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Fail(String),
    /// 永不返回，用于触发超时
    Hang,
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub address: String,
}

struct FakeState {
    radio_on: bool,
    peripherals: Vec<PeripheralHandle>,
    connect: Step,
    discovery: Step,
    subscribe: Step,
    services: Vec<GattService>,
    payloads: Vec<Vec<u8>>,
    scan_tx: Option<mpsc::UnboundedSender<PeripheralHandle>>,
    link_tx: Option<mpsc::UnboundedSender<LinkEvent>>,
    subscribed: Option<Uuid>,
    descriptor_writes: Vec<(DescriptorRef, Vec<u8>)>,
    scans_started: usize,
    scans_stopped: usize,
    connects: usize,
    disconnects: usize,
}

pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    /// 无线电开启、提供 NUS 服务、每一步都成功
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                radio_on: true,
                peripherals: Vec::new(),
                connect: Step::Succeed,
                discovery: Step::Succeed,
                subscribe: Step::Succeed,
                services: vec![uart_service()],
                payloads: Vec::new(),
                scan_tx: None,
                link_tx: None,
                subscribed: None,
                descriptor_writes: Vec::new(),
                scans_started: 0,
                scans_stopped: 0,
                connects: 0,
                disconnects: 0,
            }),
        }
    }

    /// 带示例外设和一段定位数据，供 demo 使用
    pub fn with_sample_data() -> Self {
        Self::new()
            .with_peripherals(vec![
                PeripheralHandle::new("C4:4F:33:12:A0:01", Some("GPS-Tracker A1".to_string())),
                PeripheralHandle::new("C4:4F:33:12:A0:02", None),
            ])
            .with_payloads(sample_payloads())
    }

    pub fn with_radio(self, on: bool) -> Self {
        self.state().radio_on = on;
        self
    }

    pub fn with_peripherals(self, peripherals: Vec<PeripheralHandle>) -> Self {
        self.state().peripherals = peripherals;
        self
    }

    pub fn with_connect(self, step: Step) -> Self {
        self.state().connect = step;
        self
    }

    pub fn with_discovery(self, step: Step) -> Self {
        self.state().discovery = step;
        self
    }

    pub fn with_subscribe(self, step: Step) -> Self {
        self.state().subscribe = step;
        self
    }

    pub fn with_services(self, services: Vec<GattService>) -> Self {
        self.state().services = services;
        self
    }

    /// 启用通知后立即送达的负载
    pub fn with_payloads(self, payloads: Vec<Vec<u8>>) -> Self {
        self.state().payloads = payloads;
        self
    }

    /// 向进行中的扫描推送一个外设；没有扫描时返回 `false`
    pub fn advertise(&self, handle: PeripheralHandle) -> bool {
        self.state()
            .scan_tx
            .as_ref()
            .is_some_and(|tx| tx.send(handle).is_ok())
    }

    /// 在当前连接上发送一条 NUS TX 通知
    pub fn notify(&self, value: &[u8]) -> bool {
        self.notify_on(UART_TX_CHAR_UUID, value)
    }

    pub fn notify_on(&self, characteristic: Uuid, value: &[u8]) -> bool {
        self.send_link_event(LinkEvent::Notification {
            characteristic,
            value: value.to_vec(),
        })
    }

    /// 模拟对端断开
    pub fn drop_link(&self) -> bool {
        let sent = self.send_link_event(LinkEvent::Disconnected);
        self.state().link_tx = None;
        sent
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scan_tx.is_some()
    }

    pub fn scans_started(&self) -> usize {
        self.state().scans_started
    }

    pub fn scans_stopped(&self) -> usize {
        self.state().scans_stopped
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// 当前已启用通知的特征
    pub fn subscribed(&self) -> Option<Uuid> {
        self.state().subscribed
    }

    pub fn descriptor_writes(&self) -> Vec<(DescriptorRef, Vec<u8>)> {
        self.state().descriptor_writes.clone()
    }

    fn send_link_event(&self, event: LinkEvent) -> bool {
        self.state()
            .link_tx
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// 三条定位：第二条跨两个通知，中间夹一条坏记录
fn sample_payloads() -> Vec<Vec<u8>> {
    let fix = |latitude: f64, longitude: f64| {
        let record = GpsRecord {
            name: "A1".to_string(),
            latitude,
            longitude,
            observed_at_millis: 0,
        };
        record.encode()
    };
    let mut split = fix(12.345701, 123.456802);
    let tail = split.split_off(19);

    vec![
        fix(12.345678, 123.456789),
        split,
        tail,
        b"A1xx.xxxxxx123.456810".to_vec(),
        fix(12.345733, 123.456851),
    ]
}

/// 标准 NUS 服务，TX 特征支持 notify
pub fn uart_service() -> GattService {
    GattService {
        uuid: UART_SERVICE_UUID,
        characteristics: vec![GattCharacteristic {
            uuid: UART_TX_CHAR_UUID,
            notify: true,
            indicate: false,
            descriptors: vec![CCCD_UUID],
        }],
    }
}

async fn perform(step: Step) -> Result<(), TransportError> {
    match step {
        Step::Succeed => Ok(()),
        Step::Fail(reason) => Err(TransportError::Rejected(reason)),
        Step::Hang => std::future::pending().await,
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    type Link = FakeLink;

    async fn radio_available(&self) -> bool {
        self.state().radio_on
    }

    async fn start_scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError> {
        let mut state = self.state();
        if !state.radio_on {
            return Err(TransportError::NoAdapter);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for handle in &state.peripherals {
            let _ = tx.send(handle.clone());
        }
        state.scan_tx = Some(tx);
        state.scans_started += 1;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.scan_tx = None;
        state.scans_stopped += 1;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Self::Link, TransportError> {
        let step = {
            let mut state = self.state();
            state.connects += 1;
            state.connect.clone()
        };
        perform(step).await?;
        Ok(FakeLink {
            address: address.to_string(),
        })
    }

    async fn link_events(
        &self,
        _link: &Self::Link,
    ) -> Result<BoxStream<'static, LinkEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().link_tx = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn discover_services(
        &self,
        _link: &Self::Link,
    ) -> Result<Vec<GattService>, TransportError> {
        let step = self.state().discovery.clone();
        perform(step).await?;
        Ok(self.state().services.clone())
    }

    async fn write_descriptor(
        &self,
        _link: &Self::Link,
        target: DescriptorRef,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let step = {
            let mut state = self.state();
            state.descriptor_writes.push((target, value.to_vec()));
            state.subscribe.clone()
        };
        perform(step).await?;

        let mut state = self.state();
        if target.descriptor == CCCD_UUID && value != DISABLE_NOTIFICATION_VALUE {
            state.subscribed = Some(target.characteristic);
            let payloads = std::mem::take(&mut state.payloads);
            if let Some(tx) = &state.link_tx {
                for value in payloads {
                    let _ = tx.send(LinkEvent::Notification {
                        characteristic: target.characteristic,
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self, _link: &Self::Link) -> Result<(), TransportError> {
        let mut state = self.state();
        state.disconnects += 1;
        state.subscribed = None;
        state.link_tx = None;
        Ok(())
    }
}
