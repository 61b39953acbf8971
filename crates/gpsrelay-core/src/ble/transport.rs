//! 无线传输能力接口
//!
//! 会话状态机和扫描协调器只依赖这里的 [`Transport`]，
//! 平台蓝牙栈由 [`crate::ble::BtleplugTransport`] 实现，
//! 测试使用 [`crate::ble::fake::FakeTransport`]。

use futures_util::stream::BoxStream;
use uuid::Uuid;

/// 扫描得到的外设标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
            rssi: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown device")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub notify: bool,
    pub indicate: bool,
    pub descriptors: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// 描述符写入的目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRef {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
}

/// 连接上的异步事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { characteristic: Uuid, value: Vec<u8> },
    /// 对端断开或链路丢失
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Descriptor not found: {0}")]
    DescriptorNotFound(Uuid),

    #[error("Operation rejected by peer: {0}")]
    Rejected(String),

    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// 已建立连接的句柄，由会话独占
    type Link: Send + Sync + 'static;

    /// 无线电是否可用（适配器存在且已上电）
    async fn radio_available(&self) -> bool;

    /// 开始扫描；返回的流在 `stop_scan` 后结束
    async fn start_scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, address: &str) -> Result<Self::Link, TransportError>;

    /// 连接上的通知与断开事件
    async fn link_events(
        &self,
        link: &Self::Link,
    ) -> Result<BoxStream<'static, LinkEvent>, TransportError>;

    async fn discover_services(&self, link: &Self::Link)
    -> Result<Vec<GattService>, TransportError>;

    async fn write_descriptor(
        &self,
        link: &Self::Link,
        target: DescriptorRef,
        value: &[u8],
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, link: &Self::Link) -> Result<(), TransportError>;
}
