pub mod btleplug_transport;
pub mod fake;
pub mod scanner;
pub mod session;
pub mod transport;

use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

pub use btleplug_transport::BtleplugTransport;
pub use scanner::{ScanCoordinator, ScanError, ScanEvent, ScanStopReason, ScanStream};
pub use session::{Session, SessionConfig, SessionError, SessionState};
pub use transport::{
    DescriptorRef, GattCharacteristic, GattService, LinkEvent, PeripheralHandle, Transport,
    TransportError,
};

/// Nordic UART Service
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// NUS TX 特征（外设 → 中心，notify）
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

static MAC_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").unwrap());

/// 地址是否合法
///
/// 接受 `AA:BB:CC:DD:EE:FF` 形式的 MAC 地址，以及 CoreBluetooth
/// 使用的 UUID 形式外设标识。
pub fn is_valid_address(address: &str) -> bool {
    MAC_PATTERN.is_match(address) || Uuid::parse_str(address).is_ok()
}
