//! GPS Relay Core Library
//!
//! 把 BLE 外设（Nordic UART 服务）推送的定位文本转成结构化记录，
//! 分发给订阅者并尽力写入远端存储。
//!
//! # 模块
//!
//! - **ble**: 传输层接口、btleplug 实现、扫描协调器、会话状态机
//! - **stream**: 字节流分帧与定位记录解析
//! - **events**: 会话事件总线
//! - **persistence**: 非阻塞持久化队列与写入端（Firestore / JSONL）
//! - **relay**: 扫描 → 会话 → 持久化的高层工作流
//!
//! # 使用示例
//!
//! ```ignore
//! use gpsrelay_core::{BtleplugTransport, Relay, RelaySettings, SessionEvent};
//!
//! let settings = RelaySettings::load();
//! let transport = Arc::new(BtleplugTransport::new().await?);
//! let relay = Relay::from_settings(transport, &settings)?;
//!
//! // 1. 扫描
//! let mut scan = relay.start_scan().await?;
//! while let Some(ScanEvent::Discovered(handle)) = scan.next().await {
//!     println!("{} {}", handle.address, handle.display_name());
//! }
//!
//! // 2. 连接并接收定位
//! let mut events = relay.subscribe();
//! relay.connect("C4:4F:33:12:A0:01").await?;
//! while let Some(event) = events.next().await {
//!     if let SessionEvent::FixReceived(fix) = event {
//!         println!("{} {} {}", fix.name, fix.latitude, fix.longitude);
//!     }
//! }
//! ```

pub mod ble;
pub mod config;
pub mod events;
pub mod logging;
pub mod persistence;
pub mod relay;
pub mod stream;

// BLE re-exports
pub use ble::{
    BtleplugTransport, PeripheralHandle, ScanCoordinator, ScanError, ScanEvent, ScanStopReason,
    ScanStream, Session, SessionConfig, SessionError, SessionState, Transport, TransportError,
    UART_SERVICE_UUID, UART_TX_CHAR_UUID,
};

// Stream re-exports
pub use stream::{FrameError, Framer, Framing, GpsRecord, ParseError};

// Event re-exports
pub use events::{EventBus, EventStream, SessionEvent};

// Persistence re-exports
pub use persistence::{PersistenceError, PersistenceQueue, PersistenceSink, StoreLayout};

pub use config::RelaySettings;
pub use logging::LogLevel;
pub use relay::Relay;
