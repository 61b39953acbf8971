//! 基于 btleplug 的平台蓝牙传输层

use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, CharPropFlags, Manager as _, Peripheral,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, info};

use crate::ble::transport::{
    DescriptorRef, GattCharacteristic, GattService, LinkEvent, PeripheralHandle, Transport,
    TransportError,
};
use crate::ble::{CCCD_UUID, DISABLE_NOTIFICATION_VALUE};

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound(e.to_string()),
            btleplug::Error::PermissionDenied => TransportError::Rejected(e.to_string()),
            other => TransportError::Backend(other.to_string()),
        }
    }
}

pub struct BtleplugLink {
    peripheral: PlatformPeripheral,
}

pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// 使用第一个蓝牙适配器
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter: {}", info);
        }
        Ok(Self { adapter })
    }

    async fn find_device(&self, address: &str) -> Result<PlatformPeripheral, TransportError> {
        let peripherals = self.adapter.peripherals().await?;

        for peripheral in peripherals {
            if let Some(props) = peripheral.properties().await? {
                if address_of(&peripheral, props.address).eq_ignore_ascii_case(address) {
                    return Ok(peripheral);
                }
            }
        }

        Err(TransportError::DeviceNotFound(address.to_string()))
    }
}

/// CoreBluetooth 不暴露 MAC 地址，退回到外设 ID
fn address_of(peripheral: &PlatformPeripheral, address: BDAddr) -> String {
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

async fn handle_for(adapter: &Adapter, event: CentralEvent) -> Option<PeripheralHandle> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        _ => return None,
    };
    let peripheral = adapter.peripheral(&id).await.ok()?;
    let props = peripheral.properties().await.ok()??;
    Some(PeripheralHandle {
        address: address_of(&peripheral, props.address),
        name: props.local_name,
        rssi: props.rssi,
    })
}

#[async_trait::async_trait]
impl Transport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn radio_available(&self) -> bool {
        matches!(
            self.adapter.adapter_state().await,
            Ok(CentralState::PoweredOn)
        )
    }

    async fn start_scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let adapter = self.adapter.clone();
        let discoveries = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move { handle_for(&adapter, event).await }
        });
        Ok(discoveries.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Self::Link, TransportError> {
        let peripheral = self.find_device(address).await?;
        if !peripheral.is_connected().await? {
            info!("Connecting to {}", address);
            peripheral.connect().await?;
        }
        Ok(BtleplugLink { peripheral })
    }

    async fn link_events(
        &self,
        link: &Self::Link,
    ) -> Result<BoxStream<'static, LinkEvent>, TransportError> {
        let notifications = link
            .peripheral
            .notifications()
            .await?
            .map(|n| LinkEvent::Notification {
                characteristic: n.uuid,
                value: n.value,
            });

        let id = link.peripheral.id();
        let watched = id.clone();
        let disconnects = self.adapter.events().await?.filter_map(move |event| {
            let lost = matches!(&event, CentralEvent::DeviceDisconnected(d) if *d == watched);
            async move { lost.then_some(LinkEvent::Disconnected) }
        });

        // 适配器事件只在订阅之后送达，连接返回后的断开要靠这次检查
        let connected = link.peripheral.is_connected().await?;
        if !connected {
            debug!("{:?} dropped before link events were subscribed", id);
        }
        Ok(link_stream(
            connected,
            stream::select(notifications, disconnects).boxed(),
        ))
    }

    async fn discover_services(
        &self,
        link: &Self::Link,
    ) -> Result<Vec<GattService>, TransportError> {
        link.peripheral.discover_services().await?;

        let services = link
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        notify: c.properties.contains(CharPropFlags::NOTIFY),
                        indicate: c.properties.contains(CharPropFlags::INDICATE),
                        descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                    })
                    .collect(),
            })
            .collect();
        Ok(services)
    }

    async fn write_descriptor(
        &self,
        link: &Self::Link,
        target: DescriptorRef,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = link
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == target.service && c.uuid == target.characteristic)
            .ok_or(TransportError::CharacteristicNotFound(target.characteristic))?;

        // CCCD 由 btleplug 的 subscribe/unsubscribe 代写
        if target.descriptor == CCCD_UUID {
            if value == DISABLE_NOTIFICATION_VALUE {
                link.peripheral.unsubscribe(&characteristic).await?;
            } else {
                link.peripheral.subscribe(&characteristic).await?;
            }
            debug!("CCCD of {} set to {:02x?}", target.characteristic, value);
            return Ok(());
        }

        let descriptor = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == target.descriptor)
            .ok_or(TransportError::DescriptorNotFound(target.descriptor))?;
        link.peripheral.write_descriptor(descriptor, value).await?;
        Ok(())
    }

    async fn disconnect(&self, link: &Self::Link) -> Result<(), TransportError> {
        link.peripheral.disconnect().await?;
        Ok(())
    }
}

/// 订阅时链路已断开则先送出 `Disconnected`
fn link_stream(
    connected: bool,
    events: BoxStream<'static, LinkEvent>,
) -> BoxStream<'static, LinkEvent> {
    if connected {
        events
    } else {
        stream::iter([LinkEvent::Disconnected]).chain(events).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn notification() -> LinkEvent {
        LinkEvent::Notification {
            characteristic: Uuid::nil(),
            value: b"A1".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_link_stream_reports_disconnect_missed_before_subscribe() {
        let events = stream::iter([notification()]).boxed();
        let seen: Vec<_> = link_stream(false, events).collect().await;
        assert_eq!(seen, vec![LinkEvent::Disconnected, notification()]);
    }

    #[tokio::test]
    async fn test_link_stream_passes_through_while_connected() {
        let events = stream::iter([notification()]).boxed();
        let seen: Vec<_> = link_stream(true, events).collect().await;
        assert_eq!(seen, vec![notification()]);
    }
}
