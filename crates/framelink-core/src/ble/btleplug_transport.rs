//! 基于 btleplug 的传输实现
//!
//! 流程:
//! 1. 扫描（或按已知 ID 查找）目标设备
//! 2. 连接并发现服务，根据服务集合区分主协议 / DFU
//! 3. 定位 TX/RX（或 DFU control/packet）特征
//! 4. 订阅通知，交给 ResponseRouter 解复用

use crate::ble::scanner::{BleScanner, ScannedDevice};
use crate::ble::{
    Connector, DEFAULT_MTU, DFU_SERVICE_UUID, Endpoint, Notification, NotificationStream,
    PRIMARY_SERVICE_UUID, Profile, Transport,
};
use crate::error::{FrameError, Result};
use btleplug::api::{
    Central as _, CentralEvent, CharPropFlags, Characteristic, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Peripheral as PlatformPeripheral};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use uuid::Uuid;

pub struct BtleplugTransport {
    id: String,
    peripheral: PlatformPeripheral,
    adapter: Adapter,
    profile: Profile,
    mtu: usize,
    characteristics: HashMap<Endpoint, Characteristic>,
}

impl BtleplugTransport {
    /// 连接已发现的外设并完成服务发现
    pub async fn open(
        id: String,
        peripheral: PlatformPeripheral,
        adapter: Adapter,
        mtu: usize,
    ) -> Result<Self> {
        if !peripheral.is_connected().await? {
            tracing::info!("Connecting to {}", id);
            peripheral.connect().await?;
        }

        tracing::info!("Discovering services...");
        peripheral.discover_services().await?;

        let service_uuids: Vec<Uuid> = peripheral.services().iter().map(|s| s.uuid).collect();
        let profile = Profile::from_services(&service_uuids)
            .ok_or(FrameError::ServiceNotFound(PRIMARY_SERVICE_UUID))?;

        let (service, endpoints) = match profile {
            Profile::Primary => (PRIMARY_SERVICE_UUID, [Endpoint::Tx, Endpoint::Rx]),
            Profile::Dfu => (DFU_SERVICE_UUID, [Endpoint::DfuControl, Endpoint::DfuPacket]),
        };

        let mut characteristics = HashMap::new();
        for endpoint in endpoints {
            let ch = find_characteristic(&peripheral, service, endpoint.uuid())?;
            characteristics.insert(endpoint, ch);
        }

        tracing::info!("Connected to {} ({:?} profile, MTU {})", id, profile, mtu);
        Ok(Self {
            id,
            peripheral,
            adapter,
            profile,
            mtu,
            characteristics,
        })
    }

    fn characteristic(&self, endpoint: Endpoint) -> Result<&Characteristic> {
        self.characteristics
            .get(&endpoint)
            .ok_or(FrameError::CharacteristicNotFound(endpoint.uuid()))
    }
}

#[async_trait::async_trait]
impl Transport for BtleplugTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn profile(&self) -> Profile {
        self.profile
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn write(&self, endpoint: Endpoint, data: &[u8], with_response: bool) -> Result<()> {
        let ch = self.characteristic(endpoint)?;
        let write_type = if !with_response
            && ch.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral.write(ch, data, write_type).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let notify_endpoint = match self.profile {
            Profile::Primary => Endpoint::Rx,
            Profile::Dfu => Endpoint::DfuControl,
        };
        let ch = self.characteristic(notify_endpoint)?;
        self.peripheral.subscribe(ch).await?;

        // 先拿适配器事件流再取通知流，断开事件不会落在两者之间
        let peripheral_id = self.peripheral.id();
        let id = self.id.clone();
        let disconnects = self
            .adapter
            .events()
            .await?
            .filter_map(move |event| {
                let hit = matches!(
                    &event,
                    CentralEvent::DeviceDisconnected(pid) if *pid == peripheral_id
                );
                if hit {
                    tracing::info!("Adapter reported {} disconnected", id);
                }
                async move { hit.then_some(()) }
            });

        let stream = self.peripheral.notifications().await?;
        let notifications = stream.filter_map(|n| async move {
            Endpoint::from_uuid(n.uuid).map(|endpoint| Notification {
                endpoint,
                value: n.value,
            })
        });
        Ok(end_on_disconnect(notifications, disconnects))
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// btleplug 的通知流在断线后不会结束，这里在 `disconnects` 产出第一个元素时截断
fn end_on_disconnect<S, D>(notifications: S, disconnects: D) -> NotificationStream
where
    S: Stream<Item = Notification> + Send + 'static,
    D: Stream<Item = ()> + Send + 'static,
{
    Box::pin(notifications.take_until(async move {
        let mut disconnects = Box::pin(disconnects);
        disconnects.next().await;
    }))
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    service_uuid: Uuid,
    uuid: Uuid,
) -> Result<Characteristic> {
    for service in peripheral.services() {
        if service.uuid == service_uuid {
            for char in service.characteristics {
                if char.uuid == uuid {
                    return Ok(char);
                }
            }
        }
    }
    Err(FrameError::CharacteristicNotFound(uuid))
}

/// 使用系统第一个蓝牙适配器的 [`Connector`]
pub struct BtleplugConnector {
    scanner: BleScanner,
    mtu: usize,
    seen: Mutex<HashMap<String, PlatformPeripheral>>,
}

impl BtleplugConnector {
    pub async fn new(allow_list: Vec<String>) -> Result<Self> {
        Ok(Self {
            scanner: BleScanner::new(allow_list).await?,
            mtu: DEFAULT_MTU,
            seen: Mutex::new(HashMap::new()),
        })
    }

    /// btleplug 不暴露协商后的 MTU，这里允许调用方指定
    #[must_use]
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    fn remember(&self, id: &str, peripheral: &PlatformPeripheral) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(id.to_string(), peripheral.clone());
        }
    }

    fn cached(&self, id: &str) -> Option<PlatformPeripheral> {
        self.seen.lock().ok().and_then(|seen| seen.get(id).cloned())
    }
}

#[async_trait::async_trait]
impl Connector for BtleplugConnector {
    async fn scan(&self, timeout: Duration) -> Result<Vec<ScannedDevice>> {
        let found = self.scanner.scan(timeout).await?;
        Ok(found
            .into_iter()
            .map(|(dev, peripheral)| {
                self.remember(&dev.id, &peripheral);
                dev
            })
            .collect())
    }

    async fn connect(&self, device: &ScannedDevice) -> Result<Arc<dyn Transport>> {
        let peripheral = self.cached(&device.id).ok_or(FrameError::DeviceNotFound)?;
        let transport = BtleplugTransport::open(
            device.id.clone(),
            peripheral,
            self.scanner.adapter().clone(),
            self.mtu,
        )
        .await?;
        Ok(Arc::new(transport))
    }

    async fn reconnect(&self, id: &str, timeout: Duration) -> Result<Option<Arc<dyn Transport>>> {
        // 先查缓存句柄，再在适配器已知的外设里查找
        let mut peripheral = self.cached(id);
        if peripheral.is_none() {
            for p in self.scanner.adapter().peripherals().await? {
                if format!("{:?}", p.id()) == id {
                    peripheral = Some(p);
                    break;
                }
            }
        }
        let Some(peripheral) = peripheral else {
            return Ok(None);
        };

        match time::timeout(
            timeout,
            BtleplugTransport::open(
                id.to_string(),
                peripheral,
                self.scanner.adapter().clone(),
                self.mtu,
            ),
        )
        .await
        {
            Ok(Ok(transport)) => Ok(Some(Arc::new(transport))),
            Ok(Err(e)) => {
                tracing::warn!("Reconnect to {} failed: {}", id, e);
                Ok(None)
            }
            Err(_) => {
                tracing::warn!("Reconnect to {} timed out after {:?}", id, timeout);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn rx(value: &[u8]) -> Notification {
        Notification {
            endpoint: Endpoint::Rx,
            value: value.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_notifications_end_on_disconnect() {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let mut stream = end_on_disconnect(
            UnboundedReceiverStream::new(notify_rx),
            UnboundedReceiverStream::new(lost_rx),
        );

        notify_tx.send(rx(b"one")).unwrap();
        assert_eq!(stream.next().await.unwrap().value, b"one");

        lost_tx.send(()).unwrap();
        notify_tx.send(rx(b"late")).unwrap();
        assert!(stream.next().await.is_none());
    }
}
