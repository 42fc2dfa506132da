//! BLE 传输层
//!
//! 核心协议只依赖这里定义的两个能力接口：
//! - [`Connector`] 扫描 / 连接 / 按 ID 重连
//! - [`Transport`] 已连接链路上的写入、通知订阅、MTU 查询
//!
//! 真实硬件由 [`btleplug_transport`] 实现，测试使用内存中的 mock。

pub mod btleplug_transport;
pub mod scanner;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use uuid::Uuid;

use crate::error::Result;

pub use btleplug_transport::{BtleplugConnector, BtleplugTransport};
pub use scanner::{ScannedDevice, pick_strongest};

/// 主协议服务
pub const PRIMARY_SERVICE_UUID: Uuid = Uuid::from_u128(0x7a230001_5475_a6a4_654c_8431f6ad49c4);
/// 主机 -> 外设（脚本与数据写入）
pub const TX_CHAR_UUID: Uuid = Uuid::from_u128(0x7a230002_5475_a6a4_654c_8431f6ad49c4);
/// 外设 -> 主机（通知）
pub const RX_CHAR_UUID: Uuid = Uuid::from_u128(0x7a230003_5475_a6a4_654c_8431f6ad49c4);

/// Nordic Secure DFU 服务 (16-bit 0xFE59)
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe59_0000_1000_8000_00805f9b34fb);
pub const DFU_CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x8ec90001_f315_4f60_9fb8_838830daea50);
pub const DFU_PACKET_CHAR_UUID: Uuid = Uuid::from_u128(0x8ec90002_f315_4f60_9fb8_838830daea50);

/// ATT 头部开销
pub const ATT_OVERHEAD: usize = 3;
/// 无法从平台获取 MTU 时使用的默认值
pub const DEFAULT_MTU: usize = 247;

/// 已发现服务集合对应的协议配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    Primary,
    Dfu,
}

impl Profile {
    /// 根据发现的服务 UUID 判断配置，主协议优先
    pub fn from_services<'a>(services: impl IntoIterator<Item = &'a Uuid>) -> Option<Self> {
        let mut dfu = false;
        for uuid in services {
            if *uuid == PRIMARY_SERVICE_UUID {
                return Some(Profile::Primary);
            }
            if *uuid == DFU_SERVICE_UUID {
                dfu = true;
            }
        }
        dfu.then_some(Profile::Dfu)
    }
}

/// 链路上的逻辑端点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tx,
    Rx,
    DfuControl,
    DfuPacket,
}

impl Endpoint {
    pub fn uuid(self) -> Uuid {
        match self {
            Endpoint::Tx => TX_CHAR_UUID,
            Endpoint::Rx => RX_CHAR_UUID,
            Endpoint::DfuControl => DFU_CONTROL_CHAR_UUID,
            Endpoint::DfuPacket => DFU_PACKET_CHAR_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        match uuid {
            TX_CHAR_UUID => Some(Endpoint::Tx),
            RX_CHAR_UUID => Some(Endpoint::Rx),
            DFU_CONTROL_CHAR_UUID => Some(Endpoint::DfuControl),
            DFU_PACKET_CHAR_UUID => Some(Endpoint::DfuPacket),
            _ => None,
        }
    }
}

/// 一次 GATT 通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub endpoint: Endpoint,
    pub value: Vec<u8>,
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// 已建立的单设备链路
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// 平台设备 ID，用于重连
    fn id(&self) -> &str;

    fn profile(&self) -> Profile;

    /// 协商后的 ATT MTU
    fn mtu(&self) -> usize;

    async fn is_connected(&self) -> bool;

    /// 写入指定端点；`with_response = false` 时优先使用 write-without-response
    async fn write(&self, endpoint: Endpoint, data: &[u8], with_response: bool) -> Result<()>;

    /// 订阅所有可通知端点，返回按到达顺序排列的通知流
    async fn notifications(&self) -> Result<NotificationStream>;

    async fn disconnect(&self) -> Result<()>;
}

/// 扫描与连接能力
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// 在 `timeout` 内扫描广播主服务或 DFU 服务的设备
    async fn scan(&self, timeout: Duration) -> Result<Vec<ScannedDevice>>;

    /// 连接并完成服务发现
    async fn connect(&self, device: &ScannedDevice) -> Result<Arc<dyn Transport>>;

    /// 按已知 ID 重连；设备不在范围内时返回 `None`
    async fn reconnect(&self, id: &str, timeout: Duration) -> Result<Option<Arc<dyn Transport>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_prefers_primary() {
        let services = [DFU_SERVICE_UUID, PRIMARY_SERVICE_UUID];
        assert_eq!(Profile::from_services(&services), Some(Profile::Primary));
        assert_eq!(Profile::from_services(&[DFU_SERVICE_UUID]), Some(Profile::Dfu));
        assert_eq!(Profile::from_services(&[Uuid::nil()]), None);
    }

    #[test]
    fn test_endpoint_uuid_roundtrip() {
        for ep in [Endpoint::Tx, Endpoint::Rx, Endpoint::DfuControl, Endpoint::DfuPacket] {
            assert_eq!(Endpoint::from_uuid(ep.uuid()), Some(ep));
        }
    }
}
