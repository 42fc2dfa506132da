//! Framelink Core Library
//!
//! Frame 智能眼镜的主机端 BLE 链路层协议实现
//!
//! # 模块
//!
//! - **ble**: 扫描、GATT 连接、`Transport` / `Connector` 能力抽象
//! - **protocol**: 帧编码、长消息重组、脚本文本构造
//! - **router**: 通知扇出与一次性等待
//! - **connection**: 连接状态机与写入串行化
//! - **command**: 脚本请求 / 响应、长脚本回退、连接后初始化
//! - **files**: 外设文件读写
//! - **dfu**: 固件更新
//!
//! # 使用示例
//!
//! ```ignore
//! use framelink_core::{BtleplugConnector, CommandChannel, Connection, LinkSettings, ScriptOptions};
//!
//! let settings = LinkSettings::load();
//! let connector = Arc::new(BtleplugConnector::new(settings.name_allow_list.clone()).await?);
//! let channel = CommandChannel::new(Arc::new(Connection::new(connector, settings)));
//!
//! channel.ensure_connected().await?;
//! let reply = channel.run_script("print(1+2)", ScriptOptions::printed()).await?;
//! let battery = channel.battery_level().await?;
//! ```

pub mod ble;
pub mod command;
pub mod config;
pub mod connection;
pub mod device;
pub mod dfu;
pub mod error;
pub mod files;
pub mod helpers;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod protocol;
pub mod router;

// BLE re-exports
pub use ble::{
    BtleplugConnector, BtleplugTransport, Connector, Endpoint, Notification, Profile,
    ScannedDevice, Transport,
};

pub use command::CommandChannel;
pub use config::{LinkSettings, ScriptOptions};
pub use connection::{ConnectOutcome, Connection, LinkState};
pub use dfu::{DfuClient, DfuObject, DfuProgress};
pub use error::{FrameError, FramingError, Result};
pub use files::FileSystem;
pub use helpers::HelperInjection;
pub use protocol::{FramePrefix, Limits};
pub use router::{DataMessage, ResponseListener, ResponseRouter, RouterEvent};
