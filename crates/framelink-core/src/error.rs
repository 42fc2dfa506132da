//! 错误类型
//!
//! 所有公开操作都返回 [`FrameError`]。重组失败单独使用可克隆的
//! [`FramingError`]，以便通过广播通道逐条消息下发。

use std::time::Duration;
use uuid::Uuid;

/// 分片重组错误（只影响当前这一条消息）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("chunk count mismatch: end marker declared {declared}, received {received}")]
    ChunkCountMismatch { declared: usize, received: usize },

    #[error("malformed end marker: {0:?}")]
    MalformedEndMarker(String),

    #[error("reassembly buffer exceeded {limit} bytes")]
    Overflow { limit: usize },

    #[error("long text is not valid UTF-8")]
    InvalidUtf8,
}

/// 驱动层统一错误
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Not connected to a device")]
    NotConnected,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Failed to connect within {timeout:?} after {attempts} attempt(s)")]
    ConnectFailed { timeout: Duration, attempts: u32 },

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Payload of {len} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error("DFU error: {0}")]
    Dfu(String),

    #[error("Peripheral script error: {0}")]
    PeripheralScript(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        FrameError::Timeout {
            what: what.into(),
            after,
        }
    }

    /// 是否属于连接类错误（未连接或中途断开）
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            FrameError::NotConnected | FrameError::ConnectionLost | FrameError::ConnectFailed { .. }
        )
    }
}

pub type Result<T, E = FrameError> = std::result::Result<T, E>;
