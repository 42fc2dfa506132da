//! 固件更新（DFU）
//!
//! 每个对象的流程:
//! `select -> create(size) -> 按 MTU 发送数据包 -> 读取 CRC -> 校验 -> execute`
//!
//! CRC32 覆盖当前对象类型从偏移 0 起已发送的全部字节。任一 CRC 不符立即终止，
//! 不会执行该对象，调用方需要从头开始。镜像最后一次 execute 时设备会重启，
//! 此时的断线或超时视为成功。

use std::sync::Arc;
use std::time::Duration;

use crc32fast::Hasher;
use log::{debug, info, warn};

use crate::ble::Endpoint;
use crate::connection::{Connection, LinkState};
use crate::error::{FrameError, Result};

const OP_CREATE: u8 = 0x01;
const OP_CRC: u8 = 0x03;
const OP_EXECUTE: u8 = 0x04;
const OP_SELECT: u8 = 0x06;
const RESPONSE_CODE: u8 = 0x60;
const RESULT_SUCCESS: u8 = 0x01;

/// 默认控制响应超时
pub const DEFAULT_DFU_TIMEOUT: Duration = Duration::from_secs(10);

/// DFU 对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuObject {
    /// init packet（`.dat`）
    Init = 1,
    /// 固件镜像（`.bin`）
    Image = 2,
}

/// 进度回调参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuProgress {
    pub object: DfuObject,
    pub sent: usize,
    pub total: usize,
}

fn result_name(code: u8) -> &'static str {
    match code {
        0x00 => "invalid opcode",
        0x01 => "success",
        0x02 => "opcode not supported",
        0x03 => "invalid parameter",
        0x04 => "insufficient resources",
        0x05 => "invalid object",
        0x07 => "unsupported type",
        0x08 => "operation not permitted",
        0x0A => "operation failed",
        0x0B => "extended error",
        _ => "unknown",
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| FrameError::Dfu(format!("control response too short: {}", hex::encode(bytes))))
}

/// 校验响应头 `[0x60, opcode, result]`，返回头之后的载荷
pub(crate) fn check_response(raw: &[u8], opcode: u8) -> Result<&[u8]> {
    let [code, op, result, rest @ ..] = raw else {
        return Err(FrameError::Dfu(format!(
            "malformed control response: {}",
            hex::encode(raw)
        )));
    };
    if *code != RESPONSE_CODE || *op != opcode {
        return Err(FrameError::Dfu(format!(
            "unexpected control response {} to opcode 0x{opcode:02x}",
            hex::encode(raw)
        )));
    }
    if *result != RESULT_SUCCESS {
        return Err(FrameError::Dfu(format!(
            "opcode 0x{opcode:02x} failed: 0x{result:02x} ({})",
            result_name(*result)
        )));
    }
    Ok(rest)
}

/// select 响应: 最大对象大小、当前偏移、CRC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SelectResponse {
    pub max_size: u32,
    pub offset: u32,
    pub crc: u32,
}

impl SelectResponse {
    pub(crate) fn parse(raw: &[u8]) -> Result<Self> {
        check_response(raw, OP_SELECT)?;
        Ok(Self {
            max_size: read_u32(raw, 3)?,
            offset: read_u32(raw, 7)?,
            crc: read_u32(raw, 11)?,
        })
    }
}

/// CRC 响应: 偏移、CRC
pub(crate) fn parse_crc_response(raw: &[u8]) -> Result<(u32, u32)> {
    check_response(raw, OP_CRC)?;
    Ok((read_u32(raw, 3)?, read_u32(raw, 7)?))
}

pub struct DfuClient {
    conn: Arc<Connection>,
    timeout: Duration,
}

impl DfuClient {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            timeout: DEFAULT_DFU_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn update_firmware(&self, init: &[u8], image: &[u8]) -> Result<()> {
        self.update_firmware_with_progress(init, image, |_| {})
            .await
    }

    pub async fn update_firmware_with_progress<F>(
        &self,
        init: &[u8],
        image: &[u8],
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(DfuProgress),
    {
        if self.conn.state() != LinkState::DfuConnected {
            return Err(FrameError::Dfu(
                "not connected to a DFU bootloader (missing DFU characteristics)".to_string(),
            ));
        }
        info!(
            "Starting firmware update: init {} bytes, image {} bytes",
            init.len(),
            image.len()
        );
        self.transfer(DfuObject::Init, init, &mut progress).await?;
        self.transfer(DfuObject::Image, image, &mut progress).await?;
        info!("Firmware update complete");
        Ok(())
    }

    async fn control(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut listener = self.conn.listen();
        self.conn
            .send_raw(Endpoint::DfuControl, request, true)
            .await?;
        listener.next_dfu_response(self.timeout).await
    }

    async fn transfer(
        &self,
        object: DfuObject,
        data: &[u8],
        progress: &mut impl FnMut(DfuProgress),
    ) -> Result<()> {
        let select = SelectResponse::parse(&self.control(&[OP_SELECT, object as u8]).await?)?;
        debug!("{:?} select: {:?}", object, select);
        let max_size = select.max_size as usize;
        if max_size == 0 {
            return Err(FrameError::Dfu("bootloader reported zero object size".to_string()));
        }

        // 数据包 = MTU - 3
        let packet_size = self.conn.limits().max_string.max(1);
        let mut hasher = Hasher::new();
        let mut sent = 0usize;
        let objects = data.chunks(max_size).count().max(1);

        for (index, chunk) in data.chunks(max_size).enumerate() {
            let len = u32::try_from(chunk.len())
                .map_err(|_| FrameError::Dfu("object too large".to_string()))?;
            let mut create = vec![OP_CREATE, object as u8];
            create.extend_from_slice(&len.to_le_bytes());
            check_response(&self.control(&create).await?, OP_CREATE)?;

            for packet in chunk.chunks(packet_size) {
                self.conn
                    .send_raw(Endpoint::DfuPacket, packet, false)
                    .await?;
            }
            hasher.update(chunk);
            sent += chunk.len();

            let (offset, crc) = parse_crc_response(&self.control(&[OP_CRC]).await?)?;
            let expected = hasher.clone().finalize();
            if offset as usize != sent || crc != expected {
                return Err(FrameError::Dfu(format!(
                    "{object:?} CRC mismatch at object {}: device offset {offset} crc {crc:08x}, expected offset {sent} crc {expected:08x}",
                    index + 1
                )));
            }

            let last = index + 1 == objects;
            match self.control(&[OP_EXECUTE]).await {
                Ok(raw) => {
                    check_response(&raw, OP_EXECUTE)?;
                }
                Err(e) if last && object == DfuObject::Image && Self::is_reboot(&e) => {
                    info!("Device rebooted after final execute ({})", e);
                }
                Err(e) => return Err(e),
            }

            progress(DfuProgress {
                object,
                sent,
                total: data.len(),
            });
        }

        if data.is_empty() {
            warn!("{:?} object is empty, nothing sent", object);
        }
        Ok(())
    }

    fn is_reboot(error: &FrameError) -> bool {
        error.is_connection_error() || matches!(error, FrameError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_response_layout() {
        let mut raw = vec![0x60, OP_SELECT, 0x01];
        raw.extend_from_slice(&4096u32.to_le_bytes());
        raw.extend_from_slice(&128u32.to_le_bytes());
        raw.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let parsed = SelectResponse::parse(&raw).unwrap();
        assert_eq!(
            parsed,
            SelectResponse {
                max_size: 4096,
                offset: 128,
                crc: 0xDEAD_BEEF
            }
        );
    }

    #[test]
    fn test_crc_response_layout() {
        let mut raw = vec![0x60, OP_CRC, 0x01];
        raw.extend_from_slice(&10u32.to_le_bytes());
        raw.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        assert_eq!(parse_crc_response(&raw).unwrap(), (10, 0x1234_5678));
    }

    #[test]
    fn test_failed_result_is_dfu_error() {
        let err = check_response(&[0x60, OP_CREATE, 0x04], OP_CREATE).unwrap_err();
        assert!(matches!(err, FrameError::Dfu(ref m) if m.contains("insufficient resources")));
    }

    #[test]
    fn test_mismatched_opcode_and_short_response() {
        assert!(check_response(&[0x60, OP_CRC, 0x01], OP_CREATE).is_err());
        assert!(check_response(&[0x60], OP_CREATE).is_err());
        assert!(parse_crc_response(&[0x60, OP_CRC, 0x01, 0x00]).is_err());
    }
}
