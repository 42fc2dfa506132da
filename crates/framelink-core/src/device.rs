//! 设备级便捷操作

use std::time::Duration;

use chrono::{Local, Offset};
use log::{debug, info, warn};
use tokio::time;

use crate::ble::Profile;
use crate::command::CommandChannel;
use crate::connection::ConnectOutcome;
use crate::error::{FrameError, Result};
use crate::protocol::script;

/// 外设收到 `frame.update()` 后重启进入 bootloader 所需的时间
const DFU_REBOOT_DELAY: Duration = Duration::from_secs(1);

/// 解析电量输出（外设可能打印 `87` 或 `87.0`）
pub(crate) fn parse_battery_level(text: &str) -> Result<u8> {
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| FrameError::Protocol(format!("invalid battery level '{}'", text.trim())))?;
    if !(0.0..=100.0).contains(&value) {
        return Err(FrameError::Protocol(format!(
            "battery level {value} out of range"
        )));
    }
    Ok(value.round() as u8)
}

impl CommandChannel {
    /// 电量百分比
    pub async fn battery_level(&self) -> Result<u8> {
        self.ready().await?;
        let _cmd = self.lock_commands().await;
        let reply = self.query(script::BATTERY_PROBE).await?;
        parse_battery_level(&reply)
    }

    pub async fn stay_awake(&self, enabled: bool) -> Result<()> {
        self.ready().await?;
        let _cmd = self.lock_commands().await;
        self.send_checked(&script::stay_awake(enabled)).await
    }

    /// 让外设休眠；外设随后会断开链路
    pub async fn sleep(&self) -> Result<()> {
        self.ready().await?;
        let _cmd = self.lock_commands().await;
        info!("Putting device to sleep");
        self.connection().send_string(script::SLEEP).await
    }

    /// 开关外设 debug print 转发
    pub fn set_print_debug(&self, enabled: bool) {
        self.connection().set_debug_logging(enabled);
    }

    pub async fn send_break_signal(&self) -> Result<()> {
        self.ready().await?;
        self.connection().send_break_signal().await
    }

    pub async fn send_reset_signal(&self) -> Result<()> {
        self.ready().await?;
        self.connection().send_reset_signal().await
    }

    /// 同步外设时钟（UTC 时间戳 + 本地时区偏移）
    pub async fn sync_time(&self) -> Result<()> {
        self.ready().await?;
        let _cmd = self.lock_commands().await;
        self.sync_time_inner().await
    }

    pub(crate) async fn sync_time_inner(&self) -> Result<()> {
        let now = Local::now();
        let offset = now.offset().fix().local_minus_utc();
        debug!("Syncing time: {} ({:+}s)", now.timestamp(), offset);
        self.send_checked(&script::time_sync(now.timestamp(), offset))
            .await
    }

    /// 查询并应用外设报告的最大字符串长度，调用方必须已持有命令锁
    pub(crate) async fn refresh_max_length(&self) -> Result<usize> {
        let reply = self.query(script::MAX_LENGTH_PROBE).await?;
        let max_string: usize = reply.trim().parse().map_err(|_| {
            FrameError::Protocol(format!("invalid max length '{}'", reply.trim()))
        })?;
        if max_string < 20 {
            return Err(FrameError::Protocol(format!(
                "max length {max_string} too small"
            )));
        }
        self.connection().set_max_string_length(max_string);
        Ok(max_string)
    }

    /// 让外设重启进入 DFU 模式，并重新连接到 DFU profile
    pub async fn enter_dfu_mode(&self, timeout: Duration) -> Result<()> {
        self.ready().await?;
        {
            let _cmd = self.lock_commands().await;
            info!("Rebooting device into DFU mode");
            self.connection().send_string(script::ENTER_DFU).await?;
        }

        self.disconnect().await?;
        // bootloader 使用不同的地址广播
        self.connection().forget_device().await;
        time::sleep(DFU_REBOOT_DELAY).await;

        match self.connection().connect(timeout).await? {
            ConnectOutcome::Fresh(Profile::Dfu) | ConnectOutcome::AlreadyConnected(Profile::Dfu) => {
                info!("Connected to DFU bootloader");
                Ok(())
            }
            ConnectOutcome::Fresh(Profile::Primary)
            | ConnectOutcome::AlreadyConnected(Profile::Primary) => {
                warn!("Device came back in application mode");
                let _ = self.connection().disconnect().await;
                Err(FrameError::Dfu(
                    "device did not reboot into DFU mode".to_string(),
                ))
            }
            ConnectOutcome::NotFound => Err(FrameError::Dfu(
                "DFU bootloader not found".to_string(),
            )),
        }
    }
}
