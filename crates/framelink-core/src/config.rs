//! 链路配置和持久化
//!
//! [`LinkSettings`] 保存扫描过滤、超时、重试预算等连接级设置；
//! [`ScriptOptions`] 是单次脚本调用的选项，默认值集中在这里定义。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FrameError, Result};
use crate::protocol::reassembly::DEFAULT_REASSEMBLY_LIMIT;

/// 文件分块写入间隔的允许范围，过快会导致外设缓冲溢出
pub const MIN_FILE_CHUNK_DELAY: Duration = Duration::from_millis(100);
pub const MAX_FILE_CHUNK_DELAY: Duration = Duration::from_millis(150);

/// 以毫秒整数序列化 `Duration`
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// 连接设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// 广播名称允许列表（前缀匹配）
    pub name_allow_list: Vec<String>,
    /// 单次扫描 + 连接的超时
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// 脚本响应的默认超时
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    /// 首次连接失败后的额外尝试次数
    pub connect_retries: u32,
    /// 链路断开后自动重连
    pub auto_reconnect: bool,
    /// 把外设 debug print 转发到日志
    pub debug_logging: bool,
    /// 文件分块写入间隔
    #[serde(with = "duration_ms")]
    pub file_chunk_delay: Duration,
    /// 连接后注入 helper 库
    pub inject_helpers: bool,
    /// 连接后同步外设时钟
    pub sync_time_on_connect: bool,
    /// 经文件写入的长脚本 / 文件的绝对上限
    pub max_file_size: usize,
    /// 单条重组消息的内存上限
    pub reassembly_limit: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            name_allow_list: vec!["Frame".to_string(), "Frame Update".to_string()],
            connect_timeout: Duration::from_secs(10),
            default_timeout: Duration::from_secs(10),
            connect_retries: 1,
            auto_reconnect: true,
            debug_logging: false,
            file_chunk_delay: MIN_FILE_CHUNK_DELAY,
            inject_helpers: true,
            sync_time_on_connect: true,
            max_file_size: 1024 * 1024,
            reassembly_limit: DEFAULT_REASSEMBLY_LIMIT,
        }
    }
}

impl LinkSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("framelink")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在或无法解析则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| FrameError::Config(e.to_string()))?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 实际使用的分块间隔（限制在 100–150ms）
    pub fn effective_chunk_delay(&self) -> Duration {
        self.file_chunk_delay
            .clamp(MIN_FILE_CHUNK_DELAY, MAX_FILE_CHUNK_DELAY)
    }
}

/// 单次脚本调用选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptOptions {
    /// 等待脚本打印的下一条字符串并返回
    pub await_printed_result: bool,
    /// 追加 nonce 确认，确保脚本已执行
    pub require_ack: bool,
    /// `None` 时使用连接默认超时
    pub timeout: Option<Duration>,
    /// 不做 `print` 改写（helper 库注入前必须使用）
    pub bypass_helpers: bool,
}

impl ScriptOptions {
    pub fn printed() -> Self {
        Self {
            await_printed_result: true,
            ..Self::default()
        }
    }

    pub fn checked() -> Self {
        Self {
            require_ack: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn bypassing_helpers(mut self) -> Self {
        self.bypass_helpers = true;
        self
    }
}
