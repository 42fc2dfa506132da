//! Command Channel
//!
//! 脚本请求 / 响应的编排:
//! - 短脚本直接写入 TX，可选等待打印结果或 nonce 确认
//! - 超出单次写入的脚本写入外设临时文件，再用 `require` 执行
//!
//! 同一连接上最多只有一个进行中的命令（发送 + 等待整体持有命令锁）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::ScriptOptions;
use crate::connection::{ConnectOutcome, Connection, LinkState};
use crate::ble::Profile;
use crate::error::{FrameError, Result};
use crate::protocol::frame::FramePrefix;
use crate::protocol::script;

/// break 信号后给外设的恢复时间
const BREAK_SETTLE: Duration = Duration::from_millis(100);
/// 确认 nonce 长度
pub(crate) const NONCE_LEN: usize = 3;

pub struct CommandChannel {
    conn: Arc<Connection>,
    command_lock: Mutex<()>,
    helpers_loaded: AtomicBool,
    debug_forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CommandChannel {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            command_lock: Mutex::new(()),
            helpers_loaded: AtomicBool::new(false),
            debug_forwarder: std::sync::Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// helper 库是否已在外设上可用
    pub fn helpers_loaded(&self) -> bool {
        self.helpers_loaded.load(Ordering::SeqCst)
    }

    pub(crate) fn set_helpers_loaded(&self, loaded: bool) {
        self.helpers_loaded.store(loaded, Ordering::SeqCst);
    }

    pub(crate) async fn lock_commands(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.command_lock.lock().await
    }

    /// 连接设备；新建立的主协议连接会执行一次 bootstrap
    ///
    /// 超时内未找到设备时返回 `Ok(false)`。
    pub async fn connect(&self, timeout: Duration) -> Result<bool> {
        let _cmd = self.command_lock.lock().await;
        match self.conn.connect(timeout).await? {
            ConnectOutcome::Fresh(Profile::Primary) => {
                if let Err(e) = self.bootstrap().await {
                    warn!("Bootstrap failed: {}", e);
                    let _ = self.conn.disconnect().await;
                    return Err(e);
                }
                Ok(true)
            }
            ConnectOutcome::Fresh(Profile::Dfu) | ConnectOutcome::AlreadyConnected(_) => Ok(true),
            ConnectOutcome::NotFound => Ok(false),
        }
    }

    /// 确保已连接，失败时按配置的重试预算再尝试
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.conn.is_connected().await {
            return Ok(());
        }
        let settings = self.conn.settings();
        let timeout = settings.connect_timeout;
        let attempts = settings.connect_retries + 1;

        for attempt in 1..=attempts {
            match self.connect(timeout).await {
                Ok(true) => return Ok(()),
                Ok(false) => warn!("Connect attempt {}/{} found no device", attempt, attempts),
                Err(e) => warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e),
            }
        }
        Err(FrameError::ConnectFailed { timeout, attempts })
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.set_helpers_loaded(false);
        self.conn.disconnect().await
    }

    /// 链路意外断开后自动重连（主动断开不会触发）
    pub fn spawn_auto_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut changes = self.conn.state_changes();
        let mut previous = *changes.borrow_and_update();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = *changes.borrow_and_update();
                let dropped = previous == LinkState::Connected && state == LinkState::Disconnected;
                previous = state;
                if !dropped {
                    continue;
                }
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                channel.set_helpers_loaded(false);
                if channel.conn.disconnected_by_user() || !channel.conn.settings().auto_reconnect {
                    continue;
                }
                info!("Link dropped, reconnecting");
                if let Err(e) = channel.ensure_connected().await {
                    warn!("Auto reconnect failed: {}", e);
                }
            }
        })
    }

    /// 未连接时按策略自动重连；DFU 模式下不能执行脚本
    pub(crate) async fn ready(&self) -> Result<()> {
        if self.conn.is_connected().await {
            return Ok(());
        }
        if self.conn.state() == LinkState::DfuConnected {
            return self.conn.require_primary();
        }
        if self.conn.settings().auto_reconnect {
            self.ensure_connected().await
        } else {
            Err(FrameError::NotConnected)
        }
    }

    /// 执行一段脚本
    ///
    /// 返回值: `await_printed_result` 时为脚本打印的下一条字符串，否则为 `None`。
    pub async fn run_script(&self, code: &str, opts: ScriptOptions) -> Result<Option<String>> {
        self.ready().await?;
        let _cmd = self.command_lock.lock().await;
        self.execute(code, opts).await
    }

    /// 强制走文件写入 + `require` 路径
    pub async fn send_long_script(&self, code: &str, opts: ScriptOptions) -> Result<Option<String>> {
        self.ready().await?;
        let _cmd = self.command_lock.lock().await;
        let code = self.prepare(code, opts);
        self.execute_long(&code, opts).await
    }

    fn timeout_for(&self, opts: ScriptOptions) -> Duration {
        opts.timeout.unwrap_or(self.conn.settings().default_timeout)
    }

    fn prepare(&self, code: &str, opts: ScriptOptions) -> String {
        let code = code.trim();
        if !opts.bypass_helpers && self.helpers_loaded() {
            script::rewrite_prints(code)
        } else {
            code.to_string()
        }
    }

    /// 调用方必须已持有命令锁
    pub(crate) async fn execute(&self, code: &str, opts: ScriptOptions) -> Result<Option<String>> {
        let code = self.prepare(code, opts);
        let limit = self.conn.limits().max_string;

        let (text, expected) = if opts.require_ack && !opts.await_printed_result {
            let (suffix, expected) = script::ack_suffix(&script::random_nonce(NONCE_LEN));
            (format!("{code}{suffix}"), Some(expected))
        } else {
            (code.clone(), None)
        };

        if text.len() > limit {
            debug!(
                "Script of {} bytes exceeds single write limit {}, sending via file",
                text.len(),
                limit
            );
            return self.execute_long(&code, opts).await;
        }

        self.send_and_await(&text, opts.await_printed_result, expected, self.timeout_for(opts))
            .await
    }

    async fn execute_long(&self, code: &str, opts: ScriptOptions) -> Result<Option<String>> {
        let max = self.conn.settings().max_file_size;
        if code.len() > max {
            return Err(FrameError::PayloadTooLarge {
                len: code.len(),
                limit: max,
            });
        }

        let module = format!("tmp{}", script::random_nonce(6));
        let path = format!("/{module}.lua");
        self.write_file_inner(&path, code.as_bytes()).await?;

        let (command, expected) = if opts.require_ack && !opts.await_printed_result {
            let (suffix, expected) = script::long_ack_suffix(&script::random_nonce(NONCE_LEN));
            (format!("{}{suffix}", script::require(&module)), Some(expected))
        } else {
            (script::require(&module), None)
        };

        let result = self
            .send_and_await(&command, opts.await_printed_result, expected, self.timeout_for(opts))
            .await;

        if let Err(e) = self.send_checked(&script::file_remove(&path)).await {
            warn!("Failed to remove temporary script {}: {}", path, e);
        }
        result
    }

    /// 发送并按需等待；超出单次写入直接报错，不会回退到文件路径
    async fn send_and_await(
        &self,
        text: &str,
        await_printed: bool,
        expected: Option<String>,
        timeout: Duration,
    ) -> Result<Option<String>> {
        if !await_printed && expected.is_none() {
            self.conn.send_string(text).await?;
            return Ok(None);
        }

        let mut listener = self.conn.listen();
        self.conn.send_string(text).await?;

        if let Some(expected) = expected {
            let reply = listener
                .next_string(|s| s == expected || script::is_error_response(s), timeout)
                .await
                .map_err(|e| match e {
                    FrameError::Timeout { after, .. } => {
                        FrameError::timeout(format!("acknowledgement {expected}"), after)
                    }
                    other => other,
                })?;
            if reply == expected {
                return Ok(None);
            }
            return Err(FrameError::PeripheralScript(reply));
        }

        let reply = listener.next_string(|_| true, timeout).await?;
        if script::is_error_response(&reply) {
            return Err(FrameError::PeripheralScript(reply));
        }
        Ok(Some(reply))
    }

    /// 带 nonce 确认的内部命令（不改写 print，不回退）
    pub(crate) async fn send_checked(&self, text: &str) -> Result<()> {
        let (suffix, expected) = script::ack_suffix(&script::random_nonce(NONCE_LEN));
        let timeout = self.conn.settings().default_timeout;
        self.send_and_await(&format!("{text}{suffix}"), false, Some(expected), timeout)
            .await
            .map(|_| ())
    }

    /// 等待打印结果的内部查询（不改写 print，不回退）
    pub(crate) async fn query(&self, text: &str) -> Result<String> {
        let timeout = self.conn.settings().default_timeout;
        self.send_and_await(text, true, None, timeout)
            .await?
            .ok_or_else(|| FrameError::Protocol(format!("no output from '{text}'")))
    }

    /// 查询 `true` / `false`
    pub(crate) async fn query_bool(&self, text: &str) -> Result<bool> {
        match self.query(text).await?.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(FrameError::Protocol(format!(
                "expected true/false, got '{other}'"
            ))),
        }
    }

    /// 新连接后的初始化，调用方必须已持有命令锁
    async fn bootstrap(&self) -> Result<()> {
        info!("Bootstrapping new connection");
        self.set_helpers_loaded(false);

        self.conn.send_break_signal().await?;
        time::sleep(BREAK_SETTLE).await;

        if let Err(e) = self.refresh_max_length().await {
            warn!("Could not query max payload length, keeping MTU-derived limit: {}", e);
        }

        self.start_debug_forwarding();

        if self.conn.settings().inject_helpers {
            let outcome = self.inject_helpers_inner().await?;
            debug!("Helper library: {:?}", outcome);
        }

        if self.conn.settings().sync_time_on_connect {
            self.sync_time_inner().await?;
        }

        self.send_checked(script::MARK_AWAKE).await?;
        info!("Connection ready");
        Ok(())
    }

    /// 订阅外设 debug print 并转发到日志
    fn start_debug_forwarding(&self) {
        let conn = Arc::downgrade(&self.conn);
        let mut prints = Box::pin(
            self.conn
                .router()
                .data_of_prefix(FramePrefix::DebugPrint),
        );
        let handle = tokio::spawn(async move {
            while let Some(message) = prints.next().await {
                let Some(conn) = conn.upgrade() else {
                    break;
                };
                if !conn.debug_logging() {
                    continue;
                }
                match message {
                    Ok(bytes) => debug!(
                        target: "framelink::peripheral",
                        "{}",
                        String::from_utf8_lossy(&bytes)
                    ),
                    Err(e) => warn!(target: "framelink::peripheral", "Bad debug print: {}", e),
                }
            }
        });

        let mut slot = self
            .debug_forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.debug_forwarder.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}
