//! 连接生命周期
//!
//! 状态: `Disconnected -> Connecting -> Connected | DfuConnected`，
//! 链路丢失或主动断开后回到 `Disconnected`。
//!
//! [`Connection`] 独占 [`Transport`]，其它组件通过 `Arc<Connection>` 访问。
//! 所有写入都经过同一把写锁，保证 TX 特征上的写入按提交顺序进行。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, watch};
use tokio::time::{self, Instant};

use crate::ble::{Connector, Endpoint, Profile, Transport, pick_strongest};
use crate::config::LinkSettings;
use crate::error::{FrameError, Result};
use crate::protocol::frame::{BREAK_SIGNAL, DATA_DISCRIMINATOR, Limits, RESET_SIGNAL, encode_data};
use crate::router::{ResponseListener, ResponseRouter};

/// 按 ID 重连可用的预算比例（1/N）
const RECONNECT_SHARE_DIVISOR: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    DfuConnected,
}

/// `connect` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// 新建立的连接，需要执行 bootstrap
    Fresh(Profile),
    AlreadyConnected(Profile),
    /// 超时内没有找到设备
    NotFound,
}

type TransportSlot = Arc<RwLock<Option<Arc<dyn Transport>>>>;

pub struct Connection {
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    router: ResponseRouter,
    /// 串行化 connect / disconnect，保存已知设备 ID
    lifecycle: Mutex<Option<String>>,
    transport: TransportSlot,
    /// 每次安装新链路递增，旧链路的关闭回调据此失效
    generation: Arc<AtomicU64>,
    state: Arc<watch::Sender<LinkState>>,
    limits: RwLock<Limits>,
    write_lock: Mutex<()>,
    debug_logging: AtomicBool,
    user_disconnected: AtomicBool,
}

impl Connection {
    pub fn new(connector: Arc<dyn Connector>, settings: LinkSettings) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            connector,
            router: ResponseRouter::new(settings.reassembly_limit),
            debug_logging: AtomicBool::new(settings.debug_logging),
            settings,
            lifecycle: Mutex::new(None),
            transport: Arc::new(RwLock::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(state),
            limits: RwLock::new(Limits::from_mtu(crate::ble::DEFAULT_MTU)),
            write_lock: Mutex::new(()),
            user_disconnected: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn router(&self) -> &ResponseRouter {
        &self.router
    }

    /// 订阅一次性响应；必须在发送请求之前调用
    pub fn listen(&self) -> ResponseListener {
        self.router.listen()
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn limits(&self) -> Limits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 使用外设报告的最大字符串长度更新写入上限
    pub fn set_max_string_length(&self, max_string: usize) {
        let limits = Limits::from_max_string(max_string);
        debug!("Link limits: string={}, binary={}", limits.max_string, limits.max_binary);
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
    }

    pub fn debug_logging(&self) -> bool {
        self.debug_logging.load(Ordering::Relaxed)
    }

    pub fn set_debug_logging(&self, enabled: bool) {
        self.debug_logging.store(enabled, Ordering::Relaxed);
    }

    /// 最近一次是否由调用方主动断开（自动重连据此跳过）
    pub fn disconnected_by_user(&self) -> bool {
        self.user_disconnected.load(Ordering::Relaxed)
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub async fn is_connected(&self) -> bool {
        match self.current_transport() {
            Some(t) => self.state() == LinkState::Connected && t.is_connected().await,
            None => false,
        }
    }

    /// 连接设备
    ///
    /// 已知设备先尝试按 ID 重连，失败再扫描；扫描时选择信号最强的候选。
    /// 超时内没有找到设备返回 [`ConnectOutcome::NotFound`] 而不是错误。
    pub async fn connect(&self, timeout: Duration) -> Result<ConnectOutcome> {
        let mut known_id = self.lifecycle.lock().await;

        if let Some(transport) = self.current_transport() {
            if transport.is_connected().await {
                return Ok(ConnectOutcome::AlreadyConnected(transport.profile()));
            }
            debug!("Dropping stale link to {}", transport.id());
            self.take_transport();
            self.router.detach();
        }

        self.state.send_replace(LinkState::Connecting);
        let attempt = self.open_link(known_id.as_deref(), timeout).await;

        let transport = match attempt {
            Ok(Some(transport)) => transport,
            Ok(None) => {
                info!("No device found within {:?}", timeout);
                self.state.send_replace(LinkState::Disconnected);
                return Ok(ConnectOutcome::NotFound);
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.state.send_replace(LinkState::Disconnected);
                return Err(e);
            }
        };

        *known_id = Some(transport.id().to_string());
        let profile = transport.profile();
        if let Err(e) = self.install(transport.clone()).await {
            self.state.send_replace(LinkState::Disconnected);
            let _ = transport.disconnect().await;
            return Err(e);
        }
        Ok(ConnectOutcome::Fresh(profile))
    }

    /// 重连占用的时间不超过总预算的一半，剩余时间留给扫描
    async fn open_link(
        &self,
        known_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<Arc<dyn Transport>>> {
        let deadline = Instant::now() + timeout;

        if let Some(id) = known_id {
            debug!("Reconnecting to known device {}", id);
            let share = timeout / RECONNECT_SHARE_DIVISOR;
            match time::timeout(share, self.connector.reconnect(id, share)).await {
                Ok(Ok(Some(transport))) => return Ok(Some(transport)),
                Ok(Ok(None)) => debug!("Known device unavailable, rescanning"),
                Ok(Err(e)) => warn!("Reconnect to {} failed: {}, rescanning", id, e),
                Err(_) => debug!("Reconnect to {} timed out after {:?}, rescanning", id, share),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let devices = match time::timeout(remaining, self.connector.scan(remaining)).await {
            Ok(devices) => devices?,
            Err(_) => return Ok(None),
        };
        let Some(best) = pick_strongest(&devices) else {
            return Ok(None);
        };
        info!(
            "Connecting to '{}' ({}, rssi={:?}, {:?})",
            best.name, best.id, best.rssi, best.profile
        );
        // 扫描可能用完剩余时间，连接本身单独计时
        match time::timeout(timeout, self.connector.connect(best)).await {
            Ok(transport) => Ok(Some(transport?)),
            Err(_) => {
                warn!("Connecting to {} timed out after {:?}", best.id, timeout);
                Ok(None)
            }
        }
    }

    async fn install(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let notifications = transport.notifications().await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let new_state = match transport.profile() {
            Profile::Primary => LinkState::Connected,
            Profile::Dfu => LinkState::DfuConnected,
        };
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) =
            Limits::from_mtu(transport.mtu());
        *self.transport.write().unwrap_or_else(PoisonError::into_inner) = Some(transport);
        self.user_disconnected.store(false, Ordering::Relaxed);
        self.state.send_replace(new_state);

        let slot = self.transport.clone();
        let state = self.state.clone();
        let current = self.generation.clone();
        self.router.attach(notifications, move || {
            // 只处理本代链路的关闭
            if current.load(Ordering::SeqCst) == generation {
                info!("Link lost");
                slot.write().unwrap_or_else(PoisonError::into_inner).take();
                state.send_replace(LinkState::Disconnected);
            }
        });
        Ok(())
    }

    /// 主动断开；挂起的等待以 `ConnectionLost` 失败
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.user_disconnected.store(true, Ordering::Relaxed);
        let transport = self.take_transport();
        self.router.detach();
        self.state.send_replace(LinkState::Disconnected);
        if let Some(transport) = transport {
            info!("Disconnecting from {}", transport.id());
            transport.disconnect().await?;
        }
        Ok(())
    }

    /// 忘记已知设备，下次连接重新扫描
    pub async fn forget_device(&self) {
        *self.lifecycle.lock().await = None;
    }

    fn mark_lost(&self) {
        if self.take_transport().is_some() {
            warn!("Link lost during write");
            self.router.detach();
            self.state.send_replace(LinkState::Disconnected);
        }
    }

    /// 要求处于主协议连接状态
    pub fn require_primary(&self) -> Result<()> {
        match self.state() {
            LinkState::Connected => Ok(()),
            LinkState::DfuConnected => Err(FrameError::Protocol(
                "device is in DFU mode".to_string(),
            )),
            LinkState::Disconnected | LinkState::Connecting => Err(FrameError::NotConnected),
        }
    }

    /// 原始写入，经写锁串行化
    pub async fn send_raw(&self, endpoint: Endpoint, data: &[u8], with_response: bool) -> Result<()> {
        self.send_frames(endpoint, std::slice::from_ref(&data), with_response)
            .await
    }

    /// 在同一次写锁内依次写出一条逻辑消息的所有帧，避免与其它发送交错
    async fn send_frames<T: AsRef<[u8]>>(
        &self,
        endpoint: Endpoint,
        frames: &[T],
        with_response: bool,
    ) -> Result<()> {
        let transport = self.current_transport().ok_or(FrameError::NotConnected)?;
        let _write = self.write_lock.lock().await;

        for frame in frames {
            let data = frame.as_ref();
            trace!("TX {:?} {}", endpoint, hex::encode(data));
            if let Err(e) = transport.write(endpoint, data, with_response).await {
                if transport.is_connected().await {
                    return Err(e);
                }
                self.mark_lost();
                return Err(FrameError::ConnectionLost);
            }
        }
        Ok(())
    }

    /// 发送一条脚本字符串（单次写入，不分片）
    pub async fn send_string(&self, text: &str) -> Result<()> {
        self.require_primary()?;
        let limit = self.limits().max_string;
        if text.len() > limit {
            return Err(FrameError::PayloadTooLarge {
                len: text.len(),
                limit,
            });
        }
        if text.as_bytes().first() == Some(&DATA_DISCRIMINATOR) {
            return Err(FrameError::Protocol(
                "string payload may not start with the data discriminator".to_string(),
            ));
        }
        debug!("Sending script: {}", text);
        self.send_raw(Endpoint::Tx, text.as_bytes(), false).await
    }

    /// 发送二进制数据；超出单次写入时按长数据协议分片
    pub async fn send_data(&self, payload: &[u8]) -> Result<()> {
        self.require_primary()?;
        let frames = encode_data(payload, self.limits());
        self.send_frames(Endpoint::Tx, &frames, false).await
    }

    /// 中断外设上卡住的脚本
    pub async fn send_break_signal(&self) -> Result<()> {
        self.require_primary()?;
        debug!("Sending break signal");
        self.send_raw(Endpoint::Tx, &[BREAK_SIGNAL], false).await
    }

    pub async fn send_reset_signal(&self) -> Result<()> {
        self.require_primary()?;
        debug!("Sending reset signal");
        self.send_raw(Endpoint::Tx, &[RESET_SIGNAL], false).await
    }
}
