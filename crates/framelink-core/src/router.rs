//! Response Router
//!
//! 单一有序的通知源经 `tokio::sync::broadcast` 扇出给任意数量的订阅者。
//! 每个订阅者从订阅时刻起看到所有后续消息，顺序与到达顺序一致。
//!
//! 一次性等待必须先 [`ResponseRouter::listen`] 再发送请求，否则可能错过响应。

use std::sync::Mutex;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use log::{debug, trace, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::ble::{Endpoint, NotificationStream};
use crate::error::{FrameError, FramingError, Result};
use crate::protocol::frame::FramePrefix;
use crate::protocol::reassembly::{Inbound, Reassembler};
use crate::protocol::script;

const CHANNEL_CAPACITY: usize = 256;

/// 路由后的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    Text(Result<String, FramingError>),
    Data {
        tag: u8,
        payload: Result<Vec<u8>, FramingError>,
    },
    /// DFU control 特征上的响应
    DfuControl(Vec<u8>),
    /// 链路已关闭，挂起的等待应失败
    Closed,
}

/// 二进制消息（用于 `data_responses`）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub tag: u8,
    pub payload: Vec<u8>,
}

pub struct ResponseRouter {
    events: broadcast::Sender<RouterEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    reassembly_limit: usize,
}

impl ResponseRouter {
    pub fn new(reassembly_limit: usize) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            events,
            pump: Mutex::new(None),
            reassembly_limit,
        }
    }

    /// 接管一条通知流；流结束时发布 [`RouterEvent::Closed`] 并调用 `on_closed`
    pub fn attach<F>(&self, mut notifications: NotificationStream, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let events = self.events.clone();
        let mut reassembler = Reassembler::new(self.reassembly_limit);

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                match notification.endpoint {
                    Endpoint::Rx => {
                        trace!("RX {:02x?}", notification.value);
                        if let Some(inbound) = reassembler.feed(&notification.value) {
                            let _ = events.send(route(inbound));
                        }
                    }
                    Endpoint::DfuControl => {
                        trace!("DFU control {:02x?}", notification.value);
                        let _ = events.send(RouterEvent::DfuControl(notification.value));
                    }
                    other => debug!("Ignoring notification on {:?}", other),
                }
            }
            debug!("Notification stream ended");
            let _ = events.send(RouterEvent::Closed);
            on_closed();
        });

        if let Some(previous) = self.replace_pump(Some(handle)) {
            previous.abort();
        }
    }

    /// 主动断开：停止泵任务并通知所有等待者
    pub fn detach(&self) {
        if let Some(handle) = self.replace_pump(None) {
            handle.abort();
        }
        let _ = self.events.send(RouterEvent::Closed);
    }

    fn replace_pump(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut pump = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::replace(&mut *pump, handle)
    }

    /// 直接发布事件（测试与本地注入使用）
    pub fn publish(&self, event: RouterEvent) {
        let _ = self.events.send(event);
    }

    /// 新的一次性等待句柄
    pub fn listen(&self) -> ResponseListener {
        ResponseListener {
            rx: self.events.subscribe(),
        }
    }

    /// 原始事件流
    pub fn events(&self) -> impl Stream<Item = RouterEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("Subscriber lagged, {} event(s) dropped", n);
                    None
                }
            }
        })
    }

    /// 所有字符串响应（长文本已重组）
    pub fn string_responses(&self) -> impl Stream<Item = Result<String>> + Send + 'static {
        self.events().filter_map(|event| async move {
            match event {
                RouterEvent::Text(text) => Some(text.map_err(FrameError::from)),
                _ => None,
            }
        })
    }

    /// 所有二进制响应
    pub fn data_responses(&self) -> impl Stream<Item = Result<DataMessage>> + Send + 'static {
        self.events().filter_map(|event| async move {
            match event {
                RouterEvent::Data { tag, payload } => Some(
                    payload
                        .map(|payload| DataMessage { tag, payload })
                        .map_err(FrameError::from),
                ),
                _ => None,
            }
        })
    }

    /// 指定前缀的二进制响应
    pub fn data_of_prefix(
        &self,
        tag: impl Into<u8>,
    ) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
        let wanted = tag.into();
        self.events().filter_map(move |event| async move {
            match event {
                RouterEvent::Data { tag, payload } if tag == wanted => {
                    Some(payload.map_err(FrameError::from))
                }
                _ => None,
            }
        })
    }

    pub async fn wait_for_string<F>(&self, matches: F, timeout: Duration) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        self.listen().next_string(matches, timeout).await
    }

    pub async fn wait_for_data_of_prefix(
        &self,
        tag: impl Into<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.listen().next_data(tag, timeout).await
    }
}

fn route(inbound: Inbound) -> RouterEvent {
    match inbound {
        Inbound::Text(text) => RouterEvent::Text(text),
        Inbound::Data { tag, payload } => RouterEvent::Data { tag, payload },
    }
}

/// 单个订阅者的一次性等待
///
/// 超时只影响本订阅，不会打扰其它订阅者。
pub struct ResponseListener {
    rx: broadcast::Receiver<RouterEvent>,
}

impl ResponseListener {
    /// 等待下一条满足 `matches` 的字符串；期间的文本重组错误直接返回
    pub async fn next_string<F>(&mut self, matches: F, timeout: Duration) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        self.next_matching("string response", timeout, |event| match event {
            RouterEvent::Text(Ok(text)) if matches(&text) => Some(Ok(text)),
            RouterEvent::Text(Err(e)) => Some(Err(e.into())),
            _ => None,
        })
        .await
    }

    pub async fn next_data(&mut self, tag: impl Into<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let wanted = tag.into();
        let what = match FramePrefix::from_byte(wanted) {
            Some(prefix) => format!("{prefix:?} data"),
            None => format!("data with prefix 0x{wanted:02x}"),
        };
        self.next_matching(&what, timeout, |event| match event {
            RouterEvent::Data { tag, payload } if tag == wanted => {
                Some(payload.map_err(FrameError::from))
            }
            _ => None,
        })
        .await
    }

    /// 等待数据，但外设先打印出错误时以 `PeripheralScript` 结束
    pub async fn next_data_or_error(
        &mut self,
        tag: impl Into<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let wanted = tag.into();
        self.next_matching("data response", timeout, |event| match event {
            RouterEvent::Data { tag, payload } if tag == wanted => {
                Some(payload.map_err(FrameError::from))
            }
            RouterEvent::Text(Ok(text)) if script::is_error_response(&text) => {
                Some(Err(FrameError::PeripheralScript(text)))
            }
            _ => None,
        })
        .await
    }

    pub async fn next_dfu_response(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.next_matching("DFU control response", timeout, |event| match event {
            RouterEvent::DfuControl(value) => Some(Ok(value)),
            _ => None,
        })
        .await
    }

    async fn next_matching<T, F>(&mut self, what: &str, timeout: Duration, mut select: F) -> Result<T>
    where
        F: FnMut(RouterEvent) -> Option<Result<T>>,
    {
        let wait = async {
            loop {
                match self.rx.recv().await {
                    Ok(RouterEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(FrameError::ConnectionLost);
                    }
                    Ok(event) => {
                        if let Some(result) = select(event) {
                            return result;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Listener lagged, {} event(s) dropped", n);
                    }
                }
            }
        };
        time::timeout(timeout, wait)
            .await
            .map_err(|_| FrameError::timeout(what, timeout))?
    }
}
