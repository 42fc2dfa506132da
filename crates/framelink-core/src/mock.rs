//! 内存中的模拟外设
//!
//! 只实现链路层关心的那一小部分脚本语义:
//! `print` / `prntLng` 字面量、nonce 确认、文件 open/write/close/remove、
//! `require`、能力探测，以及 DFU 控制点。所有写入和通知按发生顺序记录在时间线上。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::ble::{
    Connector, Endpoint, Notification, NotificationStream, Profile, ScannedDevice, Transport,
};
use crate::error::{FrameError, Result};
use crate::protocol::frame::{
    DATA_DISCRIMINATOR, FILE_CHUNK_TAG, Limits, encode_string, long_data_frames,
};
use crate::helpers::READ_FILE_HELPER;
use crate::protocol::script::{BATTERY_PROBE, ENTER_DFU, MAX_LENGTH_PROBE, PRINT_HELPER};

pub const MOCK_DEVICE_ID: &str = "mock-frame";

static ACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#";print\("([+>][A-Za-z0-9]+)"\)$"#).expect("valid regex"));
static FILE_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^w=frame\.file\.open\("((?:[^"\\]|\\.)*)","(write|append)"\)(;frame\.bluetooth\.receive_callback\(.*\))?$"#)
        .expect("valid regex")
});
static FILE_WRITE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^w:write\("(.*)"\)$"#).expect("valid regex"));
static FILE_REMOVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^frame\.file\.remove\("(.*)"\)$"#).expect("valid regex"));
static FILE_MKDIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^pcall\(frame\.file\.mkdir,"(.*)"\)$"#).expect("valid regex"));
static FILE_PROBE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^local r,f=pcall\(frame\.file\.open,"(.*?)","read"\)"#).expect("valid regex")
});
static FUNCTION_PROBE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^print\(tostring\(type\((\w+)\)=="function"\)\)$"#).expect("valid regex")
});
static REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^require\("(.*)"\)$"#).expect("valid regex"));
static READ_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^readFile\("(.*)"\)$"#).expect("valid regex"));
static PRINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(print|prntLng)\((.*)\)$").expect("valid regex"));
static ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^error\("(.*)"\)$"#).expect("valid regex"));
static FUNCTION_DEF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^function\s+(\w+)\s*\(").expect("valid regex"));
static FILE_READ_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"f:read\((\d*)\)").expect("valid regex"));
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("valid regex"));

/// 时间线上的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Write { endpoint: Endpoint, data: Vec<u8> },
    Notify { endpoint: Endpoint, data: Vec<u8> },
    Connected(Profile),
    Disconnected,
}

enum Reply {
    Notify(Endpoint, Vec<u8>),
    /// 外设断开链路，可选地以另一 profile 重启
    Drop(Option<Profile>),
}

#[derive(Default)]
struct DfuState {
    max_object: u32,
    corrupt_crc: bool,
    current: u8,
    data: HashMap<u8, Vec<u8>>,
    executed: Vec<u8>,
    reboot_after_image: Option<usize>,
}

struct State {
    profile: Profile,
    available: bool,
    connected: bool,
    connects: usize,
    max_length: usize,
    battery: String,
    response_delay: Duration,
    write_delay: Duration,
    replies: HashMap<String, Vec<String>>,
    notify: Option<mpsc::UnboundedSender<Notification>>,
    events: Vec<MockEvent>,
    files: HashMap<String, Vec<u8>>,
    functions: HashSet<String>,
    /// 已加载的 `readFile` 的读取方式：`Some(n)` 按块读，`None` 按行读（会丢掉换行）
    read_block: Option<usize>,
    open_file: Option<(String, Vec<u8>)>,
    receive_callback: bool,
    dfu: DfuState,
}

/// 按外设 `f:read` 的语义拼出 `readFile` 发回的内容：按块读原样返回，按行读去掉换行
fn read_like_helper(content: &[u8], block: Option<usize>) -> Vec<u8> {
    match block {
        Some(size) => content.chunks(size.max(1)).flatten().copied().collect(),
        None => content.iter().copied().filter(|&b| b != b'\n').collect(),
    }
}

/// Lua 字面量反转义（`\n`、`\"`、`\ddd` 等）
pub(crate) fn unescape_literal(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0B),
            d if d.is_ascii_digit() => {
                let mut j = i + 1;
                let mut value: u32 = 0;
                while j < bytes.len() && j < i + 4 && bytes[j].is_ascii_digit() {
                    value = value * 10 + u32::from(bytes[j] - b'0');
                    j += 1;
                }
                out.push(u8::try_from(value).unwrap_or(u8::MAX));
                i = j;
                continue;
            }
            other => out.push(other),
        }
        i += 2;
    }
    out
}

/// 解析 `print(...)` 的参数: 字符串字面量或数字
fn literal_argument(arg: &str) -> Option<Vec<u8>> {
    let arg = arg.trim();
    for quote in ['"', '\''] {
        if arg.len() >= 2 && arg.starts_with(quote) && arg.ends_with(quote) {
            return Some(unescape_literal(&arg[1..arg.len() - 1]));
        }
    }
    NUMBER.is_match(arg).then(|| arg.as_bytes().to_vec())
}

impl State {
    fn limits(&self) -> Limits {
        Limits::from_max_string(self.max_length)
    }

    fn handle_write(&mut self, endpoint: Endpoint, data: &[u8]) -> Vec<Reply> {
        match endpoint {
            Endpoint::Tx => self.handle_tx(data),
            Endpoint::DfuControl => self.handle_dfu_control(data),
            Endpoint::DfuPacket => {
                let current = self.dfu.current;
                self.dfu.data.entry(current).or_default().extend_from_slice(data);
                Vec::new()
            }
            Endpoint::Rx => Vec::new(),
        }
    }

    fn handle_tx(&mut self, data: &[u8]) -> Vec<Reply> {
        match data.first() {
            Some(&DATA_DISCRIMINATOR) => {
                if data.get(1) == Some(&FILE_CHUNK_TAG)
                    && self.receive_callback
                    && let Some((_, content)) = self.open_file.as_mut()
                {
                    content.extend_from_slice(&data[2..]);
                }
                Vec::new()
            }
            None | Some(&(0x03 | 0x04)) => Vec::new(),
            Some(_) => match std::str::from_utf8(data) {
                Ok(text) => self.run_chunk(text),
                Err(_) => Vec::new(),
            },
        }
    }

    fn run_chunk(&mut self, text: &str) -> Vec<Reply> {
        let (body, ack) = match ACK.captures(text) {
            Some(caps) => {
                let start = caps.get(0).map_or(text.len(), |m| m.start());
                (&text[..start], caps.get(1).map(|m| m.as_str().to_string()))
            }
            None => (text, None),
        };

        let mut out = Vec::new();
        let mut after = Vec::new();
        if let Some(replies) = self.replies.get(body) {
            out.extend(replies.iter().map(|r| r.as_bytes().to_vec()));
            out.extend(ack.map(String::into_bytes));
        } else {
            match self.exec_block(body, &mut out, &mut after) {
                Ok(()) => out.extend(ack.map(String::into_bytes)),
                Err(message) => {
                    let head: String = body.chars().take(20).collect();
                    out.push(format!("[string \"{head}\"]:1: {message}").into_bytes());
                }
            }
        }

        let mut replies: Vec<Reply> = out
            .into_iter()
            .map(|bytes| Reply::Notify(Endpoint::Rx, bytes))
            .collect();
        replies.extend(after);
        replies
    }

    /// 逐行执行；顶层 `function NAME(` 定义函数，缩进行视为函数体
    fn exec_block(
        &mut self,
        code: &str,
        out: &mut Vec<Vec<u8>>,
        after: &mut Vec<Reply>,
    ) -> std::result::Result<(), String> {
        let mut defining: Option<String> = None;
        for line in code.lines() {
            if let Some(caps) = FUNCTION_DEF.captures(line) {
                let name = caps[1].to_string();
                if name == READ_FILE_HELPER {
                    self.read_block = None;
                }
                self.functions.insert(name.clone());
                defining = Some(name);
                continue;
            }
            if line.starts_with(char::is_whitespace) {
                if defining.as_deref() == Some(READ_FILE_HELPER)
                    && let Some(caps) = FILE_READ_CALL.captures(line)
                {
                    self.read_block = caps[1].parse().ok();
                }
                continue;
            }
            if line == "end" || line.is_empty() {
                defining = None;
                continue;
            }
            self.exec(line, out, after)?;
        }
        Ok(())
    }

    fn commit_file(&mut self) {
        if let Some((path, content)) = self.open_file.take() {
            self.files.insert(path, content);
        }
    }

    fn exec(
        &mut self,
        line: &str,
        out: &mut Vec<Vec<u8>>,
        after: &mut Vec<Reply>,
    ) -> std::result::Result<(), String> {
        if line == "frame.bluetooth.receive_callback(nil);w:close()" {
            self.receive_callback = false;
            self.commit_file();
        } else if let Some(caps) = FILE_OPEN.captures(line) {
            let path = String::from_utf8_lossy(&unescape_literal(&caps[1])).into_owned();
            let initial = if &caps[2] == "append" {
                self.files.get(&path).cloned().unwrap_or_default()
            } else {
                Vec::new()
            };
            self.open_file = Some((path, initial));
            self.receive_callback = caps.get(3).is_some();
        } else if let Some(caps) = FILE_WRITE.captures(line) {
            let chunk = unescape_literal(&caps[1]);
            let Some((_, content)) = self.open_file.as_mut() else {
                return Err("attempt to index a nil value (global 'w')".to_string());
            };
            content.extend_from_slice(&chunk);
        } else if line == "w:close()" {
            self.commit_file();
        } else if let Some(caps) = FILE_REMOVE.captures(line) {
            let path = String::from_utf8_lossy(&unescape_literal(&caps[1])).into_owned();
            if self.files.remove(&path).is_none() {
                return Err(format!("{path}: file not found"));
            }
        } else if FILE_MKDIR.is_match(line) {
            // 目录不单独建模
        } else if let Some(caps) = FILE_PROBE.captures(line) {
            let path = String::from_utf8_lossy(&unescape_literal(&caps[1])).into_owned();
            out.push(self.files.contains_key(&path).to_string().into_bytes());
        } else if let Some(caps) = FUNCTION_PROBE.captures(line) {
            out.push(self.functions.contains(&caps[1]).to_string().into_bytes());
        } else if let Some(caps) = REQUIRE.captures(line) {
            let module = caps[1].to_string();
            let Some(content) = self.files.get(&format!("/{module}.lua")).cloned() else {
                return Err(format!("module '{module}' not found"));
            };
            self.exec_block(&String::from_utf8_lossy(&content), out, after)?;
        } else if line == MAX_LENGTH_PROBE {
            out.push(self.max_length.to_string().into_bytes());
        } else if line == BATTERY_PROBE {
            out.push(self.battery.clone().into_bytes());
        } else if let Some(caps) = READ_FILE.captures(line) {
            if !self.functions.contains(READ_FILE_HELPER) {
                return Err("attempt to call a nil value (global 'readFile')".to_string());
            }
            let path = String::from_utf8_lossy(&unescape_literal(&caps[1])).into_owned();
            let Some(content) = self.files.get(&path) else {
                return Err(format!("{path}: file not found"));
            };
            let data = read_like_helper(content, self.read_block);
            out.extend(long_data_frames(&data, self.limits().chunk_size()));
        } else if let Some(caps) = PRINT.captures(line) {
            let helper = &caps[1] == PRINT_HELPER;
            if helper && !self.functions.contains(PRINT_HELPER) {
                return Err(format!("attempt to call a nil value (global '{PRINT_HELPER}')"));
            }
            if let Some(value) = literal_argument(&caps[2]) {
                if helper {
                    let text = String::from_utf8_lossy(&value).into_owned();
                    out.extend(encode_string(&text, self.limits()));
                } else {
                    out.push(value);
                }
            }
        } else if let Some(caps) = ERROR.captures(line) {
            return Err(caps[1].to_string());
        } else if line == ENTER_DFU {
            after.push(Reply::Drop(Some(Profile::Dfu)));
        }
        Ok(())
    }

    fn dfu_reply(opcode: u8, payload: &[u32]) -> Reply {
        let mut bytes = vec![0x60, opcode, 0x01];
        for value in payload {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Reply::Notify(Endpoint::DfuControl, bytes)
    }

    fn handle_dfu_control(&mut self, data: &[u8]) -> Vec<Reply> {
        let Some(&opcode) = data.first() else {
            return Vec::new();
        };
        let current = self.dfu.current;
        let sent = self.dfu.data.get(&current).cloned().unwrap_or_default();
        let len = u32::try_from(sent.len()).unwrap_or(u32::MAX);
        let mut crc = crc32fast::hash(&sent);
        if self.dfu.corrupt_crc {
            crc ^= 0xFFFF_FFFF;
        }

        match opcode {
            0x06 => {
                self.dfu.current = data.get(1).copied().unwrap_or(1);
                let selected = self.dfu.data.get(&self.dfu.current).map_or(0, Vec::len);
                vec![Self::dfu_reply(
                    opcode,
                    &[
                        self.dfu.max_object,
                        u32::try_from(selected).unwrap_or(u32::MAX),
                        0,
                    ],
                )]
            }
            0x01 => {
                self.dfu.current = data.get(1).copied().unwrap_or(1);
                vec![Self::dfu_reply(opcode, &[])]
            }
            0x03 => vec![Self::dfu_reply(opcode, &[len, crc])],
            0x04 => {
                self.dfu.executed.push(current);
                let reboot = current == 2
                    && self
                        .dfu
                        .reboot_after_image
                        .is_some_and(|total| sent.len() >= total);
                if reboot {
                    vec![Reply::Drop(Some(Profile::Primary))]
                } else {
                    vec![Self::dfu_reply(opcode, &[])]
                }
            }
            _ => vec![Reply::Notify(
                Endpoint::DfuControl,
                vec![0x60, opcode, 0x02],
            )],
        }
    }
}

/// 模拟外设；克隆共享同一状态
#[derive(Clone)]
pub struct MockPeripheral {
    state: Arc<Mutex<State>>,
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeripheral {
    /// 主协议设备，最大字符串长度 244（MTU 247）
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                profile: Profile::Primary,
                available: true,
                connected: false,
                connects: 0,
                max_length: 244,
                battery: "87".to_string(),
                response_delay: Duration::ZERO,
                write_delay: Duration::ZERO,
                replies: HashMap::new(),
                notify: None,
                events: Vec::new(),
                files: HashMap::new(),
                functions: HashSet::new(),
                read_block: Some(512),
                open_file: None,
                receive_callback: false,
                dfu: DfuState {
                    max_object: 4096,
                    ..DfuState::default()
                },
            })),
        }
    }

    /// 处于 DFU bootloader 的设备
    pub fn dfu() -> Self {
        let mock = Self::new();
        mock.state().profile = Profile::Dfu;
        mock
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_max_length(self, max_length: usize) -> Self {
        self.state().max_length = max_length;
        self
    }

    #[must_use]
    pub fn with_battery(self, reply: &str) -> Self {
        self.state().battery = reply.to_string();
        self
    }

    /// 所有响应延迟发送
    #[must_use]
    pub fn with_response_delay(self, delay: Duration) -> Self {
        self.state().response_delay = delay;
        self
    }

    /// 每次写入在记录前先挂起，模拟慢速链路
    #[must_use]
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.state().write_delay = delay;
        self
    }

    /// 对完全相同的脚本回复固定内容
    #[must_use]
    pub fn with_reply(self, script: &str, replies: &[&str]) -> Self {
        self.state().replies.insert(
            script.to_string(),
            replies.iter().map(ToString::to_string).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_function(self, name: &str) -> Self {
        self.state().functions.insert(name.to_string());
        self
    }

    #[must_use]
    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.put_file(path, content);
        self
    }

    #[must_use]
    pub fn with_dfu_object_size(self, size: u32) -> Self {
        self.state().dfu.max_object = size;
        self
    }

    /// CRC 响应与实际数据不符
    #[must_use]
    pub fn with_corrupt_crc(self) -> Self {
        self.state().dfu.corrupt_crc = true;
        self
    }

    /// 镜像累计收到 `total` 字节后，execute 时直接重启而不回复
    #[must_use]
    pub fn with_reboot_after_image(self, total: usize) -> Self {
        self.state().dfu.reboot_after_image = Some(total);
        self
    }

    pub fn connector(&self) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            peripheral: self.clone(),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// 按顺序的全部写入
    pub fn writes(&self) -> Vec<(Endpoint, Vec<u8>)> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                MockEvent::Write { endpoint, data } => Some((*endpoint, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// TX 上的脚本文本写入
    pub fn tx_strings(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter(|(endpoint, data)| {
                *endpoint == Endpoint::Tx
                    && !matches!(data.first(), None | Some(&(DATA_DISCRIMINATOR | 0x03 | 0x04)))
            })
            .filter_map(|(_, data)| String::from_utf8(data).ok())
            .collect()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.state().files.insert(path.to_string(), content.to_vec());
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().files.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.state().functions.contains(name)
    }

    /// 模拟外设重启后内存中的函数丢失
    pub fn forget_functions(&self) {
        self.state().functions.clear();
    }

    pub fn executed_objects(&self) -> Vec<u8> {
        self.state().dfu.executed.clone()
    }

    pub fn dfu_data(&self, object: u8) -> Vec<u8> {
        self.state().dfu.data.get(&object).cloned().unwrap_or_default()
    }

    /// 主动推送一条 RX 通知
    pub fn push_rx(&self, data: &[u8]) {
        self.deliver_now(vec![Reply::Notify(Endpoint::Rx, data.to_vec())]);
    }

    /// 外设侧断开
    pub fn drop_link(&self) {
        self.deliver_now(vec![Reply::Drop(None)]);
    }

    fn open_link(&self) -> Result<Arc<dyn Transport>> {
        let mut state = self.state();
        if !state.available {
            return Err(FrameError::DeviceNotFound);
        }
        state.connected = true;
        state.connects += 1;
        let profile = state.profile;
        state.events.push(MockEvent::Connected(profile));
        let transport: Arc<dyn Transport> = Arc::new(MockTransport {
            peripheral: self.clone(),
            profile,
            mtu: state.max_length + crate::ble::ATT_OVERHEAD,
        });
        Ok(transport)
    }

    fn deliver(&self, replies: Vec<Reply>) {
        if replies.is_empty() {
            return;
        }
        let delay = self.state().response_delay;
        if delay.is_zero() {
            self.deliver_now(replies);
        } else {
            let peripheral = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                peripheral.deliver_now(replies);
            });
        }
    }

    fn deliver_now(&self, replies: Vec<Reply>) {
        let mut state = self.state();
        for reply in replies {
            match reply {
                Reply::Notify(endpoint, data) => {
                    if !state.connected {
                        continue;
                    }
                    state.events.push(MockEvent::Notify {
                        endpoint,
                        data: data.clone(),
                    });
                    if let Some(tx) = &state.notify {
                        let _ = tx.send(Notification {
                            endpoint,
                            value: data,
                        });
                    }
                }
                Reply::Drop(reboot_into) => {
                    state.connected = false;
                    state.notify = None;
                    state.functions.clear();
                    state.open_file = None;
                    state.receive_callback = false;
                    state.events.push(MockEvent::Disconnected);
                    if let Some(profile) = reboot_into {
                        state.profile = profile;
                    }
                }
            }
        }
    }
}

pub struct MockTransport {
    peripheral: MockPeripheral,
    profile: Profile,
    mtu: usize,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &str {
        MOCK_DEVICE_ID
    }

    fn profile(&self) -> Profile {
        self.profile
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn is_connected(&self) -> bool {
        let state = self.peripheral.state();
        state.connected && state.profile == self.profile
    }

    async fn write(&self, endpoint: Endpoint, data: &[u8], _with_response: bool) -> Result<()> {
        let delay = self.peripheral.state().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let replies = {
            let mut state = self.peripheral.state();
            if !state.connected || state.profile != self.profile {
                return Err(FrameError::NotConnected);
            }
            state.events.push(MockEvent::Write {
                endpoint,
                data: data.to_vec(),
            });
            state.handle_write(endpoint, data)
        };
        self.peripheral.deliver(replies);
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peripheral.state().notify = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.peripheral.state();
        if state.connected {
            state.connected = false;
            state.notify = None;
            state.events.push(MockEvent::Disconnected);
        }
        Ok(())
    }
}

pub struct MockConnector {
    peripheral: MockPeripheral,
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<ScannedDevice>> {
        let state = self.peripheral.state();
        if !state.available {
            return Ok(Vec::new());
        }
        let name = match state.profile {
            Profile::Primary => "Frame 4F",
            Profile::Dfu => "Frame Update",
        };
        Ok(vec![ScannedDevice {
            id: MOCK_DEVICE_ID.to_string(),
            name: name.to_string(),
            rssi: Some(-48),
            profile: state.profile,
        }])
    }

    async fn connect(&self, _device: &ScannedDevice) -> Result<Arc<dyn Transport>> {
        self.peripheral.open_link()
    }

    async fn reconnect(&self, id: &str, _timeout: Duration) -> Result<Option<Arc<dyn Transport>>> {
        if id != MOCK_DEVICE_ID || !self.peripheral.state().available {
            return Ok(None);
        }
        self.peripheral.open_link().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_literal() {
        assert_eq!(unescape_literal(r#"a\"b\\c\n"#), b"a\"b\\c\n");
        assert_eq!(unescape_literal(r"\000\255x"), vec![0, 255, b'x']);
        assert_eq!(unescape_literal(r"\0011"), vec![1, b'1']);
    }

    #[test]
    fn test_literal_argument() {
        assert_eq!(literal_argument("\"hi\""), Some(b"hi".to_vec()));
        assert_eq!(literal_argument("'x'"), Some(b"x".to_vec()));
        assert_eq!(literal_argument("42"), Some(b"42".to_vec()));
        assert_eq!(literal_argument("a+b"), None);
    }

    fn texts(replies: &[Reply]) -> Vec<String> {
        replies
            .iter()
            .filter_map(|r| match r {
                Reply::Notify(Endpoint::Rx, d) => Some(String::from_utf8_lossy(d).into_owned()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ack_and_error_replies() {
        let mock = MockPeripheral::new();
        let mut state = mock.state();
        assert_eq!(texts(&state.run_chunk("x=1;print(\"+abc\")")), vec!["+abc"]);
        assert_eq!(texts(&state.run_chunk("print(\"hi\")")), vec!["hi"]);
        let err = texts(&state.run_chunk("error(\"boom\");print(\"+abc\")"));
        assert_eq!(err.len(), 1);
        assert!(err[0].starts_with("[string") && err[0].ends_with(":1: boom"));
    }

    #[test]
    fn test_file_commands() {
        let mock = MockPeripheral::new();
        let mut state = mock.state();
        state.run_chunk("w=frame.file.open(\"/a.txt\",\"write\")");
        state.run_chunk("w:write(\"x\\\"y\\000\")");
        state.run_chunk("w:close()");
        assert_eq!(state.files.get("/a.txt"), Some(&b"x\"y\0".to_vec()));
        state.run_chunk("frame.file.remove(\"/a.txt\")");
        assert!(state.files.is_empty());
    }

    #[test]
    fn test_read_file_follows_loaded_helper() {
        let mock = MockPeripheral::new().with_file("/a.txt", b"a\nb\n");
        let mut state = mock.state();
        let payload = |replies: Vec<Reply>| -> Vec<u8> {
            replies
                .into_iter()
                .filter_map(|r| match r {
                    Reply::Notify(Endpoint::Rx, d) if d[1] == 0x01 => Some(d[2..].to_vec()),
                    _ => None,
                })
                .flatten()
                .collect()
        };

        state.run_chunk("function readFile(path)\n  local l = f:read()\nend");
        assert_eq!(payload(state.run_chunk("readFile(\"/a.txt\")")), b"ab");

        state.run_chunk("function readFile(path)\n  local b = f:read(512)\nend");
        assert_eq!(payload(state.run_chunk("readFile(\"/a.txt\")")), b"a\nb\n");
    }
}
