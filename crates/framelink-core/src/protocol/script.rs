//! 外设脚本文本构造
//!
//! 外设的执行接口是文本，所有脚本片段都经由这里的纯函数拼接，
//! 转义规则（反斜杠、引号、换行、控制字符）只在此处实现。

use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;

/// 长文本安全的打印函数（由 helper 库提供）
pub const PRINT_HELPER: &str = "prntLng";

/// 行首、或前一个字符不是标识符 / `.` / `:` 时的 `print(`
static PRINT_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^A-Za-z0-9_.:])print\s*\(").expect("valid regex"));

/// 外设报错输出的行号标记，例如 `[string "x"]:1:`
static LUA_ERROR_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\]:\d+:").expect("valid regex"));

/// 单字节的转义形式
fn escape_byte(out: &mut String, b: u8) {
    match b {
        b'\\' => out.push_str("\\\\"),
        b'"' => out.push_str("\\\""),
        b'\'' => out.push_str("\\'"),
        b'\n' => out.push_str("\\n"),
        b'\r' => out.push_str("\\r"),
        b'\t' => out.push_str("\\t"),
        0x20..=0x7E => out.push(b as char),
        // 十进制转义固定写成三位，避免与后续数字字符粘连
        _ => {
            let _ = write!(out, "\\{b:03}");
        }
    }
}

/// 单字节转义后的长度
pub fn escaped_len(b: u8) -> usize {
    match b {
        b'\\' | b'"' | b'\'' | b'\n' | b'\r' | b'\t' => 2,
        0x20..=0x7E => 1,
        _ => 4,
    }
}

/// 任意字节序列的双引号字面量
pub fn lua_bytes_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        escape_byte(&mut out, b);
    }
    out.push('"');
    out
}

/// 字符串字面量；非 ASCII 的 UTF-8 字节原样保留
pub fn lua_string_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        if ch.is_ascii() {
            escape_byte(&mut out, ch as u8);
        } else {
            out.push(ch);
        }
    }
    out.push('"');
    out
}

/// 随机字母数字串，用于确认 nonce 和临时文件名
pub fn random_nonce(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// 短路径确认: 追加 `;print("+nonce")`，返回 (后缀, 期望的响应)
pub fn ack_suffix(nonce: &str) -> (String, String) {
    let expected = format!("+{nonce}");
    (format!(";print(\"{expected}\")"), expected)
}

/// 长路径（require）确认使用 `>nonce`，与短路径区分
pub fn long_ack_suffix(nonce: &str) -> (String, String) {
    let expected = format!(">{nonce}");
    (format!(";print(\"{expected}\")"), expected)
}

/// 把 `print(` 调用改写为长文本安全的 helper
pub fn rewrite_prints(code: &str) -> String {
    PRINT_CALL
        .replace_all(code, format!("${{1}}{PRINT_HELPER}(").as_str())
        .into_owned()
}

/// 外设错误输出以 `[` 开头，并带有 error 字样或 `]:行号:` 位置标记
pub fn is_error_response(text: &str) -> bool {
    text.starts_with('[')
        && (text.to_ascii_lowercase().contains("error") || LUA_ERROR_LOCATION.is_match(text))
}

pub fn require(module: &str) -> String {
    format!("require({})", lua_string_literal(module))
}

/// 打开文件到全局变量 `w`
pub fn file_open(path: &str, mode: &str) -> String {
    format!(
        "w=frame.file.open({},{})",
        lua_string_literal(path),
        lua_string_literal(mode)
    )
}

pub fn file_write(chunk: &[u8]) -> String {
    format!("w:write({})", lua_bytes_literal(chunk))
}

/// `file_write` 除数据本身外的固定开销
pub const FILE_WRITE_OVERHEAD: usize = "w:write(\"\")".len();

pub fn file_close() -> &'static str {
    "w:close()"
}

pub fn file_remove(path: &str) -> String {
    format!("frame.file.remove({})", lua_string_literal(path))
}

pub fn file_mkdir(path: &str) -> String {
    format!("pcall(frame.file.mkdir,{})", lua_string_literal(path))
}

/// 打印 `true` / `false`
pub fn file_exists_probe(path: &str) -> String {
    format!(
        "local r,f=pcall(frame.file.open,{},\"read\");if r then f:close();print(\"true\") else print(\"false\") end",
        lua_string_literal(path)
    )
}

/// 打印 `true` / `false`
pub fn function_exists_probe(name: &str) -> String {
    format!("print(tostring(type({name})==\"function\"))")
}

/// 注册文件数据接收回调: 以 `0x02` 开头的数据帧写入 `w`
pub fn file_receive_callback(path: &str) -> String {
    format!(
        "{};frame.bluetooth.receive_callback(function(d) if string.byte(d,1)==2 then w:write(string.sub(d,2)) end end)",
        file_open(path, "write")
    )
}

pub fn clear_receive_callback() -> &'static str {
    "frame.bluetooth.receive_callback(nil);w:close()"
}

/// 与 UTC 的偏移，格式 `+HH:MM` / `-HH:MM`
pub fn utc_offset_string(offset_seconds: i32) -> String {
    let sign = if offset_seconds < 0 { '-' } else { '+' };
    let total_minutes = offset_seconds.unsigned_abs() / 60;
    format!("{sign}{:02}:{:02}", total_minutes / 60, total_minutes % 60)
}

pub fn time_sync(epoch_seconds: i64, offset_seconds: i32) -> String {
    format!(
        "frame.time.utc({epoch_seconds});frame.time.zone(\"{}\")",
        utc_offset_string(offset_seconds)
    )
}

pub const MAX_LENGTH_PROBE: &str = "print(frame.bluetooth.max_length())";
pub const BATTERY_PROBE: &str = "print(frame.battery_level())";
pub const MARK_AWAKE: &str = "is_awake=true";
pub const SLEEP: &str = "frame.sleep()";
pub const ENTER_DFU: &str = "frame.update()";

pub fn stay_awake(enabled: bool) -> String {
    format!("frame.stay_awake({enabled})")
}
