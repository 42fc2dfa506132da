//! 外设侧 helper 库
//!
//! 提供长文本打印（`prntLng`）和长数据发送，按源码哈希存放在
//! `/lib-<hash>/` 下，版本变化时自动写入新目录。

use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::command::CommandChannel;
use crate::error::{FrameError, Result};
use crate::protocol::script::{self, PRINT_HELPER};

/// helper 库源码
///
/// 长文本: `"\n" + chunk` ... `"\v" + count`；
/// 长数据: `0x01 + chunk` ... `0x02 + count`（固件自动加上 0x01 discriminator）。
pub const HELPER_SOURCE: &str = r##"function sendChunks(emit, finish, s)
  local size = frame.bluetooth.max_length() - 3
  local count = 0
  for i = 1, #s, size do
    emit(string.sub(s, i, i + size - 1))
    count = count + 1
  end
  finish(tostring(count))
end
function sendData(d)
  while true do
    if pcall(frame.bluetooth.send, d) then break end
    frame.sleep(0.0025)
  end
end
function prntLng(...)
  local parts = {}
  for i = 1, select("#", ...) do parts[#parts + 1] = tostring(select(i, ...)) end
  local s = table.concat(parts, "\t")
  local b = string.byte(s, 1)
  if #s > 0 and #s <= frame.bluetooth.max_length() and b ~= 1 and b ~= 10 and b ~= 11 then
    print(s)
    return
  end
  sendChunks(function(c) print("\n" .. c) end, function(n) print("\v" .. n) end, s)
end
function sendLongData(d)
  sendChunks(function(c) sendData("\001" .. c) end, function(n) sendData("\002" .. n) end, d)
end
function readFile(path)
  local f = frame.file.open(path, "read")
  local parts = {}
  while true do
    local b = f:read(512)
    if b == nil then break end
    parts[#parts + 1] = b
  end
  f:close()
  sendLongData(table.concat(parts))
end
"##;

/// 读文件 helper 的函数名
pub const READ_FILE_HELPER: &str = "readFile";

/// helper 源码哈希（SHA-256 前 4 字节的十六进制）
pub fn library_hash() -> String {
    let digest = Sha256::digest(HELPER_SOURCE.as_bytes());
    hex::encode(&digest[..4])
}

pub fn library_dir(hash: &str) -> String {
    format!("/lib-{hash}")
}

pub fn library_path(hash: &str) -> String {
    format!("/lib-{hash}/{PRINT_HELPER}.lua")
}

/// `require` 使用的模块名（不带前导 `/` 和扩展名）
pub fn library_module(hash: &str) -> String {
    format!("lib-{hash}/{PRINT_HELPER}")
}

/// 注入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperInjection {
    /// 函数已在内存中
    AlreadyLoaded,
    /// 当前版本的文件已存在，仅重新加载
    LoadedFromFile,
    /// 写入新文件并加载
    Written,
}

impl CommandChannel {
    /// 确保 helper 库可用，多次调用是幂等的
    pub async fn inject_helpers(&self) -> Result<HelperInjection> {
        self.ready().await?;
        let _cmd = self.lock_commands().await;
        self.inject_helpers_inner().await
    }

    async fn helper_present(&self) -> Result<bool> {
        self.query_bool(&script::function_exists_probe(PRINT_HELPER))
            .await
    }

    /// 调用方必须已持有命令锁
    pub(crate) async fn inject_helpers_inner(&self) -> Result<HelperInjection> {
        if self.helper_present().await? {
            self.set_helpers_loaded(true);
            return Ok(HelperInjection::AlreadyLoaded);
        }

        let hash = library_hash();
        let path = library_path(&hash);
        let module = library_module(&hash);

        if self.query_bool(&script::file_exists_probe(&path)).await? {
            self.send_checked(&script::require(&module)).await?;
            if self.helper_present().await? {
                info!("Loaded helper library from {}", path);
                self.set_helpers_loaded(true);
                return Ok(HelperInjection::LoadedFromFile);
            }
            warn!("Helper library at {} did not load, rewriting", path);
        }

        info!("Writing helper library to {}", path);
        self.send_checked(&script::file_mkdir(&library_dir(&hash)))
            .await?;
        self.write_file_inner(&path, HELPER_SOURCE.as_bytes())
            .await?;
        self.send_checked(&script::require(&module)).await?;

        if !self.helper_present().await? {
            return Err(FrameError::Protocol(format!(
                "helper library {path} written but {PRINT_HELPER} is still undefined"
            )));
        }
        self.set_helpers_loaded(true);
        Ok(HelperInjection::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_paths() {
        let hash = library_hash();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(library_path("abcd0123"), "/lib-abcd0123/prntLng.lua");
        assert_eq!(library_module("abcd0123"), "lib-abcd0123/prntLng");
        assert_eq!(library_dir("abcd0123"), "/lib-abcd0123");
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(library_hash(), library_hash());
    }

    #[test]
    fn test_source_defines_helpers() {
        assert!(HELPER_SOURCE.contains(&format!("function {PRINT_HELPER}(")));
        assert!(HELPER_SOURCE.contains(&format!("function {READ_FILE_HELPER}(")));
        // 源码完整保留到最后一个函数
        assert!(HELPER_SOURCE.contains("select(\"#\", ...)"));
        assert!(HELPER_SOURCE.trim_end().ends_with("sendLongData(table.concat(parts))\nend"));
        // 按块读取，保留文件中的换行
        assert!(HELPER_SOURCE.contains("f:read(512)"));
    }
}
