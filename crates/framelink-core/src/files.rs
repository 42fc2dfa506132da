//! 外设文件操作
//!
//! 文件内容有两种写法:
//! - [`FileSystem::write_file`] 内容转义成脚本字面量，按 `w:write("...")` 分块，每块确认
//! - [`FileSystem::write_file_binary`] 注册接收回调，按 `[0x01][0x02] + chunk` 数据帧发送
//!
//! 两种方式的分块之间都会等待 100–150ms，给外设留出处理时间。

use log::{debug, info};
use tokio::time;

use crate::ble::Endpoint;
use crate::command::{CommandChannel, NONCE_LEN};
use crate::error::{FrameError, Result};
use crate::helpers::READ_FILE_HELPER;
use crate::protocol::frame::{DATA_DISCRIMINATOR, FILE_CHUNK_TAG, FramePrefix};
use crate::protocol::script::{self, FILE_WRITE_OVERHEAD, escaped_len};

/// 单个转义字节的最大长度（`\ddd`）
const MAX_ESCAPED_BYTE: usize = 4;

/// 外设文件系统句柄
pub struct FileSystem<'a> {
    channel: &'a CommandChannel,
}

impl CommandChannel {
    pub fn files(&self) -> FileSystem<'_> {
        FileSystem { channel: self }
    }
}

impl FileSystem<'_> {
    /// 以脚本字面量分块写入文件（覆盖已有内容）
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.channel.ready().await?;
        let _cmd = self.channel.lock_commands().await;
        self.channel.write_file_inner(path, data).await
    }

    /// 以二进制数据帧写入文件，适合大文件
    pub async fn write_file_binary(&self, path: &str, data: &[u8]) -> Result<()> {
        self.channel.ready().await?;
        let _cmd = self.channel.lock_commands().await;
        self.channel.write_file_binary_inner(path, data).await
    }

    /// 读取文件内容（需要 helper 库）
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.channel.ready().await?;
        let _cmd = self.channel.lock_commands().await;
        self.channel.read_file_inner(path).await
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        self.channel.ready().await?;
        let _cmd = self.channel.lock_commands().await;
        self.channel
            .query_bool(&script::file_exists_probe(path))
            .await
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.channel.ready().await?;
        let _cmd = self.channel.lock_commands().await;
        debug!("Deleting {}", path);
        self.channel
            .send_checked(&script::file_remove(path))
            .await
    }
}

/// 按转义后长度贪心切分，每块转义后不超过 `budget`
pub(crate) fn escaped_chunks(data: &[u8], budget: usize) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, &b) in data.iter().enumerate() {
        let cost = escaped_len(b);
        if used + cost > budget && i > start {
            chunks.push(&data[start..i]);
            start = i;
            used = 0;
        }
        used += cost;
    }
    if start < data.len() {
        chunks.push(&data[start..]);
    }
    chunks
}

impl CommandChannel {
    fn check_file_size(&self, len: usize) -> Result<()> {
        let limit = self.connection().settings().max_file_size;
        if len > limit {
            return Err(FrameError::PayloadTooLarge { len, limit });
        }
        Ok(())
    }

    /// 调用方必须已持有命令锁
    pub(crate) async fn write_file_inner(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_file_size(data.len())?;

        let limits = self.connection().limits();
        let ack_overhead = script::ack_suffix(&"0".repeat(NONCE_LEN)).0.len();
        let budget = limits
            .max_string
            .saturating_sub(FILE_WRITE_OVERHEAD + ack_overhead);
        if budget < MAX_ESCAPED_BYTE {
            return Err(FrameError::PayloadTooLarge {
                len: FILE_WRITE_OVERHEAD + ack_overhead + MAX_ESCAPED_BYTE,
                limit: limits.max_string,
            });
        }

        let chunks = escaped_chunks(data, budget);
        info!("Writing {} ({} bytes, {} chunks)", path, data.len(), chunks.len());
        let delay = self.connection().settings().effective_chunk_delay();

        self.send_checked(&script::file_open(path, "write")).await?;
        for chunk in chunks {
            self.send_checked(&script::file_write(chunk)).await?;
            time::sleep(delay).await;
        }
        self.send_checked(script::file_close()).await
    }

    async fn write_file_binary_inner(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_file_size(data.len())?;

        let conn = self.connection();
        // discriminator + 文件块标记
        let chunk_size = conn.limits().max_binary.saturating_sub(1).max(1);
        let delay = conn.settings().effective_chunk_delay();
        info!(
            "Writing {} as binary ({} bytes, {} byte chunks)",
            path,
            data.len(),
            chunk_size
        );

        self.send_checked(&script::file_receive_callback(path)).await?;
        for chunk in data.chunks(chunk_size) {
            let mut frame = Vec::with_capacity(chunk.len() + 2);
            frame.push(DATA_DISCRIMINATOR);
            frame.push(FILE_CHUNK_TAG);
            frame.extend_from_slice(chunk);
            conn.send_raw(Endpoint::Tx, &frame, false).await?;
            time::sleep(delay).await;
        }
        self.send_checked(script::clear_receive_callback()).await
    }

    async fn read_file_inner(&self, path: &str) -> Result<Vec<u8>> {
        if !self.helpers_loaded() {
            return Err(FrameError::Protocol(format!(
                "reading files needs the helper library ({READ_FILE_HELPER})"
            )));
        }
        let conn = self.connection();
        let mut listener = conn.listen();
        conn.send_string(&format!(
            "{READ_FILE_HELPER}({})",
            script::lua_string_literal(path)
        ))
        .await?;
        listener
            .next_data_or_error(FramePrefix::LongData, conn.settings().default_timeout)
            .await
    }
}
