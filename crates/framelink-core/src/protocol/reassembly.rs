//! 通知分类与长消息重组
//!
//! 每条原始通知先按首字节分类：
//! - `0x01` 开头: 二进制帧，第二个字节是类型前缀
//! - `0x0A` / `0x0B` 开头: 长文本分片 / 结束标记
//! - 其它: 普通 UTF-8 字符串
//!
//! 文本、长数据、照片三个 family 各自最多一个进行中的重组，互不干扰。
//! 订阅者只会看到完整消息，看不到中间分片。

use log::{trace, warn};

use crate::error::FramingError;
use crate::protocol::frame::{DATA_DISCRIMINATOR, FramePrefix};

/// 重组缓冲的默认上限
pub const DEFAULT_REASSEMBLY_LIMIT: usize = 8 * 1024 * 1024;

/// 解码后的一条完整消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(Result<String, FramingError>),
    Data {
        tag: u8,
        payload: Result<Vec<u8>, FramingError>,
    },
}

#[derive(Debug, Default)]
struct LongTransfer {
    buffer: Vec<u8>,
    chunks: usize,
    overflowed: bool,
}

impl LongTransfer {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        self.chunks += 1;
        if self.overflowed {
            return;
        }
        if self.buffer.len() + chunk.len() > limit {
            warn!("Reassembly buffer exceeded {} bytes, discarding", limit);
            self.overflowed = true;
            self.buffer = Vec::new();
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// 按结束标记声明的 chunk 数校验并取出数据
    fn finish(self, declared: Option<usize>, limit: usize) -> Result<Vec<u8>, FramingError> {
        if self.overflowed {
            return Err(FramingError::Overflow { limit });
        }
        if let Some(declared) = declared
            && declared != self.chunks
        {
            return Err(FramingError::ChunkCountMismatch {
                declared,
                received: self.chunks,
            });
        }
        Ok(self.buffer)
    }
}

/// 结束标记的载荷是十进制 ASCII 的 chunk 数，空载荷视为 0
fn parse_chunk_count(body: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| FramingError::MalformedEndMarker(format!("{body:02x?}")))?
        .trim();
    if text.is_empty() {
        return Ok(0);
    }
    text.parse()
        .map_err(|_| FramingError::MalformedEndMarker(text.to_string()))
}

/// 单连接的重组状态机
#[derive(Debug)]
pub struct Reassembler {
    text: Option<LongTransfer>,
    data: Option<LongTransfer>,
    photo: Option<LongTransfer>,
    limit: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_LIMIT)
    }
}

impl Reassembler {
    pub fn new(limit: usize) -> Self {
        Self {
            text: None,
            data: None,
            photo: None,
            limit,
        }
    }

    /// 输入一条原始通知，消息完整时返回
    pub fn feed(&mut self, raw: &[u8]) -> Option<Inbound> {
        let (&first, rest) = raw.split_first()?;

        if first == DATA_DISCRIMINATOR {
            let Some((&tag, body)) = rest.split_first() else {
                trace!("Ignoring bare discriminator notification");
                return None;
            };
            return self.feed_data(tag, body);
        }

        match FramePrefix::from_byte(first) {
            Some(FramePrefix::LongText) => {
                self.text
                    .get_or_insert_with(LongTransfer::default)
                    .push(rest, self.limit);
                None
            }
            Some(FramePrefix::LongTextEnd) => {
                let transfer = self.text.take().unwrap_or_default();
                let result = parse_chunk_count(rest)
                    .and_then(|declared| transfer.finish(Some(declared), self.limit))
                    .and_then(|bytes| String::from_utf8(bytes).map_err(|_| FramingError::InvalidUtf8));
                Some(Inbound::Text(result))
            }
            _ => Some(Inbound::Text(
                String::from_utf8(raw.to_vec()).map_err(|_| FramingError::InvalidUtf8),
            )),
        }
    }

    fn feed_data(&mut self, tag: u8, body: &[u8]) -> Option<Inbound> {
        match FramePrefix::from_byte(tag) {
            Some(FramePrefix::LongData) => {
                self.data
                    .get_or_insert_with(LongTransfer::default)
                    .push(body, self.limit);
                None
            }
            Some(FramePrefix::LongDataEnd) => {
                let transfer = self.data.take().unwrap_or_default();
                let payload = parse_chunk_count(body)
                    .and_then(|declared| transfer.finish(Some(declared), self.limit));
                Some(Inbound::Data {
                    tag: FramePrefix::LongData.byte(),
                    payload,
                })
            }
            Some(FramePrefix::PhotoData) => {
                self.photo
                    .get_or_insert_with(LongTransfer::default)
                    .push(body, self.limit);
                None
            }
            // 照片结束帧携带最后一段数据，不带计数
            Some(FramePrefix::PhotoDataEnd) => {
                let mut transfer = self.photo.take().unwrap_or_default();
                transfer.push(body, self.limit);
                Some(Inbound::Data {
                    tag: FramePrefix::PhotoData.byte(),
                    payload: transfer.finish(None, self.limit),
                })
            }
            _ => Some(Inbound::Data {
                tag,
                payload: Ok(body.to_vec()),
            }),
        }
    }
}
