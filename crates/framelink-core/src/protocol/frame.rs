//! 帧类型前缀与分片编码
//!
//! 二进制帧: `[0x01][tag] + payload`，字符串帧: 原始 UTF-8（首字节不得为 0x01）。
//! 超出单次写入上限的消息拆分为若干 chunk，最后追加一个携带 chunk 数
//! （十进制 ASCII）的结束标记。

use crate::ble::ATT_OVERHEAD;

/// 区分二进制帧与字符串帧的首字节
pub const DATA_DISCRIMINATOR: u8 = 0x01;
/// 中断外设上正在执行的脚本
pub const BREAK_SIGNAL: u8 = 0x03;
/// 重启外设脚本环境
pub const RESET_SIGNAL: u8 = 0x04;
/// 外设文件接收回调识别的数据块标记
pub const FILE_CHUNK_TAG: u8 = 0x02;

/// 二进制通知的类型前缀
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FramePrefix {
    LongData = 0x01,
    LongDataEnd = 0x02,
    Wake = 0x03,
    Tap = 0x04,
    MicData = 0x05,
    DebugPrint = 0x06,
    PhotoData = 0x07,
    PhotoDataEnd = 0x08,
    CheckLength = 0x09,
    LongText = 0x0A,
    LongTextEnd = 0x0B,
}

impl FramePrefix {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FramePrefix::LongData),
            0x02 => Some(FramePrefix::LongDataEnd),
            0x03 => Some(FramePrefix::Wake),
            0x04 => Some(FramePrefix::Tap),
            0x05 => Some(FramePrefix::MicData),
            0x06 => Some(FramePrefix::DebugPrint),
            0x07 => Some(FramePrefix::PhotoData),
            0x08 => Some(FramePrefix::PhotoDataEnd),
            0x09 => Some(FramePrefix::CheckLength),
            0x0A => Some(FramePrefix::LongText),
            0x0B => Some(FramePrefix::LongTextEnd),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl From<FramePrefix> for u8 {
    fn from(prefix: FramePrefix) -> Self {
        prefix.byte()
    }
}

/// 当前链路的单次写入上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// 单次字符串写入的最大字节数
    pub max_string: usize,
    /// 单次二进制写入的最大载荷（预留 1 字节给 discriminator）
    pub max_binary: usize,
}

impl Limits {
    /// `max_string = MTU - 3`, `max_binary = MTU - 4`
    pub fn from_mtu(mtu: usize) -> Self {
        Self::from_max_string(mtu.saturating_sub(ATT_OVERHEAD))
    }

    /// 由外设报告的最大字符串长度推出
    pub fn from_max_string(max_string: usize) -> Self {
        Self {
            max_string,
            max_binary: max_string.saturating_sub(1),
        }
    }

    /// 长消息每个 chunk 的最大字节数（discriminator + chunk tag 各占 1 字节）
    pub fn chunk_size(&self) -> usize {
        self.max_binary.saturating_sub(2).max(1)
    }
}

/// 字符串首字节会被接收方误判为二进制帧或长文本帧时返回 true
fn ambiguous_first_byte(bytes: &[u8]) -> bool {
    matches!(
        bytes.first(),
        Some(&DATA_DISCRIMINATOR)
            | Some(&0x0A) // FramePrefix::LongText
            | Some(&0x0B) // FramePrefix::LongTextEnd
    )
}

/// 编码字符串消息
///
/// 能放进单次写入且首字节无歧义时原样发送，否则走长文本分片。
pub fn encode_string(text: &str, limits: Limits) -> Vec<Vec<u8>> {
    let bytes = text.as_bytes();
    if bytes.len() <= limits.max_string && !ambiguous_first_byte(bytes) && !bytes.is_empty() {
        return vec![bytes.to_vec()];
    }
    long_text_frames(bytes, limits.chunk_size())
}

/// 编码二进制消息
///
/// 单次写入: `[0x01] + payload`；否则走长数据分片。
pub fn encode_data(payload: &[u8], limits: Limits) -> Vec<Vec<u8>> {
    if payload.len() <= limits.max_binary {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(DATA_DISCRIMINATOR);
        frame.extend_from_slice(payload);
        return vec![frame];
    }
    long_data_frames(payload, limits.chunk_size())
}

/// 长数据分片: `[0x01][0x01] + chunk` ... `[0x01][0x02] + count`
pub fn long_data_frames(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let header = [DATA_DISCRIMINATOR, FramePrefix::LongData.byte()];
    let end = [DATA_DISCRIMINATOR, FramePrefix::LongDataEnd.byte()];
    chunked(&header, &end, payload, chunk_size)
}

/// 长文本分片: `[0x0A] + chunk` ... `[0x0B] + count`（没有外层 discriminator）
pub fn long_text_frames(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    chunked(
        &[FramePrefix::LongText.byte()],
        &[FramePrefix::LongTextEnd.byte()],
        payload,
        chunk_size,
    )
}

fn chunked(header: &[u8], end: &[u8], payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let mut frames: Vec<Vec<u8>> = payload
        .chunks(chunk_size.max(1))
        .map(|chunk| {
            let mut frame = Vec::with_capacity(header.len() + chunk.len());
            frame.extend_from_slice(header);
            frame.extend_from_slice(chunk);
            frame
        })
        .collect();

    let count = frames.len();
    let mut end_frame = end.to_vec();
    end_frame.extend_from_slice(count.to_string().as_bytes());
    frames.push(end_frame);
    frames
}
