//! 应用层分片协议
//!
//! - [`frame`] 类型前缀与分片编码
//! - [`reassembly`] 通知流的分类与长消息重组
//! - [`script`] 外设脚本文本构造（所有转义规则集中于此）

pub mod frame;
pub mod reassembly;
pub mod script;

pub use frame::{DATA_DISCRIMINATOR, FramePrefix, Limits, encode_data, encode_string};
pub use reassembly::{Inbound, Reassembler};
