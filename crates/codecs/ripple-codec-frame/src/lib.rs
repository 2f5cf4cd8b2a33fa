//! `ripple-codec-frame` 提供长度前缀命令帧的编解码处理器。
//!
//! # 使用概览（How）
//! - 入站：[`ByteToMessageDecoder`] 包裹 [`FrameDecoder`]，把任意切分的字节流还原为 [`FrameMessage`]；
//! - 出站：[`FrameEncoder`] 把 [`FrameMessage`] 写入池化缓冲后交给下一个出站处理器；
//! - [`EchoHandler`] 演示业务处理器的写法，同时用于端到端测试。
//!
//! 典型注册顺序（头 → 尾）：`decoder`、`encoder`、业务处理器。

mod decoder;
mod echo;
mod encoder;
mod frame;

pub use decoder::{ByteToMessageDecoder, DecodeOutcome, Decoder, FrameDecoder};
pub use echo::EchoHandler;
pub use encoder::FrameEncoder;
pub use frame::{
    COMMAND_LEN, DEFAULT_MAX_FRAME_LENGTH, FrameError, FrameMessage, HEADER_LEN, LENGTH_FIELD_LEN,
};
