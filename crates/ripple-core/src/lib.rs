//! `ripple-core` 定义协议无关的通道契约。
//!
//! # 模块定位（Why）
//! - [`Pipeline`]：挂在单条连接上的处理器链，入站事件自头向尾、出站写入自尾向头；
//! - [`Channel`]：传输实现需要满足的最小抽象，流水线借由它把编码后的字节交给套接字；
//! - [`AttributeMap`]：上层在连接上挂载元数据（如会话标识）的通道级存储。
//!
//! # 设计概要（How）
//! - 处理器能力在注册时解析为 [`ChannelHandler`] 中的两个可选 trait 对象，分发时不做类型探测；
//! - 写入结果以 [`WriteFuture`] 表达：同步可知的结果立即就绪，交给发送循环的写入在字节落地后完成。

mod attributes;
mod channel;
mod error;
mod future;
mod message;
pub mod pipeline;

pub use attributes::{AttributeMap, SESSION_ID};
pub use channel::{AtomicChannelState, Channel, ChannelId, ChannelState};
pub use error::{CoreError, Result};
pub use future::{WriteFuture, WritePromise, WriteResult};
pub use message::PipelineMessage;
pub use pipeline::{
    ChannelContext, ChannelHandler, HandlerCapability, HandlerRef, InboundHandler,
    OutboundHandler, Pipeline,
};

pub use ripple_buffer as buffer;
