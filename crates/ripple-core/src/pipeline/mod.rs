//! 通道流水线：处理器契约、节点上下文与双向链式分发。

mod context;
mod handler;
#[allow(clippy::module_inception)]
mod pipeline;

pub use context::ChannelContext;
pub use handler::{ChannelHandler, HandlerCapability, InboundHandler, OutboundHandler};
pub use pipeline::{HandlerRef, Pipeline};
