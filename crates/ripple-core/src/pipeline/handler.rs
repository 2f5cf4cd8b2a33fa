use std::{fmt, sync::Arc};

use crate::{error::CoreError, future::WriteFuture, message::PipelineMessage};

use super::context::ChannelContext;

/// 入站处理器。
///
/// 所有方法默认把事件原样转发给下一个入站处理器，实现方只需覆盖关心的事件；
/// 不调用 `ctx.fire_*` 即表示吞掉事件。返回 `Err` 会沿调用栈回到通道循环，
/// 由通道统一上报 `exception_caught` 并关闭连接。
pub trait InboundHandler: Send + Sync + 'static {
    fn on_channel_registered(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        ctx.fire_channel_registered()
    }

    fn on_channel_active(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        ctx.fire_channel_active()
    }

    fn on_channel_inactive(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        ctx.fire_channel_inactive()
    }

    fn on_channel_unregistered(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        ctx.fire_channel_unregistered()
    }

    fn on_read(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        ctx.fire_channel_read(msg)
    }

    fn on_exception_caught(
        &self,
        ctx: &ChannelContext<'_>,
        error: CoreError,
    ) -> Result<(), CoreError> {
        ctx.fire_exception_caught(error)
    }
}

/// 出站处理器。
///
/// 默认实现把写入转交给前一个出站处理器；处理器可以转换、拆分或丢弃消息。
pub trait OutboundHandler: Send + Sync + 'static {
    fn on_write(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> WriteFuture {
        ctx.write(msg)
    }
}

/// 处理器在注册时声明的能力。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerCapability {
    Inbound,
    Outbound,
    Duplex,
}

/// 注册到流水线的处理器槽位。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 事件分发时不做任何运行时类型探测：能力在注册时就解析成两个可选的 trait 对象；
/// - 同一处理器实例以 `Duplex` 注册时，两个方向共享同一个 `Arc`。
///
/// ## 契约（What）
/// - `inbound`/`outbound`/`duplex` 构造函数是唯一入口；
/// - [`ChannelHandler::same_handler`] 依据底层实例地址判等，供 `remove`/`replace` 按处理器定位节点。
#[derive(Clone)]
pub struct ChannelHandler {
    inbound: Option<Arc<dyn InboundHandler>>,
    outbound: Option<Arc<dyn OutboundHandler>>,
    identity: usize,
}

impl ChannelHandler {
    pub fn inbound<H: InboundHandler>(handler: H) -> Self {
        Self::from_inbound(Arc::new(handler))
    }

    pub fn outbound<H: OutboundHandler>(handler: H) -> Self {
        Self::from_outbound(Arc::new(handler))
    }

    pub fn duplex<H: InboundHandler + OutboundHandler>(handler: H) -> Self {
        let shared = Arc::new(handler);
        let identity = Arc::as_ptr(&shared) as *const () as usize;
        let inbound: Arc<dyn InboundHandler> = shared.clone();
        let outbound: Arc<dyn OutboundHandler> = shared;
        Self {
            inbound: Some(inbound),
            outbound: Some(outbound),
            identity,
        }
    }

    pub fn from_inbound(handler: Arc<dyn InboundHandler>) -> Self {
        let identity = Arc::as_ptr(&handler) as *const () as usize;
        Self {
            inbound: Some(handler),
            outbound: None,
            identity,
        }
    }

    pub fn from_outbound(handler: Arc<dyn OutboundHandler>) -> Self {
        let identity = Arc::as_ptr(&handler) as *const () as usize;
        Self {
            inbound: None,
            outbound: Some(handler),
            identity,
        }
    }

    pub fn capability(&self) -> HandlerCapability {
        match (&self.inbound, &self.outbound) {
            (Some(_), Some(_)) => HandlerCapability::Duplex,
            (None, Some(_)) => HandlerCapability::Outbound,
            _ => HandlerCapability::Inbound,
        }
    }

    pub fn as_inbound(&self) -> Option<&Arc<dyn InboundHandler>> {
        self.inbound.as_ref()
    }

    pub fn as_outbound(&self) -> Option<&Arc<dyn OutboundHandler>> {
        self.outbound.as_ref()
    }

    pub fn same_handler(&self, other: &ChannelHandler) -> bool {
        self.identity == other.identity
    }
}

impl fmt::Debug for ChannelHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandler")
            .field("capability", &self.capability())
            .finish()
    }
}
