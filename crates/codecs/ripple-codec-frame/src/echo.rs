use ripple_core::{ChannelContext, CoreError, InboundHandler, PipelineMessage};

use crate::frame::FrameMessage;

/// 回显处理器：以相同命令与负载、`request_id = 0` 应答每一帧。
///
/// 需要位于 [`crate::FrameEncoder`] 之后（更靠近尾部），以便应答经过编码器。
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoHandler;

impl InboundHandler for EchoHandler {
    fn on_read(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        let frame = match msg.downcast::<FrameMessage>() {
            Ok(frame) => frame,
            Err(other) => return ctx.fire_channel_read(other),
        };
        tracing::trace!(command = %frame.command, request_id = frame.request_id, "echoing frame");
        let reply = FrameMessage::new(frame.command, 0, frame.payload);
        // 应答落地与否由发送循环负责，这里不等待。
        drop(ctx.write(PipelineMessage::user(reply)));
        Ok(())
    }
}
