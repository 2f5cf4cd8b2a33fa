use ripple_core::{ChannelContext, CoreError, OutboundHandler, PipelineMessage, WriteFuture};

use crate::frame::FrameMessage;

/// 把 [`FrameMessage`] 编码为线格式缓冲的出站处理器。
///
/// 缓冲从流水线的池中租借；其它类型的消息原样向前传递。
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameEncoder;

impl OutboundHandler for FrameEncoder {
    fn on_write(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> WriteFuture {
        let frame = match msg.downcast::<FrameMessage>() {
            Ok(frame) => frame,
            Err(other) => return ctx.write(other),
        };
        let mut buf = ctx.buffer_pool().allocate();
        if let Err(err) = frame.encode_into(&mut buf) {
            let _ = buf.release();
            return WriteFuture::failed(CoreError::handler(err));
        }
        ctx.write(PipelineMessage::Buffer(buf))
    }
}
