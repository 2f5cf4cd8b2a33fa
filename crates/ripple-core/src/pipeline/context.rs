use std::sync::Arc;

use ripple_buffer::BufferPool;

use crate::{channel::Channel, error::CoreError, future::WriteFuture, message::PipelineMessage};

use super::pipeline::Pipeline;

/// 绑定到某个流水线节点的上下文。
///
/// 处理器通过它继续传播事件：`fire_*` 从当前节点向尾部寻找下一个入站处理器，
/// `write` 从当前节点向头部寻找下一个出站处理器。上下文只在一次回调内有效。
pub struct ChannelContext<'a> {
    pipeline: &'a Pipeline,
    index: usize,
    name: Arc<str>,
}

impl<'a> ChannelContext<'a> {
    pub(crate) fn new(pipeline: &'a Pipeline, index: usize, name: Arc<str>) -> Self {
        Self {
            pipeline,
            index,
            name,
        }
    }

    /// 当前节点名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &'a Pipeline {
        self.pipeline
    }

    /// 所属通道；流水线未挂接通道或通道已释放时为 `None`。
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.pipeline.channel()
    }

    pub fn buffer_pool(&self) -> &'a BufferPool {
        self.pipeline.buffer_pool()
    }

    pub fn fire_channel_registered(&self) -> Result<(), CoreError> {
        self.pipeline.registered_from(self.index)
    }

    pub fn fire_channel_active(&self) -> Result<(), CoreError> {
        self.pipeline.active_from(self.index)
    }

    pub fn fire_channel_inactive(&self) -> Result<(), CoreError> {
        self.pipeline.inactive_from(self.index)
    }

    pub fn fire_channel_unregistered(&self) -> Result<(), CoreError> {
        self.pipeline.unregistered_from(self.index)
    }

    pub fn fire_channel_read(&self, msg: PipelineMessage) -> Result<(), CoreError> {
        self.pipeline.read_from(self.index, msg)
    }

    pub fn fire_exception_caught(&self, error: CoreError) -> Result<(), CoreError> {
        self.pipeline.exception_from(self.index, error)
    }

    pub fn write(&self, msg: PipelineMessage) -> WriteFuture {
        self.pipeline.write_from(self.index, msg)
    }
}
