use std::{any::Any, fmt};

use ripple_buffer::ByteBuf;

/// 在流水线中流动的消息。
///
/// - `Buffer`：原始字节，入站时来自传输层，出站时最终交给传输层；
/// - `User`：编解码器产出的业务对象，通过 [`PipelineMessage::downcast`] 还原具体类型。
///
/// 消息按值移动；持有 `Buffer` 的一方负责在丢弃前调用 [`PipelineMessage::release`]。
pub enum PipelineMessage {
    Buffer(ByteBuf),
    User(Box<dyn Any + Send>),
}

impl PipelineMessage {
    pub fn user<T: Any + Send>(value: T) -> Self {
        Self::User(Box::new(value))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer(_))
    }

    /// 取出缓冲；类型不符时原样返回。
    pub fn into_buffer(self) -> Result<ByteBuf, Self> {
        match self {
            Self::Buffer(buf) => Ok(buf),
            other => Err(other),
        }
    }

    /// 尝试还原业务对象；类型不符时原样返回。
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        match self {
            Self::User(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(boxed) => Err(Self::User(boxed)),
            },
            other => Err(other),
        }
    }

    /// 丢弃消息；缓冲会被释放一次。
    pub fn release(self) {
        if let Self::Buffer(mut buf) = self
            && !buf.is_released()
        {
            let _ = buf.release();
        }
    }
}

impl From<ByteBuf> for PipelineMessage {
    fn from(buf: ByteBuf) -> Self {
        Self::Buffer(buf)
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(buf) => f
                .debug_struct("PipelineMessage::Buffer")
                .field("readable", &buf.readable_bytes())
                .finish(),
            Self::User(_) => f.write_str("PipelineMessage::User(..)"),
        }
    }
}
