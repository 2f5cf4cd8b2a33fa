use std::{error::Error as StdError, io};

use ripple_buffer::BufferError;
use thiserror::Error;

/// 流水线与通道层的统一错误。
///
/// # 契约说明（What）
/// - 拓扑类错误（`DuplicateName`、`HandlerNotFound`）同步返回给修改流水线的调用方；
/// - `PeerDisconnected` 仅用于描述关闭原因，传输层不会把它投递给 `exception_caught`；
/// - `Io` 与处理器失败会经由 `exception_caught` 上报，随后触发通道关闭；
/// - `Handler` 供上层处理器（如解码器）包装自定义错误。
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("handler name `{0}` already exists in the pipeline")]
    DuplicateName(String),
    #[error("handler `{0}` not found in the pipeline")]
    HandlerNotFound(String),
    #[error("outbound message reached the transport without being encoded into a buffer")]
    UnsupportedMessage,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("handler panicked during {event}: {message}")]
    HandlerPanicked { event: &'static str, message: String },
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Handler(Box<dyn StdError + Send + Sync>),
}

impl CoreError {
    /// 包装上层处理器的自定义错误。
    pub fn handler<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Handler(Box::new(error))
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateName(_) => "ripple.pipeline.duplicate_name",
            Self::HandlerNotFound(_) => "ripple.pipeline.handler_not_found",
            Self::UnsupportedMessage => "ripple.pipeline.unsupported_message",
            Self::ChannelClosed => "ripple.channel.closed",
            Self::PeerDisconnected => "ripple.channel.peer_disconnected",
            Self::Io { .. } => "ripple.channel.io",
            Self::HandlerPanicked { .. } => "ripple.pipeline.handler_panicked",
            Self::Buffer(inner) => inner.code(),
            Self::Handler(_) => "ripple.pipeline.handler_failed",
        }
    }
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
