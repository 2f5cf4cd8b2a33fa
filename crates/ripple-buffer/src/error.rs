use thiserror::Error;

/// 缓冲、对象池与 Slab 分配器共享的错误类型。
///
/// # 契约说明（What）
/// - `CapacityExceeded`：扩容后仍无法容纳写入，只影响当前写操作；
/// - `UseAfterRelease`：引用计数已归零的缓冲被再次访问，属于调用方编程错误；
/// - `OutOfBounds`：读取长度超过可读字节数，读游标保持不变；
/// - `SizeTooLarge`：租借尺寸大于块大小；
/// - `Disposed`：分配器已释放，拒绝新的租借。
///
/// 所有错误均为同步、局部错误，不会破坏池的共享状态。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("writer index {writer_index} + {requested} exceeds max capacity {max_capacity}")]
    CapacityExceeded {
        writer_index: usize,
        requested: usize,
        max_capacity: usize,
    },
    #[error("buffer accessed after its reference count reached zero")]
    UseAfterRelease,
    #[error("requested {requested} bytes at index {index}, only {available} available")]
    OutOfBounds {
        index: usize,
        requested: usize,
        available: usize,
    },
    #[error("requested block size {requested} exceeds slab block size {block_size}")]
    SizeTooLarge { requested: usize, block_size: usize },
    #[error("slab allocator has been disposed")]
    Disposed,
}

impl BufferError {
    /// 稳定错误码，便于日志检索与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "ripple.buffer.capacity_exceeded",
            Self::UseAfterRelease => "ripple.buffer.use_after_release",
            Self::OutOfBounds { .. } => "ripple.buffer.out_of_bounds",
            Self::SizeTooLarge { .. } => "ripple.buffer.size_too_large",
            Self::Disposed => "ripple.buffer.disposed",
        }
    }
}
