use std::{
    fmt,
    sync::atomic::{AtomicU8, AtomicU64, Ordering},
};

use ripple_buffer::ByteBuf;

use crate::{attributes::AttributeMap, future::WriteFuture, message::PipelineMessage};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的通道标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// 分配下一个标识。
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{:08x}", self.0)
    }
}

/// 通道生命周期。
///
/// `Created → Connected → Draining → Closed`，只能前进不能回退。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelState {
    Created = 0,
    Connected = 1,
    Draining = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Connected,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// 只进不退的原子状态单元。
#[derive(Debug)]
pub struct AtomicChannelState(AtomicU8);

impl Default for AtomicChannelState {
    fn default() -> Self {
        Self::new(ChannelState::Created)
    }
}

impl AtomicChannelState {
    pub const fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// 推进到 `next`；仅当 `next` 晚于当前状态时生效，返回推进前的状态。
    pub fn advance(&self, next: ChannelState) -> ChannelState {
        let prev = self.0.fetch_max(next as u8, Ordering::AcqRel);
        ChannelState::from_u8(prev)
    }
}

/// 一条连接对上层暴露的抽象。
///
/// # 契约（What）
/// - `write`：总是先经过流水线的出站链；
/// - `close`：优雅关闭，先排空已排队的写入再关闭套接字，立即返回；
/// - `shutdown`：立即关闭，幂等，只有真正执行了拆除的那次调用返回 `true`；
/// - `send_to_transport`：流水线出站链的兜底出口，仅供 [`crate::Pipeline`] 调用，
///   实现方在把字节拷贝进传输层自有内存后释放 `buf`。
pub trait Channel: Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    fn state(&self) -> ChannelState;

    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    fn attributes(&self) -> &AttributeMap;

    fn write(&self, msg: PipelineMessage) -> WriteFuture;

    fn close(&self);

    fn shutdown(&self) -> bool;

    fn send_to_transport(&self, buf: ByteBuf) -> WriteFuture;
}
