//! `ripple-buffer` 提供传输栈热路径上的内存原语。
//!
//! # 模块定位（Why）
//! - [`ByteBuf`]：带独立读写游标、显式引用计数的可增长字节缓冲，供编解码器累积与解析帧；
//! - [`BufferPool`] / [`ObjectPool`]：基于无锁有界队列的对象池，缓冲在最后一次
//!   `release` 时自动回池；
//! - [`SlabAllocator`]：把大块内存切成固定大小的 [`Block`]，为套接字收发提供免分配的读写区。
//!
//! # 设计概要（How）
//! - 回收路径全部显式化：`ByteBuf` 依赖 `release`，`Block` 依赖 `Drop`，不存在依赖析构时序的隐式回收；
//! - 池与分配器的共享结构只有 `crossbeam-queue` 队列与原子计数，可在任意线程并发使用。

mod buf;
mod error;
mod pool;
mod slab;

pub use buf::{BufferRecycler, ByteBuf, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY};
pub use error::BufferError;
pub use pool::{
    BufferPool, BufferPoolOptions, DEFAULT_RETAIN_CAPACITY, ObjectPool, PoolStats, Poolable,
};
pub use slab::{
    Block, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCKS_PER_SLAB, PAGE_SIZE, Slab, SlabAllocator, SlabStats,
};
