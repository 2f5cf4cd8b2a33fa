use std::{
    alloc::{self, Layout},
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crossbeam_queue::SegQueue;
use spin::Mutex;

use crate::error::BufferError;

/// 默认块大小，对齐典型操作系统页。
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// 每个 Slab 默认切分的块数（默认 128 KiB）。
pub const DEFAULT_BLOCKS_PER_SLAB: usize = 32;
/// Slab 起始地址的对齐边界。
pub const PAGE_SIZE: usize = 4096;

/// 一段固定长度的大块内存。
///
/// 内存在最后一个引用（分配器或块）释放后归还给系统，
/// 因此已租出的块在分配器销毁后依旧指向有效内存。
pub struct Slab {
    ptr: NonNull<u8>,
    layout: Layout,
    active: AtomicBool,
}

// SAFETY: `Slab` 只暴露原始区域；各 `Block` 持有互不重叠的区间，
// 同一区间在任何时刻只存在于自由队列或单个 `Block` 中。
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    fn allocate(len: usize) -> Option<Self> {
        // 起始地址按页对齐，切分从偏移 0 开始，任何大小的 Slab 都不会损失块。
        let layout = Layout::from_size_align(len.max(1), PAGE_SIZE).ok()?;
        // SAFETY: layout 非零长度。
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Some(Self {
            ptr,
            layout,
            active: AtomicBool::new(true),
        })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// 分配器尚未销毁时为 `true`。
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // SAFETY: `ptr` 由同一 `layout` 分配且仅在此处释放。
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("len", &self.len())
            .field("active", &self.is_active())
            .finish()
    }
}

struct BlockRegion {
    slab: Arc<Slab>,
    offset: usize,
    len: usize,
}

/// Slab 中一段固定长度的可租借视图。
///
/// `Drop` 时总是回到所属分配器的自由队列；分配器已销毁时直接丢弃。
pub struct Block {
    region: Option<BlockRegion>,
    allocator: Arc<AllocatorInner>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.region.as_ref().map_or(0, |region| region.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 块在 Slab 中的起始偏移。
    pub fn offset(&self) -> usize {
        self.region.as_ref().map_or(0, |region| region.offset)
    }

    pub fn slab(&self) -> Option<&Arc<Slab>> {
        self.region.as_ref().map(|region| &region.slab)
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.region {
            // SAFETY: 区间位于 Slab 内存范围内，且仅由当前块持有。
            Some(region) => unsafe {
                slice::from_raw_parts(region.slab.ptr.as_ptr().add(region.offset), region.len)
            },
            None => &[],
        }
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.region {
            // SAFETY: 同上；`&mut self` 保证独占。
            Some(region) => unsafe {
                slice::from_raw_parts_mut(region.slab.ptr.as_ptr().add(region.offset), region.len)
            },
            None => &mut [],
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.allocator.return_region(region);
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("offset", &self.offset())
            .field("len", &self.len())
            .finish()
    }
}

/// Slab 分配器统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlabStats {
    pub block_size: usize,
    pub slabs: usize,
    pub free_blocks: usize,
    pub leased_blocks: usize,
}

/// 为 I/O 热路径提供固定大小内存块的 Slab 分配器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 套接字收发缓冲需要频繁租借与归还，按消息分配会放大分配器压力与碎片；
/// - 预热后的稳定态只剩一次无锁出队与一次入队。
///
/// ## 逻辑（How）
/// - 自由队列为 `crossbeam_queue::SegQueue`，存放尚未租出的块区间；
/// - 队列为空时分配一个按页对齐、大小为 `block_size × blocks_per_slab` 的 Slab，
///   从偏移 0 开始切分，返回其中一块，其余入队；
/// - Slab 列表只在新建与销毁时加锁，属于冷路径。
///
/// ## 契约（What）
/// - `rent(size)`：`size > block_size` 返回 [`BufferError::SizeTooLarge`]，销毁后返回
///   [`BufferError::Disposed`]；返回的块长度恒为 `block_size`；
/// - `return_block`/`Drop`：未销毁时入队，否则丢弃；同一块不会被回收两次；
/// - `dispose`：标记所有 Slab 失活并清空自由队列，幂等。
#[derive(Clone)]
pub struct SlabAllocator {
    inner: Arc<AllocatorInner>,
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCKS_PER_SLAB)
    }
}

struct AllocatorInner {
    block_size: usize,
    blocks_per_slab: usize,
    free: SegQueue<BlockRegion>,
    slabs: Mutex<Vec<Arc<Slab>>>,
    disposed: AtomicBool,
    leased: AtomicUsize,
}

impl SlabAllocator {
    /// 块大小与每 Slab 块数均至少为 1。
    pub fn new(block_size: usize, blocks_per_slab: usize) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                block_size: block_size.max(1),
                blocks_per_slab: blocks_per_slab.max(1),
                free: SegQueue::new(),
                slabs: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
                leased: AtomicUsize::new(0),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// 租借一个能容纳 `size` 字节的块。
    pub fn rent(&self, size: usize) -> Result<Block, BufferError> {
        let inner = &self.inner;
        if size > inner.block_size {
            return Err(BufferError::SizeTooLarge {
                requested: size,
                block_size: inner.block_size,
            });
        }
        if self.is_disposed() {
            return Err(BufferError::Disposed);
        }
        let region = match inner.free.pop() {
            Some(region) => region,
            None => inner.allocate_slab()?,
        };
        inner.leased.fetch_add(1, Ordering::Relaxed);
        Ok(Block {
            region: Some(region),
            allocator: Arc::clone(inner),
        })
    }

    /// 显式归还块，等价于 `drop(block)`。
    pub fn return_block(&self, block: Block) {
        drop(block);
    }

    /// 释放所有 Slab；仍在外的块归还时被直接丢弃。
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let slabs = std::mem::take(&mut *self.inner.slabs.lock());
        for slab in &slabs {
            slab.active.store(false, Ordering::Release);
        }
        while self.inner.free.pop().is_some() {}
        tracing::debug!(slabs = slabs.len(), "slab allocator disposed");
    }

    pub fn statistics(&self) -> SlabStats {
        SlabStats {
            block_size: self.inner.block_size,
            slabs: self.inner.slabs.lock().len(),
            free_blocks: self.inner.free.len(),
            leased_blocks: self.inner.leased.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for SlabAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabAllocator")
            .field("stats", &self.statistics())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl AllocatorInner {
    fn allocate_slab(&self) -> Result<BlockRegion, BufferError> {
        let too_large = BufferError::SizeTooLarge {
            requested: self.block_size,
            block_size: self.block_size,
        };
        let Some(slab_len) = self.block_size.checked_mul(self.blocks_per_slab) else {
            return Err(too_large);
        };
        let Some(slab) = Slab::allocate(slab_len) else {
            return Err(too_large);
        };
        let slab = Arc::new(slab);

        {
            let mut slabs = self.slabs.lock();
            if self.disposed.load(Ordering::Acquire) {
                return Err(BufferError::Disposed);
            }
            slabs.push(Arc::clone(&slab));
        }

        for index in 1..self.blocks_per_slab {
            self.free.push(BlockRegion {
                slab: Arc::clone(&slab),
                offset: index * self.block_size,
                len: self.block_size,
            });
        }
        tracing::trace!(
            blocks = self.blocks_per_slab,
            block_size = self.block_size,
            "slab allocated"
        );
        Ok(BlockRegion {
            slab,
            offset: 0,
            len: self.block_size,
        })
    }

    fn return_region(&self, region: BlockRegion) {
        let _ = self
            .leased
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(prev.saturating_sub(1))
            });
        if self.disposed.load(Ordering::Acquire) || !region.slab.is_active() {
            return;
        }
        self.free.push(region);
    }
}
