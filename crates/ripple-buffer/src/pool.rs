use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_queue::ArrayQueue;

use crate::buf::{BufferRecycler, ByteBuf, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY};

/// 默认的归还保留上限。
pub const DEFAULT_RETAIN_CAPACITY: usize = 64 * 1024;

/// 可被 [`ObjectPool`] 复用的对象。
pub trait Poolable: Send + 'static {
    /// 回到自由队列前重置内部状态。
    fn reset(&mut self);
}

impl Poolable for ByteBuf {
    fn reset(&mut self) {
        self.reset_for_reuse();
    }
}

/// 池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 自由队列中的空闲对象数。
    pub idle: usize,
    /// 工厂累计创建次数。
    pub created: u64,
    /// 命中自由队列的租借次数。
    pub reused: u64,
    /// 因超出上限被丢弃的对象数。
    pub trimmed: u64,
}

/// 基于无锁有界队列的通用对象池。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 在热路径上复用缓冲等对象，避免每条消息都触发堆分配；
/// - 多个连接、多个调度线程同时租借与归还时不依赖全局锁。
///
/// ## 逻辑（How）
/// - 自由队列使用 `crossbeam_queue::ArrayQueue`，容量即 `max_size`；
/// - `allocate` 优先弹出空闲对象，队列为空时通过工厂新建，不会阻塞或失败；
/// - `free` 先调用 [`Poolable::reset`]，再尝试入队；队列已满时直接丢弃。
///
/// ## 契约（What）
/// - 构造时预填充 `min_size` 个对象；
/// - 自由队列长度在任何时刻都不超过 `max_size`（`ArrayQueue` 的容量是硬上限）；
/// - 统计数据仅用于观测，采用 `Relaxed` 内存序。
pub struct ObjectPool<T: Poolable> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Poolable> ObjectPool<T> {
    /// 创建对象池并预填充 `min_size` 个对象。
    ///
    /// `max_size` 至少为 1，且不小于 `min_size`。
    pub fn new<F>(factory: F, min_size: usize, max_size: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let max_size = max_size.max(min_size).max(1);
        let inner = PoolInner {
            queue: ArrayQueue::new(max_size),
            factory: Box::new(factory),
            min_size,
            metrics: PoolMetrics::default(),
        };
        for _ in 0..min_size {
            let item = inner.create();
            let _ = inner.queue.push(item);
        }
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn allocate(&self) -> T {
        self.inner.allocate()
    }

    pub fn free(&self, item: T) {
        self.inner.free(item);
    }

    pub fn min_size(&self) -> usize {
        self.inner.min_size
    }

    pub fn max_size(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn idle(&self) -> usize {
        self.inner.queue.len()
    }

    /// 丢弃空闲对象直到队列长度不超过 `target`，返回丢弃数量。
    pub fn shrink_to(&self, target: usize) -> usize {
        let mut dropped = 0;
        while self.inner.queue.len() > target {
            if self.inner.queue.pop().is_none() {
                break;
            }
            dropped += 1;
        }
        self.inner
            .metrics
            .trimmed
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

impl<T: Poolable> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("min_size", &self.inner.min_size)
            .field("max_size", &self.inner.queue.capacity())
            .field("stats", &self.inner.snapshot())
            .finish()
    }
}

struct PoolInner<T> {
    queue: ArrayQueue<T>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    min_size: usize,
    metrics: PoolMetrics,
}

impl<T: Poolable> PoolInner<T> {
    fn create(&self) -> T {
        self.metrics.created.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }

    fn allocate(&self) -> T {
        match self.queue.pop() {
            Some(item) => {
                self.metrics.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => self.create(),
        }
    }

    fn free(&self, mut item: T) {
        item.reset();
        if self.queue.push(item).is_err() {
            self.metrics.trimmed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(max_size = self.queue.capacity(), "pool full, dropping item");
        }
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            idle: self.queue.len(),
            created: self.metrics.created.load(Ordering::Relaxed),
            reused: self.metrics.reused.load(Ordering::Relaxed),
            trimmed: self.metrics.trimmed.load(Ordering::Relaxed),
        }
    }
}

/// 缓冲归还端：容量超出 `retain_capacity` 的存储直接丢弃，不回到自由队列。
struct BufferReturn {
    objects: Arc<PoolInner<ByteBuf>>,
    retain_capacity: usize,
}

impl BufferRecycler for BufferReturn {
    fn reclaim(&self, buf: ByteBuf) {
        if buf.capacity() > self.retain_capacity {
            self.objects.metrics.trimmed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                capacity = buf.capacity(),
                retain_capacity = self.retain_capacity,
                "dropping oversized buffer"
            );
            return;
        }
        self.objects.free(buf);
    }
}

#[derive(Default)]
struct PoolMetrics {
    created: AtomicU64,
    reused: AtomicU64,
    trimmed: AtomicU64,
}

/// [`BufferPool`] 的构造参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferPoolOptions {
    pub buffer_size: usize,
    pub max_capacity: usize,
    /// 归还时允许保留的最大容量；低于 `buffer_size` 时按 `buffer_size` 计。
    pub retain_capacity: usize,
    pub min_size: usize,
    pub max_size: usize,
}

impl Default for BufferPoolOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_INITIAL_CAPACITY,
            max_capacity: DEFAULT_MAX_CAPACITY,
            retain_capacity: DEFAULT_RETAIN_CAPACITY,
            min_size: 10,
            max_size: 100,
        }
    }
}

/// 专用于 [`ByteBuf`] 的对象池。
///
/// 租出的缓冲挂接了指回本池的回收端：调用方最后一次 `release` 时，
/// 缓冲存储自动回到自由队列。
#[derive(Clone)]
pub struct BufferPool {
    objects: ObjectPool<ByteBuf>,
    recycler: Arc<BufferReturn>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("objects", &self.objects)
            .field("retain_capacity", &self.recycler.retain_capacity)
            .finish()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolOptions::default())
    }
}

impl BufferPool {
    pub fn new(options: BufferPoolOptions) -> Self {
        let BufferPoolOptions {
            buffer_size,
            max_capacity,
            ..
        } = options;
        let objects = ObjectPool::new(
            move || ByteBuf::new(buffer_size, max_capacity),
            options.min_size,
            options.max_size,
        );
        let recycler = Arc::new(BufferReturn {
            objects: Arc::clone(&objects.inner),
            retain_capacity: options.retain_capacity.max(buffer_size),
        });
        Self { objects, recycler }
    }

    /// 租借一个 `ref_count == 1` 的空缓冲。
    pub fn allocate(&self) -> ByteBuf {
        let mut buf = self.objects.allocate();
        let recycler: Arc<dyn BufferRecycler> = self.recycler.clone();
        buf.attach_recycler(recycler);
        buf
    }

    /// 直接归还缓冲，不经过引用计数；超大的存储同样被丢弃。
    pub fn free(&self, buf: ByteBuf) {
        self.recycler.reclaim(buf);
    }

    pub fn idle(&self) -> usize {
        self.objects.idle()
    }

    pub fn shrink_to(&self, target: usize) -> usize {
        self.objects.shrink_to(target)
    }

    pub fn statistics(&self) -> PoolStats {
        self.objects.statistics()
    }
}
