use std::{fmt, mem, sync::Arc};

use bytes::{Bytes, BytesMut};

use crate::error::BufferError;

/// 池化缓冲的默认初始容量。
pub const DEFAULT_INITIAL_CAPACITY: usize = 256;
/// 默认最大容量，与线协议中 `i32` 长度字段的上限对齐。
pub const DEFAULT_MAX_CAPACITY: usize = i32::MAX as usize;
/// 扩容时倍增的起点。
const GROWTH_FLOOR: usize = 64;

/// 引用计数归零时接收缓冲存储的回收端。
///
/// # 契约（What）
/// - `reclaim` 收到的缓冲已重置游标，`ref_count == 0`，且不再携带回收端；
/// - 实现方负责决定复用还是丢弃底层存储，不得回调原缓冲。
pub trait BufferRecycler: Send + Sync + 'static {
    fn reclaim(&self, buf: ByteBuf);
}

/// 带独立读写游标的可增长字节缓冲，引用计数显式管理。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 为编解码器与传输层提供大端序标量读写，以及可跨读事件累积的字节容器；
/// - 通过显式 `retain`/`release` 与池协作，替代依赖析构时机的隐式回收。
///
/// ## 逻辑（How）
/// - `data` 的长度恒等于逻辑容量，写入前通过 [`ByteBuf::ensure_writable`] 以 2 的幂扩容；
/// - `release` 使计数归零时重置游标，并把底层存储交给 [`BufferRecycler`]；
///   若未挂接回收端，存储直接释放。
///
/// ## 契约（What）
/// - 不变式：`0 ≤ reader_index ≤ writer_index ≤ capacity ≤ max_capacity`；
/// - 新建缓冲的 `ref_count` 为 1；计数归零后的任何访问返回 [`BufferError::UseAfterRelease`]；
/// - 类型本身不做线程同步，跨任务传递依赖所有权转移（move）。
///
/// ## 风险与权衡（Trade-offs）
/// - 忘记调用 `release` 的缓冲在 `Drop` 时仅释放内存、不会回池，属于可接受的性能退化而非内存错误。
pub struct ByteBuf {
    data: BytesMut,
    reader_index: usize,
    writer_index: usize,
    max_capacity: usize,
    ref_count: usize,
    recycler: Option<Arc<dyn BufferRecycler>>,
}

impl Default for ByteBuf {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }
}

impl ByteBuf {
    /// 创建指定初始容量的缓冲；初始容量超过 `max_capacity` 时截断。
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        let capacity = initial_capacity.min(max_capacity);
        Self {
            data: BytesMut::zeroed(capacity),
            reader_index: 0,
            writer_index: 0,
            max_capacity,
            ref_count: 1,
            recycler: None,
        }
    }

    /// 以给定字节构造一个可读缓冲，容量恰好等于输入长度。
    pub fn copied_from(bytes: &[u8]) -> Self {
        let mut buf = Self::new(bytes.len(), DEFAULT_MAX_CAPACITY.max(bytes.len()));
        buf.data[..bytes.len()].copy_from_slice(bytes);
        buf.writer_index = bytes.len();
        buf
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer_index
    }

    pub fn is_readable(&self) -> bool {
        self.writer_index > self.reader_index
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// 计数是否已经归零。
    pub fn is_released(&self) -> bool {
        self.ref_count == 0
    }

    /// 增加一次引用。
    pub fn retain(&mut self) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        self.ref_count += 1;
        Ok(())
    }

    /// 减少一次引用，归零时回收并返回 `true`。
    ///
    /// 回收后调用方不得再访问此缓冲；所有读写操作都会返回
    /// [`BufferError::UseAfterRelease`]。
    pub fn release(&mut self) -> Result<bool, BufferError> {
        self.ensure_accessible()?;
        self.ref_count -= 1;
        if self.ref_count > 0 {
            return Ok(false);
        }
        self.deallocate();
        Ok(true)
    }

    fn deallocate(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
        let storage = mem::take(&mut self.data);
        if let Some(recycler) = self.recycler.take() {
            recycler.reclaim(ByteBuf {
                data: storage,
                reader_index: 0,
                writer_index: 0,
                max_capacity: self.max_capacity,
                ref_count: 0,
                recycler: None,
            });
        }
    }

    pub(crate) fn attach_recycler(&mut self, recycler: Arc<dyn BufferRecycler>) {
        self.recycler = Some(recycler);
    }

    /// 重置为可复用状态：游标归零、计数恢复为 1、解除回收端。
    pub(crate) fn reset_for_reuse(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
        self.ref_count = 1;
        self.recycler = None;
    }

    fn ensure_accessible(&self) -> Result<(), BufferError> {
        if self.ref_count == 0 {
            return Err(BufferError::UseAfterRelease);
        }
        Ok(())
    }

    /// 确保至少还有 `min_writable` 字节可写。
    ///
    /// 空间足够时不做任何事；否则扩容到不小于 `writer_index + min_writable` 的
    /// 最小 2 的幂（从 64 起倍增），并以 `max_capacity` 封顶。
    pub fn ensure_writable(&mut self, min_writable: usize) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        if min_writable <= self.writable_bytes() {
            return Ok(());
        }
        let required = self.writer_index.checked_add(min_writable);
        let required = match required {
            Some(required) if required <= self.max_capacity => required,
            _ => {
                return Err(BufferError::CapacityExceeded {
                    writer_index: self.writer_index,
                    requested: min_writable,
                    max_capacity: self.max_capacity,
                });
            }
        };
        let new_capacity = required
            .max(GROWTH_FLOOR)
            .checked_next_power_of_two()
            .unwrap_or(self.max_capacity)
            .min(self.max_capacity);
        self.data.resize(new_capacity, 0);
        Ok(())
    }

    /// 跳过 `len` 个可读字节。
    pub fn skip(&mut self, len: usize) -> Result<(), BufferError> {
        self.check_readable(len)?;
        self.reader_index += len;
        Ok(())
    }

    /// 清空游标，容量保持不变。
    pub fn clear(&mut self) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        self.reader_index = 0;
        self.writer_index = 0;
        Ok(())
    }

    /// 将未读字节前移到缓冲起始位置，回收已读空间。
    pub fn discard_read_bytes(&mut self) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        if self.reader_index == 0 {
            return Ok(());
        }
        self.data.copy_within(self.reader_index..self.writer_index, 0);
        self.writer_index -= self.reader_index;
        self.reader_index = 0;
        Ok(())
    }

    /// 当前可读区域的只读视图。
    pub fn readable_slice(&self) -> Result<&[u8], BufferError> {
        self.ensure_accessible()?;
        Ok(&self.data[self.reader_index..self.writer_index])
    }

    /// 手动推进写游标，配合外部直接填充的场景。
    pub fn set_writer_index(&mut self, index: usize) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        if index < self.reader_index || index > self.capacity() {
            return Err(BufferError::OutOfBounds {
                index,
                requested: 0,
                available: self.capacity(),
            });
        }
        self.writer_index = index;
        Ok(())
    }

    fn check_readable(&self, len: usize) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        if len > self.readable_bytes() {
            return Err(BufferError::OutOfBounds {
                index: self.reader_index,
                requested: len,
                available: self.readable_bytes(),
            });
        }
        Ok(())
    }

    fn check_index(&self, index: usize, len: usize) -> Result<(), BufferError> {
        self.ensure_accessible()?;
        match index.checked_add(len) {
            Some(end) if end <= self.writer_index => Ok(()),
            _ => Err(BufferError::OutOfBounds {
                index,
                requested: len,
                available: self.writer_index.saturating_sub(index),
            }),
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.ensure_writable(bytes.len())?;
        let start = self.writer_index;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writer_index += bytes.len();
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], BufferError> {
        let out = self.peek::<N>(self.reader_index)?;
        self.reader_index += N;
        Ok(out)
    }

    fn peek<const N: usize>(&self, index: usize) -> Result<[u8; N], BufferError> {
        self.check_index(index, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[index..index + N]);
        Ok(out)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), BufferError> {
        self.put(&[u8::from(value)])
    }

    pub fn write_byte(&mut self, value: u8) -> Result<(), BufferError> {
        self.put(&[value])
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), BufferError> {
        self.put(&value.to_be_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), BufferError> {
        self.put(&value.to_be_bytes())
    }

    /// 以 IEEE-754 位模式经 `i32` 写出。
    pub fn write_f32(&mut self, value: f32) -> Result<(), BufferError> {
        self.write_i32(value.to_bits() as i32)
    }

    /// 以 IEEE-754 位模式经 `i64` 写出。
    pub fn write_f64(&mut self, value: f64) -> Result<(), BufferError> {
        self.write_i64(value.to_bits() as i64)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.put(bytes)
    }

    pub fn read_bool(&mut self) -> Result<bool, BufferError> {
        Ok(self.take::<1>()?[0] != 0)
    }

    pub fn read_byte(&mut self) -> Result<u8, BufferError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32, BufferError> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, BufferError> {
        Ok(i64::from_be_bytes(self.take()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, BufferError> {
        Ok(f32::from_bits(self.read_i32()? as u32))
    }

    pub fn read_f64(&mut self) -> Result<f64, BufferError> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    /// 读出 `len` 个字节的拷贝。
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, BufferError> {
        self.check_readable(len)?;
        let start = self.reader_index;
        self.reader_index += len;
        Ok(Bytes::copy_from_slice(&self.data[start..start + len]))
    }

    /// 读满 `dst`。
    pub fn read_into(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        self.check_readable(dst.len())?;
        let start = self.reader_index;
        dst.copy_from_slice(&self.data[start..start + dst.len()]);
        self.reader_index += dst.len();
        Ok(())
    }

    pub fn get_bool(&self, index: usize) -> Result<bool, BufferError> {
        Ok(self.peek::<1>(index)?[0] != 0)
    }

    pub fn get_byte(&self, index: usize) -> Result<u8, BufferError> {
        Ok(self.peek::<1>(index)?[0])
    }

    pub fn get_i32(&self, index: usize) -> Result<i32, BufferError> {
        Ok(i32::from_be_bytes(self.peek(index)?))
    }

    pub fn get_i64(&self, index: usize) -> Result<i64, BufferError> {
        Ok(i64::from_be_bytes(self.peek(index)?))
    }

    pub fn get_f32(&self, index: usize) -> Result<f32, BufferError> {
        Ok(f32::from_bits(self.get_i32(index)? as u32))
    }

    pub fn get_f64(&self, index: usize) -> Result<f64, BufferError> {
        Ok(f64::from_bits(self.get_i64(index)? as u64))
    }

    /// 拷贝 `[index, index + dst.len())` 到 `dst`，不移动游标。
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        self.check_index(index, dst.len())?;
        dst.copy_from_slice(&self.data[index..index + dst.len()]);
        Ok(())
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("reader_index", &self.reader_index)
            .field("writer_index", &self.writer_index)
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity)
            .field("ref_count", &self.ref_count)
            .field("pooled", &self.recycler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRecycler {
        reclaimed: AtomicUsize,
    }

    impl BufferRecycler for CountingRecycler {
        fn reclaim(&self, buf: ByteBuf) {
            assert_eq!(buf.ref_count(), 0);
            assert_eq!(buf.writer_index(), 0);
            self.reclaimed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn scalars_round_trip_in_big_endian() {
        let mut buf = ByteBuf::new(4, 1024);
        buf.write_bool(true).expect("写入 bool");
        buf.write_byte(0xAB).expect("写入 byte");
        buf.write_i32(-7).expect("写入 i32");
        buf.write_i64(i64::MIN + 3).expect("写入 i64");
        buf.write_f32(1.5).expect("写入 f32");
        buf.write_f64(-2.25).expect("写入 f64");

        assert_eq!(buf.get_i32(2).expect("读取 i32"), -7);
        assert_eq!(buf.get_byte(2).expect("首字节"), 0xFF);

        assert!(buf.read_bool().expect("读取 bool"));
        assert_eq!(buf.read_byte().expect("读取 byte"), 0xAB);
        assert_eq!(buf.read_i32().expect("读取 i32"), -7);
        assert_eq!(buf.read_i64().expect("读取 i64"), i64::MIN + 3);
        assert_eq!(buf.read_f32().expect("读取 f32"), 1.5);
        assert_eq!(buf.read_f64().expect("读取 f64"), -2.25);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn short_read_leaves_cursor_untouched() {
        let mut buf = ByteBuf::copied_from(&[0, 1, 2]);
        let err = buf.read_i32().expect_err("不足 4 字节必须失败");
        assert!(matches!(err, BufferError::OutOfBounds { requested: 4, .. }));
        assert_eq!(buf.reader_index(), 0);
    }

    #[test]
    fn growth_uses_power_of_two_from_floor() {
        let mut buf = ByteBuf::new(0, 1000);
        buf.ensure_writable(10).expect("首次扩容");
        assert_eq!(buf.capacity(), 64);
        buf.write_bytes(&[7; 64]).expect("写满");
        buf.ensure_writable(1).expect("再次扩容");
        assert_eq!(buf.capacity(), 128);
        buf.ensure_writable(800).expect("封顶扩容");
        assert_eq!(buf.capacity(), 1000);
        let err = buf.ensure_writable(937).expect_err("超出最大容量");
        assert!(matches!(err, BufferError::CapacityExceeded { .. }));
        assert_eq!(buf.capacity(), 1000);
    }

    #[test]
    fn available_space_does_not_reallocate() {
        let mut buf = ByteBuf::new(256, 1024);
        buf.write_i64(1).expect("写入");
        buf.ensure_writable(248).expect("空间充足");
        assert_eq!(buf.capacity(), 256);
    }

    #[test]
    fn released_buffer_rejects_access() {
        let recycler = Arc::new(CountingRecycler::default());
        let mut buf = ByteBuf::new(16, 64);
        buf.attach_recycler(recycler.clone());
        buf.write_i32(9).expect("写入");
        assert!(buf.release().expect("释放"));
        assert_eq!(recycler.reclaimed.load(Ordering::SeqCst), 1);
        assert_eq!(buf.write_i32(1), Err(BufferError::UseAfterRelease));
        assert_eq!(buf.read_i32(), Err(BufferError::UseAfterRelease));
        assert_eq!(buf.retain(), Err(BufferError::UseAfterRelease));
        assert_eq!(buf.release(), Err(BufferError::UseAfterRelease));
        assert_eq!(buf.clear(), Err(BufferError::UseAfterRelease));
        assert_eq!(recycler.reclaimed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn discard_read_bytes_compacts_unread_region() {
        let mut buf = ByteBuf::copied_from(&[1, 2, 3, 4, 5]);
        buf.skip(2).expect("跳过");
        buf.discard_read_bytes().expect("压缩");
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.readable_slice().expect("可读视图"), &[3, 4, 5]);
    }

    proptest! {
        #[test]
        fn deallocates_exactly_once_when_count_first_hits_zero(
            ops in proptest::collection::vec(any::<bool>(), 0..64)
        ) {
            let recycler = Arc::new(CountingRecycler::default());
            let mut buf = ByteBuf::new(8, 64);
            buf.attach_recycler(recycler.clone());
            let mut expected = 1usize;
            for retain in ops {
                if expected == 0 {
                    prop_assert!(buf.retain().is_err());
                    prop_assert!(buf.release().is_err());
                    continue;
                }
                if retain {
                    buf.retain().expect("retain");
                    expected += 1;
                } else {
                    let freed = buf.release().expect("release");
                    expected -= 1;
                    prop_assert_eq!(freed, expected == 0);
                }
                let reclaimed = recycler.reclaimed.load(Ordering::SeqCst);
                prop_assert_eq!(reclaimed, usize::from(expected == 0));
            }
        }

        #[test]
        fn cursor_invariant_holds_after_every_write(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..200), 0..20),
            reads in proptest::collection::vec(0usize..64, 0..20),
        ) {
            let mut buf = ByteBuf::new(0, 2048);
            for (index, chunk) in chunks.iter().enumerate() {
                let _ = buf.write_bytes(chunk);
                if let Some(n) = reads.get(index) {
                    let _ = buf.skip((*n).min(buf.readable_bytes()));
                }
                prop_assert!(buf.reader_index() <= buf.writer_index());
                prop_assert!(buf.writer_index() <= buf.capacity());
                prop_assert!(buf.capacity() <= buf.max_capacity());
                prop_assert_eq!(buf.readable_bytes(), buf.writer_index() - buf.reader_index());
            }
        }

        #[test]
        fn i64_and_f64_round_trip(a in any::<i64>(), b in any::<f64>().prop_filter("nan", |v| !v.is_nan())) {
            let mut buf = ByteBuf::default();
            buf.write_i64(a).expect("写入");
            buf.write_f64(b).expect("写入");
            prop_assert_eq!(buf.read_i64().expect("读取"), a);
            prop_assert_eq!(buf.read_f64().expect("读取"), b);
        }
    }
}
