use std::collections::VecDeque;

use parking_lot::Mutex;
use ripple_buffer::Block;
use ripple_core::{WritePromise, WriteResult};
use tokio::sync::Notify;

/// 队列中的一段字节：租借的块与其中有效的前缀长度。
///
/// 出站段可能携带一次写入的完成端；同一次写入拆成多段时只挂在最后一段上。
pub(crate) struct Segment {
    block: Block,
    len: usize,
    completion: Option<Completion>,
}

struct Completion {
    promise: WritePromise,
    total: usize,
}

impl Segment {
    pub(crate) fn new(block: Block, len: usize) -> Self {
        debug_assert!(len <= block.len());
        Self {
            block,
            len,
            completion: None,
        }
    }

    /// 挂上写入完成端，`total` 为整次写入的字节数。
    pub(crate) fn with_promise(mut self, promise: WritePromise, total: usize) -> Self {
        self.completion = Some(Completion { promise, total });
        self
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.block[..self.len]
    }

    /// 字节已交给操作系统（或写入失败）时调用；没有完成端的段直接丢弃。
    pub(crate) fn complete(self, result: impl FnOnce(usize) -> WriteResult) {
        if let Some(Completion { promise, total }) = self.completion {
            promise.complete(result(total));
        }
    }
}

/// [`TransportPipe::read`] 的结果。
pub(crate) enum PipeRead {
    Data(Vec<Segment>),
    /// 写端已完成且队列已空。
    Completed,
    /// 挂起的读取被取消，或读端已关闭。
    Cancelled,
}

/// [`TransportPipe::flush`] 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    Flushed,
    Cancelled,
    ReaderCompleted,
}

struct PipeState {
    segments: VecDeque<Segment>,
    buffered: usize,
    writer_completed: bool,
    reader_completed: bool,
    read_cancelled: bool,
    flush_cancelled: bool,
}

/// 单生产者、单消费者的有界字节段队列。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 让接收循环与分发循环、出站写入与发送循环之间以段为单位解耦；
/// - 以水位控制背压：未消费字节达到 `pause_threshold` 时 [`TransportPipe::flush`] 挂起，
///   回落到 `resume_threshold`（暂停水位的一半）后恢复，避免在阈值附近抖动。
///
/// ## 逻辑（How）
/// - 状态由 `parking_lot::Mutex` 保护，持锁区间内不做任何等待；
/// - 等待方先登记 `Notify::notified()` 并 `enable`，再检查状态，最后才挂起，
///   配合 `notify_waiters` 不会丢失唤醒；
/// - `buffered` 在 [`TransportPipe::advance`] 中扣减，即消费方处理完毕后才释放水位。
///
/// ## 契约（What）
/// - `push` 在读端已关闭或写端已完成时拒绝新段，段被丢弃，挂在上面的写入以
///   `ChannelClosed` 结束；
/// - `cancel_pending_read` / `cancel_pending_flush` 只作用于当前或下一次等待；
/// - `abort` 同时关闭读端并取消双方的等待，用于通道立即关闭。
pub(crate) struct TransportPipe {
    state: Mutex<PipeState>,
    pause_threshold: usize,
    resume_threshold: usize,
    readable: Notify,
    writable: Notify,
}

impl TransportPipe {
    pub(crate) fn new(pause_threshold: usize) -> Self {
        let pause_threshold = pause_threshold.max(1);
        Self {
            state: Mutex::new(PipeState {
                segments: VecDeque::new(),
                buffered: 0,
                writer_completed: false,
                reader_completed: false,
                read_cancelled: false,
                flush_cancelled: false,
            }),
            pause_threshold,
            resume_threshold: pause_threshold / 2,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// 追加一段字节；返回 `false` 表示队列已不再接收。
    pub(crate) fn push(&self, segment: Segment) -> bool {
        {
            let mut state = self.state.lock();
            if state.writer_completed || state.reader_completed {
                return false;
            }
            state.buffered += segment.len();
            state.segments.push_back(segment);
        }
        self.readable.notify_waiters();
        true
    }

    /// 在同一次加锁内追加一组段，多个写入方的段不会交错；返回 `false` 时整组被丢弃。
    pub(crate) fn push_all(&self, segments: Vec<Segment>) -> bool {
        {
            let mut state = self.state.lock();
            if state.writer_completed || state.reader_completed {
                return false;
            }
            for segment in segments {
                state.buffered += segment.len();
                state.segments.push_back(segment);
            }
        }
        self.readable.notify_waiters();
        true
    }

    /// 未消费字节数。
    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().buffered
    }

    /// 是否低于暂停水位。
    pub(crate) fn has_capacity(&self) -> bool {
        self.buffered() < self.pause_threshold
    }

    /// 未达到暂停水位时立即返回，否则等待回落到恢复水位。
    pub(crate) async fn flush(&self) -> FlushOutcome {
        let mut limit = self.pause_threshold;
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.flush_cancelled {
                    state.flush_cancelled = false;
                    return FlushOutcome::Cancelled;
                }
                if state.reader_completed {
                    return FlushOutcome::ReaderCompleted;
                }
                if state.buffered < limit {
                    return FlushOutcome::Flushed;
                }
            }
            limit = self.resume_threshold + 1;
            notified.await;
        }
    }

    /// 取走当前排队的全部段，队列为空时等待。
    pub(crate) async fn read(&self) -> PipeRead {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.read_cancelled {
                    state.read_cancelled = false;
                    return PipeRead::Cancelled;
                }
                if state.reader_completed {
                    return PipeRead::Cancelled;
                }
                if !state.segments.is_empty() {
                    return PipeRead::Data(state.segments.drain(..).collect());
                }
                if state.writer_completed {
                    return PipeRead::Completed;
                }
            }
            notified.await;
        }
    }

    /// 消费方处理完 `consumed` 字节后归还水位。
    pub(crate) fn advance(&self, consumed: usize) {
        {
            let mut state = self.state.lock();
            state.buffered = state.buffered.saturating_sub(consumed);
        }
        self.writable.notify_waiters();
    }

    /// 写端不再产生数据；已排队的段仍可读出。
    pub(crate) fn complete(&self) {
        self.state.lock().writer_completed = true;
        self.readable.notify_waiters();
    }

    pub(crate) fn cancel_pending_read(&self) {
        self.state.lock().read_cancelled = true;
        self.readable.notify_waiters();
    }

    pub(crate) fn cancel_pending_flush(&self) {
        self.state.lock().flush_cancelled = true;
        self.writable.notify_waiters();
    }

    /// 关闭读端、丢弃排队的段并取消双方等待。
    pub(crate) fn abort(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.reader_completed = true;
            state.buffered = 0;
            std::mem::take(&mut state.segments)
        };
        // 段在锁外丢弃：块归还分配器，未完成的写入随完成端一起结束。
        drop(dropped);
        self.cancel_pending_read();
        self.cancel_pending_flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_buffer::SlabAllocator;
    use ripple_core::{CoreError, WriteFuture};
    use std::{sync::Arc, time::Duration};

    fn segment(allocator: &SlabAllocator, len: usize) -> Segment {
        let block = allocator.rent(len).expect("租借块");
        Segment::new(block, len)
    }

    #[tokio::test]
    async fn flush_pauses_above_threshold_and_resumes_at_half() {
        let allocator = SlabAllocator::new(64, 8);
        let pipe = Arc::new(TransportPipe::new(100));
        assert!(pipe.push(segment(&allocator, 60)));
        assert_eq!(pipe.flush().await, FlushOutcome::Flushed);
        assert!(pipe.push(segment(&allocator, 60)));
        assert!(!pipe.has_capacity());

        let flusher = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move { pipe.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flusher.is_finished());

        let PipeRead::Data(segments) = pipe.read().await else {
            panic!("应读到数据");
        };
        assert_eq!(segments.len(), 2);
        pipe.advance(segments.iter().map(Segment::len).sum());
        assert_eq!(flusher.await.expect("任务"), FlushOutcome::Flushed);
    }

    #[tokio::test]
    async fn completed_pipe_drains_before_reporting_completion() {
        let allocator = SlabAllocator::new(64, 8);
        let pipe = TransportPipe::new(1024);
        assert!(pipe.push(segment(&allocator, 8)));
        pipe.complete();
        assert!(!pipe.push(segment(&allocator, 8)));
        assert!(matches!(pipe.read().await, PipeRead::Data(ref segments) if segments.len() == 1));
        assert!(matches!(pipe.read().await, PipeRead::Completed));
    }

    #[tokio::test]
    async fn cancel_wakes_pending_reader_once() {
        let pipe = Arc::new(TransportPipe::new(1024));
        let reader = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move { matches!(pipe.read().await, PipeRead::Cancelled) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pipe.cancel_pending_read();
        assert!(reader.await.expect("任务"));

        let allocator = SlabAllocator::new(64, 8);
        assert!(pipe.push(segment(&allocator, 4)));
        assert!(matches!(pipe.read().await, PipeRead::Data(_)));
    }

    #[tokio::test]
    async fn abort_fails_queued_writes() {
        let allocator = SlabAllocator::new(64, 8);
        let pipe = TransportPipe::new(1024);
        let (promise, future) = WriteFuture::pending();
        assert!(pipe.push(segment(&allocator, 16).with_promise(promise, 16)));
        pipe.abort();
        assert!(matches!(future.await, Err(CoreError::ChannelClosed)));
        assert!(matches!(pipe.read().await, PipeRead::Cancelled));
        assert_eq!(pipe.flush().await, FlushOutcome::Cancelled);
        assert_eq!(allocator.statistics().leased_blocks, 0);
    }

    #[tokio::test]
    async fn batch_lands_contiguously_and_is_rejected_whole_after_completion() {
        let allocator = SlabAllocator::new(64, 8);
        let pipe = TransportPipe::new(1024);
        assert!(pipe.push(segment(&allocator, 4)));
        let (promise, future) = WriteFuture::pending();
        let batch = vec![
            segment(&allocator, 64),
            segment(&allocator, 64),
            segment(&allocator, 8).with_promise(promise, 136),
        ];
        assert!(pipe.push_all(batch));
        assert_eq!(pipe.buffered(), 140);

        let PipeRead::Data(segments) = pipe.read().await else {
            panic!("应读到数据");
        };
        let lens: Vec<usize> = segments.iter().map(Segment::len).collect();
        assert_eq!(lens, [4, 64, 64, 8]);
        pipe.advance(140);
        for segment in segments {
            segment.complete(Ok);
        }
        assert_eq!(future.await.expect("写入完成"), 136);

        pipe.complete();
        let (promise, future) = WriteFuture::pending();
        let rejected = vec![
            segment(&allocator, 16),
            segment(&allocator, 16).with_promise(promise, 32),
        ];
        assert!(!pipe.push_all(rejected));
        assert!(matches!(future.await, Err(CoreError::ChannelClosed)));
        assert_eq!(pipe.buffered(), 0);
        assert_eq!(allocator.statistics().leased_blocks, 0);
    }
}
