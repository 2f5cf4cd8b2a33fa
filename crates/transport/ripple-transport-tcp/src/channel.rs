use std::{
    any::Any,
    fmt, io,
    net::{Shutdown, SocketAddr},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use ripple_buffer::{BufferPool, ByteBuf, SlabAllocator};
use ripple_core::{
    AtomicChannelState, AttributeMap, Channel, ChannelId, ChannelState, CoreError, Pipeline,
    PipelineMessage, WriteFuture,
};
use socket2::SockRef;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    sync::Notify,
};

use crate::{
    error::{
        CONFIGURE, ErrorClass, OperationKind, READ, SHUTDOWN, TransportError, WRITE, classify,
        map_io_error,
    },
    pipe::{FlushOutcome, PipeRead, Segment, TransportPipe},
};

/// 通道关闭时的回调，由服务端用来把通道移出连接表。
pub(crate) type CloseHook = Box<dyn FnOnce(ChannelId) + Send>;

/// 服务端为每条连接准备的共享资源与参数。
#[derive(Clone, Debug)]
pub(crate) struct ChannelResources {
    pub(crate) buffer_pool: BufferPool,
    pub(crate) allocator: SlabAllocator,
    pub(crate) no_delay: bool,
    pub(crate) wait_for_data: bool,
    pub(crate) max_read_buffer_size: usize,
    pub(crate) max_write_buffer_size: usize,
}

/// 通道累计统计的快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub reads: u64,
    pub writes: u64,
}

#[derive(Default)]
struct StatCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl StatCounters {
    fn on_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn on_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// 一条已接入的 TCP 连接。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把套接字读写与流水线回调拆成三个循环：接收循环只负责把字节搬进入站队列，
///   分发循环把字节交给流水线，发送循环把出站队列写回套接字；
/// - 三个循环运行在同一个 I/O 调度器上，连接内的回调串行执行。
///
/// ## 逻辑（How）
/// 1. `Created → Connected`：[`SocketChannel::start`] 把套接字交给调度器并触发 `active`；
/// 2. 对端 EOF：入站队列完成，分发循环排空后调用 [`Channel::close`]；
/// 3. `close` 进入 `Draining` 并完成出站队列，发送循环写完剩余数据后执行 `shutdown`；
/// 4. `shutdown` 取消两条队列上的等待并关闭套接字，三个循环退出后进入 `Closed`，
///    依次触发 `inactive`、`unregistered` 并从连接表移除。
///
/// ## 契约（What）
/// - 断开类 I/O 错误（复位、中止、断管等）只触发关闭，不上报；
/// - 其余 I/O 错误与处理器失败（返回 `Err` 或 panic）经 `exception_caught` 上报一次后关闭；
/// - `inactive` 与 `unregistered` 各至多触发一次；
/// - 通道总以 `Arc<SocketChannel>` 形式存在，流水线持有其弱引用。
pub struct SocketChannel {
    id: ChannelId,
    state: AtomicChannelState,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    attributes: AttributeMap,
    pipeline: Pipeline,
    inbound: TransportPipe,
    outbound: TransportPipe,
    allocator: SlabAllocator,
    wait_for_data: bool,
    scheduler: Handle,
    /// 尚未交给调度器的套接字；`start` 与未启动时的 `shutdown` 二者只有一方能取走。
    pending: Mutex<Option<std::net::TcpStream>>,
    /// 用于从任意线程关闭套接字的句柄副本。
    control: Mutex<Option<std::net::TcpStream>>,
    activated: AtomicBool,
    closing: AtomicBool,
    shut: AtomicBool,
    finished: AtomicBool,
    exception_reported: AtomicBool,
    on_closed: Mutex<Option<CloseHook>>,
    closed: Notify,
    stats: StatCounters,
}

impl SocketChannel {
    /// 包装一条刚接入的连接；此时尚未开始读写。
    pub(crate) fn accepted(
        stream: TcpStream,
        scheduler: Handle,
        resources: &ChannelResources,
    ) -> Result<Arc<Self>, TransportError> {
        let configure = |err: io::Error| map_io_error(CONFIGURE, err);
        stream.set_nodelay(resources.no_delay).map_err(configure)?;
        let peer_addr = stream.peer_addr().map_err(configure)?;
        let local_addr = stream.local_addr().map_err(configure)?;
        // 套接字要在目标调度器的反应器上重新注册，先退回标准库类型。
        let socket = stream.into_std().map_err(configure)?;
        let control = socket.try_clone().map_err(configure)?;

        let buffer_pool = resources.buffer_pool.clone();
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let channel: Weak<dyn Channel> = weak.clone();
            Self {
                id: ChannelId::next(),
                state: AtomicChannelState::default(),
                peer_addr,
                local_addr,
                attributes: AttributeMap::new(),
                pipeline: Pipeline::attached(channel, buffer_pool),
                inbound: TransportPipe::new(resources.max_read_buffer_size),
                outbound: TransportPipe::new(resources.max_write_buffer_size),
                allocator: resources.allocator.clone(),
                wait_for_data: resources.wait_for_data,
                scheduler,
                pending: Mutex::new(Some(socket)),
                control: Mutex::new(Some(control)),
                activated: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                shut: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                exception_reported: AtomicBool::new(false),
                on_closed: Mutex::new(None),
                closed: Notify::new(),
                stats: StatCounters::default(),
            }
        }))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn statistics(&self) -> ChannelStats {
        self.stats.snapshot()
    }

    /// 出站队列是否低于暂停水位。
    pub fn is_writable(&self) -> bool {
        self.outbound.has_capacity()
    }

    /// 尚未写入套接字的出站字节数。
    pub fn pending_write_bytes(&self) -> usize {
        self.outbound.buffered()
    }

    /// 等待出站队列回落到可写水位；通道关闭后返回 `false`。
    pub async fn writable(&self) -> bool {
        self.outbound.flush().await == FlushOutcome::Flushed
    }

    /// 等待通道进入 `Closed`。
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.load() == ChannelState::Closed {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn set_close_hook(&self, hook: CloseHook) {
        *self.on_closed.lock() = Some(hook);
    }

    /// 把套接字交给调度器并启动三个循环。重复调用或已关闭时无效。
    pub(crate) fn start(self: &Arc<Self>) {
        let Some(socket) = self.pending.lock().take() else {
            return;
        };
        self.state.advance(ChannelState::Connected);
        let channel = Arc::clone(self);
        // 调度器停机时任务可能尚未轮询或停在任意 await 点就被丢弃，守卫随任务一同析构并完成收尾。
        let finish = FinishOnDrop(Arc::clone(self));
        self.scheduler.spawn(async move {
            let _finish = finish;
            channel.run(socket).await;
        });
    }

    async fn run(self: Arc<Self>, socket: std::net::TcpStream) {
        match TcpStream::from_std(socket) {
            Ok(stream) => {
                self.activated.store(true, Ordering::Release);
                tracing::debug!(channel_id = %self.id, peer = %self.peer_addr, "channel active");
                let active = self.guard("channel_active", || self.pipeline.fire_channel_active());
                if let Err(error) = active {
                    self.fail(error);
                }
                let (reader, writer) = stream.into_split();
                tokio::join!(
                    self.receive_loop(reader),
                    self.dispatch_loop(),
                    self.send_loop(writer),
                );
            }
            Err(err) => {
                self.on_io_error(CONFIGURE, err);
            }
        }
    }

    async fn receive_loop(&self, mut reader: OwnedReadHalf) {
        let rent_size = (self.allocator.block_size() / 2).max(1);
        loop {
            if self.wait_for_data
                && let Err(err) = reader.readable().await
            {
                self.on_io_error(READ, err);
                break;
            }
            if self.shut.load(Ordering::Acquire) {
                break;
            }
            let mut block = match self.allocator.rent(rent_size) {
                Ok(block) => block,
                Err(err) => {
                    self.fail(CoreError::Buffer(err));
                    break;
                }
            };
            match reader.read(&mut block[..]).await {
                Ok(0) => {
                    tracing::debug!(
                        channel_id = %self.id,
                        peer = %self.peer_addr,
                        "peer closed the connection"
                    );
                    break;
                }
                Ok(read) => {
                    self.stats.on_read(read);
                    if !self.inbound.push(Segment::new(block, read)) {
                        break;
                    }
                    if self.inbound.flush().await != FlushOutcome::Flushed {
                        break;
                    }
                }
                Err(err) => {
                    self.on_io_error(READ, err);
                    break;
                }
            }
        }
        self.inbound.complete();
    }

    async fn dispatch_loop(&self) {
        loop {
            match self.inbound.read().await {
                PipeRead::Data(segments) => {
                    let mut consumed = 0;
                    for segment in segments {
                        consumed += segment.len();
                        if let Err(error) = self.dispatch(segment.bytes()) {
                            self.fail(error);
                            return;
                        }
                    }
                    self.inbound.advance(consumed);
                }
                PipeRead::Completed => {
                    self.close();
                    return;
                }
                PipeRead::Cancelled => return,
            }
        }
    }

    fn dispatch(&self, bytes: &[u8]) -> Result<(), CoreError> {
        let mut buf = self.pipeline.buffer_pool().allocate();
        if let Err(err) = buf.write_bytes(bytes) {
            let _ = buf.release();
            return Err(err.into());
        }
        self.guard("channel_read", || {
            self.pipeline.fire_channel_read(PipelineMessage::Buffer(buf))
        })
    }

    async fn send_loop(&self, mut writer: OwnedWriteHalf) {
        loop {
            match self.outbound.read().await {
                PipeRead::Data(segments) => {
                    let mut consumed = 0;
                    for segment in segments {
                        let len = segment.len();
                        if let Err(err) = writer.write_all(segment.bytes()).await {
                            let kind = err.kind();
                            segment.complete(|_| {
                                Err(CoreError::Io {
                                    operation: WRITE.message,
                                    source: io::Error::from(kind),
                                })
                            });
                            self.on_io_error(WRITE, err);
                            return;
                        }
                        consumed += len;
                        self.stats.on_write(len);
                        segment.complete(Ok);
                    }
                    self.outbound.advance(consumed);
                }
                PipeRead::Completed => {
                    if let Err(err) = writer.shutdown().await {
                        tracing::debug!(
                            channel_id = %self.id,
                            error = %err,
                            "write half shutdown failed"
                        );
                    }
                    self.shutdown();
                    return;
                }
                PipeRead::Cancelled => return,
            }
        }
    }

    /// 在处理器边界捕获 panic，转换为 [`CoreError::HandlerPanicked`]。
    fn guard<F>(&self, event: &'static str, call: F) -> Result<(), CoreError>
    where
        F: FnOnce() -> Result<(), CoreError>,
    {
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(result) => result,
            Err(payload) => Err(CoreError::HandlerPanicked {
                event,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    fn on_io_error(&self, kind: OperationKind, err: io::Error) {
        match classify(&err) {
            ErrorClass::Disconnect => {
                tracing::debug!(
                    channel_id = %self.id,
                    peer = %self.peer_addr,
                    error = %err,
                    "{} interrupted by peer",
                    kind.message
                );
                self.shutdown();
            }
            ErrorClass::Fatal => self.fail(map_io_error(kind, err).into_core()),
        }
    }

    /// 上报一次异常并强制关闭。
    pub(crate) fn fail(&self, error: CoreError) {
        if !self.exception_reported.swap(true, Ordering::AcqRel) {
            tracing::warn!(channel_id = %self.id, code = error.code(), %error, "channel failed");
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.pipeline.fire_exception_caught(error)
            }));
            if !matches!(result, Ok(Ok(()))) {
                tracing::warn!(channel_id = %self.id, "exception handler failed");
            }
        }
        self.shutdown();
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.advance(ChannelState::Closed);
        let stats = self.stats.snapshot();
        tracing::debug!(
            channel_id = %self.id,
            peer = %self.peer_addr,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            "channel closed"
        );
        if self.activated.load(Ordering::Acquire) {
            self.notify_lifecycle("channel_inactive", || self.pipeline.fire_channel_inactive());
        }
        self.notify_lifecycle("channel_unregistered", || {
            self.pipeline.fire_channel_unregistered()
        });
        if let Some(hook) = self.on_closed.lock().take() {
            hook(self.id);
        }
        self.closed.notify_waiters();
    }

    fn notify_lifecycle<F>(&self, event: &'static str, call: F)
    where
        F: FnOnce() -> Result<(), CoreError>,
    {
        if let Err(error) = self.guard(event, call) {
            tracing::warn!(
                channel_id = %self.id,
                event,
                code = error.code(),
                %error,
                "lifecycle handler failed"
            );
        }
    }
}

/// 离开作用域时执行 [`SocketChannel::finish`]，正常返回与任务被取消走同一条收尾路径。
struct FinishOnDrop(Arc<SocketChannel>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

impl Channel for SocketChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn state(&self) -> ChannelState {
        self.state.load()
    }

    fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    fn write(&self, msg: PipelineMessage) -> WriteFuture {
        match panic::catch_unwind(AssertUnwindSafe(|| self.pipeline.write(msg))) {
            Ok(future) => future,
            Err(payload) => {
                self.fail(CoreError::HandlerPanicked {
                    event: "write",
                    message: panic_message(payload.as_ref()),
                });
                WriteFuture::failed(CoreError::ChannelClosed)
            }
        }
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.advance(ChannelState::Draining);
        tracing::debug!(
            channel_id = %self.id,
            pending = self.outbound.buffered(),
            "channel closing"
        );
        self.outbound.complete();
        if self.pending.lock().is_some() {
            self.shutdown();
        }
    }

    fn shutdown(&self) -> bool {
        if self.shut.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.advance(ChannelState::Draining);
        self.inbound.abort();
        self.outbound.abort();
        if let Some(control) = self.control.lock().take()
            && let Err(err) = SockRef::from(&control).shutdown(Shutdown::Both)
            && err.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(
                channel_id = %self.id,
                code = SHUTDOWN.code,
                error = %err,
                "socket shutdown failed"
            );
        }
        // 从未启动的通道没有循环可等，直接收尾。
        let never_started = self.pending.lock().take();
        if never_started.is_some() {
            drop(never_started);
            self.finish();
        }
        true
    }

    fn send_to_transport(&self, mut buf: ByteBuf) -> WriteFuture {
        let result = self.enqueue(&buf);
        let _ = buf.release();
        result
    }
}

impl SocketChannel {
    /// 把缓冲的可读字节拷贝进块并排入出站队列。
    fn enqueue(&self, buf: &ByteBuf) -> WriteFuture {
        if self.shut.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire) {
            return WriteFuture::failed(CoreError::ChannelClosed);
        }
        let bytes = match buf.readable_slice() {
            Ok(bytes) => bytes,
            Err(err) => return WriteFuture::failed(err.into()),
        };
        if bytes.is_empty() {
            return WriteFuture::ready(0);
        }

        let block_size = self.allocator.block_size();
        let mut segments = Vec::with_capacity(bytes.len().div_ceil(block_size));
        for chunk in bytes.chunks(block_size) {
            let mut block = match self.allocator.rent(chunk.len()) {
                Ok(block) => block,
                Err(err) => return WriteFuture::failed(err.into()),
            };
            block[..chunk.len()].copy_from_slice(chunk);
            segments.push(Segment::new(block, chunk.len()));
        }

        let (promise, future) = WriteFuture::pending();
        if let Some(last) = segments.pop() {
            segments.push(last.with_promise(promise, bytes.len()));
        }
        // 一次写入的所有段整体入队；被拒绝时挂在最后一段上的写入以 `ChannelClosed` 结束。
        self.outbound.push_all(segments);
        future
    }
}

impl fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketChannel")
            .field("id", &self.id)
            .field("state", &self.state.load())
            .field("peer_addr", &self.peer_addr)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
