use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use ripple_buffer::{BufferPool, SlabAllocator};
use ripple_core::{Channel, ChannelId, CoreError};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Notify,
};

use crate::{
    channel::{ChannelResources, SocketChannel},
    config::ServerOptions,
    error::{ACCEPT, BIND, ErrorClass, TransportError, map_io_error},
    scheduler::IoSchedulerGroup,
};

/// 接入失败后再次 `accept` 之前的退避时长，避免文件描述符耗尽时空转。
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

type Registry = DashMap<ChannelId, Arc<SocketChannel>>;

/// 为每条新连接装配流水线的回调。
///
/// 闭包 `Fn(&Arc<SocketChannel>) -> Result<(), CoreError>` 自动实现该 trait。
pub trait ChannelInitializer: Send + Sync + 'static {
    /// 在 `registered` 之前调用；返回错误时连接被立即关闭。
    fn init_channel(&self, channel: &Arc<SocketChannel>) -> Result<(), CoreError>;

    /// 接入循环或连接装配失败时调用。
    fn exception_caught(&self, error: &TransportError) {
        tracing::warn!(code = error.code(), %error, "server error");
    }
}

impl<F> ChannelInitializer for F
where
    F: Fn(&Arc<SocketChannel>) -> Result<(), CoreError> + Send + Sync + 'static,
{
    fn init_channel(&self, channel: &Arc<SocketChannel>) -> Result<(), CoreError> {
        self(channel)
    }
}

/// TCP 服务端：监听、接入循环、调度器组与连接表。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把"绑定监听套接字 → 持续接入 → 为连接选择调度器并装配流水线"的流程收拢到一处，
///   业务方只需提供 [`ChannelInitializer`]；
/// - 连接表以通道 ID 为键，支持按 ID 查找、统计连接数与整体关闭。
///
/// ## 逻辑（How）
/// - [`SocketServer::bind`] 用 `socket2` 设置地址复用、端口复用（unix）与 backlog 后交给 Tokio；
/// - [`SocketServer::accept_loop`] 每接入一条连接：轮询选出调度器、创建通道、挂上
///   关闭回调、写入连接表、调用初始化器、触发 `registered`，最后启动通道；
/// - 通道关闭时经回调把自己移出连接表，回调只持有连接表的弱引用。
///
/// ## 契约（What）
/// - `bind` 与 `accept_loop` 需在 Tokio 运行时内调用；
/// - [`SocketServer::stop`] 停止接入、丢弃监听器并关闭所有连接，可重复调用；
/// - 断开类接入错误只记录 `debug` 日志，其余错误交给 [`ChannelInitializer::exception_caught`]，
///   接入循环都会继续。
pub struct SocketServer {
    options: ServerOptions,
    initializer: Arc<dyn ChannelInitializer>,
    schedulers: IoSchedulerGroup,
    resources: ChannelResources,
    registry: Arc<Registry>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stopped: AtomicBool,
    stop_signal: Notify,
}

impl SocketServer {
    pub fn new<I>(options: ServerOptions, initializer: I) -> Result<Self, TransportError>
    where
        I: ChannelInitializer,
    {
        options.validate()?;
        let schedulers = IoSchedulerGroup::new(options.schedulers)?;
        let resources = ChannelResources {
            buffer_pool: BufferPool::new(options.buffer_pool_options()),
            allocator: SlabAllocator::new(options.block_size, options.blocks_per_slab),
            no_delay: options.no_delay,
            wait_for_data: options.wait_for_data_before_allocating_buffer,
            max_read_buffer_size: options.max_read_buffer_size,
            max_write_buffer_size: options.max_write_buffer_size,
        };
        Ok(Self {
            options,
            initializer: Arc::new(initializer),
            schedulers,
            resources,
            registry: Arc::new(DashMap::new()),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.resources.buffer_pool
    }

    pub fn allocator(&self) -> &SlabAllocator {
        &self.resources.allocator
    }

    /// 实际绑定的地址；未绑定时为 `None`。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<SocketChannel>> {
        self.registry.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// 创建并绑定监听套接字，返回实际地址（端口为 0 时由系统分配）。
    pub fn bind(&self) -> Result<SocketAddr, TransportError> {
        let addr = self.options.socket_addr();
        let bind_err = |err: std::io::Error| map_io_error(BIND, err);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket
            .set_reuse_address(self.options.reuse_address)
            .map_err(bind_err)?;
        #[cfg(unix)]
        socket
            .set_reuse_port(self.options.reuse_port)
            .map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(self.options.backlog).map_err(bind_err)?;

        let listener = TcpListener::from_std(socket.into()).map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(local);
        tracing::info!(addr = %local, backlog = self.options.backlog, "server listening");
        Ok(local)
    }

    /// 持续接入连接，直到 [`SocketServer::stop`] 被调用。
    pub async fn accept_loop(&self) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::NotBound)?;
        loop {
            let stop = self.stop_signal.notified();
            tokio::pin!(stop);
            stop.as_mut().enable();
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let accepted = tokio::select! {
                biased;
                _ = &mut stop => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.on_accept(stream, peer),
                Err(err) => {
                    let error = map_io_error(ACCEPT, err);
                    match error.class() {
                        ErrorClass::Disconnect => {
                            tracing::debug!(%error, "transient accept failure");
                        }
                        ErrorClass::Fatal => {
                            self.initializer.exception_caught(&error);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
        drop(listener);
        tracing::info!(addr = ?self.local_addr(), "accept loop stopped");
        Ok(())
    }

    /// 绑定（若尚未绑定）并运行接入循环。
    pub async fn run(&self) -> Result<(), TransportError> {
        if self.listener.lock().is_none() {
            self.bind()?;
        }
        self.accept_loop().await
    }

    fn on_accept(&self, stream: TcpStream, peer: SocketAddr) {
        let scheduler = self.schedulers.next();
        let channel = match SocketChannel::accepted(stream, scheduler, &self.resources) {
            Ok(channel) => channel,
            Err(error) => {
                self.initializer.exception_caught(&error);
                return;
            }
        };
        let id = channel.id();
        tracing::debug!(channel_id = %id, %peer, "connection accepted");

        let registry = Arc::downgrade(&self.registry);
        channel.set_close_hook(Box::new(move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&id);
            }
        }));
        self.registry.insert(id, Arc::clone(&channel));

        if let Err(error) = self.initializer.init_channel(&channel) {
            tracing::warn!(
                channel_id = %id,
                code = error.code(),
                %error,
                "channel initializer failed"
            );
            channel.shutdown();
            return;
        }
        if let Err(error) = channel.pipeline().fire_channel_registered() {
            channel.fail(error);
            return;
        }
        channel.start();
    }

    /// 当前连接的快照。
    pub fn channels(&self) -> Vec<Arc<SocketChannel>> {
        self.registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// 立即关闭所有连接；每个通道在收尾时自行移出连接表。
    pub fn shutdown_all(&self) {
        // 先取快照再关闭，关闭回调会回头修改连接表。
        for channel in self.channels() {
            channel.shutdown();
        }
    }

    /// 停止接入并关闭所有连接。
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_signal.notify_waiters();
        // 未进入接入循环时监听器仍在这里，一并丢弃。
        drop(self.listener.lock().take());
        let connections = self.connection_count();
        self.shutdown_all();
        tracing::info!(connections, "server stopped");
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
        self.resources.allocator.dispose();
    }
}

impl fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketServer")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .field("schedulers", &self.schedulers)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}
