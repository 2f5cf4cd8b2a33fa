//! 连接生命周期：事件顺序、对端断开、处理器失败与优雅关闭。

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ripple_buffer::ByteBuf;
use ripple_core::{
    Channel, ChannelContext, ChannelHandler, ChannelId, ChannelState, CoreError, InboundHandler,
    PipelineMessage,
};
use ripple_transport_tcp::{ChannelInitializer, ServerOptions, SocketChannel, SocketServer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// 记录经过的入站事件，并把事件继续向后传递。
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    channel: Arc<Mutex<Option<ChannelId>>>,
}

impl Recorder {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().expect("事件锁").push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().expect("事件锁").clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|seen| *seen == event).count()
    }

    fn channel_id(&self) -> Option<ChannelId> {
        *self.channel.lock().expect("通道锁")
    }
}

impl InboundHandler for Recorder {
    fn on_channel_registered(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        self.push("registered");
        ctx.fire_channel_registered()
    }

    fn on_channel_active(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        *self.channel.lock().expect("通道锁") = ctx.channel().map(|channel| channel.id());
        self.push("active");
        ctx.fire_channel_active()
    }

    fn on_channel_inactive(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        self.push("inactive");
        ctx.fire_channel_inactive()
    }

    fn on_channel_unregistered(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        self.push("unregistered");
        ctx.fire_channel_unregistered()
    }

    fn on_read(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        self.push("read");
        ctx.fire_channel_read(msg)
    }

    fn on_exception_caught(
        &self,
        _ctx: &ChannelContext<'_>,
        error: CoreError,
    ) -> Result<(), CoreError> {
        self.push(format!("exception: {error}"));
        Ok(())
    }
}

/// 读到任何数据都按给定方式失败。
struct Failing {
    panic: bool,
}

impl InboundHandler for Failing {
    fn on_read(&self, _ctx: &ChannelContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        msg.release();
        if self.panic {
            panic!("处理器崩溃");
        }
        Err(CoreError::handler(std::io::Error::other("rejected")))
    }
}

/// 连接建立后写出问候语并立即请求优雅关闭。
struct GreetAndClose;

impl InboundHandler for GreetAndClose {
    fn on_channel_active(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        drop(ctx.write(ByteBuf::copied_from(b"bye").into()));
        if let Some(channel) = ctx.channel() {
            channel.close();
        }
        ctx.fire_channel_active()
    }
}

enum Extra {
    None,
    Failing { panic: bool },
    GreetAndClose,
}

struct Initializer {
    recorder: Recorder,
    extra: Extra,
}

impl ChannelInitializer for Initializer {
    fn init_channel(&self, channel: &Arc<SocketChannel>) -> Result<(), CoreError> {
        let pipeline = channel.pipeline();
        match self.extra {
            Extra::None => {}
            Extra::Failing { panic } => {
                pipeline.add_last("failing", ChannelHandler::inbound(Failing { panic }))?;
            }
            Extra::GreetAndClose => {
                pipeline.add_last("greet", ChannelHandler::inbound(GreetAndClose))?;
            }
        }
        pipeline.add_last("recorder", ChannelHandler::inbound(self.recorder.clone()))
    }
}

struct Harness {
    server: Arc<SocketServer>,
    recorder: Recorder,
}

impl Harness {
    fn start(extra: Extra) -> anyhow::Result<Self> {
        let recorder = Recorder::default();
        let options = ServerOptions::default()
            .with_port(0)
            .with_schedulers(1)
            .with_reuse_port(false);
        let server = Arc::new(SocketServer::new(
            options,
            Initializer {
                recorder: recorder.clone(),
                extra,
            },
        )?);
        server.bind()?;
        let accepting = Arc::clone(&server);
        tokio::spawn(async move {
            accepting.accept_loop().await.expect("接入循环");
        });
        Ok(Self { server, recorder })
    }

    async fn connect(&self) -> anyhow::Result<TcpStream> {
        let addr = self.server.local_addr().expect("已绑定");
        Ok(TcpStream::connect(addr).await?)
    }
}

/// 以 10ms 为间隔轮询，最多等待 [`IO_TIMEOUT`]。
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_disconnect_fires_inactive_and_unregistered_once() -> anyhow::Result<()> {
    let harness = Harness::start(Extra::None)?;
    let client = harness.connect().await?;

    assert!(eventually(|| harness.recorder.channel_id().is_some()).await);
    let id = harness.recorder.channel_id().expect("已激活");
    let channel = harness.server.channel(id).expect("连接表中应有该通道");
    assert_eq!(harness.server.connection_count(), 1);

    drop(client);
    timeout(IO_TIMEOUT, channel.closed()).await?;
    assert!(eventually(|| harness.server.connection_count() == 0).await);

    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(
        harness.recorder.events(),
        ["registered", "active", "inactive", "unregistered"]
    );
    harness.server.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_error_is_reported_once_and_closes_connection() -> anyhow::Result<()> {
    let harness = Harness::start(Extra::Failing { panic: false })?;
    let mut client = harness.connect().await?;

    client.write_all(b"anything").await?;
    let mut rest = Vec::new();
    let _ = timeout(IO_TIMEOUT, client.read_to_end(&mut rest)).await?;
    assert!(rest.is_empty());

    assert!(eventually(|| harness.recorder.count("unregistered") == 1).await);
    let exceptions: Vec<_> = harness
        .recorder
        .events()
        .into_iter()
        .filter(|event| event.starts_with("exception"))
        .collect();
    assert_eq!(exceptions.len(), 1, "异常只上报一次: {exceptions:?}");
    assert!(exceptions[0].contains("rejected"));
    assert_eq!(harness.recorder.count("read"), 0);
    harness.server.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_panic_becomes_exception() -> anyhow::Result<()> {
    let harness = Harness::start(Extra::Failing { panic: true })?;
    let mut client = harness.connect().await?;

    client.write_all(b"boom").await?;
    let mut rest = Vec::new();
    let _ = timeout(IO_TIMEOUT, client.read_to_end(&mut rest)).await?;

    assert!(eventually(|| harness.recorder.count("unregistered") == 1).await);
    let events = harness.recorder.events();
    assert!(
        events
            .iter()
            .any(|event| event.starts_with("exception") && event.contains("panicked")),
        "应把崩溃转换为异常事件: {events:?}"
    );
    assert_eq!(harness.server.connection_count(), 0);
    harness.server.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn close_drains_pending_writes_before_fin() -> anyhow::Result<()> {
    let harness = Harness::start(Extra::GreetAndClose)?;
    let mut client = harness.connect().await?;

    let mut received = Vec::new();
    timeout(IO_TIMEOUT, client.read_to_end(&mut received)).await??;
    assert_eq!(received, b"bye");

    assert!(eventually(|| harness.server.connection_count() == 0).await);
    harness.server.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_large_writes_reach_the_wire_unsplit() -> anyhow::Result<()> {
    const CHUNK: usize = 64 * 1024;
    let harness = Harness::start(Extra::None)?;
    let mut client = harness.connect().await?;
    assert!(eventually(|| harness.recorder.channel_id().is_some()).await);
    let id = harness.recorder.channel_id().expect("已激活");
    let channel = harness.server.channel(id).expect("连接表中应有该通道");

    for _ in 0..10 {
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let writers: Vec<_> = [b'A', b'B']
            .into_iter()
            .map(|fill| {
                let channel = Arc::clone(&channel);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    channel.write(ByteBuf::copied_from(&vec![fill; CHUNK]).into())
                })
            })
            .collect();

        let mut received = vec![0u8; 2 * CHUNK];
        timeout(IO_TIMEOUT, client.read_exact(&mut received)).await??;
        for writer in writers {
            let written = writer.join().expect("写线程");
            assert_eq!(timeout(IO_TIMEOUT, written).await??, CHUNK);
        }
        let switches = received.windows(2).filter(|pair| pair[0] != pair[1]).count();
        assert_eq!(switches, 1, "两次写入的字节不应交错");
    }
    harness.server.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_closes_live_connections() -> anyhow::Result<()> {
    let harness = Harness::start(Extra::None)?;
    let mut first = harness.connect().await?;
    let mut second = harness.connect().await?;
    assert!(eventually(|| harness.server.connection_count() == 2).await);
    assert!(eventually(|| harness.recorder.count("active") == 2).await);

    harness.server.stop();
    for client in [&mut first, &mut second] {
        let mut rest = Vec::new();
        let _ = timeout(IO_TIMEOUT, client.read_to_end(&mut rest)).await?;
        assert!(rest.is_empty());
    }
    assert!(eventually(|| harness.server.connection_count() == 0).await);
    assert_eq!(harness.recorder.count("unregistered"), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_server_still_fires_inactive_and_unregistered() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let options = ServerOptions::default()
        .with_port(0)
        .with_schedulers(1)
        .with_reuse_port(false);
    let server = SocketServer::new(
        options,
        Initializer {
            recorder: recorder.clone(),
            extra: Extra::None,
        },
    )?;
    let addr = server.bind()?;
    let mut client = TcpStream::connect(addr).await?;

    // 接入循环只运行到连接激活为止，随后整个服务端被直接丢弃。
    tokio::select! {
        result = server.accept_loop() => result?,
        activated = eventually(|| recorder.count("active") == 1) => assert!(activated),
    }
    drop(server);

    let mut rest = Vec::new();
    let _ = timeout(IO_TIMEOUT, client.read_to_end(&mut rest)).await?;
    assert!(eventually(|| recorder.count("unregistered") == 1).await);
    assert_eq!(
        recorder.events(),
        ["registered", "active", "inactive", "unregistered"]
    );
    Ok(())
}
