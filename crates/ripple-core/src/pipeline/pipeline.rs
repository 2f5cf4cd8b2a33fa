use std::{
    fmt,
    sync::{Arc, Weak},
};

use ripple_buffer::BufferPool;
use spin::RwLock;

use crate::{channel::Channel, error::CoreError, future::WriteFuture, message::PipelineMessage};

use super::{
    context::ChannelContext,
    handler::{ChannelHandler, InboundHandler, OutboundHandler},
};

const HEAD: usize = 0;
const TAIL: usize = 1;

/// 定位流水线节点的方式：按名称或按处理器实例。
#[derive(Clone, Copy, Debug)]
pub enum HandlerRef<'a> {
    Name(&'a str),
    Handler(&'a ChannelHandler),
}

impl<'a> From<&'a str> for HandlerRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a String> for HandlerRef<'a> {
    fn from(name: &'a String) -> Self {
        Self::Name(name.as_str())
    }
}

impl<'a> From<&'a ChannelHandler> for HandlerRef<'a> {
    fn from(handler: &'a ChannelHandler) -> Self {
        Self::Handler(handler)
    }
}

impl fmt::Display for HandlerRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Handler(handler) => write!(f, "<{:?} handler>", handler.capability()),
        }
    }
}

struct Node {
    name: Arc<str>,
    handler: Option<ChannelHandler>,
    prev: usize,
    next: usize,
}

/// 以下标互链的双向链表；`HEAD`/`TAIL` 为哨兵，永不移除。
///
/// 被摘除的节点交出处理器，但保留原有 `prev`/`next`，槽位不复用，
/// 正在该节点上执行的回调仍可继续向原邻居传播事件。
struct Chain {
    nodes: Vec<Node>,
}

impl Chain {
    fn new() -> Self {
        let sentinel = |name: &str| Node {
            name: Arc::from(name),
            handler: None,
            prev: HEAD,
            next: TAIL,
        };
        Self {
            nodes: vec![sentinel("head"), sentinel("tail")],
        }
    }

    fn linked(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.nodes[HEAD].next;
        std::iter::from_fn(move || {
            if cursor == TAIL {
                return None;
            }
            let current = cursor;
            cursor = self.nodes[current].next;
            Some(current)
        })
    }

    fn find(&self, target: HandlerRef<'_>) -> Option<usize> {
        self.linked().find(|index| {
            let node = &self.nodes[*index];
            match target {
                HandlerRef::Name(name) => &*node.name == name,
                HandlerRef::Handler(handler) => node
                    .handler
                    .as_ref()
                    .is_some_and(|candidate| candidate.same_handler(handler)),
            }
        })
    }

    fn contains_name(&self, name: &str) -> bool {
        self.find(HandlerRef::Name(name)).is_some()
    }

    fn link_between(&mut self, prev: usize, next: usize, name: Arc<str>, handler: ChannelHandler) {
        let index = self.nodes.len();
        self.nodes.push(Node {
            name,
            handler: Some(handler),
            prev,
            next,
        });
        self.nodes[prev].next = index;
        self.nodes[next].prev = index;
    }

    fn unlink(&mut self, index: usize) -> Option<ChannelHandler> {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[index].handler.take()
    }
}

/// 一条连接上的处理器流水线。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把连接事件与业务逻辑解耦：解码、业务、编码等处理器按名称串成链，互不感知；
/// - 入站事件自头向尾、出站写入自尾向头传播，是每个处理器都必须遵守的核心契约。
///
/// ## 逻辑（How）
/// - 拓扑是以下标互链的双向链表，头尾哨兵不携带处理器；
/// - 结构修改在 `spin::RwLock` 写锁内完成；分发时只在读锁内找到下一个具备对应能力的节点，
///   克隆出 `Arc` 后立即释放锁再调用处理器，因此处理器可以在回调中修改流水线；
/// - 出站写入越过头哨兵后交给通道的 [`Channel::send_to_transport`]。
///
/// ## 契约（What）
/// - 名称在流水线内唯一，重复注册返回 [`CoreError::DuplicateName`]；
/// - `remove`/`replace` 遍历整条链定位节点，找不到时返回 [`CoreError::HandlerNotFound`]；
/// - 到达尾部的入站消息被释放并记录 `debug` 日志；到达尾部的异常记录 `warn` 日志。
pub struct Pipeline {
    chain: RwLock<Chain>,
    channel: Option<Weak<dyn Channel>>,
    buffer_pool: BufferPool,
}

impl Pipeline {
    /// 创建未挂接通道的流水线；出站写入越过头部后以 [`CoreError::ChannelClosed`] 失败。
    pub fn new(buffer_pool: BufferPool) -> Self {
        Self {
            chain: RwLock::new(Chain::new()),
            channel: None,
            buffer_pool,
        }
    }

    /// 创建挂接到 `channel` 的流水线。
    pub fn attached(channel: Weak<dyn Channel>, buffer_pool: BufferPool) -> Self {
        Self {
            chain: RwLock::new(Chain::new()),
            channel: Some(channel),
            buffer_pool,
        }
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.as_ref().and_then(Weak::upgrade)
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    pub fn add_first(
        &self,
        name: impl Into<Arc<str>>,
        handler: ChannelHandler,
    ) -> Result<(), CoreError> {
        let name = name.into();
        let mut chain = self.chain.write();
        if chain.contains_name(&name) {
            return Err(CoreError::DuplicateName(name.to_string()));
        }
        let next = chain.nodes[HEAD].next;
        chain.link_between(HEAD, next, name, handler);
        Ok(())
    }

    pub fn add_last(
        &self,
        name: impl Into<Arc<str>>,
        handler: ChannelHandler,
    ) -> Result<(), CoreError> {
        let name = name.into();
        let mut chain = self.chain.write();
        if chain.contains_name(&name) {
            return Err(CoreError::DuplicateName(name.to_string()));
        }
        let prev = chain.nodes[TAIL].prev;
        chain.link_between(prev, TAIL, name, handler);
        Ok(())
    }

    /// 摘除节点并返回其处理器。
    pub fn remove<'r>(
        &self,
        target: impl Into<HandlerRef<'r>>,
    ) -> Result<ChannelHandler, CoreError> {
        let target = target.into();
        let mut chain = self.chain.write();
        let index = chain
            .find(target)
            .ok_or_else(|| CoreError::HandlerNotFound(target.to_string()))?;
        chain
            .unlink(index)
            .ok_or_else(|| CoreError::HandlerNotFound(target.to_string()))
    }

    /// 在 `old` 的位置换入新节点，返回被替换的处理器。
    pub fn replace<'r>(
        &self,
        old: impl Into<HandlerRef<'r>>,
        new_name: impl Into<Arc<str>>,
        new_handler: ChannelHandler,
    ) -> Result<ChannelHandler, CoreError> {
        let old = old.into();
        let new_name = new_name.into();
        let mut chain = self.chain.write();
        let index = chain
            .find(old)
            .ok_or_else(|| CoreError::HandlerNotFound(old.to_string()))?;
        if *chain.nodes[index].name != *new_name && chain.contains_name(&new_name) {
            return Err(CoreError::DuplicateName(new_name.to_string()));
        }
        let (prev, next) = (chain.nodes[index].prev, chain.nodes[index].next);
        let replaced = chain
            .unlink(index)
            .ok_or_else(|| CoreError::HandlerNotFound(old.to_string()))?;
        chain.link_between(prev, next, new_name, new_handler);
        Ok(replaced)
    }

    pub fn get(&self, name: &str) -> Option<ChannelHandler> {
        let chain = self.chain.read();
        let index = chain.find(HandlerRef::Name(name))?;
        chain.nodes[index].handler.clone()
    }

    /// 自头向尾的节点名称。
    pub fn names(&self) -> Vec<Arc<str>> {
        let chain = self.chain.read();
        chain
            .linked()
            .map(|index| Arc::clone(&chain.nodes[index].name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chain.read().linked().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fire_channel_registered(&self) -> Result<(), CoreError> {
        self.registered_from(HEAD)
    }

    pub fn fire_channel_active(&self) -> Result<(), CoreError> {
        self.active_from(HEAD)
    }

    pub fn fire_channel_inactive(&self) -> Result<(), CoreError> {
        self.inactive_from(HEAD)
    }

    pub fn fire_channel_unregistered(&self) -> Result<(), CoreError> {
        self.unregistered_from(HEAD)
    }

    pub fn fire_channel_read(&self, msg: PipelineMessage) -> Result<(), CoreError> {
        self.read_from(HEAD, msg)
    }

    pub fn fire_exception_caught(&self, error: CoreError) -> Result<(), CoreError> {
        self.exception_from(HEAD, error)
    }

    /// 从尾部开始的出站写入。
    pub fn write(&self, msg: PipelineMessage) -> WriteFuture {
        self.write_from(TAIL, msg)
    }

    fn next_inbound(&self, from: usize) -> Option<(ChannelContext<'_>, Arc<dyn InboundHandler>)> {
        let chain = self.chain.read();
        let mut cursor = chain.nodes.get(from)?.next;
        while cursor != TAIL {
            let node = &chain.nodes[cursor];
            if let Some(handler) = node.handler.as_ref().and_then(ChannelHandler::as_inbound) {
                let ctx = ChannelContext::new(self, cursor, Arc::clone(&node.name));
                return Some((ctx, Arc::clone(handler)));
            }
            cursor = node.next;
        }
        None
    }

    fn prev_outbound(&self, from: usize) -> Option<(ChannelContext<'_>, Arc<dyn OutboundHandler>)> {
        let chain = self.chain.read();
        let mut cursor = chain.nodes.get(from)?.prev;
        while cursor != HEAD {
            let node = &chain.nodes[cursor];
            if let Some(handler) = node.handler.as_ref().and_then(ChannelHandler::as_outbound) {
                let ctx = ChannelContext::new(self, cursor, Arc::clone(&node.name));
                return Some((ctx, Arc::clone(handler)));
            }
            cursor = node.prev;
        }
        None
    }

    pub(crate) fn registered_from(&self, from: usize) -> Result<(), CoreError> {
        match self.next_inbound(from) {
            Some((ctx, handler)) => handler.on_channel_registered(&ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn active_from(&self, from: usize) -> Result<(), CoreError> {
        match self.next_inbound(from) {
            Some((ctx, handler)) => handler.on_channel_active(&ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn inactive_from(&self, from: usize) -> Result<(), CoreError> {
        match self.next_inbound(from) {
            Some((ctx, handler)) => handler.on_channel_inactive(&ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn unregistered_from(&self, from: usize) -> Result<(), CoreError> {
        match self.next_inbound(from) {
            Some((ctx, handler)) => handler.on_channel_unregistered(&ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn read_from(&self, from: usize, msg: PipelineMessage) -> Result<(), CoreError> {
        match self.next_inbound(from) {
            Some((ctx, handler)) => handler.on_read(&ctx, msg),
            None => {
                tracing::debug!(msg = ?msg, "discarded inbound message that reached the pipeline tail");
                msg.release();
                Ok(())
            }
        }
    }

    pub(crate) fn exception_from(&self, from: usize, error: CoreError) -> Result<(), CoreError> {
        match self.next_inbound(from) {
            Some((ctx, handler)) => handler.on_exception_caught(&ctx, error),
            None => {
                tracing::warn!(code = error.code(), %error, "exception reached the pipeline tail");
                Ok(())
            }
        }
    }

    pub(crate) fn write_from(&self, from: usize, msg: PipelineMessage) -> WriteFuture {
        match self.prev_outbound(from) {
            Some((ctx, handler)) => handler.on_write(&ctx, msg),
            None => self.write_to_transport(msg),
        }
    }

    fn write_to_transport(&self, msg: PipelineMessage) -> WriteFuture {
        let mut buf = match msg.into_buffer() {
            Ok(buf) => buf,
            Err(other) => {
                tracing::debug!(msg = ?other, "outbound message was not encoded");
                other.release();
                return WriteFuture::failed(CoreError::UnsupportedMessage);
            }
        };
        match self.channel() {
            Some(channel) => channel.send_to_transport(buf),
            None => {
                let _ = buf.release();
                WriteFuture::failed(CoreError::ChannelClosed)
            }
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("handlers", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attributes::AttributeMap,
        channel::{ChannelId, ChannelState},
    };
    use futures::executor::block_on;
    use ripple_buffer::{BufferPoolOptions, ByteBuf};
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        label: &'static str,
        journal: Journal,
    }

    impl InboundHandler for Recorder {
        fn on_read(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
            self.journal.lock().expect("日志锁").push(format!("in:{}", self.label));
            ctx.fire_channel_read(msg)
        }
    }

    impl OutboundHandler for Recorder {
        fn on_write(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> WriteFuture {
            self.journal.lock().expect("日志锁").push(format!("out:{}", self.label));
            ctx.write(msg)
        }
    }

    struct Swallow;

    impl InboundHandler for Swallow {
        fn on_read(&self, _ctx: &ChannelContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
            msg.release();
            Ok(())
        }
    }

    struct RemoveSelfOnRead;

    impl InboundHandler for RemoveSelfOnRead {
        fn on_read(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
            ctx.pipeline().remove(ctx.name())?;
            ctx.fire_channel_read(msg)
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        attributes: AttributeMap,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Channel for RecordingChannel {
        fn id(&self) -> ChannelId {
            ChannelId::from_raw(7)
        }

        fn state(&self) -> ChannelState {
            ChannelState::Connected
        }

        fn attributes(&self) -> &AttributeMap {
            &self.attributes
        }

        fn write(&self, msg: PipelineMessage) -> WriteFuture {
            msg.release();
            WriteFuture::failed(CoreError::ChannelClosed)
        }

        fn close(&self) {}

        fn shutdown(&self) -> bool {
            false
        }

        fn send_to_transport(&self, mut buf: ByteBuf) -> WriteFuture {
            let bytes = buf.readable_slice().map(<[u8]>::to_vec).unwrap_or_default();
            let len = bytes.len();
            self.sent.lock().expect("发送记录锁").push(bytes);
            let _ = buf.release();
            WriteFuture::ready(len)
        }
    }

    fn recorder(label: &'static str, journal: &Journal) -> ChannelHandler {
        ChannelHandler::duplex(Recorder {
            label,
            journal: Arc::clone(journal),
        })
    }

    fn small_pool() -> BufferPool {
        BufferPool::new(BufferPoolOptions {
            min_size: 0,
            max_size: 4,
            ..BufferPoolOptions::default()
        })
    }

    #[test]
    fn inbound_runs_head_to_tail_and_outbound_tail_to_head() {
        let channel = Arc::new(RecordingChannel::default());
        let weak: Weak<dyn Channel> = Arc::downgrade(&channel) as Weak<dyn Channel>;
        let pipeline = Pipeline::attached(weak, small_pool());
        let journal = Journal::default();
        pipeline.add_first("a", recorder("a", &journal)).expect("注册 a");
        pipeline.add_last("b", recorder("b", &journal)).expect("注册 b");

        pipeline
            .fire_channel_read(PipelineMessage::Buffer(ByteBuf::copied_from(b"ping")))
            .expect("入站分发");
        let written = block_on(pipeline.write(ByteBuf::copied_from(b"pong").into())).expect("出站写入");

        assert_eq!(written, 4);
        assert_eq!(
            *journal.lock().expect("日志锁"),
            vec!["in:a", "in:b", "out:b", "out:a"]
        );
        assert_eq!(*channel.sent.lock().expect("发送记录锁"), vec![b"pong".to_vec()]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let pipeline = Pipeline::new(small_pool());
        pipeline.add_last("codec", ChannelHandler::inbound(Swallow)).expect("首次注册");
        let err = pipeline
            .add_first("codec", ChannelHandler::inbound(Swallow))
            .expect_err("重名注册必须失败");
        assert!(matches!(err, CoreError::DuplicateName(name) if name == "codec"));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn remove_and_replace_walk_the_whole_chain() {
        let pipeline = Pipeline::new(small_pool());
        let journal = Journal::default();
        let middle = recorder("m", &journal);
        pipeline.add_last("first", recorder("f", &journal)).expect("注册");
        pipeline.add_last("middle", middle.clone()).expect("注册");
        pipeline.add_last("last", recorder("l", &journal)).expect("注册");

        pipeline
            .replace("last", "swapped", recorder("s", &journal))
            .expect("替换尾部节点");
        let names: Vec<String> = pipeline.names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["first", "middle", "swapped"]);

        let removed = pipeline.remove(&middle).expect("按实例摘除");
        assert!(removed.same_handler(&middle));
        assert!(matches!(
            pipeline.remove("middle"),
            Err(CoreError::HandlerNotFound(_))
        ));
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn swallowed_event_stops_propagation() {
        let pipeline = Pipeline::new(small_pool());
        let journal = Journal::default();
        pipeline.add_last("swallow", ChannelHandler::inbound(Swallow)).expect("注册");
        pipeline.add_last("after", recorder("after", &journal)).expect("注册");
        pipeline
            .fire_channel_read(PipelineMessage::user(5u32))
            .expect("入站分发");
        assert!(journal.lock().expect("日志锁").is_empty());
    }

    #[test]
    fn handler_may_remove_itself_during_dispatch() {
        let pipeline = Pipeline::new(small_pool());
        let journal = Journal::default();
        pipeline.add_last("once", ChannelHandler::inbound(RemoveSelfOnRead)).expect("注册");
        pipeline.add_last("next", recorder("next", &journal)).expect("注册");
        pipeline.fire_channel_read(PipelineMessage::user(1u8)).expect("首次分发");
        pipeline.fire_channel_read(PipelineMessage::user(2u8)).expect("再次分发");
        assert_eq!(pipeline.len(), 1);
        assert_eq!(journal.lock().expect("日志锁").len(), 2);
    }

    /// 析构时置位，用于观察流水线是否仍持有处理器。
    struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

    impl InboundHandler for DropFlag {}

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn removed_and_replaced_handlers_are_released() {
        let pipeline = Pipeline::new(small_pool());
        let removed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let replaced = Arc::new(std::sync::atomic::AtomicBool::new(false));
        pipeline
            .add_last("gone", ChannelHandler::inbound(DropFlag(Arc::clone(&removed))))
            .expect("注册");
        pipeline
            .add_last("old", ChannelHandler::inbound(DropFlag(Arc::clone(&replaced))))
            .expect("注册");

        drop(pipeline.remove("gone").expect("摘除"));
        drop(pipeline.replace("old", "new", ChannelHandler::inbound(Swallow)).expect("替换"));

        assert!(removed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(replaced.load(std::sync::atomic::Ordering::SeqCst));
        assert!(pipeline.get("new").is_some());
    }

    #[test]
    fn unencoded_message_cannot_reach_transport() {
        let pipeline = Pipeline::new(small_pool());
        let result = block_on(pipeline.write(PipelineMessage::user("raw")));
        assert!(matches!(result, Err(CoreError::UnsupportedMessage)));
    }

    #[test]
    fn tail_releases_unconsumed_buffers_to_the_pool() {
        let pool = small_pool();
        let pipeline = Pipeline::new(pool.clone());
        let mut buf = pool.allocate();
        buf.write_i32(1).expect("写入");
        pipeline
            .fire_channel_read(PipelineMessage::Buffer(buf))
            .expect("入站分发");
        assert_eq!(pool.idle(), 1);
    }
}
