use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use crate::error::CoreError;

/// 写操作的结果：写入套接字的字节数。
pub type WriteResult = Result<usize, CoreError>;

/// 一次出站写入的挂起结果。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - `Channel::write` 需要立即返回，而字节真正交给操作系统发生在发送循环中；
/// - 调用方可以选择 `await` 等待落地，也可以直接丢弃，只关心入队成功。
///
/// ## 契约（What）
/// - 由处理器同步得出结论时使用 [`WriteFuture::ready`] / [`WriteFuture::failed`]；
/// - 交给发送循环时使用 [`WriteFuture::pending`]，由 [`WritePromise`] 完成；
/// - 承诺方在完成前被丢弃（通道关闭）时，结果为 [`CoreError::ChannelClosed`]。
#[must_use = "写结果需要等待或显式丢弃"]
#[derive(Debug)]
pub struct WriteFuture {
    state: State,
}

#[derive(Debug)]
enum State {
    Ready(Option<WriteResult>),
    Pending(oneshot::Receiver<WriteResult>),
}

impl WriteFuture {
    pub fn ready(written: usize) -> Self {
        Self {
            state: State::Ready(Some(Ok(written))),
        }
    }

    pub fn failed(error: CoreError) -> Self {
        Self {
            state: State::Ready(Some(Err(error))),
        }
    }

    /// 创建一对承诺与挂起结果。
    pub fn pending() -> (WritePromise, Self) {
        let (tx, rx) = oneshot::channel();
        (
            WritePromise { tx },
            Self {
                state: State::Pending(rx),
            },
        )
    }

    /// 是否在创建时就已得出结论（无需等待发送循环）。
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, State::Ready(Some(_)))
    }
}

impl Future for WriteFuture {
    type Output = WriteResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            State::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(CoreError::ChannelClosed)),
            },
            State::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(CoreError::ChannelClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// [`WriteFuture`] 的完成端，由发送循环持有。
#[derive(Debug)]
pub struct WritePromise {
    tx: oneshot::Sender<WriteResult>,
}

impl WritePromise {
    pub fn complete(self, result: WriteResult) {
        // 接收端已丢弃说明调用方不关心结果。
        let _ = self.tx.send(result);
    }
}
