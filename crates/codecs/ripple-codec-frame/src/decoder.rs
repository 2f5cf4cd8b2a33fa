use std::any::Any;

use ripple_buffer::{BufferError, ByteBuf};
use ripple_core::{ChannelContext, CoreError, InboundHandler, PipelineMessage};
use spin::Mutex;

use crate::frame::{
    COMMAND_LEN, DEFAULT_MAX_FRAME_LENGTH, FrameError, FrameMessage, HEADER_LEN, LENGTH_FIELD_LEN,
    parse_command,
};

/// 单次解码尝试的结果。
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome<T> {
    /// 得到一条完整消息，读游标已越过该帧。
    Complete(T),
    /// 字节不足，读游标保持不变。
    Incomplete,
}

/// 从累积缓冲中切出一条消息的解码策略。
///
/// 实现方只关心"当前字节够不够一帧"；累积、续读与分发由
/// [`ByteToMessageDecoder`] 负责。返回 `Incomplete` 时不得移动读游标。
pub trait Decoder: Send + Sync + 'static {
    type Item: Any + Send;

    fn decode(&self, src: &mut ByteBuf) -> Result<DecodeOutcome<Self::Item>, FrameError>;
}

/// 把字节流转换为消息的入站处理器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - TCP 只保证字节有序，不保留消息边界；一次读取可能包含半帧、整帧或多帧；
/// - 将"跨读事件累积剩余字节"的逻辑集中在此，具体协议只需实现 [`Decoder`]。
///
/// ## 逻辑（How）
/// 1. 累积缓冲为空时直接接管入站缓冲，否则把新字节追加到累积缓冲并释放入站缓冲；
/// 2. 只要还有可读字节就循环调用 [`Decoder::decode`]，直到返回 `Incomplete`；
/// 3. 累积缓冲读空后立即释放回池，否则保留到下一次读事件；
/// 4. 释放内部锁之后，按解码顺序逐条 `fire_channel_read`。
///
/// ## 契约（What）
/// - 非缓冲消息原样向后传递；
/// - 解码失败时丢弃累积缓冲；失败之前已解出的消息照常分发，随后返回错误，由通道上报异常并关闭连接；
/// - `channel_inactive` 时释放残留的累积缓冲。
pub struct ByteToMessageDecoder<D> {
    decoder: D,
    cumulation: Mutex<Option<ByteBuf>>,
}

impl<D: Decoder> ByteToMessageDecoder<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            cumulation: Mutex::new(None),
        }
    }

    /// 当前累积但尚未解码的字节数。
    pub fn buffered_bytes(&self) -> usize {
        self.cumulation
            .lock()
            .as_ref()
            .map_or(0, ByteBuf::readable_bytes)
    }

    /// 一次累积与解码；解码失败前已得到的消息随错误一并返回，调用方先分发再上报。
    fn cumulate(&self, incoming: ByteBuf) -> (Vec<D::Item>, Option<CoreError>) {
        let mut slot = self.cumulation.lock();
        let mut cumulation = match slot.take() {
            None => incoming,
            Some(mut cumulation) => {
                let mut incoming = incoming;
                let appended = append(&mut cumulation, &incoming);
                let _ = incoming.release();
                if let Err(err) = appended {
                    let _ = cumulation.release();
                    return (Vec::new(), Some(err.into()));
                }
                cumulation
            }
        };

        let mut decoded = Vec::new();
        while cumulation.is_readable() {
            match self.decoder.decode(&mut cumulation) {
                Ok(DecodeOutcome::Complete(item)) => decoded.push(item),
                Ok(DecodeOutcome::Incomplete) => break,
                Err(err) => {
                    let _ = cumulation.release();
                    return (decoded, Some(CoreError::handler(err)));
                }
            }
        }

        if cumulation.is_readable() {
            *slot = Some(cumulation);
        } else {
            let _ = cumulation.release();
        }
        (decoded, None)
    }
}

fn append(cumulation: &mut ByteBuf, incoming: &ByteBuf) -> Result<(), BufferError> {
    cumulation.discard_read_bytes()?;
    cumulation.write_bytes(incoming.readable_slice()?)
}

impl<D: Decoder> InboundHandler for ByteToMessageDecoder<D> {
    fn on_read(&self, ctx: &ChannelContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        let buf = match msg.into_buffer() {
            Ok(buf) => buf,
            Err(other) => return ctx.fire_channel_read(other),
        };
        let (decoded, failure) = self.cumulate(buf);
        for item in decoded {
            ctx.fire_channel_read(PipelineMessage::user(item))?;
        }
        failure.map_or(Ok(()), Err)
    }

    fn on_channel_inactive(&self, ctx: &ChannelContext<'_>) -> Result<(), CoreError> {
        if let Some(mut leftover) = self.cumulation.lock().take() {
            tracing::debug!(
                handler = ctx.name(),
                bytes = leftover.readable_bytes(),
                "dropping partial frame on inactive channel"
            );
            let _ = leftover.release();
        }
        ctx.fire_channel_inactive()
    }
}

/// 默认命令帧解码器：`i32 total_length | 32 字节命令 | i32 request_id | payload`。
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    max_frame_length: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Decoder for FrameDecoder {
    type Item = FrameMessage;

    fn decode(&self, src: &mut ByteBuf) -> Result<DecodeOutcome<FrameMessage>, FrameError> {
        if src.readable_bytes() < LENGTH_FIELD_LEN {
            return Ok(DecodeOutcome::Incomplete);
        }
        let total_length = src.get_i32(src.reader_index())?;
        let frame_len = match usize::try_from(total_length) {
            Ok(len) if len >= HEADER_LEN => len,
            _ => return Err(FrameError::Malformed { total_length }),
        };
        if frame_len > self.max_frame_length {
            return Err(FrameError::TooLarge {
                total_length: frame_len,
                limit: self.max_frame_length,
            });
        }
        if src.readable_bytes() < LENGTH_FIELD_LEN + frame_len {
            return Ok(DecodeOutcome::Incomplete);
        }

        src.skip(LENGTH_FIELD_LEN)?;
        let mut slot = [0u8; COMMAND_LEN];
        src.read_into(&mut slot)?;
        let request_id = src.read_i32()?;
        let payload = src.read_bytes(frame_len - HEADER_LEN)?;
        Ok(DecodeOutcome::Complete(FrameMessage {
            command: parse_command(&slot),
            request_id,
            payload,
        }))
    }
}
