use bytes::Bytes;
use ripple_buffer::ByteBuf;
use thiserror::Error;

/// 长度字段宽度。
pub const LENGTH_FIELD_LEN: usize = 4;
/// 命令槽固定宽度。
pub const COMMAND_LEN: usize = 32;
/// `total_length` 中除负载外的部分：命令槽 + `request_id`。
pub const HEADER_LEN: usize = COMMAND_LEN + 4;
/// 默认允许的最大 `total_length`。
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// 帧编解码错误。
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame total length {total_length} is smaller than the 36-byte header")]
    Malformed { total_length: i32 },
    #[error("frame total length {total_length} exceeds limit {limit}")]
    TooLarge { total_length: usize, limit: usize },
    #[error("command `{0}` does not fit the 32-byte command slot")]
    CommandTooLong(String),
    #[error(transparent)]
    Buffer(#[from] ripple_buffer::BufferError),
}

/// 线上的一条命令帧。
///
/// ```text
/// offset 0  : i32      total_length   // 36 + len(payload)
/// offset 4  : [u8; 32] command        // UTF-8，末尾补零
/// offset 36 : i32      request_id
/// offset 40 : [u8]     payload
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameMessage {
    pub command: String,
    pub request_id: i32,
    pub payload: Bytes,
}

impl FrameMessage {
    pub fn new(command: impl Into<String>, request_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            request_id,
            payload: payload.into(),
        }
    }

    /// `total_length` 字段的值。
    pub fn total_length(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// 整帧在线上的字节数（含长度字段）。
    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_LEN + self.total_length()
    }

    /// 按线格式追加到 `buf`。
    pub fn encode_into(&self, buf: &mut ByteBuf) -> Result<(), FrameError> {
        let command = self.command.as_bytes();
        if command.len() > COMMAND_LEN {
            return Err(FrameError::CommandTooLong(self.command.clone()));
        }
        let total_length =
            i32::try_from(self.total_length()).map_err(|_| FrameError::TooLarge {
                total_length: self.total_length(),
                limit: i32::MAX as usize,
            })?;
        let mut slot = [0u8; COMMAND_LEN];
        slot[..command.len()].copy_from_slice(command);

        buf.ensure_writable(self.encoded_len())?;
        buf.write_i32(total_length)?;
        buf.write_bytes(&slot)?;
        buf.write_i32(self.request_id)?;
        buf.write_bytes(&self.payload)?;
        Ok(())
    }
}

/// 去掉命令槽末尾的补零后按 UTF-8 解析，非法序列以替换字符呈现。
pub(crate) fn parse_command(slot: &[u8]) -> String {
    let end = slot
        .iter()
        .rposition(|byte| *byte != 0)
        .map_or(0, |last| last + 1);
    String::from_utf8_lossy(&slot[..end]).into_owned()
}
