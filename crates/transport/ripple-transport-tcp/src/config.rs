use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    path::Path,
};

use ripple_buffer::{
    BufferPoolOptions, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCKS_PER_SLAB, DEFAULT_MAX_CAPACITY,
    DEFAULT_RETAIN_CAPACITY,
};
use serde::Deserialize;

use crate::error::{LOAD_OPTIONS, TransportError, map_io_error};

/// 默认最大帧长度，与帧编解码器保持一致。
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const MAX_DEFAULT_SCHEDULERS: usize = 16;

/// 服务端配置。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把监听套接字选项、调度器数量、池容量与队列水位集中到一处，既可以在代码中以
///   `with_*` 链式构造，也可以从 TOML 文件加载；
/// - 配置缺省字段时回落到默认值，因此最小配置文件只需写出需要覆盖的键。
///
/// ## 契约（What）
/// - [`ServerOptions::validate`] 拒绝零调度器、零块大小、`min_pool_size > max_pool_size`
///   以及小于一个块的读写水位；
/// - [`ServerOptions::from_toml_str`] 与 [`ServerOptions::load`] 在解析后立即校验。
///
/// ```toml
/// address = "0.0.0.0"
/// port = 9000
/// schedulers = 4
/// max_read_buffer_size = 131072
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOptions {
    pub address: IpAddr,
    pub port: u16,
    pub backlog: i32,
    pub no_delay: bool,
    pub reuse_address: bool,
    pub reuse_port: bool,
    pub schedulers: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub buffer_size: usize,
    pub block_size: usize,
    pub blocks_per_slab: usize,
    pub max_read_buffer_size: usize,
    pub max_write_buffer_size: usize,
    pub wait_for_data_before_allocating_buffer: bool,
    pub max_frame_length: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8007,
            backlog: 512,
            no_delay: true,
            reuse_address: true,
            reuse_port: true,
            schedulers: default_schedulers(),
            min_pool_size: 10,
            max_pool_size: 50,
            buffer_size: 256,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks_per_slab: DEFAULT_BLOCKS_PER_SLAB,
            max_read_buffer_size: 64 * 1024,
            max_write_buffer_size: 64 * 1024,
            wait_for_data_before_allocating_buffer: true,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

fn default_schedulers() -> usize {
    std::thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .min(MAX_DEFAULT_SCHEDULERS)
}

impl ServerOptions {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, TransportError> {
        let options: Self = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// 从 TOML 文件加载并校验。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|err| map_io_error(LOAD_OPTIONS, err))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.schedulers == 0 {
            return Err(invalid("schedulers must be at least 1"));
        }
        if self.block_size == 0 || self.blocks_per_slab == 0 {
            return Err(invalid("block_size and blocks_per_slab must be non-zero"));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(invalid(format!(
                "min_pool_size {} exceeds max_pool_size {}",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.max_read_buffer_size < self.block_size
            || self.max_write_buffer_size < self.block_size
        {
            return Err(invalid(format!(
                "read/write buffer limits must hold at least one {}-byte block",
                self.block_size
            )));
        }
        if self.backlog <= 0 {
            return Err(invalid("backlog must be positive"));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// 每条连接入站缓冲所用的对象池参数。
    pub fn buffer_pool_options(&self) -> BufferPoolOptions {
        BufferPoolOptions {
            buffer_size: self.buffer_size,
            max_capacity: DEFAULT_MAX_CAPACITY,
            retain_capacity: DEFAULT_RETAIN_CAPACITY,
            min_size: self.min_pool_size,
            max_size: self.max_pool_size,
        }
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_schedulers(mut self, schedulers: usize) -> Self {
        self.schedulers = schedulers;
        self
    }

    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = min;
        self.max_pool_size = max;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_buffer_limits(mut self, max_read: usize, max_write: usize) -> Self {
        self.max_read_buffer_size = max_read;
        self.max_write_buffer_size = max_write;
        self
    }

    pub fn with_wait_for_data(mut self, wait: bool) -> Self {
        self.wait_for_data_before_allocating_buffer = wait;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidOptions(reason.into())
}
