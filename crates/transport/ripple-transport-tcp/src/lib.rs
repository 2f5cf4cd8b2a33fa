//! `ripple-transport-tcp` 把 `ripple-core` 的流水线接到 Tokio TCP 套接字上。
//!
//! # 组成
//! - [`SocketServer`]：监听、接入循环、连接表；
//! - [`SocketChannel`]：单条连接的接收、分发与发送循环；
//! - [`IoSchedulerGroup`]：固定数量的单线程调度器，连接按轮询绑定；
//! - [`ServerOptions`]：可从 TOML 加载的服务端配置；
//! - [`TransportError`]：带稳定错误码的传输层错误。
//!
//! # 快速上手
//! ```no_run
//! use std::sync::Arc;
//! use ripple_core::CoreError;
//! use ripple_transport_tcp::{ServerOptions, SocketChannel, SocketServer};
//!
//! fn install(channel: &Arc<SocketChannel>) -> Result<(), CoreError> {
//!     // 按需注册解码器、编码器与业务处理器。
//!     let _ = channel.pipeline().len();
//!     Ok(())
//! }
//!
//! # async fn demo() -> Result<(), ripple_transport_tcp::TransportError> {
//! let server = SocketServer::new(ServerOptions::default(), install)?;
//! server.bind()?;
//! server.accept_loop().await
//! # }
//! ```

mod channel;
mod config;
mod error;
mod pipe;
mod scheduler;
mod server;

pub use channel::{ChannelStats, SocketChannel};
pub use config::{DEFAULT_MAX_FRAME_LENGTH, ServerOptions};
pub use error::{ErrorClass, OperationKind, TransportError, classify};
pub use scheduler::IoSchedulerGroup;
pub use server::{ChannelInitializer, SocketServer};
