//! 帧协议回显服务。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=ripple_transport_tcp=debug,info \
//!     cargo run -p ripple-examples --bin echo_server -- crates/ripple-examples/config/echo_server.toml
//! ```
//! - 第一个参数为可选的 TOML 配置路径，缺省时使用 `ServerOptions::default()`；
//! - `Ctrl-C` 触发 `SocketServer::stop`，关闭所有连接后退出。

use std::{env, path::PathBuf, sync::Arc};

use anyhow::Context;
use ripple_examples::{EchoInitializer, install_tracing};
use ripple_transport_tcp::{ServerOptions, SocketServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_tracing()?;

    let options = match env::args().nth(1).map(PathBuf::from) {
        Some(path) => ServerOptions::load(&path)
            .with_context(|| format!("加载配置失败: {}", path.display()))?,
        None => ServerOptions::default(),
    };
    let initializer = EchoInitializer::new(options.max_frame_length);
    let server = Arc::new(SocketServer::new(options, initializer)?);
    let addr = server.bind()?;
    tracing::info!(%addr, "echo server ready");

    let accepting = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_loop().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("等待退出信号失败")?;
    tracing::info!(
        connections = server.connection_count(),
        "shutdown requested"
    );
    server.stop();
    accepting.await??;
    Ok(())
}
