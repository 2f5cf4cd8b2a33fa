//! ripple 示例：帧协议回显服务的流水线装配与日志初始化。
//!
//! `echo_server` 二进制只负责解析参数与等待退出信号，装配逻辑集中在本库中，
//! 便于在集成测试或其他二进制里复用。

use std::sync::Arc;

use ripple_codec_frame::{ByteToMessageDecoder, EchoHandler, FrameDecoder, FrameEncoder};
use ripple_core::{Channel, ChannelHandler, CoreError, SESSION_ID};
use ripple_transport_tcp::{ChannelInitializer, SocketChannel, TransportError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 为每条连接安装 `decoder → encoder → echo` 三个处理器。
///
/// 连接的对端地址以 [`SESSION_ID`] 存入通道属性，供后续处理器在日志中关联会话。
#[derive(Clone, Copy, Debug)]
pub struct EchoInitializer {
    max_frame_length: usize,
}

impl EchoInitializer {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl ChannelInitializer for EchoInitializer {
    fn init_channel(&self, channel: &Arc<SocketChannel>) -> Result<(), CoreError> {
        channel
            .attributes()
            .add_attribute(SESSION_ID, channel.peer_addr().to_string());

        let pipeline = channel.pipeline();
        pipeline.add_last(
            "decoder",
            ChannelHandler::inbound(ByteToMessageDecoder::new(FrameDecoder::new(
                self.max_frame_length,
            ))),
        )?;
        pipeline.add_last("encoder", ChannelHandler::outbound(FrameEncoder))?;
        pipeline.add_last("echo", ChannelHandler::inbound(EchoHandler))?;
        Ok(())
    }

    fn exception_caught(&self, error: &TransportError) {
        tracing::warn!(code = error.code(), %error, "echo server error");
    }
}

/// 安装全局日志订阅者，过滤规则取自 `RUST_LOG`，缺省为 `info`。
///
/// 重复调用时返回错误而不是覆盖已有订阅者。
pub fn install_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_codec_frame::FrameMessage;
    use ripple_core::buffer::ByteBuf;
    use ripple_transport_tcp::{ServerOptions, SocketServer};
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    #[test]
    fn bundled_config_is_valid() {
        let options =
            ServerOptions::from_toml_str(include_str!("../config/echo_server.toml"))
                .expect("示例配置应能解析");
        assert_eq!(options.port, 8007);
        assert_eq!(options.max_frame_length, 1024 * 1024);
        options.validate().expect("示例配置应通过校验");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_initializer_serves_frames_and_tags_session() {
        let options = ServerOptions::default()
            .with_port(0)
            .with_schedulers(1)
            .with_reuse_port(false);
        let server = Arc::new(
            SocketServer::new(options, EchoInitializer::new(1024)).expect("创建服务端"),
        );
        let addr = server.bind().expect("绑定");
        let accepting = Arc::clone(&server);
        tokio::spawn(async move { accepting.accept_loop().await });

        let mut client = TcpStream::connect(addr).await.expect("连接");
        let mut request = ByteBuf::default();
        FrameMessage::new("echo", 7, &b"hi"[..])
            .encode_into(&mut request)
            .expect("编码");
        client
            .write_all(request.readable_slice().expect("可读视图"))
            .await
            .expect("发送");

        let mut reply = [0u8; 42];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
            .await
            .expect("等待应答超时")
            .expect("读取应答");
        assert_eq!(&reply[..4], &38i32.to_be_bytes());
        assert_eq!(&reply[4..8], b"echo");
        assert_eq!(&reply[36..40], &0i32.to_be_bytes());
        assert_eq!(&reply[40..], b"hi");

        let channel = server
            .channels()
            .into_iter()
            .next()
            .expect("应有一条连接");
        let session = channel
            .attributes()
            .get_attribute::<String>(SESSION_ID)
            .expect("会话标识");
        assert_eq!(*session, client.local_addr().expect("本地地址").to_string());
        server.stop();
    }
}
