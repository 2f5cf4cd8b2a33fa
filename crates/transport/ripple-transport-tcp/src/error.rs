use std::io;

use ripple_core::CoreError;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "ripple.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "ripple.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "ripple.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "ripple.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "ripple.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "ripple.transport.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const SCHEDULER: OperationKind = OperationKind {
    code: "ripple.transport.tcp.scheduler_failed",
    message: "io scheduler start",
};
pub(crate) const LOAD_OPTIONS: OperationKind = OperationKind {
    code: "ripple.transport.tcp.options_unreadable",
    message: "read server options",
};

/// I/O 错误在通道边界上的处理方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// 对端断开或操作被打断：只触发关闭，不作为异常上报。
    Disconnect,
    /// 其余错误：经 `exception_caught` 上报后强制关闭。
    Fatal,
}

/// 按 `io::ErrorKind` 对错误分类。
pub fn classify(error: &io::Error) -> ErrorClass {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionRefused
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof
        | ErrorKind::Interrupted => ErrorClass::Disconnect,
        _ => ErrorClass::Fatal,
    }
}

/// TCP 传输层错误。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{}: {source}", .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("invalid server options: {0}")]
    InvalidOptions(String),
    #[error("failed to parse server options: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("server is not bound to a listening socket")]
    NotBound,
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl TransportError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { kind, .. } => kind.code,
            Self::InvalidOptions(_) => "ripple.transport.tcp.invalid_options",
            Self::Parse(_) => "ripple.transport.tcp.options_malformed",
            Self::NotBound => "ripple.transport.tcp.not_bound",
            Self::Core(inner) => inner.code(),
        }
    }

    /// 非 I/O 错误一律视为 [`ErrorClass::Fatal`]。
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { source, .. } => classify(source),
            _ => ErrorClass::Fatal,
        }
    }

    /// 转换为流水线可投递的 [`CoreError`]。
    pub fn into_core(self) -> CoreError {
        match self {
            Self::Io { kind, source } => CoreError::Io {
                operation: kind.message,
                source,
            },
            Self::Core(inner) => inner,
            other => CoreError::handler(other),
        }
    }
}

/// 将 IO 错误映射为传输层错误，保留操作种类以便生成错误码。
pub(crate) fn map_io_error(kind: OperationKind, source: io::Error) -> TransportError {
    TransportError::Io { kind, source }
}
