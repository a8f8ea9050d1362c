use std::borrow::Cow;
use std::io;

use thiserror::Error;

/// 网络与生命周期错误的封闭分类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 与具体传输实现解耦：无论底层是 Tokio 套接字还是测试替身，上层只面对这一组错误种类；
/// - 让最终消费者（Future 的等待方、接收循环的回调）可以用 `match` 决定“失败返回”还是“记录后继续”。
///
/// ## 契约（What）
/// - 解析类：[`ErrorKind::BadAddress`]、[`ErrorKind::HostNotFound`]；
/// - 连接类：[`ErrorKind::ConnectionRefused`]、[`ErrorKind::Unreachable`]、[`ErrorKind::PingTimeout`]，
///   以及对端关闭 [`ErrorKind::ConnectionClosed`] 与兜底的 [`ErrorKind::Io`]；
/// - TLS 类统一为 [`ErrorKind::Tls`]；
/// - 协议类：[`ErrorKind::MalformedHeader`]、[`ErrorKind::MessageTooLarge`]；
/// - 生命周期类：[`ErrorKind::InvalidState`]、[`ErrorKind::OperationAborted`]；
/// - 本地致命类：[`ErrorKind::SocketCreationFailed`]，与传输错误区分。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    /// URL 无法解析、缺少主机或端口非法。
    #[error("bad address")]
    BadAddress,
    /// 解析成功但没有可接受的端点。
    #[error("host not found")]
    HostNotFound,
    /// 对端拒绝连接。
    #[error("connection refused")]
    ConnectionRefused,
    /// 网络或主机不可达。
    #[error("network unreachable")]
    Unreachable,
    /// 保活探测超时。
    #[error("ping timeout")]
    PingTimeout,
    /// 对端关闭或重置了连接。
    #[error("connection closed")]
    ConnectionClosed,
    /// 其余传输层 IO 失败。
    #[error("i/o failure")]
    Io,
    /// 握手或证书校验失败。
    #[error("tls failure")]
    Tls,
    /// 报文头非法（魔数不符、类型未知等）。
    #[error("malformed message header")]
    MalformedHeader,
    /// 报文声明的负载超过上限。
    #[error("message too large")]
    MessageTooLarge,
    /// 在错误的状态下发起操作。
    #[error("invalid state")]
    InvalidState,
    /// 操作被停止信号或宿主析构中止。
    #[error("operation aborted")]
    OperationAborted,
    /// 无法创建本地套接字。
    #[error("socket creation failed")]
    SocketCreationFailed,
}

/// 贯穿所有回调与 Future 的不透明错误值。
///
/// `Clone` 是刻意的：同一个完成信号可能被多个等待方共享。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("[{code}] {kind}: {message}")]
pub struct SocketError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    io_kind: Option<io::ErrorKind>,
    os_code: Option<i32>,
}

impl SocketError {
    /// 以稳定错误码与文案构造错误。
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            io_kind: None,
            os_code: None,
        }
    }

    /// 附带原始 IO 错误信息，供致命错误判定使用。
    pub fn with_io(mut self, error: &io::Error) -> Self {
        self.io_kind = Some(error.kind());
        self.os_code = error.raw_os_error();
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 触发该错误的 IO 错误种类（若有）。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        self.io_kind
    }

    /// 触发该错误的操作系统错误码（若有）。
    pub fn raw_os_error(&self) -> Option<i32> {
        self.os_code
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::OperationAborted
    }

    /// 操作被中止。
    pub fn aborted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::OperationAborted, ABORTED_CODE, message)
    }

    /// 在错误状态下发起操作。
    pub fn invalid_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::InvalidState, INVALID_STATE_CODE, message)
    }

    /// 地址非法。
    pub fn bad_address(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::BadAddress, BAD_ADDRESS_CODE, message)
    }
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const RESOLVE: OperationKind = OperationKind {
    code: "msgsock.transport.resolve_failed",
    message: "resolve",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "msgsock.transport.connect_failed",
    message: "tcp connect",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "msgsock.transport.configure_failed",
    message: "tcp configure",
};
pub const HANDSHAKE: OperationKind = OperationKind {
    code: "msgsock.transport.handshake_failed",
    message: "tls handshake",
};
pub const OPEN: OperationKind = OperationKind {
    code: "msgsock.transport.open_failed",
    message: "socket open",
};
pub const BIND: OperationKind = OperationKind {
    code: "msgsock.transport.bind_failed",
    message: "tcp bind",
};
pub const LISTEN: OperationKind = OperationKind {
    code: "msgsock.transport.listen_failed",
    message: "tcp listen",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "msgsock.transport.accept_failed",
    message: "tcp accept",
};
pub const READ: OperationKind = OperationKind {
    code: "msgsock.transport.read_failed",
    message: "message read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "msgsock.transport.write_failed",
    message: "message write",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "msgsock.transport.shutdown_failed",
    message: "tcp shutdown",
};

const ABORTED_CODE: &str = "msgsock.operation_aborted";
const INVALID_STATE_CODE: &str = "msgsock.invalid_state";
const BAD_ADDRESS_CODE: &str = "msgsock.bad_address";

/// 将 IO 错误映射为 [`SocketError`]，并推导错误种类。
pub fn map_io_error(kind: OperationKind, error: io::Error) -> SocketError {
    SocketError::new(
        categorize_io_error(&error),
        kind.code,
        format!("{}: {}", kind.message, error),
    )
    .with_io(&error)
}

/// 构造某一步骤被停止信号中止的错误。
pub fn aborted_error(kind: OperationKind) -> SocketError {
    SocketError::aborted(format!("{} aborted", kind.message))
}

fn categorize_io_error(error: &io::Error) -> ErrorKind {
    use io::ErrorKind as Io;
    match error.kind() {
        Io::ConnectionRefused => ErrorKind::ConnectionRefused,
        Io::HostUnreachable | Io::NetworkUnreachable | Io::NetworkDown => ErrorKind::Unreachable,
        Io::TimedOut => ErrorKind::PingTimeout,
        Io::UnexpectedEof
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::BrokenPipe
        | Io::NotConnected => ErrorKind::ConnectionClosed,
        Io::AddrNotAvailable => ErrorKind::BadAddress,
        _ => ErrorKind::Io,
    }
}
