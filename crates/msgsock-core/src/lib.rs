#![doc = r#"
# msgsock-core

## 设计动机（Why）
- **与传输解耦**：错误分类、URL、报文模型与编解码不依赖任何运行时，传输层与状态机都只引用这里的类型；
- **零拷贝**：大块数据作为子缓冲区挂在报文上，编码时仅产生 [`bytes::Bytes`] 引用；
- **一次性完成信号**：[`Promise`] 保证无论连接如何结束，等待方都恰好收到一次结果。

## 核心契约（What）
- [`SocketError`] / [`ErrorKind`]：封闭的错误分类，附带稳定错误码与原始 IO 信息；
- [`Url`] / [`TcpScheme`]：`tcp`、`tcps`、`tcpsm` 三种方案，默认端口 [`DEFAULT_PORT`]；
- [`Message`] / [`codec`]：28 字节报文头 + 负载 + 引用式子缓冲区；
- [`CapabilityMap`]：连接建立后交换的能力表。

## 风险与考量（Trade-offs）
- 解码得到的负载总是扁平的，子缓冲区布局只能由持有偏移信息的上层还原；
- 报文头采用固定小端序，与大端对端互通需要两端都遵循同一约定。
"#]

pub mod capability;
pub mod codec;
pub mod error;
pub mod message;
pub mod option;
pub mod promise;
pub mod url;

pub use capability::{CapabilityError, CapabilityMap, CapabilityValue};
pub use error::{ErrorKind, OperationKind, SocketError, aborted_error, map_io_error};
pub use message::{
    Header, Message, MessageAddress, MessageBuilder, MessageFlags, MessageType, SubBuffer,
    next_message_id,
};
pub use option::{HandshakeSide, Ipv6Enabled, ReuseAddressEnabled, SslEnabled};
pub use promise::{Completion, Promise, completed};
pub use url::{DEFAULT_PORT, TcpScheme, Url, UrlError};
