use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, SocketError};

/// 报文头固定长度（字节）。
pub const HEADER_SIZE: usize = 28;
/// 报文头起始魔数。
pub const MAGIC_COOKIE: u32 = 0x42de_ad42;
/// 当前报文头版本。
pub const HEADER_VERSION: u16 = 0;
/// 子缓冲区长度标记的字节数。
pub const SUB_BUFFER_MARKER_SIZE: usize = 4;

/// 服务端保留服务号。
pub const SERVICE_SERVER: u32 = 0;
/// 服务端认证动作号，握手阶段可携带能力表。
pub const SERVER_FUNCTION_AUTHENTICATE: u32 = 8;

static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// 分配进程内唯一递增的报文 id。
pub fn next_message_id() -> u32 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// 报文类型，线上以单字节编码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    None = 0,
    Call = 1,
    Reply = 2,
    Error = 3,
    Post = 4,
    Event = 5,
    Capability = 6,
    Cancel = 7,
    Canceled = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => MessageType::None,
            1 => MessageType::Call,
            2 => MessageType::Reply,
            3 => MessageType::Error,
            4 => MessageType::Post,
            5 => MessageType::Event,
            6 => MessageType::Capability,
            7 => MessageType::Cancel,
            8 => MessageType::Canceled,
            _ => return None,
        })
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::None => "None",
            MessageType::Call => "Call",
            MessageType::Reply => "Reply",
            MessageType::Error => "Error",
            MessageType::Post => "Post",
            MessageType::Event => "Event",
            MessageType::Capability => "Capability",
            MessageType::Cancel => "Cancel",
            MessageType::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 报文头中的标志位集合。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const DYNAMIC_PAYLOAD: MessageFlags = MessageFlags(0x1);
    pub const RETURN_TYPE: MessageFlags = MessageFlags(0x2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: MessageFlags) -> Self {
        Self(self.0 | other.0)
    }
}

/// 报文的寻址信息：id 加上服务、对象与函数号。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageAddress {
    pub message_id: u32,
    pub service: u32,
    pub object: u32,
    pub function: u32,
}

impl MessageAddress {
    pub const fn new(message_id: u32, service: u32, object: u32, function: u32) -> Self {
        Self {
            message_id,
            service,
            object,
            function,
        }
    }
}

/// 解码后的报文头。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub id: u32,
    /// 负载总长度，含全部子缓冲区字节。
    pub size: u32,
    pub version: u16,
    pub kind: MessageType,
    pub flags: MessageFlags,
    pub service: u32,
    pub object: u32,
    pub function: u32,
}

/// 嵌入在负载中的子缓冲区：`offset` 指向负载内的长度标记位置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubBuffer {
    offset: usize,
    data: Bytes,
}

impl SubBuffer {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// 线上传输的报文单元：报文头 + 内联负载 + 引用式子缓冲区。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 大块二进制数据以 [`SubBuffer`] 形式挂在负载上，编码时只传递 [`Bytes`] 引用而不复制；
/// - 一旦交给发送队列即不可再修改，因此构造统一走 [`MessageBuilder`]。
///
/// ## 契约（What）
/// - `payload()` 只包含内联字节；每个子缓冲区在内联负载中占一个 4 字节长度标记；
/// - `total_size()` = 内联长度 + 全部子缓冲区长度，也就是报文头 `size` 字段的值；
/// - 从线上解码得到的报文负载是扁平的，可用 [`Message::split_sub_buffers`] 按已知偏移还原。
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    kind: MessageType,
    flags: MessageFlags,
    service: u32,
    object: u32,
    function: u32,
    payload: Bytes,
    sub_buffers: Vec<SubBuffer>,
}

impl Message {
    /// 以类型与地址开始构造报文。
    pub fn builder(kind: MessageType, address: MessageAddress) -> MessageBuilder {
        MessageBuilder {
            address,
            kind,
            flags: MessageFlags::empty(),
            payload: BytesMut::new(),
            sub_buffers: Vec::new(),
        }
    }

    /// 构造一条回复：沿用请求的 id 与地址。
    pub fn reply_to(request: &Message) -> MessageBuilder {
        Message::builder(MessageType::Reply, request.address())
    }

    /// 以解码得到的报文头和扁平负载构造报文。
    pub fn from_wire(header: Header, payload: Bytes) -> Self {
        Self {
            id: header.id,
            kind: header.kind,
            flags: header.flags,
            service: header.service,
            object: header.object,
            function: header.function,
            payload,
            sub_buffers: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn service(&self) -> u32 {
        self.service
    }

    pub fn object(&self) -> u32 {
        self.object
    }

    pub fn function(&self) -> u32 {
        self.function
    }

    pub fn address(&self) -> MessageAddress {
        MessageAddress::new(self.id, self.service, self.object, self.function)
    }

    /// 内联负载字节。
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn sub_buffers(&self) -> &[SubBuffer] {
        &self.sub_buffers
    }

    /// 负载总长度，含子缓冲区。
    pub fn total_size(&self) -> usize {
        self.payload.len()
            + self
                .sub_buffers
                .iter()
                .map(|sub| sub.data.len())
                .sum::<usize>()
    }

    /// 由报文字段生成报文头。
    ///
    /// 总长度超过 `u32` 时返回 [`ErrorKind::MessageTooLarge`]。
    pub fn header(&self) -> Result<Header, SocketError> {
        let size = u32::try_from(self.total_size()).map_err(|_| {
            SocketError::new(
                ErrorKind::MessageTooLarge,
                "msgsock.codec.payload_overflow",
                format!("payload of {} bytes does not fit a header", self.total_size()),
            )
        })?;
        Ok(Header {
            id: self.id,
            size,
            version: HEADER_VERSION,
            kind: self.kind,
            flags: self.flags,
            service: self.service,
            object: self.object,
            function: self.function,
        })
    }

    /// 类型不为 `None` 且对象号非零。
    pub fn is_valid(&self) -> bool {
        self.kind != MessageType::None && self.object != 0
    }

    /// 按已知的标记偏移（升序）把扁平负载还原为“内联负载 + 子缓冲区”。
    ///
    /// 偏移是标记在内联负载中的位置，与 [`MessageBuilder::push_sub_buffer`] 的返回值一致。
    pub fn split_sub_buffers(&self, offsets: &[usize]) -> Result<Message, SocketError> {
        let flat = self.flat_payload();
        let mut inline = BytesMut::with_capacity(flat.len());
        let mut sub_buffers = Vec::with_capacity(offsets.len());
        let mut cursor = 0usize;
        let mut shift = 0usize;

        for &offset in offsets {
            let marker = offset + shift;
            let marker_end = marker + SUB_BUFFER_MARKER_SIZE;
            if marker < cursor || marker_end > flat.len() {
                return Err(malformed_layout(offset));
            }
            let mut raw = [0u8; SUB_BUFFER_MARKER_SIZE];
            raw.copy_from_slice(&flat[marker..marker_end]);
            let size = u32::from_le_bytes(raw) as usize;
            let data_end = marker_end + size;
            if data_end > flat.len() {
                return Err(malformed_layout(offset));
            }
            inline.extend_from_slice(&flat[cursor..marker_end]);
            sub_buffers.push(SubBuffer {
                offset,
                data: flat.slice(marker_end..data_end),
            });
            shift += size;
            cursor = data_end;
        }
        inline.extend_from_slice(&flat[cursor..]);

        Ok(Message {
            payload: inline.freeze(),
            sub_buffers,
            ..self.clone()
        })
    }

    fn flat_payload(&self) -> Bytes {
        if self.sub_buffers.is_empty() {
            return self.payload.clone();
        }
        let mut flat = BytesMut::with_capacity(self.total_size());
        let mut cursor = 0usize;
        for sub in &self.sub_buffers {
            let end = sub.offset + SUB_BUFFER_MARKER_SIZE;
            flat.extend_from_slice(&self.payload[cursor..end]);
            flat.extend_from_slice(&sub.data);
            cursor = end;
        }
        flat.extend_from_slice(&self.payload[cursor..]);
        flat.freeze()
    }
}

fn malformed_layout(offset: usize) -> SocketError {
    SocketError::new(
        ErrorKind::MalformedHeader,
        "msgsock.codec.sub_buffer_layout",
        format!("no valid sub-buffer marker at offset {offset}"),
    )
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("service", &self.service)
            .field("object", &self.object)
            .field("function", &self.function)
            .field("payload_len", &self.payload.len())
            .field("sub_buffers", &self.sub_buffers.len())
            .finish()
    }
}

/// [`Message`] 的构造器；`build` 之后报文不可再修改。
#[derive(Debug)]
pub struct MessageBuilder {
    address: MessageAddress,
    kind: MessageType,
    flags: MessageFlags,
    payload: BytesMut,
    sub_buffers: Vec<SubBuffer>,
}

impl MessageBuilder {
    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// 追加内联负载字节。
    pub fn payload(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.payload.extend_from_slice(bytes.as_ref());
        self
    }

    /// 追加一个子缓冲区：写入 4 字节长度标记并记录其偏移，返回该偏移。
    ///
    /// 子缓冲区本身按引用保存，不会被复制进内联负载。
    pub fn push_sub_buffer(&mut self, data: Bytes) -> Result<usize, SocketError> {
        let size = u32::try_from(data.len()).map_err(|_| {
            SocketError::new(
                ErrorKind::MessageTooLarge,
                "msgsock.codec.sub_buffer_overflow",
                format!("sub-buffer of {} bytes is too large", data.len()),
            )
        })?;
        let offset = self.payload.len();
        self.payload.put_u32_le(size);
        self.sub_buffers.push(SubBuffer { offset, data });
        Ok(offset)
    }

    pub fn build(self) -> Message {
        Message {
            id: self.address.message_id,
            kind: self.kind,
            flags: self.flags,
            service: self.address.service,
            object: self.address.object,
            function: self.address.function,
            payload: self.payload.freeze(),
            sub_buffers: self.sub_buffers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> MessageBuilder {
        Message::builder(MessageType::Call, MessageAddress::new(7, 1, 2, 3))
    }

    #[test]
    fn sub_buffers_are_counted_in_total_size() {
        let mut builder = call().payload(b"head");
        let offset = builder.push_sub_buffer(Bytes::from_static(b"0123456789")).expect("push");
        let message = builder.payload(b"tail").build();

        assert_eq!(offset, 4);
        assert_eq!(message.payload().len(), 4 + SUB_BUFFER_MARKER_SIZE + 4);
        assert_eq!(message.total_size(), 12 + 10);
        assert_eq!(message.header().expect("header").size, 22);
    }

    #[test]
    fn split_rejects_offsets_past_the_payload() {
        let message = call().payload(b"abc").build();
        let err = message.split_sub_buffers(&[2]).expect_err("marker out of range");
        assert_eq!(err.kind(), ErrorKind::MalformedHeader);
    }

    #[test]
    fn validity_requires_type_and_object() {
        assert!(call().build().is_valid());
        let orphan = Message::builder(MessageType::Call, MessageAddress::new(1, 1, 0, 1)).build();
        assert!(!orphan.is_valid());
        let untyped = Message::builder(MessageType::None, MessageAddress::new(1, 1, 1, 1)).build();
        assert!(!untyped.is_valid());
    }

    #[test]
    fn reply_keeps_request_address() {
        let request = call().build();
        let reply = Message::reply_to(&request).build();
        assert_eq!(reply.kind(), MessageType::Reply);
        assert_eq!(reply.address(), request.address());
    }

    #[test]
    fn message_ids_increase() {
        let first = next_message_id();
        assert!(next_message_id() > first);
    }

    #[test]
    fn type_codes_are_stable() {
        for code in 0..=8u8 {
            let kind = MessageType::from_u8(code).expect("known code");
            assert_eq!(kind.as_u8(), code);
        }
        assert_eq!(MessageType::from_u8(9), None);
    }
}
