//! 报文与线上缓冲区序列之间的编解码。
//!
//! 报文头固定 28 字节、小端序：
//!
//! | 字段 | 类型 |
//! |------|------|
//! | magic | `u32` |
//! | id | `u32` |
//! | size | `u32` |
//! | version | `u16` |
//! | type | `u8` |
//! | flags | `u8` |
//! | service | `u32` |
//! | object | `u32` |
//! | function | `u32` |
//!
//! 编码输出为有序的 [`Bytes`] 列表：报文头；对每个子缓冲区，先是截至其长度标记（含）的
//! 内联片段，再是子缓冲区本身；最后是剩余的内联片段。子缓冲区与内联片段均为引用切片。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, SocketError};
use crate::message::{
    HEADER_SIZE, Header, MAGIC_COOKIE, Message, MessageFlags, MessageType, SUB_BUFFER_MARKER_SIZE,
};

/// 默认的单条报文负载上限（字节）。
pub const DEFAULT_MAX_PAYLOAD: usize = 50_000_000;

/// 把报文编码为线上缓冲区序列。
pub fn encode(message: &Message) -> Result<Vec<Bytes>, SocketError> {
    let header = encode_header(&message.header()?);
    let payload = message.payload();
    let mut buffers = Vec::with_capacity(2 + message.sub_buffers().len() * 2);
    buffers.push(Bytes::copy_from_slice(&header));

    let mut cursor = 0usize;
    for sub in message.sub_buffers() {
        let end = sub.offset() + SUB_BUFFER_MARKER_SIZE;
        buffers.push(payload.slice(cursor..end));
        buffers.push(sub.data().clone());
        cursor = end;
    }
    if cursor < payload.len() {
        buffers.push(payload.slice(cursor..));
    }
    Ok(buffers)
}

/// 序列化报文头。
pub fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    let mut cursor = &mut out[..];
    cursor.put_u32_le(MAGIC_COOKIE);
    cursor.put_u32_le(header.id);
    cursor.put_u32_le(header.size);
    cursor.put_u16_le(header.version);
    cursor.put_u8(header.kind.as_u8());
    cursor.put_u8(header.flags.bits());
    cursor.put_u32_le(header.service);
    cursor.put_u32_le(header.object);
    cursor.put_u32_le(header.function);
    out
}

/// 解析报文头并校验魔数与类型。
pub fn decode_header(raw: &[u8; HEADER_SIZE]) -> Result<Header, SocketError> {
    let mut cursor = &raw[..];
    let magic = cursor.get_u32_le();
    if magic != MAGIC_COOKIE {
        return Err(SocketError::new(
            ErrorKind::MalformedHeader,
            "msgsock.codec.bad_magic",
            format!("bad magic cookie {magic:#010x}"),
        ));
    }
    let id = cursor.get_u32_le();
    let size = cursor.get_u32_le();
    let version = cursor.get_u16_le();
    let type_code = cursor.get_u8();
    let kind = MessageType::from_u8(type_code).ok_or_else(|| {
        SocketError::new(
            ErrorKind::MalformedHeader,
            "msgsock.codec.unknown_type",
            format!("unknown message type {type_code}"),
        )
    })?;
    let flags = MessageFlags::from_bits(cursor.get_u8());
    let service = cursor.get_u32_le();
    let object = cursor.get_u32_le();
    let function = cursor.get_u32_le();
    Ok(Header {
        id,
        size,
        version,
        kind,
        flags,
        service,
        object,
        function,
    })
}

/// 拒绝声明负载超过上限的报文头。
pub fn check_payload_size(header: &Header, max_payload: usize) -> Result<(), SocketError> {
    if header.size as usize > max_payload {
        return Err(SocketError::new(
            ErrorKind::MessageTooLarge,
            "msgsock.codec.payload_too_large",
            format!(
                "message {} declares {} payload bytes, limit is {}",
                header.id, header.size, max_payload
            ),
        ));
    }
    Ok(())
}

/// 从一段连续字节中解码一条完整报文，负载为扁平形式。
pub fn decode_frame(frame: &[u8], max_payload: usize) -> Result<Message, SocketError> {
    let Some((raw_header, rest)) = frame.split_first_chunk::<HEADER_SIZE>() else {
        return Err(truncated(frame.len(), HEADER_SIZE));
    };
    let header = decode_header(raw_header)?;
    check_payload_size(&header, max_payload)?;
    let size = header.size as usize;
    if rest.len() != size {
        return Err(truncated(rest.len(), size));
    }
    Ok(Message::from_wire(header, Bytes::copy_from_slice(rest)))
}

/// 把缓冲区序列拼接为一段连续字节，便于测试与日志。
pub fn concat(buffers: &[Bytes]) -> Bytes {
    let total = buffers.iter().map(Bytes::len).sum();
    let mut out = BytesMut::with_capacity(total);
    for buffer in buffers {
        out.extend_from_slice(buffer);
    }
    out.freeze()
}

fn truncated(actual: usize, expected: usize) -> SocketError {
    SocketError::new(
        ErrorKind::MalformedHeader,
        "msgsock.codec.truncated",
        format!("expected {expected} bytes, got {actual}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageAddress;

    fn sample() -> Message {
        let mut builder =
            Message::builder(MessageType::Call, MessageAddress::new(1, 1, 2, 3)).payload(b"ab");
        builder
            .push_sub_buffer(Bytes::from_static(b"XYZ"))
            .expect("push");
        builder.payload(b"cd").build()
    }

    #[test]
    fn layout_interleaves_inline_chunks_and_sub_buffers() {
        let buffers = encode(&sample()).expect("encode");
        assert_eq!(buffers.len(), 4);
        assert_eq!(buffers[0].len(), HEADER_SIZE);
        assert_eq!(&buffers[1][..], &[b'a', b'b', 3, 0, 0, 0]);
        assert_eq!(&buffers[2][..], b"XYZ");
        assert_eq!(&buffers[3][..], b"cd");
    }

    #[test]
    fn sub_buffer_is_referenced_not_copied() {
        let blob = Bytes::from(vec![7u8; 64]);
        let mut builder = Message::builder(MessageType::Post, MessageAddress::new(2, 1, 1, 1));
        builder.push_sub_buffer(blob.clone()).expect("push");
        let buffers = encode(&builder.build()).expect("encode");
        assert_eq!(buffers[2].as_ptr(), blob.as_ptr());
    }

    #[test]
    fn header_fields_survive_encoding() {
        let header = sample().header().expect("header");
        assert_eq!(decode_header(&encode_header(&header)), Ok(header));
    }

    #[test]
    fn bad_magic_is_a_protocol_fault() {
        let mut raw = encode_header(&sample().header().expect("header"));
        raw[0] ^= 0xff;
        let err = decode_header(&raw).expect_err("magic mismatch");
        assert_eq!(err.kind(), ErrorKind::MalformedHeader);
        assert_eq!(err.code(), "msgsock.codec.bad_magic");
    }

    #[test]
    fn oversized_declaration_is_rejected() {
        let frame = concat(&encode(&sample()).expect("encode"));
        let err = decode_frame(&frame, 4).expect_err("over limit");
        assert_eq!(err.kind(), ErrorKind::MessageTooLarge);
    }

    #[test]
    fn empty_payload_decodes() {
        let message = Message::builder(MessageType::Reply, MessageAddress::new(9, 1, 1, 1)).build();
        let frame = concat(&encode(&message).expect("encode"));
        assert_eq!(frame.len(), HEADER_SIZE);
        assert_eq!(decode_frame(&frame, DEFAULT_MAX_PAYLOAD), Ok(message));
    }
}
