use bytes::BytesMut;
use msgsock_core::codec::{check_payload_size, decode_header};
use msgsock_core::error::READ;
use msgsock_core::message::HEADER_SIZE;
use msgsock_core::{Message, SocketError, map_io_error};
use msgsock_transport::StopSignal;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 从字节流读取一条完整报文。
///
/// 先读定长报文头并校验魔数、类型与负载上限，再恰好读取声明长度的负载；
/// 声明长度为零时不再发起读取。
pub async fn read_message<R>(reader: &mut R, max_payload: usize) -> Result<Message, SocketError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut raw)
        .await
        .map_err(|err| map_io_error(READ, err))?;
    let header = decode_header(&raw)?;
    check_payload_size(&header, max_payload)?;
    let mut payload = BytesMut::zeroed(header.size as usize);
    if !payload.is_empty() {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|err| map_io_error(READ, err))?;
    }
    Ok(Message::from_wire(header, payload.freeze()))
}

/// 连续接收循环。
///
/// 每次只有一个读取在途；处理器返回 `true` 时继续下一条。读取失败（含被停止）
/// 会交给处理器一次，然后循环结束。交给处理器的报文只在本次调用内有效。
pub async fn receive_loop<R, F>(mut reader: R, max_payload: usize, stop: StopSignal, mut handler: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(Result<&Message, SocketError>) -> bool,
{
    loop {
        match stop.run(READ, read_message(&mut reader, max_payload)).await {
            Ok(message) => {
                if !handler(Ok(&message)) {
                    return;
                }
            }
            Err(err) => {
                handler(Err(err));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgsock_core::codec::{concat, encode};
    use msgsock_core::{ErrorKind, MessageAddress, MessageType};
    use tokio::io::AsyncWriteExt;

    fn frame(message: &Message) -> bytes::Bytes {
        concat(&encode(message).expect("encode"))
    }

    fn call(payload: &[u8]) -> Message {
        Message::builder(MessageType::Call, MessageAddress::new(1, 1, 2, 3))
            .payload(payload)
            .build()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_sequential_messages_until_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(&frame(&call(b"abc"))).await.expect("write");
        writer.write_all(&frame(&call(b""))).await.expect("write");
        drop(writer);

        let mut seen = Vec::new();
        let mut closed = None;
        receive_loop(reader, 1024, StopSignal::new(), |next| match next {
            Ok(message) => {
                seen.push(message.payload().clone());
                true
            }
            Err(err) => {
                closed = Some(err.kind());
                false
            }
        })
        .await;
        assert_eq!(seen, vec![bytes::Bytes::from_static(b"abc"), bytes::Bytes::new()]);
        assert_eq!(closed, Some(ErrorKind::ConnectionClosed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_payload_is_rejected_before_reading_it() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        writer.write_all(&frame(&call(&[7u8; 64]))).await.expect("write");
        let err = read_message(&mut reader, 16).await.expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::MessageTooLarge);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_magic_is_a_malformed_header() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        writer.write_all(&[0u8; HEADER_SIZE]).await.expect("write");
        let err = read_message(&mut reader, 16).await.expect_err("bad magic");
        assert_eq!(err.kind(), ErrorKind::MalformedHeader);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_interrupts_a_pending_read() {
        let (_writer, reader) = tokio::io::duplex(1024);
        let stop = StopSignal::new();
        stop.trigger();
        let mut aborted = false;
        receive_loop(reader, 16, stop, |next| {
            aborted = next.is_err_and(|err| err.is_aborted());
            false
        })
        .await;
        assert!(aborted);
    }
}
