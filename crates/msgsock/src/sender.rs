use std::collections::VecDeque;
use std::sync::Arc;

use msgsock_core::error::WRITE;
use msgsock_core::{Message, SocketError, codec, map_io_error};
use msgsock_transport::StopSignal;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// 单条报文写完后的回调：返回 `true` 继续发送队首。
pub type SendCompletion = Arc<dyn Fn(&Message, Result<(), SocketError>) -> bool + Send + Sync>;

#[derive(Default)]
struct SendQueue {
    entries: VecDeque<Arc<Message>>,
    sending: bool,
}

struct SenderShared<W> {
    socket: u64,
    queue: Mutex<SendQueue>,
    writer: tokio::sync::Mutex<W>,
    stop: StopSignal,
    on_complete: SendCompletion,
}

/// FIFO 发送队列与单飞写循环。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 发送方可以在任意任务中调用 [`Sender::send`]，而线上字节必须严格按入队顺序出现；
/// - 同一时刻最多一个写循环在运行，写半部因此无需额外的并发控制。
///
/// ## 契约（What）
/// - 空闲时入队立即启动写循环；忙碌时入队只追加；
/// - 每条报文写完后先调用完成回调，再出队；出队与“发送中”标记复位由守卫保证，
///   即使回调 panic 也不会泄漏在途槽位；
/// - 回调返回 `false` 或队列已空时写循环进入空闲，等待下一次入队；
/// - 停止信号触发后，写入以 [`ErrorKind::OperationAborted`](msgsock_core::ErrorKind::OperationAborted)
///   结束，后续 `send` 返回 `false`。
///
/// ## 风险与考量（Trade-offs）
/// - 队列条目以 `Arc<Message>` 持有，写循环读取队首时只克隆指针，不会因其他线程入队而失效。
pub struct Sender<W> {
    shared: Arc<SenderShared<W>>,
}

impl<W> Clone for Sender<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W> Sender<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: u64, writer: W, stop: StopSignal, on_complete: SendCompletion) -> Self {
        Self {
            shared: Arc::new(SenderShared {
                socket,
                queue: Mutex::new(SendQueue::default()),
                writer: tokio::sync::Mutex::new(writer),
                stop,
                on_complete,
            }),
        }
    }

    /// 入队一条报文；发送方已停止时返回 `false`。
    pub fn send(&self, message: Arc<Message>) -> bool {
        let start = {
            let mut queue = self.shared.queue.lock();
            if self.shared.stop.is_triggered() {
                return false;
            }
            queue.entries.push_back(message);
            !std::mem::replace(&mut queue.sending, true)
        };
        if start {
            tokio::spawn(drain(Arc::clone(&self.shared)));
        }
        true
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    pub fn is_sending(&self) -> bool {
        self.shared.queue.lock().sending
    }

    /// 等待当前在途的写入结束并关闭写半部。
    pub async fn close(&self) {
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// 在途条目：出队与标记复位必定执行。
struct InFlight<'a> {
    queue: &'a Mutex<SendQueue>,
    armed: bool,
}

impl InFlight<'_> {
    /// 出队并返回是否继续写下一条。
    fn release(mut self, keep_going: bool) -> bool {
        self.armed = false;
        let mut queue = self.queue.lock();
        queue.entries.pop_front();
        let more = keep_going && !queue.entries.is_empty();
        if !more {
            queue.sending = false;
        }
        more
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut queue = self.queue.lock();
            queue.entries.pop_front();
            queue.sending = false;
        }
    }
}

async fn drain<W>(shared: Arc<SenderShared<W>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let head = shared.queue.lock().entries.front().cloned();
        let Some(message) = head else {
            shared.queue.lock().sending = false;
            return;
        };
        let slot = InFlight {
            queue: &shared.queue,
            armed: true,
        };
        let result = shared.stop.run(WRITE, write_message(&shared, &message)).await;
        trace!(socket = shared.socket, id = message.id(), ok = result.is_ok(), "message written");
        let keep_going = (shared.on_complete)(&message, result);
        if !slot.release(keep_going) {
            return;
        }
    }
}

async fn write_message<W>(shared: &SenderShared<W>, message: &Message) -> Result<(), SocketError>
where
    W: AsyncWrite + Unpin,
{
    let buffers = codec::encode(message)?;
    let mut writer = shared.writer.lock().await;
    for buffer in &buffers {
        writer
            .write_all(buffer)
            .await
            .map_err(|err| map_io_error(WRITE, err))?;
    }
    writer.flush().await.map_err(|err| map_io_error(WRITE, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgsock_core::{MessageAddress, MessageType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    fn completion(
        f: impl Fn(&Message, Result<(), SocketError>) -> bool + Send + Sync + 'static,
    ) -> SendCompletion {
        Arc::new(f)
    }

    fn message(id: u32) -> Arc<Message> {
        Arc::new(
            Message::builder(MessageType::Call, MessageAddress::new(id, 1, 2, 3))
                .payload(id.to_le_bytes())
                .build(),
        )
    }

    async fn read_ids(reader: &mut tokio::io::DuplexStream, count: usize) -> Vec<u32> {
        let mut ids = Vec::new();
        for _ in 0..count {
            let mut frame = [0u8; msgsock_core::message::HEADER_SIZE + 4];
            reader.read_exact(&mut frame).await.expect("frame");
            ids.push(codec::decode_frame(&frame, 64).expect("decode").id());
        }
        ids
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bytes_leave_in_enqueue_order() {
        let (writer, mut reader) = tokio::io::duplex(1 << 16);
        let sender = Sender::new(
            1,
            writer,
            StopSignal::new(),
            completion(|_, result| result.is_ok()),
        );
        for id in 1..=32 {
            assert!(sender.send(message(id)));
        }
        let ids = read_ids(&mut reader, 32).await;
        assert_eq!(ids, (1..=32).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_callback_still_releases_the_slot() {
        let (writer, mut reader) = tokio::io::duplex(1 << 16);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let sender = Sender::new(
            2,
            writer,
            StopSignal::new(),
            completion(move |message, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                if message.id() == 1 {
                    panic!("completion callback failure");
                }
                true
            }),
        );
        assert!(sender.send(message(1)));
        read_ids(&mut reader, 1).await;
        while sender.is_sending() {
            tokio::task::yield_now().await;
        }
        assert_eq!(sender.pending(), 0);

        assert!(sender.send(message(2)));
        assert_eq!(read_ids(&mut reader, 1).await, vec![2]);
        while sender.is_sending() {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stopped_sender_refuses_new_messages() {
        let (writer, _reader) = tokio::io::duplex(64);
        let stop = StopSignal::new();
        let sender = Sender::new(3, writer, stop.clone(), completion(|_, _| true));
        stop.trigger();
        assert!(!sender.send(message(1)));
        assert_eq!(sender.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn false_from_callback_parks_the_loop() {
        let (writer, mut reader) = tokio::io::duplex(1 << 16);
        let sender = Sender::new(4, writer, StopSignal::new(), completion(|_, _| false));
        assert!(sender.send(message(1)));
        assert!(sender.send(message(2)));
        read_ids(&mut reader, 1).await;
        while sender.is_sending() {
            tokio::task::yield_now().await;
        }
        assert_eq!(sender.pending(), 1);
        // 下一次入队重新启动写循环，从仍在队首的报文继续。
        assert!(sender.send(message(3)));
        assert_eq!(read_ids(&mut reader, 1).await, vec![2]);
    }
}
