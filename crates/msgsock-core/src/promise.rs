use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::error::SocketError;

/// 可被多方等待的完成信号。
pub type Completion<T> = Shared<BoxFuture<'static, Result<T, SocketError>>>;

/// 构造一个已经完成的 [`Completion`]。
pub fn completed<T>(result: Result<T, SocketError>) -> Completion<T>
where
    T: Clone + Send + Sync + 'static,
{
    futures::future::ready(result).boxed().shared()
}

/// 只能兑现一次的承诺。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 断开请求可能在连接尚未完成时到达，必须把“断开完成”这份义务交给最终执行拆除的状态；
/// - 宿主在连接中途析构时，等待方仍需恰好收到一次结果，而不是永远挂起。
///
/// ## 契约（What）
/// - `set` 仅首次生效，返回是否由本次调用兑现；
/// - 全部句柄释放而未兑现时，等待方收到 [`ErrorKind::OperationAborted`](crate::ErrorKind::OperationAborted)；
/// - `future` 可多次调用，所有返回值观察到同一结果。
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

struct PromiseInner<T> {
    sender: Mutex<Option<oneshot::Sender<Result<T, SocketError>>>>,
    future: Completion<T>,
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let future = async move {
            match receiver.await {
                Ok(result) => result,
                Err(oneshot::Canceled) => Err(SocketError::aborted("promise dropped")),
            }
        }
        .boxed()
        .shared();
        Self {
            inner: Arc::new(PromiseInner {
                sender: Mutex::new(Some(sender)),
                future,
            }),
        }
    }

    /// 兑现承诺，重复调用无效。
    pub fn set(&self, result: Result<T, SocketError>) -> bool {
        match self.inner.sender.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    pub fn set_value(&self, value: T) -> bool {
        self.set(Ok(value))
    }

    pub fn set_error(&self, error: SocketError) -> bool {
        self.set(Err(error))
    }

    pub fn is_pending(&self) -> bool {
        self.inner.sender.lock().is_some()
    }

    pub fn future(&self) -> Completion<T> {
        self.inner.future.clone()
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("pending", &self.inner.sender.lock().is_some())
            .finish()
    }
}
