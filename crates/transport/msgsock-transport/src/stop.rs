use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use msgsock_core::{OperationKind, SocketError, aborted_error};
use tokio::sync::Notify;

/// 一次性的停止信号，供当前进行中的异步步骤作为取消触发器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 解析、建连、握手、接受连接这些长步骤共用同一个信号，取消逻辑集中在一处；
/// - 步骤按顺序执行，因此任一时刻只有一个步骤在等待该信号。
///
/// ## 契约（What）
/// - `trigger` 仅首次调用返回 `true`；
/// - `stopped` 在触发后（或已触发时）立即完成；
/// - `run` 让给定步骤与信号竞速：信号先到则丢弃步骤 Future（即取消解析或关闭正在建立的套接字），
///   返回 [`ErrorKind::OperationAborted`](msgsock_core::ErrorKind::OperationAborted)。
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发信号，返回是否为首次触发。
    pub fn trigger(&self) -> bool {
        let first = !self.inner.triggered.swap(true, Ordering::AcqRel);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// 等待信号被触发。
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// 在停止信号的约束下执行一个步骤。
    pub async fn run<F, T>(&self, kind: OperationKind, step: F) -> Result<T, SocketError>
    where
        F: Future<Output = Result<T, SocketError>>,
    {
        if self.is_triggered() {
            return Err(aborted_error(kind));
        }
        tokio::select! {
            biased;
            _ = self.stopped() => Err(aborted_error(kind)),
            result = step => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgsock_core::ErrorKind;
    use msgsock_core::error::RESOLVE;
    use std::time::Duration;

    #[test]
    fn only_the_first_trigger_counts() {
        let stop = StopSignal::new();
        assert!(stop.trigger());
        assert!(!stop.clone().trigger());
        assert!(stop.is_triggered());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_step_is_aborted_once_triggered() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.trigger();
        });
        let result = stop
            .run(RESOLVE, std::future::pending::<Result<(), SocketError>>())
            .await;
        assert_eq!(result.map_err(|err| err.kind()), Err(ErrorKind::OperationAborted));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn already_triggered_signal_skips_the_step() {
        let stop = StopSignal::new();
        stop.trigger();
        let result = stop.run(RESOLVE, async { Ok::<_, SocketError>(1) }).await;
        assert!(result.is_err());
        stop.stopped().await;
    }
}
