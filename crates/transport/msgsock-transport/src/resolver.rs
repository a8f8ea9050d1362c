use std::net::SocketAddr;
use std::sync::Arc;

use msgsock_core::error::RESOLVE;
use msgsock_core::{ErrorKind, Ipv6Enabled, SocketError, Url};
use tracing::debug;

use crate::network::Network;
use crate::stop::StopSignal;

/// URL → 候选端点。
///
/// 解析在停止信号约束下进行：宿主被析构或请求断开时，挂起的解析被丢弃，
/// 调用方恰好收到一次 [`ErrorKind::OperationAborted`]。
#[derive(Debug)]
pub struct Resolver<N> {
    network: Arc<N>,
}

impl<N> Clone for Resolver<N> {
    fn clone(&self) -> Self {
        Self {
            network: Arc::clone(&self.network),
        }
    }
}

impl<N: Network> Resolver<N> {
    pub fn new(network: Arc<N>) -> Self {
        Self { network }
    }

    /// 解析客户端连接目标，端口必须非零。
    pub async fn resolve(
        &self,
        url: &Url,
        ipv6: Ipv6Enabled,
        stop: &StopSignal,
    ) -> Result<SocketAddr, SocketError> {
        if url.port() == 0 {
            return Err(SocketError::bad_address(format!("{url}: port 0 is not connectable")));
        }
        self.first_acceptable(url, ipv6, stop).await
    }

    /// 解析监听地址，允许端口 0 交给内核分配。
    pub async fn resolve_bind(
        &self,
        url: &Url,
        ipv6: Ipv6Enabled,
        stop: &StopSignal,
    ) -> Result<SocketAddr, SocketError> {
        self.first_acceptable(url, ipv6, stop).await
    }

    /// 返回按原始顺序过滤后的全部候选端点。
    pub async fn candidates(
        &self,
        url: &Url,
        ipv6: Ipv6Enabled,
        stop: &StopSignal,
    ) -> Result<Vec<SocketAddr>, SocketError> {
        if url.host().is_empty() {
            return Err(SocketError::bad_address(format!("{url}: empty host")));
        }
        let entries = stop
            .run(RESOLVE, self.network.resolve(url.host(), url.port()))
            .await?;
        Ok(entries
            .into_iter()
            .filter(|addr| acceptable(addr, ipv6))
            .collect())
    }

    async fn first_acceptable(
        &self,
        url: &Url,
        ipv6: Ipv6Enabled,
        stop: &StopSignal,
    ) -> Result<SocketAddr, SocketError> {
        let entry = self
            .candidates(url, ipv6, stop)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                SocketError::new(
                    ErrorKind::HostNotFound,
                    RESOLVE.code,
                    format!("{url}: no acceptable endpoint"),
                )
            })?;
        debug!(%url, endpoint = %entry, "resolved");
        Ok(entry)
    }
}

/// 关闭 IPv6 时跳过 IPv6 条目。
pub fn acceptable(addr: &SocketAddr, ipv6: Ipv6Enabled) -> bool {
    ipv6.is_enabled() || addr.is_ipv4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{HostScript, MockNetwork};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn url(text: &str) -> Url {
        Url::parse(text).expect("url")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skips_ipv6_entries_when_disabled() {
        let network = MockNetwork::new();
        network.script_host(
            "dual.example",
            HostScript::Resolve(vec![
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            ]),
        );
        let resolver = Resolver::new(Arc::new(network));
        let stop = StopSignal::new();

        let v4 = resolver
            .resolve(&url("tcp://dual.example:9"), Ipv6Enabled::disabled(), &stop)
            .await
            .expect("v4 entry");
        assert_eq!(v4.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));

        let v6 = resolver
            .resolve(&url("tcp://dual.example:9"), Ipv6Enabled::enabled(), &stop)
            .await
            .expect("v6 entry");
        assert!(v6.is_ipv6());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_ipv6_entries_means_host_not_found() {
        let network = MockNetwork::new();
        network.script_host(
            "v6.example",
            HostScript::Resolve(vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]),
        );
        let err = Resolver::new(Arc::new(network))
            .resolve(&url("tcp://v6.example:9"), Ipv6Enabled::disabled(), &StopSignal::new())
            .await
            .expect_err("nothing acceptable");
        assert_eq!(err.kind(), ErrorKind::HostNotFound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn port_zero_never_reaches_the_network() {
        let network = Arc::new(MockNetwork::new());
        let err = Resolver::new(network.clone())
            .resolve(&url("tcp://127.0.0.1:0"), Ipv6Enabled::disabled(), &StopSignal::new())
            .await
            .expect_err("port 0");
        assert_eq!(err.kind(), ErrorKind::BadAddress);
        assert_eq!(network.stats().resolves, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_aborts_a_hanging_lookup() {
        let network = MockNetwork::new();
        network.script_host("slow.example", HostScript::Hang);
        let resolver = Resolver::new(Arc::new(network));
        let stop = StopSignal::new();
        let trigger = stop.clone();
        let pending = tokio::spawn(async move {
            resolver
                .resolve(&url("tcp://slow.example:9"), Ipv6Enabled::disabled(), &stop)
                .await
        });
        tokio::task::yield_now().await;
        trigger.trigger();
        let err = pending.await.expect("join").expect_err("aborted");
        assert!(err.is_aborted());
    }
}
