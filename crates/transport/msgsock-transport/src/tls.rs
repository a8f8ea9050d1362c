use std::fmt;
use std::io;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use msgsock_core::error::HANDSHAKE;
use msgsock_core::{ErrorKind, HandshakeSide, SocketError, TcpScheme};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    AlertDescription, ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore,
    ServerConfig, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

const CONFIG_CODE: &str = "msgsock.transport.tls_config_failed";

/// 对端证书的校验强度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    /// 不校验对端证书。
    None,
    /// 要求并校验对端证书。
    Peer,
}

/// 根据握手角色与 URL 方案决定校验强度。
///
/// `tcp` 与 `tcps` 两侧都不校验对端；只有双向认证的 `tcpsm` 要求对端出示并通过校验的证书。
pub fn verify_mode(side: HandshakeSide, scheme: TcpScheme) -> VerifyMode {
    match (side, scheme) {
        (_, TcpScheme::Tcpsm) => VerifyMode::Peer,
        (HandshakeSide::Client | HandshakeSide::Server, TcpScheme::Tcp | TcpScheme::Tcps) => {
            VerifyMode::None
        }
    }
}

/// 证书链与私钥。
pub struct TlsIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    fn clone_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain_len", &self.chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// 连接共享的 TLS 上下文。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一监听器接入的所有连接、同一客户端发起的所有连接共用一份身份与信任库；
/// - 证书轮换不应打断已建立的连接，因此身份放在 [`ArcSwapOption`] 中原子替换，
///   之后构造的配置自动使用新证书。
///
/// ## 契约（What）
/// - `client_config(scheme)`：`tcp`/`tcps` 跳过服务端校验；`tcpsm` 以信任库校验服务端，
///   并在持有身份时出示客户端证书；
/// - `server_config(scheme)`：必须持有身份；`tcpsm` 额外要求并校验客户端证书；
/// - 显式使用 `ring` 提供者，避免依赖进程级默认提供者的安装顺序。
///
/// ## 风险与权衡（Trade-offs）
/// - 每次握手都重新构造 rustls 配置，换取身份替换即时生效；握手频率远低于消息频率，开销可接受。
pub struct TlsContext {
    identity: ArcSwapOption<TlsIdentity>,
    trust: ArcSwap<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("identity", &self.identity.load().is_some())
            .field("trusted", &self.trust.load().len())
            .finish()
    }
}

impl TlsContext {
    pub fn new() -> Self {
        Self {
            identity: ArcSwapOption::empty(),
            trust: ArcSwap::from_pointee(RootCertStore::empty()),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub fn with_identity(self, identity: TlsIdentity) -> Self {
        self.identity.store(Some(Arc::new(identity)));
        self
    }

    /// 追加信任锚；任一证书无法解析即整体失败。
    pub fn with_trusted_certificates(
        self,
        certificates: impl IntoIterator<Item = CertificateDer<'static>>,
    ) -> Result<Self, SocketError> {
        let mut store = RootCertStore::clone(&self.trust.load());
        for certificate in certificates {
            store.add(certificate).map_err(config_error)?;
        }
        self.trust.store(Arc::new(store));
        Ok(self)
    }

    /// 原子替换身份，只影响之后的握手。
    pub fn replace_identity(&self, identity: TlsIdentity) {
        self.identity.store(Some(Arc::new(identity)));
    }

    pub fn has_identity(&self) -> bool {
        self.identity.load().is_some()
    }

    pub fn client_config(&self, scheme: TcpScheme) -> Result<Arc<ClientConfig>, SocketError> {
        let builder = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(config_error)?;
        let config = match verify_mode(HandshakeSide::Client, scheme) {
            VerifyMode::None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoServerVerification {
                    provider: Arc::clone(&self.provider),
                }))
                .with_no_client_auth(),
            VerifyMode::Peer => {
                let builder = builder.with_root_certificates(self.trust.load_full());
                match self.identity.load_full() {
                    Some(identity) => builder
                        .with_client_auth_cert(identity.chain.clone(), identity.clone_key())
                        .map_err(config_error)?,
                    None => builder.with_no_client_auth(),
                }
            }
        };
        Ok(Arc::new(config))
    }

    pub fn server_config(&self, scheme: TcpScheme) -> Result<Arc<ServerConfig>, SocketError> {
        let identity = self.identity.load_full().ok_or_else(|| {
            SocketError::new(
                ErrorKind::Tls,
                CONFIG_CODE,
                "tls server requires a certificate identity",
            )
        })?;
        let builder = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(config_error)?;
        let builder = match verify_mode(HandshakeSide::Server, scheme) {
            VerifyMode::None => builder.with_no_client_auth(),
            VerifyMode::Peer => {
                let verifier = WebPkiClientVerifier::builder_with_provider(
                    self.trust.load_full(),
                    Arc::clone(&self.provider),
                )
                .build()
                .map_err(|err| {
                    SocketError::new(
                        ErrorKind::Tls,
                        CONFIG_CODE,
                        format!("client verifier: {err}"),
                    )
                })?;
                builder.with_client_cert_verifier(verifier)
            }
        };
        let config = builder
            .with_single_cert(identity.chain.clone(), identity.clone_key())
            .map_err(config_error)?;
        Ok(Arc::new(config))
    }
}

/// 把 URL 主机转换为 SNI 名称；IP 字面量按地址处理。
pub fn server_name(host: &str) -> Result<ServerName<'static>, SocketError> {
    ServerName::try_from(host.to_owned())
        .map_err(|err| SocketError::bad_address(format!("`{host}` is not a tls server name: {err}")))
}

fn config_error(error: RustlsError) -> SocketError {
    SocketError::new(ErrorKind::Tls, CONFIG_CODE, format!("tls config: {error}"))
}

/// 跳过服务端证书链校验，但仍验证握手签名。
#[derive(Debug)]
struct NoServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// 将握手阶段的 `io::Error` 映射为 [`ErrorKind::Tls`]。
///
/// 所有握手失败对外都是同一种错误；文案中附带细分类别（证书、完整性、告警、IO），
/// 便于排障而不扩大错误种类的集合。
pub fn map_handshake_error(error: io::Error) -> SocketError {
    let category = error
        .get_ref()
        .and_then(|source| source.downcast_ref::<RustlsError>())
        .map(categorize_rustls_error)
        .unwrap_or("io");
    SocketError::new(
        ErrorKind::Tls,
        HANDSHAKE.code,
        format!("{} ({category}): {error}", HANDSHAKE.message),
    )
    .with_io(&error)
}

fn categorize_rustls_error(error: &RustlsError) -> &'static str {
    use RustlsError::*;
    match error {
        NoCertificatesPresented | InvalidCertificate(_) | UnsupportedNameType => "certificate",
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | PeerSentOversizedRecord => "integrity",
        PeerIncompatible(_) => "incompatible",
        AlertReceived(alert) => alert_category(alert),
        _ => "protocol",
    }
}

fn alert_category(alert: &AlertDescription) -> &'static str {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateRequired => "certificate alert",
        _ => "alert",
    }
}
