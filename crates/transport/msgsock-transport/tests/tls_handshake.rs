use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use msgsock_core::{ErrorKind, Ipv6Enabled, ReuseAddressEnabled, SocketError, TcpScheme, Url};
use msgsock_transport::{
    AcceptLoop, ConnectedSocket, Connector, FatalAcceptErrors, SocketTuning, StopSignal,
    TlsContext, TlsIdentity, TokioNetwork, TokioSocket,
};
use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct Authority {
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    fn new() -> Result<Self> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    fn issue(&self, name: &str) -> Result<TlsIdentity> {
        let key = KeyPair::generate()?;
        let cert = CertificateParams::new(vec![name.to_owned()])?.signed_by(
            &key,
            &self.cert,
            &self.key,
        )?;
        Ok(TlsIdentity::new(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        ))
    }
}

fn connector(tls: TlsContext) -> Connector<TokioNetwork> {
    Connector::new(
        Arc::new(TokioNetwork),
        Arc::new(tls),
        SocketTuning::default(),
    )
}

type Pair = (
    Result<ConnectedSocket<TokioSocket>, SocketError>,
    Result<ConnectedSocket<TokioSocket>, SocketError>,
);

async fn handshake(scheme: TcpScheme, client: TlsContext, server: TlsContext) -> Result<Pair> {
    let network = TokioNetwork;
    let acceptor = AcceptLoop::bind(
        &network,
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        ReuseAddressEnabled::enabled(),
        FatalAcceptErrors::default(),
    )
    .context("bind loopback listener")?;
    let url = Url::new(scheme, "127.0.0.1", acceptor.local_addr().port());

    let server_side = connector(server);
    let server_task = async {
        let mut accepted = None;
        acceptor
            .run(
                |socket| {
                    accepted = Some(socket);
                    false
                },
                &StopSignal::new(),
            )
            .await;
        match accepted {
            Some(Ok(socket)) => {
                server_side
                    .handshake_accepted(socket, scheme, &StopSignal::new())
                    .await
            }
            Some(Err(err)) => Err(err),
            None => Err(SocketError::aborted("accept loop ended without a socket")),
        }
    };
    let client_side = connector(client);
    let client_stop = StopSignal::new();
    let client_task = client_side.connect(&url, Ipv6Enabled::disabled(), &client_stop);
    let (client, server) = tokio::join!(client_task, server_task);
    Ok((client, server))
}

#[tokio::test(flavor = "multi_thread")]
async fn single_sided_tls_skips_client_verification() -> Result<()> {
    let authority = Authority::new()?;
    let server = TlsContext::new().with_identity(authority.issue("127.0.0.1")?);
    let (client, server) = handshake(TcpScheme::Tcps, TlsContext::new(), server).await?;
    let client = client.context("client handshake")?;
    let server = server.context("server handshake")?;
    assert!(client.is_tls() && server.is_tls());

    let (_, mut writer, _) = client.into_split();
    let (mut reader, _, _) = server.into_split();
    writer.write_all(b"sealed").await?;
    writer.flush().await?;
    let mut buf = [0u8; 6];
    reader.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"sealed");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mutual_tls_verifies_both_peers() -> Result<()> {
    let authority = Authority::new()?;
    let server = TlsContext::new()
        .with_identity(authority.issue("127.0.0.1")?)
        .with_trusted_certificates([authority.der()])?;
    let client = TlsContext::new()
        .with_identity(authority.issue("client.local")?)
        .with_trusted_certificates([authority.der()])?;
    let (client, server) = handshake(TcpScheme::Tcpsm, client, server).await?;
    assert!(client.context("client handshake")?.is_tls());
    assert!(server.context("server handshake")?.is_tls());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mutual_tls_rejects_a_client_without_certificate() -> Result<()> {
    let authority = Authority::new()?;
    let server = TlsContext::new()
        .with_identity(authority.issue("127.0.0.1")?)
        .with_trusted_certificates([authority.der()])?;
    let client = TlsContext::new().with_trusted_certificates([authority.der()])?;
    let (_, server) = handshake(TcpScheme::Tcpsm, client, server).await?;
    let err = server.expect_err("server must demand a client certificate");
    assert_eq!(err.kind(), ErrorKind::Tls);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mutual_tls_rejects_an_untrusted_server() -> Result<()> {
    let trusted = Authority::new()?;
    let rogue = Authority::new()?;
    let server = TlsContext::new()
        .with_identity(rogue.issue("127.0.0.1")?)
        .with_trusted_certificates([trusted.der()])?;
    let client = TlsContext::new()
        .with_identity(trusted.issue("client.local")?)
        .with_trusted_certificates([trusted.der()])?;
    let (client, _) = handshake(TcpScheme::Tcpsm, client, server).await?;
    let err = client.expect_err("client must reject the rogue server");
    assert_eq!(err.kind(), ErrorKind::Tls);
    Ok(())
}
