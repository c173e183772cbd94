//! This module contains structs and functions to easily create a TLS termination
//! server, which can be used in combination with an Axum [`Router`].
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{Router, extract::Request};
use futures_util::pin_mut;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::net::TcpListener;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring::default_provider,
        pki_types::{CertificateDer, PrivateKeyDer},
        version::{TLS12, TLS13},
    },
};
use tower::{Service, ServiceExt};
use tracing::{Instrument, instrument};

pub type Result<T, E = TlsServerError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TlsServerError {
    #[snafu(display("failed to read {path:?}"))]
    ReadPemFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse PEM-encoded certificates in {path:?}"))]
    ParseCertificates {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("no certificate found in {path:?}"))]
    NoCertificate { path: PathBuf },

    #[snafu(display("failed to parse PEM-encoded private key in {path:?}"))]
    ParsePrivateKey {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("no private key found in {path:?}"))]
    NoPrivateKey { path: PathBuf },

    #[snafu(display("failed to construct TLS server config, bad certificate/key"))]
    InvalidTlsPrivateKey { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to create TCP listener by binding to socket address {socket_addr:?}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },
}

/// A server which terminates TLS connections and allows clients to communicate
/// via HTTPS with the underlying HTTP router.
pub struct TlsServer {
    config: Arc<ServerConfig>,
    socket_addr: SocketAddr,
    router: Router,
}

impl TlsServer {
    /// Creates a TLS server which serves `router` on `socket_addr`, using the
    /// PEM-encoded certificate chain and private key found at the given paths.
    #[instrument(name = "create_tls_server", skip(router))]
    pub async fn new(
        socket_addr: SocketAddr,
        router: Router,
        certificate_path: &Path,
        private_key_path: &Path,
    ) -> Result<Self> {
        let config = server_config_from_pem_files(certificate_path, private_key_path).await?;

        Ok(Self {
            config: Arc::new(config),
            socket_addr,
            router,
        })
    }

    /// Runs the TLS server by listening for incoming TCP connections on the
    /// bound socket address. It only accepts TLS connections. Internally each
    /// TLS stream get handled by a Hyper service, which in turn is an Axum
    /// router.
    pub async fn run(self) -> Result<()> {
        let tls_acceptor = TlsAcceptor::from(self.config);
        let tcp_listener =
            TcpListener::bind(self.socket_addr)
                .await
                .context(BindTcpListenerSnafu {
                    socket_addr: self.socket_addr,
                })?;

        tracing::info!(socket_addr = %self.socket_addr, "webhook server listening");

        // The connect info service hands each accepted connection its peer
        // address, see https://github.com/tokio-rs/axum/discussions/2397
        let mut router = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        pin_mut!(tcp_listener);
        loop {
            let tls_acceptor = tls_acceptor.clone();

            // Wait for new tcp connection
            let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
                Ok((stream, addr)) => (stream, addr),
                Err(err) => {
                    tracing::trace!(%err, "failed to accept incoming TCP connection");
                    continue;
                }
            };

            let tower_service = match router.call(remote_addr).await {
                Ok(tower_service) => tower_service,
                Err(infallible) => match infallible {},
            };

            let span = tracing::debug_span!(
                "accept tcp connection",
                client.address = %remote_addr.ip(),
                client.port = remote_addr.port(),
            );
            tokio::spawn(
                async move {
                    // Wait for tls handshake to happen
                    let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            tracing::trace!(%err, %remote_addr, "error during tls handshake connection");
                            return;
                        }
                    };

                    // Hyper has its own `AsyncRead` and `AsyncWrite` traits and doesn't use tokio.
                    // `TokioIo` converts between them.
                    let tls_stream = TokioIo::new(tls_stream);

                    // Hyper also has its own `Service` trait and doesn't use tower. We can use
                    // `hyper::service::service_fn` to create a hyper `Service` that calls our app through
                    // `tower::Service::call`.
                    let hyper_service = service_fn(move |request: Request<Incoming>| {
                        // We need to clone here, because oneshot consumes self
                        tower_service.clone().oneshot(request)
                    });

                    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(tls_stream, hyper_service)
                        .instrument(tracing::debug_span!("serve connection"))
                        .await
                        .unwrap_or_else(|err| {
                            tracing::warn!(%err, %remote_addr, "failed to serve connection");
                        });
                }
                .instrument(span),
            );
        }
    }
}

/// Builds a rustls [`ServerConfig`] (TLS 1.2 and 1.3, ALPN `h2` and
/// `http/1.1`) from PEM files on disk.
pub async fn server_config_from_pem_files(
    certificate_path: &Path,
    private_key_path: &Path,
) -> Result<ServerConfig> {
    let certificate_chain = read_certificate_chain(certificate_path).await?;
    let private_key = read_private_key(private_key_path).await?;

    let tls_provider = default_provider();
    let mut config = ServerConfig::builder_with_provider(tls_provider.into())
        .with_protocol_versions(&[&TLS12, &TLS13])
        .context(SetSafeTlsProtocolVersionsSnafu)?
        .with_no_client_auth()
        .with_single_cert(certificate_chain, private_key)
        .context(InvalidTlsPrivateKeySnafu)?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

async fn read_certificate_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = tokio::fs::read(path)
        .await
        .context(ReadPemFileSnafu { path })?;

    let certificates = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context(ParseCertificatesSnafu { path })?;

    if certificates.is_empty() {
        return NoCertificateSnafu { path }.fail();
    }

    Ok(certificates)
}

async fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = tokio::fs::read(path)
        .await
        .context(ReadPemFileSnafu { path })?;

    rustls_pemfile::private_key(&mut pem.as_slice())
        .context(ParsePrivateKeySnafu { path })?
        .context(NoPrivateKeySnafu { path })
}
