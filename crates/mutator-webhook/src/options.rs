//! Contains available options to configure the [WebhookServer][crate::WebhookServer].
use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use mutator_certs::TrustBundlePaths;

use crate::constants::DEFAULT_SOCKET_ADDRESS;

/// Specifies available webhook server options.
///
/// The [`Default`] implementation for this struct contains the following values:
///
/// - The socket binds to 0.0.0.0 on port 8443 (HTTPS)
/// - The serving certificate and key are read from `tls.crt` and `tls.key`
///   in the current working directory.
///
/// ### Example with Custom HTTPS IP Address and Port
///
/// ```
/// use mutator_webhook::WebhookServerOptions;
///
/// // Set IP address and port at the same time
/// let options = WebhookServerOptions::builder()
///     .bind_address([0, 0, 0, 0], 12345)
///     .build();
///
/// // Set port only and read the TLS material from a directory
/// let options = WebhookServerOptions::builder()
///     .bind_port(12345)
///     .tls_directory("/etc/webhook/certs")
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct WebhookServerOptions {
    /// The HTTPS socket address the [`TcpListener`][tokio::net::TcpListener]
    /// binds to.
    pub socket_addr: SocketAddr,

    /// Path to the PEM-encoded serving certificate.
    pub certificate_path: PathBuf,

    /// Path to the PEM-encoded private key of the serving certificate.
    pub private_key_path: PathBuf,
}

impl Default for WebhookServerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl WebhookServerOptions {
    /// Returns the default [`WebhookServerOptionsBuilder`] which allows to
    /// selectively customize the options. See the documentation for
    /// [`WebhookServerOptions`] for more information on available functions.
    pub fn builder() -> WebhookServerOptionsBuilder {
        WebhookServerOptionsBuilder::default()
    }
}

/// The [`WebhookServerOptionsBuilder`] which allows to selectively customize
/// the webhook server [`WebhookServerOptions`].
#[derive(Debug, Default)]
pub struct WebhookServerOptionsBuilder {
    socket_addr: Option<SocketAddr>,
    tls_paths: Option<TrustBundlePaths>,
}

impl WebhookServerOptionsBuilder {
    /// Sets the socket address the webhook server uses to bind for HTTPS.
    pub fn bind_address(mut self, bind_ip: impl Into<IpAddr>, bind_port: u16) -> Self {
        self.socket_addr = Some(SocketAddr::new(bind_ip.into(), bind_port));
        self
    }

    /// Sets the IP address of the socket address the webhook server uses to
    /// bind for HTTPS.
    pub fn bind_ip(mut self, bind_ip: impl Into<IpAddr>) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_ip(bind_ip.into());
        self
    }

    /// Sets the port of the socket address the webhook server uses to bind
    /// for HTTPS.
    pub fn bind_port(mut self, bind_port: u16) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_port(bind_port);
        self
    }

    /// Reads the serving certificate and key from the files a
    /// [`TrustBundle`](mutator_certs::TrustBundle) writes into `directory`.
    pub fn tls_directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.tls_paths = Some(TrustBundlePaths::in_directory(directory));
        self
    }

    /// Builds the final [`WebhookServerOptions`] by using default values for
    /// any not explicitly set option.
    pub fn build(self) -> WebhookServerOptions {
        let tls_paths = self
            .tls_paths
            .unwrap_or_else(|| TrustBundlePaths::in_directory(""));

        WebhookServerOptions {
            socket_addr: self.socket_addr.unwrap_or(DEFAULT_SOCKET_ADDRESS),
            certificate_path: tls_paths.server_certificate,
            private_key_path: tls_paths.server_private_key,
        }
    }
}
