//! HTTPS plumbing for a Kubernetes mutating admission webhook.
//!
//! The crate provides three independent pieces:
//!
//! - [`WebhookServer`], which serves a caller-provided Axum [`Router`] over
//!   TLS using a PEM-encoded certificate and key from disk,
//! - [`WebhookRegistration`], which describes the desired
//!   `MutatingWebhookConfiguration`, and
//! - [`Registrar`], which applies that description to the cluster once.
//!
//! ```
//! use mutator_webhook::{WebhookServer, WebhookServerOptions};
//! use axum::Router;
//!
//! # async fn test() {
//! let options = WebhookServerOptions::builder()
//!     .tls_directory("/etc/webhook/certs")
//!     .build();
//! let server = WebhookServer::new(Router::new(), options).await;
//! # }
//! ```
use axum::Router;
use futures_util::{FutureExt as _, pin_mut, select};
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::tls::TlsServer;

pub mod constants;
pub mod options;
pub mod registrar;
pub mod registration;
pub mod tls;

// Selected re-exports
pub use crate::{
    options::WebhookServerOptions,
    registrar::{ApplyOutcome, Registrar, RegistrarError, StoreError, WebhookConfigurationStore},
    registration::WebhookRegistration,
};

/// A result type alias with the [`WebhookError`] type as the default error type.
pub type Result<T, E = WebhookError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WebhookError {
    #[snafu(display("failed to create TLS server"))]
    CreateTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to run TLS server"))]
    RunTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to register {signal} signal handler"))]
    RegisterSignalHandler {
        source: std::io::Error,
        signal: &'static str,
    },
}

/// A ready-to-use webhook server.
///
/// The routes and their handlers are supplied by the caller, the server takes
/// care of TLS termination and request tracing.
pub struct WebhookServer {
    tls_server: TlsServer,
}

impl WebhookServer {
    /// Creates a new webhook server.
    ///
    /// The serving certificate and key are read once, here. Use
    /// [`WebhookServer::run()`] to start accepting connections.
    pub async fn new(router: Router, options: WebhookServerOptions) -> Result<Self> {
        tracing::trace!("create new webhook server");

        let service_builder = ServiceBuilder::new().layer(TraceLayer::new_for_http());
        let router = router.layer(service_builder);

        tracing::debug!("create TLS server");
        let tls_server = TlsServer::new(
            options.socket_addr,
            router,
            &options.certificate_path,
            &options.private_key_path,
        )
        .await
        .context(CreateTlsServerSnafu)?;

        Ok(Self { tls_server })
    }

    /// Runs the webhook server until it fails or the process receives
    /// SIGINT or SIGTERM.
    ///
    /// In-flight requests are not drained on shutdown.
    pub async fn run(self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())
            .context(RegisterSignalHandlerSnafu { signal: "SIGINT" })?;
        let mut sigterm = signal(SignalKind::terminate())
            .context(RegisterSignalHandlerSnafu { signal: "SIGTERM" })?;

        tracing::debug!("created unix signal handlers");

        let future_server = self.run_server().fuse();
        let future_signal = async {
            select! {
                signal = sigint.recv().fuse() => {
                    if signal.is_some() {
                        tracing::info!("received SIGINT, shutting down");
                    }
                },
                signal = sigterm.recv().fuse() => {
                    if signal.is_some() {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                },
            };
        }
        .fuse();

        // select requires Future + Unpin
        pin_mut!(future_server);
        pin_mut!(future_signal);

        select! {
            result = future_server => result,
            () = future_signal => Ok(()),
        }
    }

    async fn run_server(self) -> Result<()> {
        tracing::debug!("run webhook server");

        self.tls_server.run().await.context(RunTlsServerSnafu)
    }
}
