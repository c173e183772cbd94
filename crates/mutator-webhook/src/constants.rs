//! Contains various constant definitions, mostly for default ports, IP
//! addresses and the names used when registering the webhook.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The default HTTPS port `8443`
pub const DEFAULT_HTTPS_PORT: u16 = 8443;

/// The default IP address [`Ipv4Addr::UNSPECIFIED`] (`0.0.0.0`) the webhook server binds to,
/// which represents binding on all network addresses.
pub const DEFAULT_LISTEN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The default socket address `0.0.0.0:8443` the webhook server binds to.
pub const DEFAULT_SOCKET_ADDRESS: SocketAddr =
    SocketAddr::new(DEFAULT_LISTEN_ADDRESS, DEFAULT_HTTPS_PORT);

/// The port of the Kubernetes service the API server sends admission reviews to.
pub const DEFAULT_WEBHOOK_SERVICE_PORT: u16 = 443;

/// The HTTP path admission reviews are posted to.
pub const DEFAULT_WEBHOOK_PATH: &str = "/mutate";

/// The default name of the MutatingWebhookConfiguration object.
pub const DEFAULT_MUTATING_WEBHOOK_CONFIGURATION_NAME: &str = "serviceaccount-label-mutator";

/// The field manager recorded on writes to the MutatingWebhookConfiguration.
pub const FIELD_MANAGER: &str = "serviceaccount-label-mutator";
