//! Resolution of Azure user-assigned managed identity names to client IDs.
//!
//! [`IdentityResolver`] is the seam the mutation policy depends on. The
//! production implementation is [`ArmIdentityResolver`], usually wrapped in a
//! [`CachingResolver`] to bound lookup latency.
use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

pub mod azure;
pub mod cache;
pub mod credential;

pub use azure::ArmIdentityResolver;
pub use cache::CachingResolver;
pub use credential::DefaultCredentialChain;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
pub enum ResolveError {
    #[snafu(display("no managed identity named {name:?} exists"))]
    NotFound { name: String },

    #[snafu(display("failed to look up managed identity {name:?}"))]
    Upstream { source: BoxError, name: String },

    #[snafu(display("lookup of managed identity {name:?} did not finish within {timeout:?}"))]
    Timeout { name: String, timeout: Duration },

    #[snafu(display(
        "cannot look up managed identity {name:?}, no Azure subscription is configured"
    ))]
    NotConfigured { name: String },
}

/// A user-assigned managed identity as returned by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedIdentity {
    pub name: String,
    pub client_id: String,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Returns the client ID of the managed identity called `name`.
    async fn resolve_client_id(&self, name: &str) -> Result<String, ResolveError>;
}

/// Used when no subscription is configured. Every lookup fails, so requests
/// referencing a managed identity are rejected instead of being let through
/// unmodified.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unconfigured;

#[async_trait]
impl IdentityResolver for Unconfigured {
    async fn resolve_client_id(&self, name: &str) -> Result<String, ResolveError> {
        NotConfiguredSnafu { name }.fail()
    }
}
