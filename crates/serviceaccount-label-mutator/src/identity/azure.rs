//! Managed identity lookups against the Azure Resource Manager API.
use async_trait::async_trait;
use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use url::Url;

use crate::identity::{
    IdentityResolver, ManagedIdentity, NotFoundSnafu, ResolveError,
    credential::{self, CredentialError, TokenCredential},
};

pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com/";
const USER_ASSIGNED_IDENTITIES_API_VERSION: &str = "2023-01-31";

#[derive(Debug, Snafu)]
pub enum ArmError {
    #[snafu(display("invalid Resource Manager endpoint"))]
    ParseEndpoint { source: CredentialError },

    #[snafu(display("Resource Manager endpoint {endpoint} cannot carry a path"))]
    EndpointNotABase { endpoint: Url },

    #[snafu(display("failed to obtain an access token"))]
    Authenticate { source: CredentialError },

    #[snafu(display("failed to list user-assigned identities from {url}"))]
    ListIdentities { source: reqwest::Error, url: Url },

    #[snafu(display("failed to decode user-assigned identities from {url}"))]
    DecodePage { source: reqwest::Error, url: Url },

    #[snafu(display("refusing to follow next link {next_link} to a different origin than {url}"))]
    ForeignNextLink { next_link: Url, url: Url },
}

/// One page of `userAssignedIdentities`.
#[derive(Debug, Deserialize)]
struct IdentityPage {
    #[serde(default)]
    value: Vec<IdentityRecord>,

    #[serde(rename = "nextLink")]
    next_link: Option<Url>,
}

#[derive(Debug, Deserialize)]
struct IdentityRecord {
    name: Option<String>,
    properties: Option<IdentityProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityProperties {
    client_id: Option<String>,
}

impl IdentityRecord {
    /// Records without a name or client ID are skipped.
    fn into_managed_identity(self) -> Option<ManagedIdentity> {
        let client_id = self.properties?.client_id.filter(|id| !id.is_empty())?;

        Some(ManagedIdentity {
            name: self.name?,
            client_id,
        })
    }
}

impl IdentityPage {
    fn find(self, name: &str) -> (Option<ManagedIdentity>, Option<Url>) {
        let found = self
            .value
            .into_iter()
            .filter_map(IdentityRecord::into_managed_identity)
            .find(|identity| identity.name == name);

        (found, self.next_link)
    }
}

/// Resolves identity names by listing every user-assigned identity in a
/// subscription, page by page, until the name is found.
pub struct ArmIdentityResolver<C> {
    client: reqwest::Client,
    credential: C,
    identities_url: Url,
}

impl<C> ArmIdentityResolver<C>
where
    C: TokenCredential,
{
    /// Creates a resolver for `subscription_id` using the public Azure cloud.
    pub fn new(
        client: reqwest::Client,
        subscription_id: &str,
        credential: C,
    ) -> Result<Self, ArmError> {
        Self::with_endpoint(client, DEFAULT_ARM_ENDPOINT, subscription_id, credential)
    }

    /// Creates a resolver talking to the Resource Manager at `endpoint`.
    pub fn with_endpoint(
        client: reqwest::Client,
        endpoint: &str,
        subscription_id: &str,
        credential: C,
    ) -> Result<Self, ArmError> {
        let endpoint = credential::parse_base_url(endpoint).context(ParseEndpointSnafu)?;

        let mut identities_url = endpoint.clone();
        identities_url
            .path_segments_mut()
            .map_err(|()| ArmError::EndpointNotABase { endpoint })?
            .pop_if_empty()
            .extend([
                "subscriptions",
                subscription_id,
                "providers",
                "Microsoft.ManagedIdentity",
                "userAssignedIdentities",
            ]);
        identities_url
            .query_pairs_mut()
            .append_pair("api-version", USER_ASSIGNED_IDENTITIES_API_VERSION);

        Ok(Self {
            client,
            credential,
            identities_url,
        })
    }

    async fn fetch_page(&self, url: &Url) -> Result<IdentityPage, ArmError> {
        let token = self.credential.token().await.context(AuthenticateSnafu)?;

        self.client
            .get(url.clone())
            .bearer_auth(token.secret())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(ListIdentitiesSnafu { url: url.clone() })?
            .json()
            .await
            .context(DecodePageSnafu { url: url.clone() })
    }

    /// The bearer token is only ever sent to the Resource Manager endpoint
    /// the resolver was created for.
    fn check_next_link(&self, next_link: Url) -> Result<Url, ArmError> {
        ensure!(
            next_link.origin() == self.identities_url.origin(),
            ForeignNextLinkSnafu {
                next_link,
                url: self.identities_url.clone(),
            }
        );

        Ok(next_link)
    }
}

#[async_trait]
impl<C> IdentityResolver for ArmIdentityResolver<C>
where
    C: TokenCredential,
{
    #[instrument(skip(self))]
    async fn resolve_client_id(&self, name: &str) -> Result<String, ResolveError> {
        let upstream = |source: ArmError| ResolveError::Upstream {
            source: Box::new(source),
            name: name.to_owned(),
        };
        let mut next_page = Some(self.identities_url.clone());
        let mut pages = 0_usize;

        while let Some(url) = next_page {
            let page = self.fetch_page(&url).await.map_err(upstream)?;
            pages += 1;

            let (found, next_link) = page.find(name);
            if let Some(identity) = found {
                debug!(pages, client_id = %identity.client_id, "resolved managed identity");
                return Ok(identity.client_id);
            }

            next_page = next_link
                .map(|next_link| self.check_next_link(next_link))
                .transpose()
                .map_err(upstream)?;
        }

        debug!(pages, "managed identity not found in any page");
        NotFoundSnafu { name }.fail()
    }
}
