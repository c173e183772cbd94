//! Ambient Azure credentials for the Resource Manager API.
//!
//! [`DefaultCredentialChain`] discovers its credential sources from the
//! process environment and tries them in order:
//!
//! 1. a client secret (`AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET`),
//! 2. workload identity federation (`AZURE_TENANT_ID`, `AZURE_CLIENT_ID`,
//!    `AZURE_FEDERATED_TOKEN_FILE`),
//! 3. the instance metadata service (IMDS) managed identity endpoint.
use std::{
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{OptionExt, Report, ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// The OAuth 2.0 scope granting access to Azure Resource Manager.
pub const ARM_SCOPE: &str = "https://management.azure.com/.default";
const ARM_RESOURCE: &str = "https://management.azure.com/";

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com/";
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const IMDS_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Cached tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);

pub const AZURE_AUTHORITY_HOST: &str = "AZURE_AUTHORITY_HOST";
pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const AZURE_FEDERATED_TOKEN_FILE: &str = "AZURE_FEDERATED_TOKEN_FILE";

#[derive(Debug, Snafu)]
pub enum CredentialError {
    #[snafu(display("failed to parse endpoint {endpoint:?}"))]
    ParseEndpoint {
        source: url::ParseError,
        endpoint: String,
    },

    #[snafu(display("failed to read federated token file {path:?}"))]
    ReadFederatedToken {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to send token request to {url}"))]
    SendTokenRequest { source: reqwest::Error, url: Url },

    #[snafu(display("token endpoint {url} responded with status {status}: {body}"))]
    TokenRejected {
        url: Url,
        status: reqwest::StatusCode,
        body: String,
    },

    #[snafu(display("failed to decode token response from {url}"))]
    DecodeTokenResponse { source: reqwest::Error, url: Url },

    #[snafu(display("token response from {url} carries invalid expires_in {value:?}"))]
    InvalidExpiry { url: Url, value: String },

    #[snafu(display("no credential source produced a token: {}", attempts.join("; ")))]
    Exhausted { attempts: Vec<String> },
}

/// Provides bearer tokens for Azure Resource Manager.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn token(&self) -> Result<AccessToken, CredentialError>;
}

/// A bearer token and the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    expires_at: Instant,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// One way of obtaining a token, discovered from the environment.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    WorkloadIdentity {
        tenant_id: String,
        client_id: String,
        token_file: PathBuf,
    },
    /// The IMDS endpoint. Without a client ID, the system-assigned identity
    /// (or the only user-assigned one) is used.
    ManagedIdentity { client_id: Option<String> },
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Self::WorkloadIdentity {
                tenant_id,
                client_id,
                token_file,
            } => f
                .debug_struct("WorkloadIdentity")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("token_file", token_file)
                .finish(),
            Self::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
        }
    }
}

impl CredentialSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientSecret { .. } => "client secret",
            Self::WorkloadIdentity { .. } => "workload identity",
            Self::ManagedIdentity { .. } => "managed identity",
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: ExpiresIn,
}

/// Entra ID returns a number, IMDS returns a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

/// Tries each [`CredentialSource`] in order and caches the first token
/// obtained until shortly before it expires.
pub struct DefaultCredentialChain {
    client: reqwest::Client,
    authority_host: Url,
    imds_endpoint: Url,
    sources: Vec<CredentialSource>,
    cached: Mutex<Option<AccessToken>>,
}

impl DefaultCredentialChain {
    pub fn from_env(client: reqwest::Client) -> Result<Self, CredentialError> {
        Self::from_lookup(client, |name| std::env::var(name).ok())
    }

    /// Builds the chain from variables returned by `lookup`. Empty values are
    /// treated as unset.
    pub fn from_lookup(
        client: reqwest::Client,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CredentialError> {
        let var = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let authority_host = parse_base_url(
            &var(AZURE_AUTHORITY_HOST).unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_owned()),
        )?;
        let imds_endpoint = Url::parse(IMDS_TOKEN_ENDPOINT).context(ParseEndpointSnafu {
            endpoint: IMDS_TOKEN_ENDPOINT,
        })?;

        let tenant_id = var(AZURE_TENANT_ID);
        let client_id = var(AZURE_CLIENT_ID);
        let mut sources = Vec::new();

        if let (Some(tenant_id), Some(client_id), Some(client_secret)) =
            (&tenant_id, &client_id, var(AZURE_CLIENT_SECRET))
        {
            sources.push(CredentialSource::ClientSecret {
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                client_secret,
            });
        }

        if let (Some(tenant_id), Some(client_id), Some(token_file)) =
            (tenant_id, &client_id, var(AZURE_FEDERATED_TOKEN_FILE))
        {
            sources.push(CredentialSource::WorkloadIdentity {
                tenant_id,
                client_id: client_id.clone(),
                token_file: token_file.into(),
            });
        }

        sources.push(CredentialSource::ManagedIdentity { client_id });

        Ok(Self {
            client,
            authority_host,
            imds_endpoint,
            sources,
            cached: Mutex::new(None),
        })
    }

    pub fn sources(&self) -> &[CredentialSource] {
        &self.sources
    }

    async fn request_token(&self, source: &CredentialSource) -> Result<AccessToken, CredentialError> {
        match source {
            CredentialSource::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = self.token_url(tenant_id)?;
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", ARM_SCOPE),
                ];
                let request = self.client.post(url.clone()).form(&form);
                send_token_request(url, request).await
            }
            CredentialSource::WorkloadIdentity {
                tenant_id,
                client_id,
                token_file,
            } => {
                // The projected token is rotated by the kubelet, read it on
                // every exchange.
                let assertion = tokio::fs::read_to_string(token_file)
                    .await
                    .context(ReadFederatedTokenSnafu { path: token_file })?;

                let url = self.token_url(tenant_id)?;
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                    ("client_assertion", assertion.trim()),
                    ("scope", ARM_SCOPE),
                ];
                let request = self.client.post(url.clone()).form(&form);
                send_token_request(url, request).await
            }
            CredentialSource::ManagedIdentity { client_id } => {
                let mut url = self.imds_endpoint.clone();
                url.query_pairs_mut()
                    .append_pair("api-version", IMDS_API_VERSION)
                    .append_pair("resource", ARM_RESOURCE);
                if let Some(client_id) = client_id {
                    url.query_pairs_mut().append_pair("client_id", client_id);
                }

                let request = self
                    .client
                    .get(url.clone())
                    .header("Metadata", "true")
                    .timeout(IMDS_REQUEST_TIMEOUT);
                send_token_request(url, request).await
            }
        }
    }

    fn token_url(&self, tenant_id: &str) -> Result<Url, CredentialError> {
        let path = format!("{tenant_id}/oauth2/v2.0/token");
        self.authority_host
            .join(&path)
            .context(ParseEndpointSnafu { endpoint: path })
    }
}

#[async_trait]
impl TokenCredential for DefaultCredentialChain {
    async fn token(&self) -> Result<AccessToken, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.clone());
        }

        let mut attempts = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match self.request_token(source).await {
                Ok(token) => {
                    debug!(credential.source = source.kind(), "acquired Azure access token");
                    *cached = Some(token.clone());
                    return Ok(token);
                }
                Err(err) => {
                    let message = Report::from_error(&err).to_string();
                    debug!(
                        credential.source = source.kind(),
                        error = %message,
                        "credential source failed, trying next"
                    );
                    attempts.push(format!("{}: {message}", source.kind()));
                }
            }
        }

        ExhaustedSnafu { attempts }.fail()
    }
}

async fn send_token_request(
    url: Url,
    request: reqwest::RequestBuilder,
) -> Result<AccessToken, CredentialError> {
    let response = request
        .send()
        .await
        .context(SendTokenRequestSnafu { url: url.clone() })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return TokenRejectedSnafu { url, status, body }.fail();
    }

    let token: TokenResponse = response
        .json()
        .await
        .context(DecodeTokenResponseSnafu { url: url.clone() })?;

    let (expires_in, value) = match token.expires_in {
        ExpiresIn::Seconds(seconds) => (Some(seconds), seconds.to_string()),
        ExpiresIn::Text(text) => (text.parse().ok(), text),
    };
    let expires_at = expires_in
        .and_then(|seconds| Instant::now().checked_add(Duration::from_secs(seconds)))
        .context(InvalidExpirySnafu { url, value })?;

    Ok(AccessToken::new(token.access_token, expires_at))
}

/// Parses `endpoint`, adding a trailing slash so relative paths can be joined.
pub(crate) fn parse_base_url(endpoint: &str) -> Result<Url, CredentialError> {
    let normalized = if endpoint.ends_with('/') {
        endpoint.to_owned()
    } else {
        format!("{endpoint}/")
    };

    Url::parse(&normalized).context(ParseEndpointSnafu { endpoint })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashMap},
        io::Write,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use axum::{
        Form, Json, Router,
        http::StatusCode,
        routing::{get, post},
    };
    use rstest::rstest;
    use serde_json::{Value, json};

    use super::*;
    use crate::identity::testing::{http_client, serve};

    fn chain(vars: &[(&str, &str)]) -> DefaultCredentialChain {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();

        DefaultCredentialChain::from_lookup(http_client(), |name| vars.get(name).cloned()).unwrap()
    }

    #[rstest]
    #[case::nothing_configured(&[], &["managed identity"])]
    #[case::client_secret(
        &[(AZURE_TENANT_ID, "t"), (AZURE_CLIENT_ID, "c"), (AZURE_CLIENT_SECRET, "s")],
        &["client secret", "managed identity"],
    )]
    #[case::workload_identity(
        &[(AZURE_TENANT_ID, "t"), (AZURE_CLIENT_ID, "c"), (AZURE_FEDERATED_TOKEN_FILE, "/token")],
        &["workload identity", "managed identity"],
    )]
    #[case::everything(
        &[
            (AZURE_TENANT_ID, "t"),
            (AZURE_CLIENT_ID, "c"),
            (AZURE_CLIENT_SECRET, "s"),
            (AZURE_FEDERATED_TOKEN_FILE, "/token"),
        ],
        &["client secret", "workload identity", "managed identity"],
    )]
    #[case::empty_secret_is_unset(
        &[(AZURE_TENANT_ID, "t"), (AZURE_CLIENT_ID, "c"), (AZURE_CLIENT_SECRET, "")],
        &["managed identity"],
    )]
    #[case::secret_without_tenant(
        &[(AZURE_CLIENT_ID, "c"), (AZURE_CLIENT_SECRET, "s")],
        &["managed identity"],
    )]
    fn discovers_sources_in_order(#[case] vars: &[(&str, &str)], #[case] expected: &[&str]) {
        let chain = chain(vars);
        let kinds: Vec<_> = chain.sources().iter().map(CredentialSource::kind).collect();

        assert_eq!(kinds, expected);
    }

    #[test]
    fn managed_identity_uses_configured_client_id() {
        let chain = chain(&[(AZURE_CLIENT_ID, "user-assigned")]);

        assert_eq!(chain.sources(), [CredentialSource::ManagedIdentity {
            client_id: Some("user-assigned".to_owned())
        }]);
    }

    #[test]
    fn debug_output_hides_client_secret() {
        let source = CredentialSource::ClientSecret {
            tenant_id: "tenant".to_owned(),
            client_id: "client".to_owned(),
            client_secret: "super-secret".to_owned(),
        };

        assert!(!format!("{source:?}").contains("super-secret"));
        assert!(!format!("{:?}", AccessToken::new("bearer", Instant::now())).contains("bearer"));
    }

    fn token_endpoint(hits: Arc<AtomicUsize>, expires_in: Value) -> Router {
        Router::new().route(
            "/tenant-1/oauth2/v2.0/token",
            post(move |Form(form): Form<HashMap<String, String>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);

                if form.get("scope").map(String::as_str) != Some(ARM_SCOPE) {
                    return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_scope"})));
                }

                let token = match (form.get("client_secret"), form.get("client_assertion")) {
                    (Some(secret), None) if secret == "s3cret" => "secret-token",
                    (None, Some(assertion)) if assertion == "federated-jwt" => "federated-token",
                    _ => {
                        return (
                            StatusCode::UNAUTHORIZED,
                            Json(json!({"error": "invalid_client"})),
                        );
                    }
                };

                (
                    StatusCode::OK,
                    Json(json!({
                        "token_type": "Bearer",
                        "access_token": token,
                        "expires_in": expires_in,
                    })),
                )
            }),
        )
    }

    #[tokio::test]
    async fn client_secret_token_is_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let authority = serve(token_endpoint(hits.clone(), json!(3599))).await;

        let chain = chain(&[
            (AZURE_AUTHORITY_HOST, authority.as_str()),
            (AZURE_TENANT_ID, "tenant-1"),
            (AZURE_CLIENT_ID, "client-1"),
            (AZURE_CLIENT_SECRET, "s3cret"),
        ]);

        let first = chain.token().await.unwrap();
        let second = chain.token().await.unwrap();

        assert_eq!(first.secret(), "secret-token");
        assert_eq!(second.secret(), "secret-token");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_lived_token_is_not_reused() {
        let hits = Arc::new(AtomicUsize::new(0));
        let authority = serve(token_endpoint(hits.clone(), json!(60))).await;

        let chain = chain(&[
            (AZURE_AUTHORITY_HOST, authority.as_str()),
            (AZURE_TENANT_ID, "tenant-1"),
            (AZURE_CLIENT_ID, "client-1"),
            (AZURE_CLIENT_SECRET, "s3cret"),
        ]);

        chain.token().await.unwrap();
        chain.token().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn falls_back_to_workload_identity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let authority = serve(token_endpoint(hits.clone(), json!("3599"))).await;

        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(token_file, "federated-jwt").unwrap();

        let chain = chain(&[
            (AZURE_AUTHORITY_HOST, authority.as_str()),
            (AZURE_TENANT_ID, "tenant-1"),
            (AZURE_CLIENT_ID, "client-1"),
            (AZURE_CLIENT_SECRET, "wrong"),
            (AZURE_FEDERATED_TOKEN_FILE, token_file.path().to_str().unwrap()),
        ]);

        let token = chain.token().await.unwrap();

        assert_eq!(token.secret(), "federated-token");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn managed_identity_queries_imds() {
        let imds = serve(Router::new().route(
            "/metadata/identity/oauth2/token",
            get(
                |headers: axum::http::HeaderMap,
                 axum::extract::Query(query): axum::extract::Query<HashMap<String, String>>| async move {
                    let has_metadata_header = headers
                        .get("Metadata")
                        .is_some_and(|value| value == "true");
                    let for_arm = query.get("resource").map(String::as_str) == Some(ARM_RESOURCE);

                    if has_metadata_header && for_arm {
                        (
                            StatusCode::OK,
                            Json(json!({"access_token": "imds-token", "expires_in": "86399"})),
                        )
                    } else {
                        (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_request"})))
                    }
                },
            ),
        ))
        .await;

        let mut chain = chain(&[]);
        chain.imds_endpoint = imds.join("metadata/identity/oauth2/token").unwrap();

        let token = chain.token().await.unwrap();
        assert_eq!(token.secret(), "imds-token");
    }

    #[tokio::test]
    async fn unrepresentable_expiry_is_rejected() {
        let hits = Arc::new(AtomicUsize::new(0));
        let authority = serve(token_endpoint(hits.clone(), json!("18446744073709551615"))).await;

        let mut chain = chain(&[
            (AZURE_AUTHORITY_HOST, authority.as_str()),
            (AZURE_TENANT_ID, "tenant-1"),
            (AZURE_CLIENT_ID, "client-1"),
            (AZURE_CLIENT_SECRET, "s3cret"),
        ]);
        chain.imds_endpoint = authority.join("imds").unwrap();

        let err = chain.token().await.unwrap_err();
        let CredentialError::Exhausted { attempts } = err else {
            panic!("expected all sources to fail, got {err:?}");
        };

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(attempts[0].starts_with("client secret: "));
        assert!(attempts[0].contains("18446744073709551615"), "{}", attempts[0]);
    }

    #[tokio::test]
    async fn reports_every_failed_source() {
        let hits = Arc::new(AtomicUsize::new(0));
        let authority = serve(token_endpoint(hits.clone(), json!(3599))).await;

        let mut chain = chain(&[
            (AZURE_AUTHORITY_HOST, authority.as_str()),
            (AZURE_TENANT_ID, "tenant-1"),
            (AZURE_CLIENT_ID, "client-1"),
            (AZURE_CLIENT_SECRET, "wrong"),
            (AZURE_FEDERATED_TOKEN_FILE, "/does/not/exist"),
        ]);
        chain.imds_endpoint = authority.join("imds").unwrap();

        let err = chain.token().await.unwrap_err();
        let CredentialError::Exhausted { attempts } = err else {
            panic!("expected all sources to fail, got {err:?}");
        };

        assert_eq!(attempts.len(), 3);
        assert!(attempts[0].starts_with("client secret: "));
        assert!(attempts[1].starts_with("workload identity: "));
        assert!(attempts[2].starts_with("managed identity: "));
    }
}
