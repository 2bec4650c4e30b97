//! Azure cloud environments and AAD token credentials.

use crate::AzureError;
use muhur::error::Error;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Instance metadata service token endpoint used for managed identities.
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Sovereign cloud the vault lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AzureEnvironment {
    /// Global Azure
    #[default]
    PublicCloud,
    /// Azure operated by 21Vianet
    ChinaCloud,
    /// Azure Government
    UsGovernmentCloud,
    /// Azure Germany
    GermanCloud,
}

impl AzureEnvironment {
    /// Canonical configuration name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PublicCloud => "AzurePublicCloud",
            Self::ChinaCloud => "AzureChinaCloud",
            Self::UsGovernmentCloud => "AzureUSGovernmentCloud",
            Self::GermanCloud => "AzureGermanCloud",
        }
    }

    /// DNS suffix of Key Vault endpoints.
    #[must_use]
    pub const fn key_vault_dns_suffix(self) -> &'static str {
        match self {
            Self::PublicCloud => "vault.azure.net",
            Self::ChinaCloud => "vault.azure.cn",
            Self::UsGovernmentCloud => "vault.usgovcloudapi.net",
            Self::GermanCloud => "vault.microsoftazure.de",
        }
    }

    /// AAD authority host.
    #[must_use]
    pub const fn active_directory_endpoint(self) -> &'static str {
        match self {
            Self::PublicCloud => "https://login.microsoftonline.com",
            Self::ChinaCloud => "https://login.chinacloudapi.cn",
            Self::UsGovernmentCloud => "https://login.microsoftonline.us",
            Self::GermanCloud => "https://login.microsoftonline.de",
        }
    }
}

impl fmt::Display for AzureEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AzureEnvironment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::PublicCloud, Self::ChinaCloud, Self::UsGovernmentCloud, Self::GermanCloud]
            .into_iter()
            .find(|env| env.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::invalid_config("environment", format!("unknown Azure environment: {s:?}")))
    }
}

/// Bearer token with its expiry.
#[derive(Clone)]
pub struct AccessToken {
    /// Raw token, without the `Bearer` prefix
    pub token: SecretString,
    /// When the token stops being usable
    pub expires_at: Instant,
}

impl AccessToken {
    fn from_lifetime(token: String, expires_in: u64) -> Self {
        let lifetime = Duration::from_secs(expires_in).saturating_sub(EXPIRY_MARGIN).max(EXPIRY_MARGIN);
        Self { token: SecretString::new(token), expires_at: Instant::now() + lifetime }
    }

    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken").field("expires_at", &self.expires_at).finish_non_exhaustive()
    }
}

/// Source of AAD bearer tokens.
#[async_trait::async_trait]
pub trait TokenCredential: Send + Sync {
    /// Fetches a token.
    ///
    /// # Errors
    ///
    /// Returns `AzureError::TokenRejected` when AAD refuses the credentials,
    /// or `AzureError::Http` when the endpoint cannot be reached.
    async fn token(&self) -> Result<AccessToken, AzureError>;
}

/// OAuth2 client-credentials grant against AAD.
pub struct ClientSecretCredential {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    scope: String,
}

impl ClientSecretCredential {
    /// Creates a credential for `tenant_id` at `authority`.
    ///
    /// `scope` is usually `https://<key vault dns suffix>/.default`.
    pub fn new(
        http: reqwest::Client,
        authority: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: SecretString,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: format!("{}/{tenant_id}/oauth2/v2.0/token", authority.trim_end_matches('/')),
            client_id: client_id.into(),
            client_secret,
            scope: scope.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn token(&self) -> Result<AccessToken, AzureError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret().as_str()),
            ("scope", self.scope.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let response = self.http.post(&self.token_url).form(&params).send().await?;
        let payload: TokenResponse = read_token_response(response).await?;
        Ok(AccessToken::from_lifetime(payload.access_token, payload.expires_in.seconds()))
    }
}

/// Managed identity token from the instance metadata service.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    resource: String,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    /// Creates a credential for `resource`, optionally pinned to a
    /// user-assigned identity.
    pub fn new(http: reqwest::Client, resource: impl Into<String>, client_id: Option<String>) -> Self {
        Self { http, endpoint: IMDS_TOKEN_ENDPOINT.to_string(), resource: resource.into(), client_id }
    }

    /// Overrides the metadata endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait::async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn token(&self) -> Result<AccessToken, AzureError> {
        let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", self.resource.as_str())];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }
        let response =
            self.http.get(&self.endpoint).header("Metadata", "true").query(&query).send().await?;
        let payload: TokenResponse = read_token_response(response).await?;
        Ok(AccessToken::from_lifetime(payload.access_token, payload.expires_in.seconds()))
    }
}

/// Fixed token, for callers that obtain tokens out of band.
pub struct StaticTokenCredential {
    token: SecretString,
}

impl StaticTokenCredential {
    /// Wraps `token`. A leading `Bearer ` is stripped.
    pub fn new(token: &str) -> Self {
        let trimmed = token.trim();
        let bare = trimmed
            .get(..7)
            .filter(|prefix| prefix.eq_ignore_ascii_case("bearer "))
            .map_or(trimmed, |_| &trimmed[7..]);
        Self { token: SecretString::new(bare.to_string()) }
    }
}

#[async_trait::async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn token(&self) -> Result<AccessToken, AzureError> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        })
    }
}

/// Caches tokens from `inner` until shortly before they expire.
pub struct CachedCredential {
    inner: Arc<dyn TokenCredential>,
    cache: Mutex<Option<AccessToken>>,
}

impl CachedCredential {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn TokenCredential>) -> Self {
        Self { inner, cache: Mutex::new(None) }
    }
}

#[async_trait::async_trait]
impl TokenCredential for CachedCredential {
    async fn token(&self) -> Result<AccessToken, AzureError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.clone());
        }
        tracing::debug!("requesting azure access token");
        let token = self.inner.token().await?;
        *cache = Some(token.clone());
        Ok(token)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: ExpiresIn,
}

// IMDS reports `expires_in` as a string, AAD as a number.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Number(u64),
    Text(String),
}

impl Default for ExpiresIn {
    fn default() -> Self {
        Self::Number(3600)
    }
}

impl ExpiresIn {
    fn seconds(&self) -> u64 {
        match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse().unwrap_or(3600),
        }
    }
}

async fn read_token_response(response: reqwest::Response) -> Result<TokenResponse, AzureError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AzureError::TokenRejected { status: status.as_u16(), body });
    }
    response
        .json()
        .await
        .map_err(|e| AzureError::UnexpectedResponse(format!("failed to parse token response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use muhur::error::ErrorKind;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_environment_parsing() {
        assert_eq!("AzurePublicCloud".parse::<AzureEnvironment>().unwrap(), AzureEnvironment::PublicCloud);
        assert_eq!("azurechinacloud".parse::<AzureEnvironment>().unwrap(), AzureEnvironment::ChinaCloud);
        assert_eq!(
            "AZUREUSGOVERNMENTCLOUD".parse::<AzureEnvironment>().unwrap(),
            AzureEnvironment::UsGovernmentCloud
        );
        let err = "AzureMoonCloud".parse::<AzureEnvironment>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_environment_endpoints() {
        assert_eq!(AzureEnvironment::PublicCloud.key_vault_dns_suffix(), "vault.azure.net");
        assert_eq!(AzureEnvironment::GermanCloud.key_vault_dns_suffix(), "vault.microsoftazure.de");
        assert_eq!(
            AzureEnvironment::UsGovernmentCloud.active_directory_endpoint(),
            "https://login.microsoftonline.us"
        );
    }

    #[test]
    fn test_static_token_strips_bearer() {
        let credential = StaticTokenCredential::new("  Bearer abc123 ");
        assert_eq!(credential.token.expose_secret(), "abc123");
        let credential = StaticTokenCredential::new("abc123");
        assert_eq!(credential.token.expose_secret(), "abc123");
    }

    #[tokio::test]
    async fn test_client_credentials_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=app"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok", "expires_in": 3600})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let inner = ClientSecretCredential::new(
            reqwest::Client::new(),
            &server.uri(),
            "tenant-1",
            "app",
            SecretString::new("secret".into()),
            "https://vault.azure.net/.default",
        );
        let cached = CachedCredential::new(Arc::new(inner));
        let first = cached.token().await.unwrap();
        let second = cached.token().await.unwrap();
        assert_eq!(first.token.expose_secret(), "tok");
        assert_eq!(second.token.expose_secret(), "tok");
    }

    #[tokio::test]
    async fn test_rejected_client_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let credential = ClientSecretCredential::new(
            reqwest::Client::new(),
            &server.uri(),
            "tenant-1",
            "app",
            SecretString::new("wrong".into()),
            "https://vault.azure.net/.default",
        );
        let err: Error = credential.token().await.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
    }

    #[tokio::test]
    async fn test_managed_identity_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .and(header("Metadata", "true"))
            .and(query_param("resource", "https://vault.azure.net"))
            .and(query_param("client_id", "identity-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "mi-tok", "expires_in": "86399"})),
            )
            .mount(&server)
            .await;

        let credential = ManagedIdentityCredential::new(
            reqwest::Client::new(),
            "https://vault.azure.net",
            Some("identity-1".into()),
        )
        .with_endpoint(format!("{}/metadata/identity/oauth2/token", server.uri()));
        let token = credential.token().await.unwrap();
        assert_eq!(token.token.expose_secret(), "mi-tok");
        assert!(token.expires_at > Instant::now() + Duration::from_secs(3600));
    }
}
