//! Key Vault REST surface used by the seal.

use crate::auth::TokenCredential;
use crate::AzureError;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Key Vault data-plane API version.
pub const KEYS_API_VERSION: &str = "7.4";

/// Subset of a JSON web key returned by Key Vault.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonWebKey {
    /// Full key identifier, `https://<vault>/keys/<name>/<version>`
    pub kid: String,
}

/// Response of `GET keys/<name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyBundle {
    /// Key material metadata
    pub key: JsonWebKey,
}

/// Response of `wrapkey` and `unwrapkey`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyOperationResult {
    /// Key identifier that performed the operation
    pub kid: String,
    /// Base64url result
    pub value: String,
}

#[derive(Serialize)]
struct KeyOperationRequest<'a> {
    alg: &'a str,
    value: &'a str,
}

/// Key Vault key operations.
#[async_trait::async_trait]
pub trait KeyVaultApi: Send + Sync {
    /// Reads the latest version of `key_name`.
    async fn get_key(&self, key_name: &str) -> Result<KeyBundle, AzureError>;

    /// Wraps `value` (base64url) with `key_name`, at `version` or the latest.
    async fn wrap_key(
        &self,
        key_name: &str,
        version: Option<&str>,
        alg: &str,
        value: &str,
    ) -> Result<KeyOperationResult, AzureError>;

    /// Unwraps `value` (base64url) with `key_name` at `version`.
    async fn unwrap_key(
        &self,
        key_name: &str,
        version: &str,
        alg: &str,
        value: &str,
    ) -> Result<KeyOperationResult, AzureError>;
}

/// `reqwest`-backed Key Vault client.
pub struct HttpKeyVaultClient {
    http: reqwest::Client,
    vault_url: String,
    credential: Arc<dyn TokenCredential>,
}

impl HttpKeyVaultClient {
    /// Creates a client for `vault_url` (`https://<vault>.<suffix>/`).
    pub fn new(http: reqwest::Client, vault_url: impl Into<String>, credential: Arc<dyn TokenCredential>) -> Self {
        let mut vault_url = vault_url.into();
        if !vault_url.ends_with('/') {
            vault_url.push('/');
        }
        Self { http, vault_url, credential }
    }

    /// Returns the vault base URL.
    #[must_use]
    pub fn vault_url(&self) -> &str {
        &self.vault_url
    }

    fn key_url(&self, key_name: &str, version: Option<&str>, operation: Option<&str>) -> String {
        let mut url = format!("{}keys/{key_name}", self.vault_url);
        for segment in [version, operation].into_iter().flatten() {
            url.push('/');
            url.push_str(segment);
        }
        url
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, AzureError> {
        let token = self.credential.token().await?;
        let response = request
            .bearer_auth(token.token.expose_secret())
            .query(&[("api-version", KEYS_API_VERSION)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AzureError::Status { status: status.as_u16(), body });
        }
        response
            .json()
            .await
            .map_err(|e| AzureError::UnexpectedResponse(format!("failed to parse key vault response: {e}")))
    }

    async fn key_operation(
        &self,
        key_name: &str,
        version: Option<&str>,
        operation: &str,
        alg: &str,
        value: &str,
    ) -> Result<KeyOperationResult, AzureError> {
        let url = self.key_url(key_name, version, Some(operation));
        self.send(self.http.post(url).json(&KeyOperationRequest { alg, value })).await
    }
}

#[async_trait::async_trait]
impl KeyVaultApi for HttpKeyVaultClient {
    async fn get_key(&self, key_name: &str) -> Result<KeyBundle, AzureError> {
        self.send(self.http.get(self.key_url(key_name, None, None))).await
    }

    async fn wrap_key(
        &self,
        key_name: &str,
        version: Option<&str>,
        alg: &str,
        value: &str,
    ) -> Result<KeyOperationResult, AzureError> {
        self.key_operation(key_name, version, "wrapkey", alg, value).await
    }

    async fn unwrap_key(
        &self,
        key_name: &str,
        version: &str,
        alg: &str,
        value: &str,
    ) -> Result<KeyOperationResult, AzureError> {
        self.key_operation(key_name, Some(version), "unwrapkey", alg, value).await
    }
}
