//! Azure Key Vault seal backend for `muhur`.
//!
//! Each encryption draws a fresh DEK, seals the payload with it, and asks Key
//! Vault to wrap the DEK with an RSA key using `RSA-OAEP-256`. The key version
//! that performed the wrap is recorded in the blob so decryption keeps working
//! after the key is rotated.
//!
//! # Example
//!
//! ```rust,no_run
//! use muhur::prelude::*;
//! use muhur_kms_azure::AzureKeyVaultSeal;
//!
//! # async fn example() -> Result<(), muhur::error::Error> {
//! let mut seal = Seal::new(Box::new(AzureKeyVaultSeal::new()));
//! seal.set_config(&SealConfig::from_pairs([
//!     ("vault_name", "my-vault"),
//!     ("key_name", "seal-key"),
//! ]))
//! .await?;
//!
//! let blob = seal.encrypt(b"root key").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Credentials
//!
//! With `tenant_id`, `client_id` and `client_secret` all set the seal uses the
//! OAuth2 client-credentials grant. Otherwise it asks the instance metadata
//! service for a managed identity token, using `client_id` to select a
//! user-assigned identity when given.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod client;

use auth::{AzureEnvironment, CachedCredential, ClientSecretCredential, ManagedIdentityCredential, TokenCredential};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use client::{HttpKeyVaultClient, KeyVaultApi};
use muhur::blob::{KeyInfo, WrappedBlob};
use muhur::config::{PublicConfig, SealConfig};
use muhur::envelope;
use muhur::error::{classify_status, Error};
use muhur::key_id::KeyIdSlot;
use muhur::seal::{SealAccess, SealType};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use zeroize::Zeroizing;

/// Key wrap algorithm.
pub const WRAP_ALGORITHM: &str = "RSA-OAEP-256";

// Configuration keys.
pub const VAULT_NAME: &str = "vault_name";
pub const KEY_NAME: &str = "key_name";
pub const TENANT_ID: &str = "tenant_id";
pub const CLIENT_ID: &str = "client_id";
pub const CLIENT_SECRET: &str = "client_secret";
pub const ENVIRONMENT: &str = "environment";
/// Overrides the Key Vault DNS suffix of the environment.
pub const RESOURCE: &str = "resource";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Key Vault emits unpadded base64url and accepts either form.
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Errors specific to Azure Key Vault operations.
#[derive(Debug, ThisError)]
pub enum AzureError {
    /// Transport failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Key Vault answered with a non-success status
    #[error("key vault returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// AAD refused to issue a token
    #[error("token request rejected: {status} {body}")]
    TokenRejected {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Response could not be interpreted
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Base64 decoding error
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<AzureError> for Error {
    fn from(err: AzureError) -> Self {
        match err {
            AzureError::Http(e) if e.is_timeout() || e.is_connect() => {
                Self::unavailable("key vault unreachable", e)
            }
            AzureError::Http(e) => match e.status() {
                Some(status) => classify_status(status.as_u16(), e.to_string()),
                None => Self::backend("key vault request failed", e),
            },
            AzureError::Status { status, body } => {
                classify_status(status, format!("key vault returned {status}: {body}"))
            }
            err @ AzureError::TokenRejected { .. } => Self::auth("azure credentials rejected", err),
            AzureError::UnexpectedResponse(msg) => Self::backend_msg(msg),
            err @ AzureError::Base64(_) => Self::backend("malformed key from key vault", err),
        }
    }
}

/// Azure Key Vault seal.
///
/// Cheap to construct; the client is built by `set_config`.
#[derive(Default)]
pub struct AzureKeyVaultSeal {
    client: Option<Arc<dyn KeyVaultApi>>,
    injected: bool,
    key_name: String,
    key_id: KeyIdSlot,
}

impl AzureKeyVaultSeal {
    /// Creates an unconfigured seal; `set_config` builds the HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a seal that talks to `client` instead of building one.
    ///
    /// Configuration is still resolved and validated by `set_config`.
    #[must_use]
    pub fn with_client(client: Arc<dyn KeyVaultApi>) -> Self {
        Self { client: Some(client), injected: true, ..Self::default() }
    }

    fn client(&self) -> Result<&dyn KeyVaultApi, Error> {
        self.client.as_deref().ok_or(Error::NotConfigured)
    }

    fn build_client(settings: &VaultSettings) -> Result<Arc<dyn KeyVaultApi>, Error> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().map_err(AzureError::from)?;

        let inner: Arc<dyn TokenCredential> = match &settings.credentials {
            Credentials::ClientSecret { tenant_id, client_id, client_secret } => {
                tracing::debug!(tenant_id = %tenant_id, client_id = %client_id, "using azure client credentials");
                Arc::new(ClientSecretCredential::new(
                    http.clone(),
                    settings.environment.active_directory_endpoint(),
                    tenant_id,
                    client_id.clone(),
                    client_secret.clone(),
                    settings.token_scope(),
                ))
            }
            Credentials::ManagedIdentity { client_id } => {
                tracing::debug!(client_id = ?client_id, "using azure managed identity");
                Arc::new(ManagedIdentityCredential::new(http.clone(), settings.token_resource(), client_id.clone()))
            }
        };

        Ok(Arc::new(HttpKeyVaultClient::new(http, settings.vault_url(), Arc::new(CachedCredential::new(inner)))))
    }
}

/// How the seal authenticates to AAD.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// OAuth2 client-credentials grant
    ClientSecret {
        /// Directory the application is registered in
        tenant_id: String,
        /// Application id
        client_id: String,
        /// Application secret
        client_secret: SecretString,
    },
    /// Instance metadata service token
    ManagedIdentity {
        /// User-assigned identity; the system identity when absent
        client_id: Option<String>,
    },
}

/// Connection settings resolved from a seal configuration.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub environment: AzureEnvironment,
    /// Replaces the environment's Key Vault DNS suffix
    pub resource: Option<String>,
    pub vault_name: String,
    pub key_name: String,
    pub credentials: Credentials,
}

impl VaultSettings {
    /// Resolves the settings, checking `vault_name` before `key_name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for an unknown environment and
    /// `Error::MissingConfig` for a missing vault or key name.
    pub fn resolve(config: &SealConfig) -> Result<Self, Error> {
        let environment = match config.optional(ENVIRONMENT, &["AZURE_ENVIRONMENT"]) {
            Some(name) => name.parse()?,
            None => AzureEnvironment::default(),
        };
        let resource = config.optional(RESOURCE, &["AZURE_AD_RESOURCE"]);
        let vault_name = config.required(VAULT_NAME, &["VAULT_AZUREKEYVAULT_VAULT_NAME"])?;
        let key_name = config.required(KEY_NAME, &["VAULT_AZUREKEYVAULT_KEY_NAME"])?;

        let tenant_id = config.optional(TENANT_ID, &["AZURE_TENANT_ID"]);
        let client_id = config.optional(CLIENT_ID, &["AZURE_CLIENT_ID"]);
        let client_secret = config.optional(CLIENT_SECRET, &["AZURE_CLIENT_SECRET"]);
        let credentials = match (tenant_id, client_id, client_secret) {
            (Some(tenant_id), Some(client_id), Some(secret)) => {
                Credentials::ClientSecret { tenant_id, client_id, client_secret: SecretString::new(secret) }
            }
            (_, client_id, _) => Credentials::ManagedIdentity { client_id },
        };

        Ok(Self { environment, resource, vault_name, key_name, credentials })
    }

    /// Key Vault DNS suffix, e.g. `vault.azure.net`.
    #[must_use]
    pub fn dns_suffix(&self) -> &str {
        self.resource.as_deref().unwrap_or_else(|| self.environment.key_vault_dns_suffix())
    }

    /// Base URL of the vault, with a trailing slash.
    #[must_use]
    pub fn vault_url(&self) -> String {
        format!("https://{}.{}/", self.vault_name, self.dns_suffix())
    }

    /// Resource a managed identity token is requested for.
    #[must_use]
    pub fn token_resource(&self) -> String {
        format!("https://{}", self.dns_suffix())
    }

    /// Scope of a client-credentials token.
    #[must_use]
    pub fn token_scope(&self) -> String {
        format!("https://{}/.default", self.dns_suffix())
    }
}

#[async_trait::async_trait]
impl SealAccess for AzureKeyVaultSeal {
    fn seal_type(&self) -> SealType {
        SealType::AzureKeyVault
    }

    fn key_id(&self) -> String {
        self.key_id.load()
    }

    async fn set_config(&mut self, config: &SealConfig) -> Result<PublicConfig, Error> {
        let settings = VaultSettings::resolve(config)?;

        let client = if self.injected {
            self.client.clone().ok_or(Error::NotConfigured)?
        } else {
            Self::build_client(&settings)?
        };

        // Access check: validates credentials and seeds the current key version.
        let bundle = client.get_key(&settings.key_name).await?;
        let version = parse_key_version(&bundle.key.kid)?;
        self.key_id.store(version);
        self.client = Some(client);
        self.key_name.clone_from(&settings.key_name);

        let VaultSettings { environment, resource, vault_name, key_name, .. } = settings;
        let mut public = PublicConfig::from([
            (ENVIRONMENT.to_string(), environment.name().to_string()),
            (VAULT_NAME.to_string(), vault_name),
            (KEY_NAME.to_string(), key_name),
        ]);
        if let Some(resource) = resource {
            public.insert(RESOURCE.to_string(), resource);
        }
        Ok(public)
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<WrappedBlob, Error> {
        let client = self.client()?;
        let envelope = envelope::encrypt(plaintext)?;
        let dek = Zeroizing::new(BASE64_URL.encode(envelope.key.expose_secret()));

        let result = client.wrap_key(&self.key_name, None, WRAP_ALGORITHM, &dek).await?;
        let version = parse_key_version(&result.kid)?;
        self.key_id.store(version.clone());

        Ok(WrappedBlob::new(
            envelope.ciphertext,
            envelope.iv,
            KeyInfo::wrapped(version, result.value.into_bytes()),
        ))
    }

    async fn decrypt(&self, blob: &WrappedBlob) -> Result<Vec<u8>, Error> {
        let info = blob.validate()?;
        if info.wrapped_key.is_empty() {
            return Err(Error::NilInput("blob has no wrapped key"));
        }
        // An empty version would unwrap with whatever key is current.
        if info.key_id.is_empty() {
            return Err(Error::InvalidKey("blob has no key version".into()));
        }
        let wrapped = std::str::from_utf8(&info.wrapped_key)
            .map_err(|_| Error::backend_msg("wrapped key is not a base64url string"))?;

        let client = self.client()?;
        let result = client.unwrap_key(&self.key_name, &info.key_id, WRAP_ALGORITHM, wrapped).await?;
        let dek = Zeroizing::new(BASE64_URL.decode(result.value.as_bytes()).map_err(AzureError::from)?);
        envelope::decrypt(&dek, &blob.iv, &blob.ciphertext)
    }
}

/// Extracts the key version, the last path segment of a Key Vault `kid`.
///
/// # Errors
///
/// Returns `Error::InvalidKey` when the identifier has no version segment.
pub fn parse_key_version(kid: &str) -> Result<String, Error> {
    let path = kid.split(['?', '#']).next().unwrap_or_default().trim_end_matches('/');
    let mut segments = path.rsplit('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(version), Some(_name), Some("keys")) if !version.is_empty() => Ok(version.to_string()),
        _ => Err(Error::InvalidKey(format!("key identifier has no version: {kid:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::{JsonWebKey, KeyBundle, KeyOperationResult};
    use muhur::config::MapEnv;
    use muhur::error::ErrorKind;
    use std::sync::Mutex;

    // Fake vault: "wrapping" reverses the base64url text, the version is
    // switchable to simulate rotation.
    #[derive(Default)]
    struct FakeVault {
        version: Mutex<String>,
        unwrap_versions: Mutex<Vec<String>>,
    }

    impl FakeVault {
        fn at(version: &str) -> Arc<Self> {
            let vault = Self::default();
            *vault.version.lock().unwrap() = version.to_string();
            Arc::new(vault)
        }

        fn rotate(&self, version: &str) {
            *self.version.lock().unwrap() = version.to_string();
        }

        fn kid(version: &str) -> String {
            format!("https://test.vault.azure.net/keys/seal-key/{version}")
        }
    }

    #[async_trait::async_trait]
    impl KeyVaultApi for FakeVault {
        async fn get_key(&self, key_name: &str) -> Result<KeyBundle, AzureError> {
            if key_name != "seal-key" {
                return Err(AzureError::Status { status: 404, body: String::new() });
            }
            let version = self.version.lock().unwrap().clone();
            Ok(KeyBundle { key: JsonWebKey { kid: Self::kid(&version) } })
        }

        async fn wrap_key(
            &self,
            _key_name: &str,
            version: Option<&str>,
            alg: &str,
            value: &str,
        ) -> Result<KeyOperationResult, AzureError> {
            assert_eq!(alg, WRAP_ALGORITHM);
            assert!(version.is_none());
            let version = self.version.lock().unwrap().clone();
            Ok(KeyOperationResult { kid: Self::kid(&version), value: value.chars().rev().collect() })
        }

        async fn unwrap_key(
            &self,
            _key_name: &str,
            version: &str,
            _alg: &str,
            value: &str,
        ) -> Result<KeyOperationResult, AzureError> {
            self.unwrap_versions.lock().unwrap().push(version.to_string());
            Ok(KeyOperationResult { kid: Self::kid(version), value: value.chars().rev().collect() })
        }
    }

    fn config() -> SealConfig {
        SealConfig::from_pairs([(VAULT_NAME, "test"), (KEY_NAME, "seal-key")]).with_env(MapEnv::new())
    }

    #[test]
    fn test_parse_key_version() {
        assert_eq!(parse_key_version("https://v.vault.azure.net/keys/k/abc123").unwrap(), "abc123");
        assert_eq!(parse_key_version("https://v.vault.azure.net/keys/k/abc123/").unwrap(), "abc123");
        assert!(parse_key_version("https://v.vault.azure.net/keys/k").is_err());
        assert!(parse_key_version("").is_err());
    }

    #[tokio::test]
    async fn test_missing_vault_name() {
        let mut seal = AzureKeyVaultSeal::with_client(FakeVault::at("v1"));
        let config = SealConfig::from_pairs([(KEY_NAME, "seal-key")]).with_env(MapEnv::new());
        let err = seal.set_config(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingConfig);
        assert!(err.to_string().contains("vault_name"));
    }

    #[tokio::test]
    async fn test_env_overrides_names() {
        let mut seal = AzureKeyVaultSeal::with_client(FakeVault::at("v1"));
        let config = SealConfig::from_pairs([(VAULT_NAME, "map-vault"), (KEY_NAME, "other")])
            .with_env(MapEnv::new().with("VAULT_AZUREKEYVAULT_KEY_NAME", "seal-key"));
        let public = seal.set_config(&config).await.unwrap();
        assert_eq!(public.get(KEY_NAME).map(String::as_str), Some("seal-key"));
        assert_eq!(public.get(VAULT_NAME).map(String::as_str), Some("map-vault"));
        assert_eq!(public.get(ENVIRONMENT).map(String::as_str), Some("AzurePublicCloud"));
    }

    #[tokio::test]
    async fn test_unknown_environment() {
        let mut seal = AzureKeyVaultSeal::with_client(FakeVault::at("v1"));
        let config = config().with_env(MapEnv::new().with("AZURE_ENVIRONMENT", "AzureMoonCloud"));
        assert_eq!(seal.set_config(&config).await.unwrap_err().kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_public_config_hides_credentials() {
        let mut seal = AzureKeyVaultSeal::with_client(FakeVault::at("v1"));
        let config = SealConfig::from_pairs([
            (VAULT_NAME, "test"),
            (KEY_NAME, "seal-key"),
            (TENANT_ID, "tenant"),
            (CLIENT_ID, "app"),
            (CLIENT_SECRET, "hunter2"),
        ])
        .with_env(MapEnv::new());
        let public = seal.set_config(&config).await.unwrap();
        assert!(!public.contains_key(CLIENT_SECRET));
        assert!(public.values().all(|v| v != "hunter2"));
    }

    #[tokio::test]
    async fn test_access_check_seeds_key_id() {
        let mut seal = AzureKeyVaultSeal::with_client(FakeVault::at("v7"));
        seal.set_config(&config()).await.unwrap();
        assert_eq!(seal.key_id(), "v7");
    }

    #[tokio::test]
    async fn test_failed_access_check_surfaces() {
        let mut seal = AzureKeyVaultSeal::with_client(FakeVault::at("v1"));
        let config = SealConfig::from_pairs([(VAULT_NAME, "test"), (KEY_NAME, "nope")]).with_env(MapEnv::new());
        assert_eq!(seal.set_config(&config).await.unwrap_err().kind(), ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn test_round_trip_across_rotation() {
        let vault = FakeVault::at("v1");
        let mut seal = AzureKeyVaultSeal::with_client(vault.clone());
        seal.set_config(&config()).await.unwrap();

        let old = seal.encrypt(b"root key").await.unwrap();
        assert_eq!(old.key_id(), Some("v1"));
        assert!(!old.key_info.as_ref().unwrap().wrapped_key.is_empty());

        vault.rotate("v2");
        let new = seal.encrypt(b"root key").await.unwrap();
        assert_eq!(new.key_id(), Some("v2"));
        assert_eq!(seal.key_id(), "v2");
        assert_ne!(old.ciphertext, new.ciphertext);

        assert_eq!(seal.decrypt(&old).await.unwrap(), b"root key");
        assert_eq!(seal.decrypt(&new).await.unwrap(), b"root key");
        assert_eq!(*vault.unwrap_versions.lock().unwrap(), vec!["v1".to_string(), "v2".to_string()]);
    }

    #[tokio::test]
    async fn test_decrypt_rejects_incomplete_blob() {
        let mut seal = AzureKeyVaultSeal::with_client(FakeVault::at("v1"));
        seal.set_config(&config()).await.unwrap();

        let mut blob = seal.encrypt(b"x").await.unwrap();
        blob.key_info.as_mut().unwrap().wrapped_key.clear();
        assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::NilInput);

        blob.key_info = None;
        assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::NilInput);
    }

    #[test]
    fn test_settings_default_to_public_cloud() {
        let settings = VaultSettings::resolve(&config()).unwrap();
        assert_eq!(settings.environment, AzureEnvironment::PublicCloud);
        assert_eq!(settings.vault_url(), "https://test.vault.azure.net/");
        assert_eq!(settings.token_resource(), "https://vault.azure.net");
        assert!(matches!(settings.credentials, Credentials::ManagedIdentity { client_id: None }));
        assert!(AzureKeyVaultSeal::build_client(&settings).is_ok());
    }

    #[test]
    fn test_settings_follow_sovereign_clouds() {
        let china = config().with_env(MapEnv::new().with("AZURE_ENVIRONMENT", "AzureChinaCloud"));
        let settings = VaultSettings::resolve(&china).unwrap();
        assert_eq!(settings.vault_url(), "https://test.vault.azure.cn/");
        assert_eq!(settings.token_scope(), "https://vault.azure.cn/.default");

        let usgov = SealConfig::from_pairs([
            (VAULT_NAME, "gov"),
            (KEY_NAME, "seal-key"),
            (ENVIRONMENT, "azureusgovernmentcloud"),
        ])
        .with_env(MapEnv::new());
        let settings = VaultSettings::resolve(&usgov).unwrap();
        assert_eq!(settings.environment, AzureEnvironment::UsGovernmentCloud);
        assert_eq!(settings.vault_url(), "https://gov.vault.usgovcloudapi.net/");
    }

    #[test]
    fn test_resource_overrides_dns_suffix() {
        let from_map = SealConfig::from_pairs([
            (VAULT_NAME, "test"),
            (KEY_NAME, "seal-key"),
            (ENVIRONMENT, "AzureChinaCloud"),
            (RESOURCE, "vault.example.internal"),
        ])
        .with_env(MapEnv::new());
        let settings = VaultSettings::resolve(&from_map).unwrap();
        assert_eq!(settings.vault_url(), "https://test.vault.example.internal/");
        assert_eq!(settings.token_resource(), "https://vault.example.internal");

        let from_env = config().with_env(MapEnv::new().with("AZURE_AD_RESOURCE", "vault.env.internal"));
        let settings = VaultSettings::resolve(&from_env).unwrap();
        assert_eq!(settings.dns_suffix(), "vault.env.internal");
        assert_eq!(settings.resource.as_deref(), Some("vault.env.internal"));
    }

    #[test]
    fn test_credential_choice() {
        let full = SealConfig::from_pairs([(VAULT_NAME, "test"), (KEY_NAME, "seal-key"), (CLIENT_ID, "app")])
            .with_env(MapEnv::new().with("AZURE_TENANT_ID", "tenant").with("AZURE_CLIENT_SECRET", "hunter2"));
        match VaultSettings::resolve(&full).unwrap().credentials {
            Credentials::ClientSecret { tenant_id, client_id, client_secret } => {
                assert_eq!(tenant_id, "tenant");
                assert_eq!(client_id, "app");
                assert_eq!(client_secret.expose_secret(), "hunter2");
            }
            other => panic!("expected client credentials, got {other:?}"),
        }

        // Without a secret the client id selects a user-assigned identity.
        let partial = SealConfig::from_pairs([
            (VAULT_NAME, "test"),
            (KEY_NAME, "seal-key"),
            (TENANT_ID, "tenant"),
            (CLIENT_ID, "identity"),
        ])
        .with_env(MapEnv::new());
        match VaultSettings::resolve(&partial).unwrap().credentials {
            Credentials::ManagedIdentity { client_id } => assert_eq!(client_id.as_deref(), Some("identity")),
            other => panic!("expected managed identity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decrypt_without_version_sends_nothing() {
        let vault = FakeVault::at("v1");
        let mut seal = AzureKeyVaultSeal::with_client(vault.clone());
        seal.set_config(&config()).await.unwrap();

        let mut blob = seal.encrypt(b"root key").await.unwrap();
        blob.key_info.as_mut().unwrap().key_id.clear();
        assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::InvalidKey);
        assert!(vault.unwrap_versions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_encrypt_before_config() {
        let seal = AzureKeyVaultSeal::new();
        assert_eq!(seal.encrypt(b"x").await.unwrap_err().kind(), ErrorKind::NotConfigured);
    }
}
