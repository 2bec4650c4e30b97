//! OCI KMS seal backend for `muhur`.
//!
//! The DEK of every envelope is encrypted by an OCI Vault master key through
//! the vault's crypto endpoint. The management endpoint reports the key's
//! current version, which is tracked as the seal's key id.
//!
//! # Authentication
//!
//! - `auth_type_api_key = true`: user API key from the OCI CLI config file
//!   (`config_file`, `config_profile`).
//! - otherwise: principal session token from `OCI_RESOURCE_PRINCIPAL_RPST`
//!   signed with `OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM`, as provided by the
//!   platform to instances and functions.
//!
//! # Retries
//!
//! Every call is retried on 5xx up to five attempts with a
//! `2^(attempt-1)` second backoff. Dropping the operation's future cancels
//! any pending retry.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod retry;
pub mod signer;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use client::{
    DecryptRequest, EncryptRequest, HttpCryptoClient, HttpManagementClient, OciCryptoApi, OciManagementApi,
};
use muhur::blob::{KeyInfo, WrappedBlob};
use muhur::config::{PublicConfig, SealConfig};
use muhur::envelope;
use muhur::error::{classify_status, Error};
use muhur::key_id::KeyIdSlot;
use muhur::seal::{SealAccess, SealType};
use retry::RetryPolicy;
use secrecy::ExposeSecret;
use signer::{ApiKeyProfile, RequestSigner, SESSION_KEY_ENV, SESSION_TOKEN_ENV};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use zeroize::Zeroizing;

// Configuration keys.
pub const KEY_ID: &str = "key_id";
pub const CRYPTO_ENDPOINT: &str = "crypto_endpoint";
pub const MANAGEMENT_ENDPOINT: &str = "management_endpoint";
pub const AUTH_TYPE_API_KEY: &str = "auth_type_api_key";
pub const CONFIG_FILE: &str = "config_file";
pub const CONFIG_PROFILE: &str = "config_profile";

/// Payload wrapped by `set_config` to check key access.
pub const CHECK_PLAINTEXT: &[u8] = b"muhur-oci-check";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors specific to OCI KMS operations.
#[derive(Debug, ThisError)]
pub enum OciError {
    /// Transport failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// OCI answered with a non-success status
    #[error("oci returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Signing credentials could not be loaded
    #[error("oci credentials: {0}")]
    Credentials(String),

    /// Endpoint is not a usable URL
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Response could not be interpreted
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Base64 decoding error
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl OciError {
    /// Returns true for server errors covered by the retry policy.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Status { status: 500..=599, .. })
    }
}

impl From<OciError> for Error {
    fn from(err: OciError) -> Self {
        match err {
            OciError::Http(e) if e.is_timeout() || e.is_connect() => Self::unavailable("oci unreachable", e),
            OciError::Http(e) => Self::backend("oci request failed", e),
            OciError::Status { status, body } => classify_status(status, format!("oci returned {status}: {body}")),
            err @ OciError::Credentials(_) => Self::auth("cannot sign oci requests", err),
            OciError::InvalidEndpoint(msg) => Self::invalid_config("endpoint", msg),
            OciError::UnexpectedResponse(msg) => Self::backend_msg(msg),
            err @ OciError::Base64(_) => Self::backend("malformed key from oci", err),
        }
    }
}

/// OCI KMS seal.
#[derive(Default)]
pub struct OciKmsSeal {
    crypto: Option<Arc<dyn OciCryptoApi>>,
    management: Option<Arc<dyn OciManagementApi>>,
    injected: bool,
    key_id: String,
    current_version: KeyIdSlot,
    retry: RetryPolicy,
}

impl OciKmsSeal {
    /// Creates an unconfigured seal; `set_config` builds the clients.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a seal that talks to the given clients instead of building
    /// its own.
    #[must_use]
    pub fn with_clients(crypto: Arc<dyn OciCryptoApi>, management: Arc<dyn OciManagementApi>) -> Self {
        Self { crypto: Some(crypto), management: Some(management), injected: true, ..Self::default() }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn clients(&self) -> Result<(&dyn OciCryptoApi, &dyn OciManagementApi), Error> {
        match (self.crypto.as_deref(), self.management.as_deref()) {
            (Some(crypto), Some(management)) => Ok((crypto, management)),
            _ => Err(Error::NotConfigured),
        }
    }

    fn signer(config: &SealConfig, api_key: bool) -> Result<RequestSigner, Error> {
        if api_key {
            let path = config
                .optional(CONFIG_FILE, &["OCI_CONFIG_FILE"])
                .map_or_else(signer::default_config_file, PathBuf::from);
            let profile = config.or_default(CONFIG_PROFILE, &["OCI_CONFIG_PROFILE"], "DEFAULT");
            tracing::debug!(config_file = %path.display(), profile = %profile, "using oci api key");
            let profile = ApiKeyProfile::load(&path, &profile)?;
            return Ok(RequestSigner::from_api_key(&profile)?);
        }

        let env = config.env();
        let token = env
            .var(SESSION_TOKEN_ENV)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::missing_config(SESSION_TOKEN_ENV))?;
        let key = env
            .var(SESSION_KEY_ENV)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::missing_config(SESSION_KEY_ENV))?;
        tracing::debug!("using oci principal session token");
        Ok(RequestSigner::from_session_token(&token, &key)?)
    }

    fn build_clients(
        config: &SealConfig,
        api_key: bool,
        crypto_endpoint: &str,
        management_endpoint: &str,
    ) -> Result<(Arc<dyn OciCryptoApi>, Arc<dyn OciManagementApi>), Error> {
        let signer = Arc::new(Self::signer(config, api_key)?);
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().map_err(OciError::from)?;
        let crypto = HttpCryptoClient::new(http.clone(), crypto_endpoint, signer.clone())?;
        let management = HttpManagementClient::new(http, management_endpoint, signer)?;
        Ok((Arc::new(crypto), Arc::new(management)))
    }

    async fn current_key_version(&self, management: &dyn OciManagementApi) -> Result<String, OciError> {
        let key = self.retry.run("get_key", || management.get_key(&self.key_id)).await?;
        Ok(key.current_key_version)
    }
}

#[async_trait::async_trait]
impl SealAccess for OciKmsSeal {
    fn seal_type(&self) -> SealType {
        SealType::OciKms
    }

    fn key_id(&self) -> String {
        self.current_version.load()
    }

    async fn set_config(&mut self, config: &SealConfig) -> Result<PublicConfig, Error> {
        let key_id = config.required(KEY_ID, &["VAULT_OCIKMS_SEAL_KEY_ID"])?;
        let crypto_endpoint = config.required(CRYPTO_ENDPOINT, &["VAULT_OCIKMS_CRYPTO_ENDPOINT"])?;
        let management_endpoint = config.required(MANAGEMENT_ENDPOINT, &["VAULT_OCIKMS_MANAGEMENT_ENDPOINT"])?;
        let api_key = config.flag(AUTH_TYPE_API_KEY, &[], false)?;

        if !self.injected {
            let (crypto, management) = Self::build_clients(config, api_key, &crypto_endpoint, &management_endpoint)?;
            self.crypto = Some(crypto);
            self.management = Some(management);
        }
        self.key_id = key_id.clone();

        // Access check with a non-empty payload; also seeds the current version.
        if let Err(err) = self.encrypt(CHECK_PLAINTEXT).await {
            if !self.injected {
                self.crypto = None;
                self.management = None;
            }
            return Err(err);
        }

        Ok(PublicConfig::from([
            (KEY_ID.to_string(), key_id),
            (CRYPTO_ENDPOINT.to_string(), crypto_endpoint),
            (MANAGEMENT_ENDPOINT.to_string(), management_endpoint),
            (AUTH_TYPE_API_KEY.to_string(), api_key.to_string()),
        ]))
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<WrappedBlob, Error> {
        let (crypto, management) = self.clients()?;
        let envelope = envelope::encrypt(plaintext)?;
        let request = EncryptRequest {
            key_id: self.key_id.clone(),
            plaintext: STANDARD.encode(envelope.key.expose_secret()),
            key_version_id: None,
        };
        let response = self.retry.run("encrypt", || crypto.encrypt(&request)).await?;

        // The version reported by the wrap is authoritative for the blob;
        // the current version may already differ under concurrent rotation.
        let blob_version = match (response.key_version_id, self.current_key_version(management).await) {
            (Some(version), Ok(current)) => {
                self.current_version.store(current);
                version
            }
            (Some(version), Err(err)) => {
                tracing::warn!(error = %err, "failed to read current oci key version");
                version
            }
            (None, Ok(current)) => {
                self.current_version.store(current.clone());
                current
            }
            (None, Err(err)) => return Err(err.into()),
        };

        Ok(WrappedBlob::new(
            envelope.ciphertext,
            envelope.iv,
            KeyInfo::wrapped(blob_version, response.ciphertext.into_bytes()),
        ))
    }

    async fn decrypt(&self, blob: &WrappedBlob) -> Result<Vec<u8>, Error> {
        let info = blob.validate()?;
        if info.wrapped_key.is_empty() {
            return Err(Error::NilInput("blob has no wrapped key"));
        }
        let ciphertext = std::str::from_utf8(&info.wrapped_key)
            .map_err(|_| Error::backend_msg("wrapped key is not an oci ciphertext string"))?;

        let (crypto, _) = self.clients()?;
        let request = DecryptRequest {
            key_id: self.key_id.clone(),
            ciphertext: ciphertext.to_string(),
            key_version_id: Some(info.key_id.clone()),
        };
        let response = self.retry.run("decrypt", || crypto.decrypt(&request)).await?;
        let dek = Zeroizing::new(STANDARD.decode(response.plaintext.as_bytes()).map_err(OciError::from)?);
        envelope::decrypt(&dek, &blob.iv, &blob.ciphertext)
    }
}
