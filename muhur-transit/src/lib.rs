//! Transit seal backend for `muhur`.
//!
//! Uses the transit engine of a Vault-compatible secret store as the KMS.
//! The plaintext itself is sent to the engine; the returned
//! `vN:<key id>:<body>` string is stored as the blob's ciphertext, and the
//! key id segment is tracked as the seal's key id.
//!
//! When a token is configured the seal renews it once during `set_config`
//! and, if that succeeds, keeps renewing it in the background until
//! `finalize`.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod renewer;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use client::{HttpTransitClient, TlsOptions, TransitApi, TransitOptions};
use muhur::blob::{KeyInfo, WrappedBlob};
use muhur::config::{PublicConfig, SealConfig};
use muhur::error::{classify_status, Error};
use muhur::key_id::KeyIdSlot;
use muhur::seal::{SealAccess, SealType};
use renewer::Renewer;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

// Configuration keys.
pub const MOUNT_PATH: &str = "mount_path";
pub const KEY_NAME: &str = "key_name";
pub const ADDRESS: &str = "address";
pub const TOKEN: &str = "token";
pub const NAMESPACE: &str = "namespace";
pub const DISABLE_RENEWAL: &str = "disable_renewal";
pub const TLS_CA_CERT: &str = "tls_ca_cert";
pub const TLS_CA_PATH: &str = "tls_ca_path";
pub const TLS_CLIENT_CERT: &str = "tls_client_cert";
pub const TLS_CLIENT_KEY: &str = "tls_client_key";
pub const TLS_SERVER_NAME: &str = "tls_server_name";
pub const TLS_SKIP_VERIFY: &str = "tls_skip_verify";

/// Address used when none is configured.
pub const DEFAULT_ADDRESS: &str = "https://127.0.0.1:8200";

/// Payload encrypted by `set_config` to check key access.
pub const CHECK_PLAINTEXT: &[u8] = b"a";

/// Errors specific to transit operations.
#[derive(Debug, ThisError)]
pub enum TransitError {
    /// Transport failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The secret store answered with a non-success status
    #[error("transit returned {status}: {errors}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Reported errors
        errors: String,
    },

    /// TLS material could not be loaded
    #[error("transit TLS configuration: {0}")]
    Tls(String),

    /// Address is not a usable URL
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Response could not be interpreted
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Base64 decoding error
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<TransitError> for Error {
    fn from(err: TransitError) -> Self {
        match err {
            TransitError::Http(e) if e.is_timeout() || e.is_connect() => Self::unavailable("transit unreachable", e),
            TransitError::Http(e) => Self::backend("transit request failed", e),
            TransitError::Status { status, errors } => {
                classify_status(status, format!("transit returned {status}: {errors}"))
            }
            TransitError::Tls(msg) => Self::invalid_config("tls", msg),
            TransitError::InvalidAddress(msg) => Self::invalid_config(ADDRESS, msg),
            TransitError::UnexpectedResponse(msg) => Self::backend_msg(msg),
            err @ TransitError::Base64(_) => Self::backend("malformed plaintext from transit", err),
        }
    }
}

/// Extracts the key id from a `vN:<key id>:<body>` ciphertext.
///
/// # Errors
///
/// Returns `Error::Backend` if the string does not have three segments or
/// the key id segment is empty.
///
/// # Example
///
/// ```
/// use muhur_transit::parse_key_id;
///
/// assert_eq!(parse_key_id("v1:test-key:c2VhbGVk").unwrap(), "test-key");
/// ```
pub fn parse_key_id(ciphertext: &str) -> Result<String, Error> {
    let mut parts = ciphertext.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(key_id), Some(_)) if !key_id.is_empty() => Ok(key_id.to_string()),
        _ => Err(Error::backend_msg("transit ciphertext is not in vN:<key id>:<body> form")),
    }
}

/// Transit seal.
#[derive(Default)]
pub struct TransitSeal {
    client: Option<Arc<dyn TransitApi>>,
    injected: bool,
    mount_path: String,
    key_name: String,
    key_id: KeyIdSlot,
    renewer: Mutex<Option<Renewer>>,
}

impl TransitSeal {
    /// Creates an unconfigured seal; `set_config` builds the client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a seal that talks to `client` instead of building its own.
    #[must_use]
    pub fn with_client(client: Arc<dyn TransitApi>) -> Self {
        Self { client: Some(client), injected: true, ..Self::default() }
    }

    /// Returns true while a background renewer is running.
    pub async fn is_renewing(&self) -> bool {
        self.renewer.lock().await.as_ref().is_some_and(|r| !r.is_finished())
    }

    fn client(&self) -> Result<&dyn TransitApi, Error> {
        self.client.as_deref().ok_or(Error::NotConfigured)
    }

    fn tls_options(config: &SealConfig) -> Result<TlsOptions, Error> {
        Ok(TlsOptions {
            ca_cert: config.optional(TLS_CA_CERT, &["VAULT_CACERT"]).map(PathBuf::from),
            ca_path: config.optional(TLS_CA_PATH, &["VAULT_CAPATH"]).map(PathBuf::from),
            client_cert: config.optional(TLS_CLIENT_CERT, &["VAULT_CLIENT_CERT"]).map(PathBuf::from),
            client_key: config.optional(TLS_CLIENT_KEY, &["VAULT_CLIENT_KEY"]).map(PathBuf::from),
            server_name: config.optional(TLS_SERVER_NAME, &["VAULT_TLS_SERVER_NAME"]),
            skip_verify: config.flag(TLS_SKIP_VERIFY, &["VAULT_SKIP_VERIFY"], false)?,
        })
    }

    async fn start_renewer(&self, client: Arc<dyn TransitApi>) {
        match client.renew_self().await {
            Ok(lease) => {
                *self.renewer.lock().await = Some(Renewer::spawn(client, lease));
            }
            Err(err) => tracing::warn!(error = %err, "initial transit token renewal failed, not renewing"),
        }
    }

    async fn stop_renewer(&self) {
        let renewer = self.renewer.lock().await.take();
        if let Some(renewer) = renewer {
            renewer.stop().await;
        }
    }
}

#[async_trait::async_trait]
impl SealAccess for TransitSeal {
    fn seal_type(&self) -> SealType {
        SealType::Transit
    }

    fn key_id(&self) -> String {
        self.key_id.load()
    }

    async fn set_config(&mut self, config: &SealConfig) -> Result<PublicConfig, Error> {
        let mount_path = config.required(MOUNT_PATH, &["VAULT_TRANSIT_SEAL_MOUNT_PATH"])?;
        let key_name = config.required(KEY_NAME, &["VAULT_TRANSIT_SEAL_KEY_NAME"])?;
        let disable_renewal = config.flag(DISABLE_RENEWAL, &["VAULT_TRANSIT_SEAL_DISABLE_RENEWAL"], false)?;
        let address = config.or_default(ADDRESS, &["VAULT_ADDR"], DEFAULT_ADDRESS);
        let namespace = config.optional(NAMESPACE, &["VAULT_NAMESPACE"]);
        let token = config.optional(TOKEN, &["VAULT_TOKEN"]);
        let tls = Self::tls_options(config)?;

        self.stop_renewer().await;
        let client = if self.injected {
            self.client.clone().ok_or(Error::NotConfigured)?
        } else {
            let options = TransitOptions {
                address: address.clone(),
                token: token.clone().map(SecretString::new),
                namespace: namespace.clone(),
                tls,
            };
            let client: Arc<dyn TransitApi> = Arc::new(HttpTransitClient::connect(options).await?);
            self.client = Some(client.clone());
            client
        };
        self.mount_path = mount_path.clone();
        self.key_name = key_name.clone();

        if token.is_some() && !disable_renewal {
            self.start_renewer(client).await;
        }

        if let Err(err) = self.encrypt(CHECK_PLAINTEXT).await {
            self.stop_renewer().await;
            if !self.injected {
                self.client = None;
            }
            return Err(err);
        }
        tracing::info!(mount_path = %mount_path, key_name = %key_name, key_id = %self.key_id.load(), "transit seal configured");

        let mut public = PublicConfig::from([
            (ADDRESS.to_string(), address),
            (MOUNT_PATH.to_string(), mount_path),
            (KEY_NAME.to_string(), key_name),
            (DISABLE_RENEWAL.to_string(), disable_renewal.to_string()),
        ]);
        if let Some(namespace) = namespace {
            public.insert(NAMESPACE.to_string(), namespace);
        }
        Ok(public)
    }

    async fn finalize(&self) -> Result<(), Error> {
        self.stop_renewer().await;
        Ok(())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<WrappedBlob, Error> {
        let client = self.client()?;
        let encoded = Zeroizing::new(STANDARD.encode(plaintext));
        let ciphertext = client.encrypt(&self.mount_path, &self.key_name, &encoded).await?;
        let key_id = parse_key_id(&ciphertext)?;
        self.key_id.store(key_id.clone());

        // The engine's string is the ciphertext; there is no local IV or
        // wrapped key.
        Ok(WrappedBlob::new(ciphertext.into_bytes(), Vec::new(), KeyInfo::unwrapped(key_id)))
    }

    async fn decrypt(&self, blob: &WrappedBlob) -> Result<Vec<u8>, Error> {
        blob.validate()?;
        let ciphertext = std::str::from_utf8(&blob.ciphertext)
            .map_err(|_| Error::backend_msg("blob ciphertext is not a transit string"))?;

        let client = self.client()?;
        let encoded = Zeroizing::new(client.decrypt(&self.mount_path, &self.key_name, ciphertext).await?);
        Ok(STANDARD.decode(encoded.as_bytes()).map_err(TransitError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_id() {
        assert_eq!(parse_key_id("v1:test-key:abc").unwrap(), "test-key");
        assert_eq!(parse_key_id("vault:v3:abc:def").unwrap(), "v3");
    }

    #[test]
    fn test_parse_key_id_rejects_malformed() {
        for input in ["", "v1", "v1:key", "v1::body"] {
            assert!(parse_key_id(input).is_err(), "{input:?} should be rejected");
        }
    }

    #[test]
    fn test_error_mapping() {
        let err: Error = TransitError::Status { status: 503, errors: "sealed".into() }.into();
        assert!(err.is_transient());
        let err: Error = TransitError::Tls("bad pem".into()).into();
        assert_eq!(err.kind(), muhur::error::ErrorKind::InvalidConfig);
    }
}
