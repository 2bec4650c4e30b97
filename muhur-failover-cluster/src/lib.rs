//! Failover cluster seal backend for `muhur`.
//!
//! The DEK of every envelope is encrypted by the cluster crypto provider of a
//! Windows failover cluster resource. The provider's key is not versioned, so
//! the key id is always [`KEY_ID`].
//!
//! The native provider is only available on Windows; elsewhere
//! [`FailoverClusterSeal::new`] returns `Error::Unsupported`.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

#[cfg(windows)]
pub mod native;

use muhur::blob::{KeyInfo, WrappedBlob};
use muhur::config::{PublicConfig, SealConfig};
use muhur::envelope;
use muhur::error::Error;
use muhur::key_id::KeyIdSlot;
use muhur::seal::{SealAccess, SealType};
use parking_lot::RwLock;
use secrecy::ExposeSecret;
use std::sync::Arc;
use thiserror::Error as ThisError;
use zeroize::Zeroizing;

/// Configuration key of the cluster resource.
pub const RESOURCE_NAME: &str = "resource_name";

/// Environment variable overriding [`RESOURCE_NAME`].
pub const RESOURCE_NAME_ENV: &str = "FAILOVERCLUSTER_RESOURCE_NAME";

/// The only key id this backend produces and accepts.
pub const KEY_ID: &str = "1";

const ERROR_ACCESS_DENIED: u32 = 5;

// HRESULTs of the form 0x8007xxxx carry a Win32 code in the low word.
const FACILITY_WIN32_MASK: u32 = 0xFFFF_0000;
const FACILITY_WIN32_ERROR: u32 = 0x8007_0000;

/// Errors specific to cluster provider operations.
#[derive(Debug, ThisError)]
pub enum ClusterError {
    /// A provider call failed
    #[error("{operation} failed with error code {code}")]
    Native {
        /// Provider function
        operation: &'static str,
        /// Win32 error code
        code: u32,
    },
}

impl ClusterError {
    /// Returns the Win32 error code, unwrapping an HRESULT-encoded one.
    #[must_use]
    pub const fn win32_code(&self) -> u32 {
        let Self::Native { code, .. } = self;
        if *code & FACILITY_WIN32_MASK == FACILITY_WIN32_ERROR {
            *code & !FACILITY_WIN32_MASK
        } else {
            *code
        }
    }
}

impl From<ClusterError> for Error {
    fn from(err: ClusterError) -> Self {
        if err.win32_code() == ERROR_ACCESS_DENIED {
            Self::auth("cluster provider denied access", err)
        } else {
            Self::backend("cluster provider failed", err)
        }
    }
}

/// Encrypts and decrypts small payloads under a cluster resource's key.
pub trait ClusterCrypto: Send + Sync {
    /// Encrypts `data`.
    ///
    /// # Errors
    ///
    /// Returns the provider's error.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ClusterError>;

    /// Decrypts `data`.
    ///
    /// # Errors
    ///
    /// Returns the provider's error.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ClusterError>;
}

/// Failover cluster seal.
pub struct FailoverClusterSeal {
    provider: RwLock<Option<Arc<dyn ClusterCrypto>>>,
    injected: Option<Arc<dyn ClusterCrypto>>,
    resource_name: String,
    key_id: KeyIdSlot,
}

impl FailoverClusterSeal {
    /// Creates an unconfigured seal; `set_config` opens the provider.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unsupported` on platforms without the cluster
    /// provider.
    pub fn new() -> Result<Self, Error> {
        if cfg!(windows) {
            Ok(Self::build(None))
        } else {
            Err(Error::Unsupported("failover cluster seal requires Windows".into()))
        }
    }

    /// Creates a seal over `provider` instead of the native one.
    #[must_use]
    pub fn with_provider(provider: Arc<dyn ClusterCrypto>) -> Self {
        Self::build(Some(provider))
    }

    fn build(injected: Option<Arc<dyn ClusterCrypto>>) -> Self {
        Self { provider: RwLock::new(None), injected, resource_name: String::new(), key_id: KeyIdSlot::new() }
    }

    /// Returns the configured resource name.
    #[must_use]
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn provider(&self) -> Result<Arc<dyn ClusterCrypto>, Error> {
        self.provider.read().clone().ok_or(Error::NotConfigured)
    }

    #[cfg(windows)]
    fn open(resource_name: &str) -> Result<Arc<dyn ClusterCrypto>, Error> {
        Ok(Arc::new(native::NativeProvider::open(resource_name)?))
    }

    #[cfg(not(windows))]
    fn open(_resource_name: &str) -> Result<Arc<dyn ClusterCrypto>, Error> {
        Err(Error::Unsupported("failover cluster seal requires Windows".into()))
    }
}

#[async_trait::async_trait]
impl SealAccess for FailoverClusterSeal {
    fn seal_type(&self) -> SealType {
        SealType::FailoverCluster
    }

    fn key_id(&self) -> String {
        self.key_id.load()
    }

    async fn set_config(&mut self, config: &SealConfig) -> Result<PublicConfig, Error> {
        let resource_name = config.required(RESOURCE_NAME, &[RESOURCE_NAME_ENV])?;
        let provider = match &self.injected {
            Some(provider) => provider.clone(),
            None => Self::open(&resource_name)?,
        };
        *self.provider.write() = Some(provider);
        self.resource_name = resource_name.clone();
        self.key_id.store(KEY_ID);
        tracing::info!(resource_name = %resource_name, "failover cluster seal configured");

        Ok(PublicConfig::from([(RESOURCE_NAME.to_string(), resource_name)]))
    }

    async fn finalize(&self) -> Result<(), Error> {
        // Dropping the last reference closes the native handle.
        self.provider.write().take();
        Ok(())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<WrappedBlob, Error> {
        let provider = self.provider()?;
        let envelope = envelope::encrypt(plaintext)?;
        let dek = Zeroizing::new(envelope.key.expose_secret().clone());
        let wrapped = blocking(move || provider.encrypt(&dek)).await?;
        Ok(WrappedBlob::new(envelope.ciphertext, envelope.iv, KeyInfo::wrapped(KEY_ID, wrapped)))
    }

    async fn decrypt(&self, blob: &WrappedBlob) -> Result<Vec<u8>, Error> {
        let info = blob.validate()?;
        if info.key_id != KEY_ID {
            return Err(Error::InvalidKey(format!("cluster key id must be {KEY_ID:?}, got {:?}", info.key_id)));
        }
        if info.wrapped_key.is_empty() {
            return Err(Error::NilInput("blob has no wrapped key"));
        }
        let provider = self.provider()?;
        let wrapped = info.wrapped_key.clone();
        let dek = Zeroizing::new(blocking(move || provider.decrypt(&wrapped)).await?);
        envelope::decrypt(&dek, &blob.iv, &blob.ciphertext)
    }
}

// Provider calls block on the cluster service; they run on the blocking pool.
async fn blocking<T, F>(call: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, ClusterError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| Error::backend("cluster provider task failed", err))?
        .map_err(Error::from)
}
