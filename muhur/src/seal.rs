//! Seal access abstraction and the stateful facade around it.

use crate::blob::WrappedBlob;
use crate::config::{PublicConfig, SealConfig};
use crate::error::Error;
use crate::metrics::{default_sink, MetricsSink};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Backend tag of a seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SealType {
    /// Azure Key Vault
    AzureKeyVault,
    /// Oracle Cloud Infrastructure KMS
    OciKms,
    /// Another secret store's transit engine
    Transit,
    /// Versioned key files on local disk
    LocalDisk,
    /// Windows failover cluster crypto provider
    FailoverCluster,
    /// Passthrough; the outer system performs the wrap
    Shamir,
}

impl SealType {
    /// All seal types, in dispatch order.
    pub const ALL: [Self; 6] = [
        Self::AzureKeyVault,
        Self::OciKms,
        Self::Transit,
        Self::LocalDisk,
        Self::FailoverCluster,
        Self::Shamir,
    ];

    /// Returns the tag used in configuration and metric keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AzureKeyVault => "azurekeyvault",
            Self::OciKms => "ocikms",
            Self::Transit => "transit",
            Self::LocalDisk => "localdisk",
            Self::FailoverCluster => "failovercluster",
            Self::Shamir => "shamir",
        }
    }
}

impl fmt::Display for SealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SealType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == tag)
            .ok_or_else(|| Error::invalid_config("type", format!("unknown seal type {s:?}")))
    }
}

/// Backend contract every seal variant implements.
///
/// Implementations must be thread-safe: `encrypt`, `decrypt` and `key_id` are
/// called concurrently. `key_id` must never block.
///
/// # Example
///
/// ```rust,ignore
/// use muhur::prelude::*;
///
/// struct MySeal { key_id: KeyIdSlot }
///
/// #[async_trait::async_trait]
/// impl SealAccess for MySeal {
///     fn seal_type(&self) -> SealType { SealType::Shamir }
///     fn key_id(&self) -> String { self.key_id.load() }
///     // ... set_config, encrypt, decrypt
/// }
/// ```
#[async_trait::async_trait]
pub trait SealAccess: Send + Sync {
    /// Returns the backend tag.
    fn seal_type(&self) -> SealType;

    /// Returns the last observed key version. Empty before configuration.
    fn key_id(&self) -> String;

    /// Resolves configuration, builds backend clients and checks access.
    ///
    /// Returns the non-sensitive resolved values.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingConfig`/`Error::InvalidConfig` for bad
    /// configuration, or the access check's error.
    async fn set_config(&mut self, config: &SealConfig) -> Result<PublicConfig, Error>;

    /// Optional start-up hook.
    ///
    /// # Errors
    ///
    /// Backend specific.
    async fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Releases backend resources. Must be idempotent.
    ///
    /// # Errors
    ///
    /// Backend specific.
    async fn finalize(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Encrypts `plaintext` and wraps its key.
    ///
    /// # Errors
    ///
    /// Backend specific.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<WrappedBlob, Error>;

    /// Unwraps the blob's key and decrypts its ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `Error::NilInput` for incomplete blobs, `Error::AuthFailure` on
    /// tag mismatch, or the backend's error.
    async fn decrypt(&self, blob: &WrappedBlob) -> Result<Vec<u8>, Error>;
}

/// Lifecycle state of a [`Seal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SealState {
    /// Created, not configured
    New = 0,
    /// `set_config` succeeded
    Configured = 1,
    /// `init` or a first operation succeeded
    Running = 2,
    /// `finalize` was called
    Finalized = 3,
}

impl SealState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Configured,
            2 => Self::Running,
            _ => Self::Finalized,
        }
    }
}

#[derive(Clone, Copy)]
enum Operation {
    Init,
    Encrypt,
    Decrypt,
}

impl Operation {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        }
    }
}

/// Stateful facade over a [`SealAccess`] variant.
///
/// Enforces the `New -> Configured -> Running -> Finalized` lifecycle and
/// emits metrics at the outer boundary of every operation, so samples include
/// the backend round trip.
///
/// # Example
///
/// ```ignore
/// use muhur::prelude::*;
/// use muhur_local_disk::LocalDiskSeal;
///
/// let mut seal = Seal::new(Box::new(LocalDiskSeal::new()));
/// seal.set_config(&SealConfig::from_pairs([("key_glob", "/etc/seal/*.key")])).await?;
///
/// let blob = seal.encrypt(b"master key").await?;
/// let plaintext = seal.decrypt(&blob).await?;
/// ```
pub struct Seal {
    access: Box<dyn SealAccess>,
    state: AtomicU8,
    metrics: Arc<dyn MetricsSink>,
}

impl Seal {
    /// Wraps `access`, reporting to the default metrics sink.
    #[must_use]
    pub fn new(access: Box<dyn SealAccess>) -> Self {
        Self::with_metrics(access, default_sink())
    }

    /// Wraps `access`, reporting to `metrics`.
    #[must_use]
    pub fn with_metrics(access: Box<dyn SealAccess>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { access, state: AtomicU8::new(SealState::New as u8), metrics }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SealState {
        SealState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the backend tag.
    #[must_use]
    pub fn seal_type(&self) -> SealType {
        self.access.seal_type()
    }

    /// Returns the last observed key version.
    #[must_use]
    pub fn key_id(&self) -> String {
        self.access.key_id()
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn access(&self) -> &dyn SealAccess {
        self.access.as_ref()
    }

    /// Configures the backend.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after `finalize`, otherwise the backend's error.
    pub async fn set_config(&mut self, config: &SealConfig) -> Result<PublicConfig, Error> {
        if self.state() == SealState::Finalized {
            return Err(Error::Closed);
        }
        let public = self.access.set_config(config).await?;
        // Reconfiguring a running seal keeps it running.
        let _ = self.state.compare_exchange(
            SealState::New as u8,
            SealState::Configured as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tracing::info!(seal = %self.seal_type(), key_id = %self.key_id(), "seal configured");
        Ok(public)
    }

    /// Runs the backend's start-up hook.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConfigured` before `set_config`, `Error::Closed` after
    /// `finalize`, otherwise the backend's error.
    pub async fn init(&self) -> Result<(), Error> {
        self.check_usable()?;
        let start = Instant::now();
        let result = self.access.init().await;
        self.record(Operation::Init, start, result.is_ok());
        result?;
        self.mark_running();
        Ok(())
    }

    /// Releases backend resources. Further calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns the backend's error from the first call.
    pub async fn finalize(&self) -> Result<(), Error> {
        let previous = self.state.swap(SealState::Finalized as u8, Ordering::AcqRel);
        if SealState::from_u8(previous) == SealState::Finalized {
            return Ok(());
        }
        tracing::info!(seal = %self.seal_type(), "finalizing seal");
        self.access.finalize().await
    }

    /// Encrypts `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConfigured` before `set_config`, `Error::Closed` after
    /// `finalize`, otherwise the backend's error.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<WrappedBlob, Error> {
        self.check_usable()?;
        let start = Instant::now();
        let result = self.access.encrypt(plaintext).await;
        self.record(Operation::Encrypt, start, result.is_ok());
        match &result {
            Ok(blob) => {
                tracing::debug!(seal = %self.seal_type(), key_id = ?blob.key_id(), "encrypted value");
                self.mark_running();
            }
            Err(err) => tracing::warn!(seal = %self.seal_type(), error = %err, "error encrypting with seal"),
        }
        result
    }

    /// Decrypts `blob`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConfigured` before `set_config`, `Error::Closed` after
    /// `finalize`, otherwise the backend's error.
    pub async fn decrypt(&self, blob: &WrappedBlob) -> Result<Vec<u8>, Error> {
        self.check_usable()?;
        let start = Instant::now();
        let result = self.access.decrypt(blob).await;
        self.record(Operation::Decrypt, start, result.is_ok());
        match &result {
            Ok(_) => {
                tracing::debug!(seal = %self.seal_type(), key_id = ?blob.key_id(), "decrypted value");
                self.mark_running();
            }
            Err(err) => tracing::debug!(seal = %self.seal_type(), key_id = ?blob.key_id(), error = %err, "error decrypting with seal"),
        }
        result
    }

    fn check_usable(&self) -> Result<(), Error> {
        match self.state() {
            SealState::New => Err(Error::NotConfigured),
            SealState::Finalized => Err(Error::Closed),
            SealState::Configured | SealState::Running => Ok(()),
        }
    }

    fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            SealState::Configured as u8,
            SealState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn record(&self, op: Operation, start: Instant, ok: bool) {
        let tag = self.seal_type().as_str();
        let op = op.as_str();

        self.metrics.measure_since(&["seal", op, "time"], start);
        self.metrics.measure_since(&["seal", tag, op, "time"], start);
        self.metrics.incr_counter(&["seal", op], 1);
        self.metrics.incr_counter(&["seal", tag, op], 1);
        if !ok {
            self.metrics.incr_counter(&["seal", op, "error"], 1);
            self.metrics.incr_counter(&["seal", tag, op, "error"], 1);
        }
    }
}

impl fmt::Debug for Seal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seal")
            .field("seal_type", &self.seal_type())
            .field("state", &self.state())
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}
