//! Error types for seal operations.

use std::fmt;

/// Boxed error used to carry the underlying cause of a failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for seal operations.
///
/// Every variant maps to exactly one [`ErrorKind`]. Variants raised on top of a
/// lower-level failure keep that failure as their `source`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required configuration key was not provided by any source
    #[error("missing required configuration: {key}")]
    MissingConfig {
        /// Configuration key that could not be resolved
        key: String,
    },

    /// A configuration value is present but unusable
    #[error("invalid configuration for {key}: {reason}")]
    InvalidConfig {
        /// Offending configuration key
        key: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Credentials were rejected or an authentication tag did not verify
    #[error("authentication failed: {message}")]
    AuthFailure {
        /// Context for the failure
        message: String,
        /// Underlying error, if any
        #[source]
        source: Option<BoxError>,
    },

    /// Transient network or server-side failure
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Context for the failure
        message: String,
        /// Underlying error, if any
        #[source]
        source: Option<BoxError>,
    },

    /// The backend replied with something that is neither transient nor an
    /// authentication or lookup failure
    #[error("backend error: {message}")]
    Backend {
        /// Context for the failure
        message: String,
        /// Underlying error, if any
        #[source]
        source: Option<BoxError>,
    },

    /// Referenced key or key version could not be resolved
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Input was missing (empty ciphertext, absent key info)
    #[error("missing input: {0}")]
    NilInput(&'static str),

    /// Key version is not accepted by this backend
    #[error("invalid key id: {0}")]
    InvalidKey(String),

    /// No key is available to encrypt with
    #[error("no key available: {0}")]
    NoKeyAvailable(String),

    /// A key file holds fewer bytes than a key needs
    #[error("key too short: {path} holds {actual} bytes (need {expected})")]
    KeyTooShort {
        /// Path of the offending key source
        path: String,
        /// Bytes required
        expected: usize,
        /// Bytes found
        actual: usize,
    },

    /// The secure random source failed
    #[error("random source failure: {0}")]
    RandomFailure(String),

    /// The AEAD cipher rejected its inputs
    #[error("cipher failure: {0}")]
    CipherFailure(String),

    /// Operation attempted before `set_config` succeeded
    #[error("seal is not configured")]
    NotConfigured,

    /// Operation attempted after `finalize`
    #[error("seal is finalized")]
    Closed,

    /// Backend is not available on this platform or in this mode
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Semantic classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingConfig,
    InvalidConfig,
    AuthFailure,
    BackendUnavailable,
    Backend,
    KeyNotFound,
    NilInput,
    InvalidKey,
    NoKeyAvailable,
    KeyTooShort,
    RandomFailure,
    CipherFailure,
    NotConfigured,
    Closed,
    Unsupported,
    Io,
}

impl Error {
    /// Returns the semantic kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingConfig { .. } => ErrorKind::MissingConfig,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::AuthFailure { .. } => ErrorKind::AuthFailure,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::KeyNotFound(_) => ErrorKind::KeyNotFound,
            Self::NilInput(_) => ErrorKind::NilInput,
            Self::InvalidKey(_) => ErrorKind::InvalidKey,
            Self::NoKeyAvailable(_) => ErrorKind::NoKeyAvailable,
            Self::KeyTooShort { .. } => ErrorKind::KeyTooShort,
            Self::RandomFailure(_) => ErrorKind::RandomFailure,
            Self::CipherFailure(_) => ErrorKind::CipherFailure,
            Self::NotConfigured => ErrorKind::NotConfigured,
            Self::Closed => ErrorKind::Closed,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Creates a `MissingConfig` error for `key`.
    pub fn missing_config(key: impl Into<String>) -> Self {
        Self::MissingConfig { key: key.into() }
    }

    /// Creates an `InvalidConfig` error for `key`.
    pub fn invalid_config(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidConfig { key: key.into(), reason: reason.to_string() }
    }

    /// AEAD tag mismatch.
    #[must_use]
    pub fn tag_mismatch() -> Self {
        Self::AuthFailure {
            message: "ciphertext may be corrupted, tampered, or sealed under another key".into(),
            source: None,
        }
    }

    /// Creates an `AuthFailure` with an underlying cause.
    pub fn auth(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::AuthFailure { message: message.into(), source: Some(source.into()) }
    }

    /// Creates a `BackendUnavailable` with an underlying cause.
    pub fn unavailable(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::BackendUnavailable { message: message.into(), source: Some(source.into()) }
    }

    /// Creates a `Backend` error with an underlying cause.
    pub fn backend(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Backend { message: message.into(), source: Some(source.into()) }
    }

    /// Creates a `Backend` error without an underlying cause.
    pub fn backend_msg(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into(), source: None }
    }

    /// Returns true if the error is transient and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Classifies an HTTP status code from a key management backend.
///
/// 401/403 are authentication failures, 404 a missing key, 5xx a transient
/// outage. Everything else is a plain backend error.
#[must_use]
pub fn classify_status(status: u16, message: String) -> Error {
    match status {
        401 | 403 => Error::AuthFailure { message, source: None },
        404 => Error::KeyNotFound(message),
        500..=599 => Error::BackendUnavailable { message, source: None },
        _ => Error::Backend { message, source: None },
    }
}
