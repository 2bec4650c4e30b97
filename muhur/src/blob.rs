//! Wrapped blob produced by `encrypt` and consumed by `decrypt`.
//!
//! The blob carries everything needed to reverse an encryption except the
//! backend's long-lived key:
//! - AEAD ciphertext
//! - AEAD nonce
//! - the key version used and the backend's wrapped form of the DEK
//!
//! Storage layout is up to the caller; both types derive serde traits.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Identifies the wrapping key version and carries the wrapped DEK.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Backend-scoped identifier of the key version used
    pub key_id: String,
    /// Backend-specific wrapped form of the DEK; empty when the backend seals
    /// the payload directly
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wrapped_key: Vec<u8>,
}

/// Serializable output of a seal's `encrypt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedBlob {
    /// AEAD output (or the backend's own ciphertext string for Transit)
    pub ciphertext: Vec<u8>,
    /// AEAD nonce
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iv: Vec<u8>,
    /// Key version and wrapped DEK
    pub key_info: Option<KeyInfo>,
}

impl WrappedBlob {
    /// Creates a blob with key info attached.
    #[must_use]
    pub fn new(ciphertext: Vec<u8>, iv: Vec<u8>, key_info: KeyInfo) -> Self {
        Self { ciphertext, iv, key_info: Some(key_info) }
    }

    /// Returns the key info, or `NilInput` when it is absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::NilInput` if the blob has no key info.
    pub fn require_key_info(&self) -> Result<&KeyInfo, Error> {
        self.key_info.as_ref().ok_or(Error::NilInput("blob has no key info"))
    }

    /// Checks the blob is complete enough to be decrypted.
    ///
    /// # Errors
    ///
    /// Returns `Error::NilInput` if the ciphertext or the key info is missing.
    pub fn validate(&self) -> Result<&KeyInfo, Error> {
        if self.ciphertext.is_empty() {
            return Err(Error::NilInput("blob has no ciphertext"));
        }
        self.require_key_info()
    }

    /// Returns the key id, if the blob carries key info.
    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.key_info.as_ref().map(|info| info.key_id.as_str())
    }
}

impl KeyInfo {
    /// Creates key info without a wrapped DEK.
    pub fn unwrapped(key_id: impl Into<String>) -> Self {
        Self { key_id: key_id.into(), wrapped_key: Vec::new() }
    }

    /// Creates key info with a wrapped DEK.
    pub fn wrapped(key_id: impl Into<String>, wrapped_key: Vec<u8>) -> Self {
        Self { key_id: key_id.into(), wrapped_key }
    }
}
