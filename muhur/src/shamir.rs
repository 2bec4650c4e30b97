//! Passthrough seal for deployments where the outer system performs the wrap.
//!
//! The outer layer reconstructs a key from its shares and hands it over with
//! [`ShamirSeal::set_key`]. Until then `encrypt` and `decrypt` report
//! `Unsupported`; afterwards the seal is a plain AES-256-GCM wrapper around
//! that key.

use crate::blob::{KeyInfo, WrappedBlob};
use crate::config::{PublicConfig, SealConfig};
use crate::envelope::{self, KEY_SIZE};
use crate::error::Error;
use crate::key_id::KeyIdSlot;
use crate::seal::{SealAccess, SealType};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretVec};

/// Key id reported by the passthrough seal.
pub const SHAMIR_KEY_ID: &str = "shamir";

/// Passthrough seal.
#[derive(Default)]
pub struct ShamirSeal {
    key: RwLock<Option<SecretVec<u8>>>,
    key_id: KeyIdSlot,
}

impl ShamirSeal {
    /// Creates a seal with no key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the key reconstructed by the outer layer.
    ///
    /// # Errors
    ///
    /// Returns `Error::CipherFailure` unless `key` is 32 bytes.
    pub fn set_key(&self, key: &[u8]) -> Result<(), Error> {
        if key.len() != KEY_SIZE {
            return Err(Error::CipherFailure(format!(
                "shamir key must be {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }
        *self.key.write() = Some(SecretVec::new(key.to_vec()));
        self.key_id.store(SHAMIR_KEY_ID);
        Ok(())
    }

    /// Returns a copy of the installed key, if any.
    #[must_use]
    pub fn key_bytes(&self) -> Option<SecretVec<u8>> {
        self.key.read().as_ref().map(|k| SecretVec::new(k.expose_secret().clone()))
    }

    fn with_key<T>(&self, f: impl FnOnce(&[u8]) -> Result<T, Error>) -> Result<T, Error> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or_else(|| {
            Error::Unsupported("shamir seal holds no key; the outer layer performs the wrap".into())
        })?;
        f(key.expose_secret())
    }
}

#[async_trait::async_trait]
impl SealAccess for ShamirSeal {
    fn seal_type(&self) -> SealType {
        SealType::Shamir
    }

    fn key_id(&self) -> String {
        self.key_id.load()
    }

    async fn set_config(&mut self, _config: &SealConfig) -> Result<PublicConfig, Error> {
        self.key_id.store(SHAMIR_KEY_ID);
        Ok(PublicConfig::new())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<WrappedBlob, Error> {
        let (iv, ciphertext) = self.with_key(|key| envelope::seal_with_key(key, plaintext))?;
        Ok(WrappedBlob::new(ciphertext, iv, KeyInfo::unwrapped(SHAMIR_KEY_ID)))
    }

    async fn decrypt(&self, blob: &WrappedBlob) -> Result<Vec<u8>, Error> {
        blob.validate()?;
        self.with_key(|key| envelope::decrypt(key, &blob.iv, &blob.ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_without_key_is_unsupported() {
        let mut seal = ShamirSeal::new();
        seal.set_config(&SealConfig::default()).await.unwrap();
        assert_eq!(seal.key_id(), SHAMIR_KEY_ID);

        let err = seal.encrypt(b"foo").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(seal.key_bytes().is_none());
    }

    #[tokio::test]
    async fn test_with_key_round_trip() {
        let seal = ShamirSeal::new();
        seal.set_key(&[7u8; KEY_SIZE]).unwrap();

        let blob = seal.encrypt(b"root key").await.unwrap();
        assert_eq!(blob.key_id(), Some(SHAMIR_KEY_ID));
        assert!(blob.key_info.as_ref().unwrap().wrapped_key.is_empty());
        assert_eq!(seal.decrypt(&blob).await.unwrap(), b"root key");
        assert_eq!(seal.key_bytes().unwrap().expose_secret(), &vec![7u8; KEY_SIZE]);
    }

    #[test]
    fn test_rejects_short_key() {
        let seal = ShamirSeal::new();
        assert_eq!(seal.set_key(&[1u8; 16]).unwrap_err().kind(), ErrorKind::CipherFailure);
    }

    #[tokio::test]
    async fn test_decrypt_without_key_info() {
        let seal = ShamirSeal::new();
        seal.set_key(&[7u8; KEY_SIZE]).unwrap();
        let blob = WrappedBlob { ciphertext: vec![1; 20], iv: vec![0; 12], key_info: None };
        assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::NilInput);
    }
}
