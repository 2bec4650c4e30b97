//! Envelope encryption primitive.
//!
//! Each call to [`encrypt`] draws a fresh 256-bit Data Encryption Key (DEK) and
//! a 96-bit nonce, seals the plaintext with AES-256-GCM and hands the DEK back
//! to the caller so a backend can wrap it. The DEK is held in a [`SecretVec`]
//! and is zeroized when dropped.

use crate::error::Error;
use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};

/// DEK size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Output of [`encrypt`]. Never serialized.
pub struct Envelope {
    /// The plaintext DEK
    pub key: SecretVec<u8>,
    /// AEAD nonce
    pub iv: Vec<u8>,
    /// AEAD ciphertext with the authentication tag appended
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("key", &"***")
            .field("iv", &self.iv)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Fills `len` bytes from the operating system's secure random source.
///
/// # Errors
///
/// Returns `Error::RandomFailure` if entropy is unavailable.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, Error> {
    let mut bytes = vec![0u8; len];
    OsRng.try_fill_bytes(&mut bytes).map_err(|e| Error::RandomFailure(e.to_string()))?;
    Ok(bytes)
}

/// Generates a random DEK.
///
/// # Errors
///
/// Returns `Error::RandomFailure` if entropy is unavailable.
pub fn generate_key() -> Result<SecretVec<u8>, Error> {
    random_bytes(KEY_SIZE).map(SecretVec::new)
}

/// Encrypts `plaintext` under a freshly generated DEK.
///
/// # Errors
///
/// Returns `Error::RandomFailure` if the DEK or nonce cannot be drawn, and
/// `Error::CipherFailure` if the cipher rejects its inputs.
///
/// # Example
///
/// ```
/// use muhur::envelope;
/// use secrecy::ExposeSecret;
///
/// let env = envelope::encrypt(b"master key").unwrap();
/// let plaintext = envelope::decrypt(env.key.expose_secret(), &env.iv, &env.ciphertext).unwrap();
/// assert_eq!(plaintext, b"master key");
/// ```
pub fn encrypt(plaintext: &[u8]) -> Result<Envelope, Error> {
    let key = generate_key()?;
    let (iv, ciphertext) = seal_with_key(key.expose_secret(), plaintext)?;
    Ok(Envelope { key, iv, ciphertext })
}

/// Decrypts `ciphertext` with `key` and `iv`.
///
/// # Errors
///
/// Returns `Error::AuthFailure` if the tag does not verify and
/// `Error::CipherFailure` if the key or nonce has the wrong length.
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::CipherFailure(format!("invalid key: {e}")))?;

    if iv.len() != NONCE_SIZE {
        return Err(Error::CipherFailure(format!(
            "invalid nonce size: {} (expected {NONCE_SIZE})",
            iv.len()
        )));
    }

    cipher.decrypt(Nonce::from_slice(iv), ciphertext).map_err(|_| Error::tag_mismatch())
}

/// Seals `plaintext` directly under `key` with a fresh random nonce.
///
/// Used by backends whose long-lived key doubles as the AEAD key.
///
/// # Errors
///
/// Returns `Error::RandomFailure` or `Error::CipherFailure`.
pub fn seal_with_key(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::CipherFailure(format!("invalid key: {e}")))?;

    let iv = random_bytes(NONCE_SIZE)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| Error::CipherFailure(format!("AES-GCM encryption failed: {e}")))?;

    Ok((iv, ciphertext))
}
