//! Local-disk seal backend for `muhur`.
//!
//! Keys are plain files selected by a glob pattern. Each file name carries its
//! version as a numeric dot-delimited component:
//! ```text
//! /etc/seal/
//! ├── seal.1.key      (32 bytes, 0600 permissions)
//! ├── seal.2.key      (32 bytes, 0600 permissions)
//! └── README          (ignored: no numeric component)
//! ```
//!
//! Encryption always uses the highest index. Rotating is writing a file with
//! a higher index; older files must stay in place for as long as blobs sealed
//! under them exist.
//!
//! The key file is the AEAD key itself; there is no intermediate DEK and the
//! blob's `wrapped_key` is empty. Intended for development, tests and
//! air-gapped deployments.

#![warn(clippy::pedantic, clippy::nursery)]

use muhur::blob::{KeyInfo, WrappedBlob};
use muhur::config::{PublicConfig, SealConfig};
use muhur::envelope::{self, KEY_SIZE};
use muhur::error::Error;
use muhur::key_id::KeyIdSlot;
use muhur::seal::{SealAccess, SealType};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Configuration key for the glob pattern.
pub const KEY_GLOB: &str = "key_glob";

/// Environment variable overriding [`KEY_GLOB`].
pub const KEY_GLOB_ENV: &str = "VAULT_LOCAL_SEAL_KEY_GLOB";

/// A key file matched by the glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFile {
    /// Version parsed from the file name
    pub index: u64,
    /// Full path
    pub path: PathBuf,
}

/// Seal backed by versioned key files.
#[derive(Debug, Default)]
pub struct LocalDiskSeal {
    key_glob: Option<String>,
    key_id: KeyIdSlot,
}

impl LocalDiskSeal {
    /// Creates an unconfigured seal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resolved glob pattern, if configured.
    #[must_use]
    pub fn key_glob(&self) -> Option<&str> {
        self.key_glob.as_deref()
    }

    /// Lists the key files matching the glob, in glob order.
    ///
    /// Files whose names carry no numeric component are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConfigured` before `set_config`.
    pub fn key_files(&self) -> Result<Vec<KeyFile>, Error> {
        let pattern = self.key_glob.as_deref().ok_or(Error::NotConfigured)?;
        let paths = glob::glob(pattern).map_err(|e| Error::invalid_config(KEY_GLOB, e))?;

        let mut files = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!(path = %err.path().display(), error = %err, "skipping unreadable key path");
                    continue;
                }
            };
            let Some(index) = path.file_name().and_then(|n| n.to_str()).and_then(parse_key_index)
            else {
                tracing::trace!(path = %path.display(), "ignoring file without key index");
                continue;
            };
            files.push(KeyFile { index, path });
        }
        Ok(files)
    }

    /// Returns the key file with the highest index.
    ///
    /// Among duplicate indices the first one seen wins.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoKeyAvailable` if the glob matches no key file.
    pub fn latest_key_file(&self) -> Result<KeyFile, Error> {
        let mut latest: Option<KeyFile> = None;
        for file in self.key_files()? {
            if latest.as_ref().map_or(true, |l| file.index > l.index) {
                latest = Some(file);
            }
        }
        latest.ok_or_else(|| {
            Error::NoKeyAvailable(format!("no key file matches {}", self.key_glob.as_deref().unwrap_or("")))
        })
    }

    /// Returns the key file with exactly `index`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no matching file carries `index`.
    pub fn key_file(&self, index: u64) -> Result<KeyFile, Error> {
        self.key_files()?
            .into_iter()
            .find(|f| f.index == index)
            .ok_or_else(|| Error::KeyNotFound(format!("no key file with index {index}")))
    }
}

#[async_trait::async_trait]
impl SealAccess for LocalDiskSeal {
    fn seal_type(&self) -> SealType {
        SealType::LocalDisk
    }

    fn key_id(&self) -> String {
        self.key_id.load()
    }

    async fn set_config(&mut self, config: &SealConfig) -> Result<PublicConfig, Error> {
        let key_glob = config.required(KEY_GLOB, &[KEY_GLOB_ENV])?;
        glob::Pattern::new(&key_glob).map_err(|e| Error::invalid_config(KEY_GLOB, e))?;

        tracing::debug!(key_glob = %key_glob, "local disk seal configured");
        let public = PublicConfig::from([(KEY_GLOB.to_string(), key_glob.clone())]);
        self.key_glob = Some(key_glob);
        Ok(public)
    }

    async fn init(&self) -> Result<(), Error> {
        let latest = self.latest_key_file()?;
        self.key_id.store(latest.index.to_string());
        Ok(())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<WrappedBlob, Error> {
        let file = self.latest_key_file()?;
        let key = read_key(&file.path)?;
        let (iv, ciphertext) = envelope::seal_with_key(&key, plaintext)?;

        let key_id = file.index.to_string();
        self.key_id.store(key_id.clone());
        Ok(WrappedBlob::new(ciphertext, iv, KeyInfo::unwrapped(key_id)))
    }

    async fn decrypt(&self, blob: &WrappedBlob) -> Result<Vec<u8>, Error> {
        let info = blob.validate()?;
        let index: u64 = info
            .key_id
            .parse()
            .map_err(|_| Error::InvalidKey(format!("not a key file index: {:?}", info.key_id)))?;

        let file = self.key_file(index)?;
        let key = read_key(&file.path)?;
        envelope::decrypt(&key, &blob.iv, &blob.ciphertext)
    }
}

/// Extracts the key index from a file name.
///
/// The last dot-delimited component that is a plain decimal number wins:
/// `foo.5.key` is 5, `seal.2024.3.key` is 3, `should_be_ignored` has none.
#[must_use]
pub fn parse_key_index(file_name: &str) -> Option<u64> {
    file_name
        .split('.')
        .rev()
        .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
        .find_map(|part| part.parse().ok())
}

/// Reads the first [`KEY_SIZE`] bytes of `path`.
///
/// # Errors
///
/// Returns `Error::KeyTooShort` if the file is shorter than a key, or
/// `Error::Io` if it cannot be read.
pub fn read_key(path: &Path) -> Result<Zeroizing<Vec<u8>>, Error> {
    let mut key = Zeroizing::new(Vec::with_capacity(KEY_SIZE));
    File::open(path)?.take(KEY_SIZE as u64).read_to_end(&mut key)?;
    if key.len() < KEY_SIZE {
        return Err(Error::KeyTooShort {
            path: path.display().to_string(),
            expected: KEY_SIZE,
            actual: key.len(),
        });
    }
    Ok(key)
}

/// Writes a new random key to `path`, readable only by the owner on Unix.
///
/// # Errors
///
/// Returns `Error::Io` if the file cannot be written, or
/// `Error::RandomFailure` if entropy is unavailable.
pub fn generate_key_file(path: &Path) -> Result<(), Error> {
    use std::io::Write;

    let key = Zeroizing::new(envelope::random_bytes(KEY_SIZE)?);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(&key)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use muhur::config::MapEnv;
    use muhur::error::ErrorKind;
    use tempfile::TempDir;

    fn config_for(dir: &Path) -> SealConfig {
        let glob = format!("{}/*.key", dir.display());
        SealConfig::from_pairs([(KEY_GLOB, glob)]).with_env(MapEnv::new())
    }

    #[test]
    fn test_parse_key_index() {
        assert_eq!(parse_key_index("test.0.key"), Some(0));
        assert_eq!(parse_key_index("foo.5.key"), Some(5));
        assert_eq!(parse_key_index("seal.2024.3.key"), Some(3));
        assert_eq!(parse_key_index("12.key"), Some(12));
        assert_eq!(parse_key_index("should_be_ignored"), None);
        assert_eq!(parse_key_index("key.v2.key"), None);
        assert_eq!(parse_key_index("key.-1.key"), None);
    }

    #[tokio::test]
    async fn test_invalid_glob_rejected() {
        let mut seal = LocalDiskSeal::new();
        let config = SealConfig::from_pairs([(KEY_GLOB, "/tmp/[*.key")]).with_env(MapEnv::new());
        let err = seal.set_config(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_missing_glob_rejected() {
        let mut seal = LocalDiskSeal::new();
        let config = SealConfig::default().with_env(MapEnv::new());
        let err = seal.set_config(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingConfig);
        assert!(err.to_string().contains(KEY_GLOB));
    }

    #[tokio::test]
    async fn test_config_does_not_require_files() {
        let dir = TempDir::new().unwrap();
        let mut seal = LocalDiskSeal::new();
        let public = seal.set_config(&config_for(dir.path())).await.unwrap();
        assert_eq!(public.get(KEY_GLOB), Some(&format!("{}/*.key", dir.path().display())));

        let err = seal.encrypt(b"foo").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoKeyAvailable);
        assert_eq!(seal.init().await.unwrap_err().kind(), ErrorKind::NoKeyAvailable);
        assert!(seal.key_id().is_empty());
    }

    #[tokio::test]
    async fn test_short_key_file_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("test.0.key"), [1u8; 16]).unwrap();

        let mut seal = LocalDiskSeal::new();
        seal.set_config(&config_for(dir.path())).await.unwrap();
        let err = seal.encrypt(b"foo").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyTooShort);
    }

    #[tokio::test]
    async fn test_only_first_32_bytes_are_used() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.0.key");
        let mut long = vec![3u8; KEY_SIZE];
        long.extend_from_slice(b"trailing newline or comment\n");
        std::fs::write(&path, &long).unwrap();

        assert_eq!(&read_key(&path).unwrap()[..], &[3u8; KEY_SIZE][..]);
    }

    #[tokio::test]
    async fn test_decrypt_missing_version() {
        let dir = TempDir::new().unwrap();
        generate_key_file(&dir.path().join("test.0.key")).unwrap();

        let mut seal = LocalDiskSeal::new();
        seal.set_config(&config_for(dir.path())).await.unwrap();
        let mut blob = seal.encrypt(b"foo").await.unwrap();
        blob.key_info.as_mut().unwrap().key_id = "9".into();

        assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::KeyNotFound);

        blob.key_info.as_mut().unwrap().key_id = "nine".into();
        assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::InvalidKey);
    }

    #[tokio::test]
    async fn test_tampered_blob_fails_auth() {
        let dir = TempDir::new().unwrap();
        generate_key_file(&dir.path().join("test.0.key")).unwrap();

        let mut seal = LocalDiskSeal::new();
        seal.set_config(&config_for(dir.path())).await.unwrap();
        let blob = seal.encrypt(b"hello").await.unwrap();

        let mut bad_ct = blob.clone();
        bad_ct.ciphertext[0] ^= 0x80;
        assert_eq!(seal.decrypt(&bad_ct).await.unwrap_err().kind(), ErrorKind::AuthFailure);

        let mut bad_iv = blob;
        bad_iv.iv[11] ^= 0x01;
        assert_eq!(seal.decrypt(&bad_iv).await.unwrap_err().kind(), ErrorKind::AuthFailure);
    }

    #[tokio::test]
    async fn test_nil_key_info() {
        let dir = TempDir::new().unwrap();
        let mut seal = LocalDiskSeal::new();
        seal.set_config(&config_for(dir.path())).await.unwrap();

        let blob = WrappedBlob { ciphertext: vec![1; 20], iv: vec![0; 12], key_info: None };
        assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::NilInput);
    }

    #[test]
    fn test_generated_key_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.0.key");
        generate_key_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), KEY_SIZE);
        assert_eq!(generate_key_file(&path).unwrap_err().kind(), ErrorKind::Io);
    }
}
