//! Several seals wrapping the same value.
//!
//! A [`MultiSeal`] encrypts a payload once per enabled seal and keeps every
//! result as a slot of a [`MultiWrapValue`]. Decryption starts with the
//! highest-priority healthy seal whose key id matches a slot; the others join
//! after [`DECRYPT_HEAD_START`].
//!
//! ```rust,ignore
//! let multi = MultiSeal::new(1, vec![
//!     SealWrapper::new("azure", 1, azure),
//!     SealWrapper::new("transit", 2, transit),
//! ])?;
//! let (value, errors) = multi.encrypt(b"master key").await?;
//! let decrypted = multi.decrypt(&value).await?;
//! if !decrypted.up_to_date {
//!     // re-wrap and store again
//! }
//! ```

use crate::blob::WrappedBlob;
use crate::error::Error;
use crate::seal::{Seal, SealState};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Time limit for one seal's encrypt call.
pub const ENCRYPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the preferred seal gets before the other seals start decrypting.
pub const DECRYPT_HEAD_START: Duration = Duration::from_secs(2);

/// Per-seal failures, keyed by seal name.
pub type SealErrors = BTreeMap<String, Error>;

/// A value wrapped by every enabled seal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiWrapValue {
    /// Generation of the seal set that wrote the value; 0 if unknown
    pub generation: u64,
    /// One blob per seal, highest priority first
    pub slots: Vec<WrappedBlob>,
}

impl MultiWrapValue {
    /// Returns the slot wrapped under `key_id`.
    #[must_use]
    pub fn blob_for_key_id(&self, key_id: &str) -> Option<&WrappedBlob> {
        self.slots.iter().find(|blob| blob.key_id() == Some(key_id))
    }

    /// Returns the sorted, deduplicated key ids of all slots.
    #[must_use]
    pub fn key_ids(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter_map(WrappedBlob::key_id)
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Result of [`MultiSeal::decrypt`].
#[derive(Debug)]
pub struct MultiDecrypt {
    /// Decrypted payload
    pub plaintext: Vec<u8>,
    /// False if the value should be encrypted again with the current seals
    pub up_to_date: bool,
}

/// A named, prioritized seal taking part in a [`MultiSeal`].
#[derive(Debug)]
pub struct SealWrapper {
    name: String,
    priority: i32,
    disabled: bool,
    seal: Seal,
    healthy: AtomicBool,
}

impl SealWrapper {
    /// Wraps `seal`. Lower `priority` values are tried first.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: i32, seal: Seal) -> Self {
        Self { name: name.into(), priority, disabled: false, seal, healthy: AtomicBool::new(true) }
    }

    /// Keeps the seal for decryption only. It wraps no new values, and a
    /// value it unwraps is reported as out of date.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[must_use]
    pub const fn seal(&self) -> &Seal {
        &self.seal
    }

    /// Returns true once the seal's configuration succeeded and until it is
    /// finalized.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        matches!(self.seal.state(), SealState::Configured | SealState::Running)
    }

    /// Returns the outcome of the seal's last encrypt, or of its last
    /// decrypt of a slot matching its key id.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn set_healthy(&self, healthy: bool) {
        if self.healthy.swap(healthy, Ordering::AcqRel) != healthy {
            if healthy {
                tracing::info!(seal = %self.name, "seal is healthy again");
            } else {
                tracing::warn!(seal = %self.name, "seal marked unhealthy");
            }
        }
    }
}

/// An ordered set of seals wrapping every value once per seal.
#[derive(Debug)]
pub struct MultiSeal {
    generation: u64,
    wrappers: Vec<Arc<SealWrapper>>,
    key_ids: ArcSwap<Vec<String>>,
}

impl MultiSeal {
    /// Creates the set from already configured seals, sorted by priority.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for an empty list or duplicate names,
    /// and `Error::NotConfigured` if no seal is configured.
    pub fn new(generation: u64, mut wrappers: Vec<SealWrapper>) -> Result<Self, Error> {
        if wrappers.is_empty() {
            return Err(Error::invalid_config("seals", "at least one seal is required"));
        }
        {
            let mut names = BTreeSet::new();
            if let Some(wrapper) = wrappers.iter().find(|w| !names.insert(w.name.as_str())) {
                return Err(Error::invalid_config("seals", format!("duplicate seal name {:?}", wrapper.name)));
            }
        }
        if !wrappers.iter().any(SealWrapper::is_configured) {
            return Err(Error::NotConfigured);
        }
        wrappers.sort_by_key(SealWrapper::priority);

        Ok(Self {
            generation,
            wrappers: wrappers.into_iter().map(Arc::new).collect(),
            key_ids: ArcSwap::from_pointee(Vec::new()),
        })
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns all seals, highest priority first.
    pub fn wrappers(&self) -> impl Iterator<Item = &SealWrapper> {
        self.wrappers.iter().map(AsRef::as_ref)
    }

    /// Returns true if every enabled seal is healthy.
    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.wrappers.iter().filter(|w| !w.disabled).all(|w| w.is_healthy())
    }

    /// Returns the key ids recorded by the last fully successful encrypt or
    /// by `init`.
    #[must_use]
    pub fn key_ids(&self) -> Vec<String> {
        self.key_ids.load().as_ref().clone()
    }

    /// Initializes every configured seal and records their key ids.
    ///
    /// # Errors
    ///
    /// Returns the first seal's init error.
    pub async fn init(&self) -> Result<(), Error> {
        let mut key_ids = BTreeSet::new();
        for wrapper in self.wrappers.iter().filter(|w| w.is_configured()) {
            wrapper.seal.init().await?;
            let key_id = wrapper.seal.key_id();
            // Some backends only learn their key id on the first encrypt.
            if !wrapper.disabled && !key_id.is_empty() {
                key_ids.insert(key_id);
            }
        }
        self.key_ids.store(Arc::new(key_ids.into_iter().collect()));
        Ok(())
    }

    /// Finalizes every configured seal.
    ///
    /// # Errors
    ///
    /// Returns all finalize failures joined into one `Error::Backend`.
    pub async fn finalize(&self) -> Result<(), Error> {
        let mut errors = SealErrors::new();
        for wrapper in self.wrappers.iter().filter(|w| w.is_configured()) {
            if let Err(err) = wrapper.seal.finalize().await {
                errors.insert(wrapper.name.clone(), err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(join_errors("failed to finalize seals", &errors))
        }
    }

    /// Encrypts `plaintext` with every enabled seal.
    ///
    /// Unhealthy seals are skipped unless no enabled seal is healthy. Each
    /// seal gets [`ENCRYPT_TIMEOUT`]. Seals that return the same key id are
    /// dropped from the value. Partial failures are returned next to the
    /// value.
    ///
    /// # Errors
    ///
    /// Fails only if no seal produced a slot.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<(MultiWrapValue, SealErrors), Error> {
        let mut errors = SealErrors::new();
        let enabled: Vec<&Arc<SealWrapper>> = self.wrappers.iter().filter(|w| !w.disabled).collect();
        let candidates: Vec<&Arc<SealWrapper>> = if enabled.iter().any(|w| w.is_healthy()) {
            for wrapper in enabled.iter().filter(|w| !w.is_healthy()) {
                errors.insert(
                    wrapper.name.clone(),
                    Error::BackendUnavailable { message: "seal is unhealthy".into(), source: None },
                );
            }
            enabled.into_iter().filter(|w| w.is_healthy()).collect()
        } else {
            // A seal may have recovered.
            enabled
        };

        let plaintext: Arc<[u8]> = plaintext.into();
        let mut tasks = JoinSet::new();
        let mut unconfigured = Vec::new();
        for (index, wrapper) in candidates.iter().enumerate() {
            if !wrapper.is_configured() {
                unconfigured.push(wrapper.name.clone());
                continue;
            }
            let wrapper = Arc::clone(wrapper);
            let plaintext = Arc::clone(&plaintext);
            tasks.spawn(async move {
                let result = tokio::time::timeout(ENCRYPT_TIMEOUT, wrapper.seal.encrypt(&plaintext))
                    .await
                    .unwrap_or_else(|_| Err(timed_out("encrypt")));
                wrapper.set_healthy(result.is_ok());
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<WrappedBlob, Error>>> = candidates.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => tracing::warn!(error = %err, "seal encrypt task failed"),
            }
        }

        let duplicates = duplicate_key_ids(&results);
        let mut slots = Vec::new();
        for (index, (wrapper, result)) in candidates.iter().zip(results).enumerate() {
            if let Some(key_id) = duplicates.get(&index) {
                errors.insert(
                    wrapper.name.clone(),
                    Error::InvalidKey(format!(
                        "seal {} returned duplicate key id {key_id:?}, key ids must be unique",
                        wrapper.name
                    )),
                );
                continue;
            }
            match result {
                Some(Ok(blob)) => slots.push(blob),
                Some(Err(err)) => {
                    tracing::trace!(seal = %wrapper.name, error = %err, "failed to encrypt with seal");
                    errors.insert(wrapper.name.clone(), err);
                }
                None if wrapper.is_configured() => {
                    errors.insert(wrapper.name.clone(), Error::backend_msg("seal encrypt task failed"));
                }
                None => {}
            }
        }

        if slots.is_empty() {
            for name in unconfigured {
                errors.insert(name, Error::NotConfigured);
            }
            tracing::error!("failed to encrypt value with any seal");
            return Err(join_errors("failed to encrypt with any seal", &errors));
        }

        let value = MultiWrapValue { generation: self.generation, slots };
        tracing::trace!(slots = value.slots.len(), failed = errors.len(), "encrypted value with seals");
        if errors.is_empty() {
            self.key_ids.store(Arc::new(value.key_ids()));
        }
        for name in unconfigured {
            errors.insert(name, Error::NotConfigured);
        }
        Ok((value, errors))
    }

    /// Returns false if `value` should be encrypted again.
    ///
    /// A value from another generation is out of date; generation 0 is never
    /// compared. Otherwise the value's key ids must equal the recorded set.
    /// With `force_refresh` the set is refreshed by encrypting a dummy value
    /// first; if some seal fails then, the value is kept as up to date since
    /// re-wrapping would lose that seal's slot.
    ///
    /// # Errors
    ///
    /// Fails if `force_refresh` is set and no seal can encrypt.
    pub async fn is_up_to_date(&self, value: &MultiWrapValue, force_refresh: bool) -> Result<bool, Error> {
        if value.generation != 0 && value.generation != self.generation {
            return Ok(false);
        }
        if force_refresh {
            let (_, errors) = self.encrypt(&[0]).await?;
            if !errors.is_empty() {
                tracing::warn!(
                    failed = errors.len(),
                    "cannot tell whether the value needs re-wrapping, some seals failed to report their key ids"
                );
                return Ok(true);
            }
        } else if self.key_ids.load().is_empty() {
            // Unknown until the first init or encrypt.
            return Ok(true);
        }
        Ok(*self.key_ids.load().as_ref() == value.key_ids())
    }

    /// Decrypts `value` with the first seal that can.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConfigured` without configured seals, otherwise
    /// all seal failures joined into one `Error::Backend`.
    pub async fn decrypt(&self, value: &MultiWrapValue) -> Result<MultiDecrypt, Error> {
        let up_to_date = self.is_up_to_date(value, false).await?;

        let configured: Vec<&Arc<SealWrapper>> = self.wrappers.iter().filter(|w| w.is_configured()).collect();
        let mut candidates: Vec<&Arc<SealWrapper>> = configured.iter().copied().filter(|w| w.is_healthy()).collect();
        if candidates.is_empty() {
            candidates = configured;
        }
        if candidates.is_empty() {
            return Err(Error::NotConfigured);
        }

        let first = candidates.iter().position(|w| has_slot(w, value)).unwrap_or_else(|| {
            tracing::warn!("value has no key id in common with the healthy seals, trying all of them");
            0
        });

        let value = Arc::new(value.clone());
        let mut tasks = JoinSet::new();
        spawn_decrypt(&mut tasks, candidates[first], &value);
        let mut waiting: Vec<&Arc<SealWrapper>> =
            candidates.iter().enumerate().filter(|(index, _)| *index != first).map(|(_, w)| *w).collect();

        let head_start = tokio::time::sleep(DECRYPT_HEAD_START);
        tokio::pin!(head_start);
        let mut errors = SealErrors::new();
        loop {
            tokio::select! {
                Some(joined) = tasks.join_next() => match joined {
                    Ok((_, Ok((plaintext, old_key)))) => {
                        return Ok(MultiDecrypt { plaintext, up_to_date: up_to_date && !old_key });
                    }
                    Ok((name, Err(err))) => {
                        errors.insert(name, err);
                    }
                    Err(err) => tracing::warn!(error = %err, "seal decrypt task failed"),
                },
                () = &mut head_start, if !waiting.is_empty() => {
                    for wrapper in waiting.drain(..) {
                        spawn_decrypt(&mut tasks, wrapper, &value);
                    }
                }
                else => break,
            }
            if tasks.is_empty() {
                // The preferred seal already failed; no reason to wait.
                for wrapper in waiting.drain(..) {
                    spawn_decrypt(&mut tasks, wrapper, &value);
                }
            }
        }

        Err(join_errors("failed to decrypt with any seal", &errors))
    }
}

type DecryptResult = (String, Result<(Vec<u8>, bool), Error>);

fn spawn_decrypt(tasks: &mut JoinSet<DecryptResult>, wrapper: &Arc<SealWrapper>, value: &Arc<MultiWrapValue>) {
    let wrapper = Arc::clone(wrapper);
    let value = Arc::clone(value);
    tasks.spawn(async move {
        let result = try_decrypt(&wrapper, &value).await.map(|plaintext| (plaintext, wrapper.disabled));
        (wrapper.name.clone(), result)
    });
}

// Health only follows decrypts of the slot matching the seal's key id; the
// other slots are usually just foreign.
async fn try_decrypt(wrapper: &SealWrapper, value: &MultiWrapValue) -> Result<Vec<u8>, Error> {
    let key_id = wrapper.seal.key_id();
    if let Some(blob) = value.blob_for_key_id(&key_id).filter(|_| !key_id.is_empty()) {
        let result = wrapper.seal.decrypt(blob).await;
        wrapper.set_healthy(result.is_ok());
        return result;
    }

    let mut last = Error::NilInput("value has no slots");
    for blob in &value.slots {
        match wrapper.seal.decrypt(blob).await {
            Ok(plaintext) => {
                wrapper.set_healthy(true);
                return Ok(plaintext);
            }
            Err(err) => last = err,
        }
    }
    tracing::trace!(seal = %wrapper.name, key_id = %key_id, error = %last, "seal could not decrypt any slot");
    Err(last)
}

fn has_slot(wrapper: &SealWrapper, value: &MultiWrapValue) -> bool {
    let key_id = wrapper.seal.key_id();
    !key_id.is_empty() && value.blob_for_key_id(&key_id).is_some()
}

// Maps result positions to the key id they share with another result.
fn duplicate_key_ids(results: &[Option<Result<WrappedBlob, Error>>]) -> BTreeMap<usize, String> {
    let mut owners: BTreeMap<&str, usize> = BTreeMap::new();
    let mut duplicates = BTreeMap::new();
    for (index, result) in results.iter().enumerate() {
        let Some(key_id) = result.as_ref().and_then(|r| r.as_ref().ok()).and_then(WrappedBlob::key_id) else {
            continue;
        };
        if let Some(&owner) = owners.get(key_id) {
            duplicates.insert(owner, key_id.to_string());
            duplicates.insert(index, key_id.to_string());
        } else {
            owners.insert(key_id, index);
        }
    }
    duplicates
}

fn timed_out(operation: &str) -> Error {
    Error::BackendUnavailable { message: format!("seal {operation} timed out after {ENCRYPT_TIMEOUT:?}"), source: None }
}

fn join_errors(message: &str, errors: &SealErrors) -> Error {
    let mut joined = message.to_string();
    for (name, err) in errors {
        let _ = write!(joined, "; seal {name}: {err}");
    }
    Error::backend_msg(joined)
}
