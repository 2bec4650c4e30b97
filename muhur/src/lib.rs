//! # `muhur`
//!
//! Auto-seal envelope encryption with pluggable key management backends.
//!
//! A seal protects a secret payload (typically the master key of a higher
//! level secret store) by encrypting it under a fresh Data Encryption Key and
//! asking a key management backend to wrap that key.
//!
//! ## Features
//!
//! - AES-256-GCM envelope primitive with per-call random DEK and nonce
//! - One [`SealAccess`](seal::SealAccess) contract for every backend
//! - Lifecycle-checked [`Seal`](seal::Seal) facade with metrics taps
//! - Lock-free key version tracking across rotations
//! - Environment-over-map configuration resolution
//! - Prioritized multi-seal wrapping with health tracking
//!
//! Backends live in their own crates: `muhur-kms-azure`, `muhur-kms-oci`,
//! `muhur-transit`, `muhur-local-disk` and `muhur-failover-cluster`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use muhur::prelude::*;
//! use muhur_local_disk::LocalDiskSeal;
//!
//! let mut seal = Seal::new(Box::new(LocalDiskSeal::new()));
//! seal.set_config(&SealConfig::from_pairs([("key_glob", "/etc/seal/*.key")])).await?;
//!
//! let blob = seal.encrypt(b"master key").await?;
//! let plaintext = seal.decrypt(&blob).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blob;
pub mod config;
pub mod envelope;
pub mod error;
pub mod key_id;
pub mod metrics;
pub mod multi;
pub mod seal;
pub mod shamir;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::blob::{KeyInfo, WrappedBlob};
    pub use crate::config::{EnvSource, MapEnv, ProcessEnv, PublicConfig, SealConfig};
    pub use crate::error::{Error, ErrorKind};
    pub use crate::key_id::KeyIdSlot;
    pub use crate::multi::{MultiSeal, MultiWrapValue, SealWrapper};
    pub use crate::seal::{Seal, SealAccess, SealState, SealType};
    pub use crate::shamir::ShamirSeal;
}
