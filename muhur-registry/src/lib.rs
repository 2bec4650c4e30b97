//! Type-tag dispatch over every `muhur` seal backend.
//!
//! ```rust,ignore
//! use muhur::prelude::*;
//!
//! let seal_type: SealType = std::env::var("SEAL_TYPE")?.parse()?;
//! let mut seal = muhur_registry::new_seal(seal_type)?;
//! seal.set_config(&SealConfig::new(values)).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]

use muhur::error::Error;
use muhur::seal::{Seal, SealAccess, SealType};
use muhur::shamir::ShamirSeal;
use muhur_failover_cluster::FailoverClusterSeal;
use muhur_kms_azure::AzureKeyVaultSeal;
use muhur_kms_oci::OciKmsSeal;
use muhur_local_disk::LocalDiskSeal;
use muhur_transit::TransitSeal;

/// Creates an unconfigured backend for `seal_type`.
///
/// # Errors
///
/// Returns `Error::Unsupported` for a backend that is not available on this
/// platform.
pub fn new_access(seal_type: SealType) -> Result<Box<dyn SealAccess>, Error> {
    tracing::debug!(seal_type = %seal_type, "creating seal backend");
    let access: Box<dyn SealAccess> = match seal_type {
        SealType::AzureKeyVault => Box::new(AzureKeyVaultSeal::new()),
        SealType::OciKms => Box::new(OciKmsSeal::new()),
        SealType::Transit => Box::new(TransitSeal::new()),
        SealType::LocalDisk => Box::new(LocalDiskSeal::new()),
        SealType::FailoverCluster => Box::new(FailoverClusterSeal::new()?),
        SealType::Shamir => Box::new(ShamirSeal::new()),
    };
    Ok(access)
}

/// Creates an unconfigured [`Seal`] for `seal_type`.
///
/// # Errors
///
/// See [`new_access`].
pub fn new_seal(seal_type: SealType) -> Result<Seal, Error> {
    new_access(seal_type).map(Seal::new)
}

/// Creates an unconfigured [`Seal`] from its tag, e.g. `"transit"`.
///
/// # Errors
///
/// Returns `Error::InvalidConfig` for an unknown tag, otherwise see
/// [`new_access`].
pub fn new_seal_from_tag(tag: &str) -> Result<Seal, Error> {
    new_seal(tag.parse()?)
}
