//! End-to-end tests through the registry.

use muhur::config::{MapEnv, SealConfig};
use muhur::error::ErrorKind;
use muhur::seal::{SealState, SealType};
use muhur_local_disk::generate_key_file;
use muhur_registry::{new_seal, new_seal_from_tag};
use tempfile::TempDir;

#[tokio::test]
async fn test_local_disk_from_tag() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    generate_key_file(&dir.path().join("seal.1.key")).expect("Failed to write key");
    let config = SealConfig::from_pairs([("key_glob", format!("{}/*.key", dir.path().display()))])
        .with_env(MapEnv::new());

    let mut seal = new_seal_from_tag("LocalDisk").expect("Failed to create seal");
    assert_eq!(seal.seal_type(), SealType::LocalDisk);
    seal.set_config(&config).await.expect("Failed to configure");
    seal.init().await.expect("Init failed");

    let blob = seal.encrypt(b"root key").await.expect("Encryption failed");
    assert_eq!(seal.decrypt(&blob).await.expect("Decryption failed"), b"root key");

    seal.finalize().await.expect("Finalize failed");
    assert_eq!(seal.state(), SealState::Finalized);
    assert_eq!(seal.encrypt(b"x").await.unwrap_err().kind(), ErrorKind::Closed);
}

#[tokio::test]
async fn test_shamir_without_key_is_unsupported() {
    let mut seal = new_seal(SealType::Shamir).expect("Failed to create seal");
    seal.set_config(&SealConfig::from_pairs(Vec::<(String, String)>::new()).with_env(MapEnv::new()))
        .await
        .expect("Failed to configure");
    assert_eq!(seal.encrypt(b"x").await.unwrap_err().kind(), ErrorKind::Unsupported);
}

#[tokio::test]
async fn test_missing_config_per_backend() {
    let empty = SealConfig::from_pairs(Vec::<(String, String)>::new()).with_env(MapEnv::new());
    let cases = [
        (SealType::AzureKeyVault, "vault_name"),
        (SealType::OciKms, "key_id"),
        (SealType::Transit, "mount_path"),
        (SealType::LocalDisk, "key_glob"),
    ];
    for (seal_type, key) in cases {
        let mut seal = new_seal(seal_type).expect("Failed to create seal");
        let err = seal.set_config(&empty).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingConfig, "{seal_type}");
        assert!(err.to_string().contains(key), "{seal_type}: {err}");
        assert_eq!(seal.state(), SealState::New);
    }
}

#[cfg(not(windows))]
#[test]
fn test_failover_cluster_unsupported_off_windows() {
    let err = new_seal(SealType::FailoverCluster).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}
