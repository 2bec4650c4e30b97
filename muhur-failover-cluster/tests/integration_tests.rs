//! Integration tests for the failover cluster seal with a stand-in provider.

use muhur::config::{MapEnv, SealConfig};
use muhur::error::ErrorKind;
use muhur::seal::{Seal, SealAccess};
use muhur_failover_cluster::{ClusterCrypto, ClusterError, FailoverClusterSeal, KEY_ID};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

// XORs with a fixed pad and prefixes a marker, so wrapped keys differ from
// the DEK and foreign input is rejected.
#[derive(Default)]
struct XorProvider {
    calls: AtomicUsize,
    deny: AtomicBool,
}

const MARKER: u8 = 0xC1;

impl ClusterCrypto for XorProvider {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = vec![MARKER];
        out.extend(data.iter().map(|b| b ^ 0x5A));
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(ClusterError::Native { operation: "ClusterDecrypt", code: 5 });
        }
        match data.split_first() {
            Some((&MARKER, rest)) => Ok(rest.iter().map(|b| b ^ 0x5A).collect()),
            _ => Err(ClusterError::Native { operation: "ClusterDecrypt", code: 13 }),
        }
    }
}

fn config() -> SealConfig {
    SealConfig::from_pairs([("resource_name", "Cluster Name")]).with_env(MapEnv::new())
}

#[tokio::test]
async fn test_round_trip() {
    let provider = Arc::new(XorProvider::default());
    let mut seal = Seal::new(Box::new(FailoverClusterSeal::with_provider(provider.clone())));
    let public = seal.set_config(&config()).await.expect("Failed to configure");
    assert_eq!(public.get("resource_name").map(String::as_str), Some("Cluster Name"));
    // Nothing is sent at configuration time.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

    let blob = seal.encrypt(b"root key").await.expect("Encryption failed");
    assert_eq!(blob.key_id(), Some(KEY_ID));
    assert_eq!(seal.key_id(), "1");
    let wrapped = &blob.key_info.as_ref().unwrap().wrapped_key;
    assert_eq!(wrapped.len(), 33);

    assert_eq!(seal.decrypt(&blob).await.expect("Decryption failed"), b"root key");
}

#[tokio::test]
async fn test_other_key_id_is_invalid() {
    let mut seal = FailoverClusterSeal::with_provider(Arc::new(XorProvider::default()));
    seal.set_config(&config()).await.expect("Failed to configure");

    let mut blob = seal.encrypt(b"root key").await.expect("Encryption failed");
    blob.key_info.as_mut().unwrap().key_id = "2".into();
    assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::InvalidKey);
}

#[tokio::test]
async fn test_resource_name_required() {
    let mut seal = FailoverClusterSeal::with_provider(Arc::new(XorProvider::default()));
    let config = SealConfig::from_pairs(Vec::<(String, String)>::new()).with_env(MapEnv::new());
    let err = seal.set_config(&config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingConfig);
    assert!(err.to_string().contains("resource_name"));
}

#[tokio::test]
async fn test_resource_name_from_env() {
    let mut seal = FailoverClusterSeal::with_provider(Arc::new(XorProvider::default()));
    let config = SealConfig::from_pairs([("resource_name", "from-map")])
        .with_env(MapEnv::new().with("FAILOVERCLUSTER_RESOURCE_NAME", "from-env"));
    seal.set_config(&config).await.expect("Failed to configure");
    assert_eq!(seal.resource_name(), "from-env");
}

#[tokio::test]
async fn test_provider_errors_are_classified() {
    let provider = Arc::new(XorProvider::default());
    let mut seal = FailoverClusterSeal::with_provider(provider.clone());
    seal.set_config(&config()).await.expect("Failed to configure");

    let mut blob = seal.encrypt(b"root key").await.expect("Encryption failed");
    blob.key_info.as_mut().unwrap().wrapped_key[0] = 0;
    assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::Backend);

    provider.deny.store(true, Ordering::SeqCst);
    assert_eq!(seal.decrypt(&blob).await.unwrap_err().kind(), ErrorKind::AuthFailure);
}

#[tokio::test]
async fn test_finalize_releases_provider() {
    let mut seal = FailoverClusterSeal::with_provider(Arc::new(XorProvider::default()));
    seal.set_config(&config()).await.expect("Failed to configure");

    seal.finalize().await.expect("Finalize failed");
    seal.finalize().await.expect("Second finalize failed");
    assert_eq!(seal.encrypt(b"x").await.unwrap_err().kind(), ErrorKind::NotConfigured);
}

// Records the thread every provider call runs on.
#[derive(Default)]
struct ThreadRecorder {
    inner: XorProvider,
    threads: parking_lot::Mutex<Vec<ThreadId>>,
}

impl ClusterCrypto for ThreadRecorder {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ClusterError> {
        self.threads.lock().push(thread::current().id());
        self.inner.encrypt(data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ClusterError> {
        self.threads.lock().push(thread::current().id());
        self.inner.decrypt(data)
    }
}

#[tokio::test]
async fn test_provider_calls_leave_the_runtime_thread() {
    let provider = Arc::new(ThreadRecorder::default());
    let mut seal = FailoverClusterSeal::with_provider(provider.clone());
    seal.set_config(&config()).await.expect("Failed to configure");

    let blob = seal.encrypt(b"root key").await.expect("Encryption failed");
    assert_eq!(seal.decrypt(&blob).await.expect("Decryption failed"), b"root key");

    let runtime_thread = thread::current().id();
    let threads = provider.threads.lock();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().all(|id| *id != runtime_thread));
}
