//! Cluster crypto provider of the Windows failover cluster service.

use crate::{ClusterCrypto, ClusterError};
use windows::core::{w, HSTRING, PCWSTR};
use windows::Win32::Foundation::{GetLastError, LocalFree, HLOCAL};
use windows::Win32::Networking::Clustering::{
    CloseClusterCryptProvider, ClusterDecrypt, ClusterEncrypt, OpenClusterCryptProvider, HCLUSCRYPTPROVIDER,
};

const PROVIDER: PCWSTR = w!("Microsoft Enhanced RSA and AES Cryptographic Provider");
const PROV_RSA_AES: u32 = 24;
const CLUS_CREATE_CRYPT_CONTAINER_NOT_FOUND: u32 = 1;
const ERROR_SUCCESS: u32 = 0;

/// Open handle to the provider of one cluster resource.
pub struct NativeProvider {
    handle: HCLUSCRYPTPROVIDER,
}

// The provider handle is usable from any thread.
unsafe impl Send for NativeProvider {}
unsafe impl Sync for NativeProvider {}

impl NativeProvider {
    /// Opens the provider for `resource_name`, creating its key container
    /// if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::Native` with the Win32 error code.
    pub fn open(resource_name: &str) -> Result<Self, ClusterError> {
        let resource = HSTRING::from(resource_name);
        // SAFETY: both strings outlive the call.
        let handle = unsafe {
            OpenClusterCryptProvider(&resource, PROVIDER, PROV_RSA_AES, CLUS_CREATE_CRYPT_CONTAINER_NOT_FOUND)
        };
        if handle.is_invalid() {
            // SAFETY: reads the calling thread's last error, set by the failed call.
            let code = unsafe { GetLastError() }.0;
            return Err(ClusterError::Native { operation: "OpenClusterCryptProvider", code });
        }
        tracing::debug!(resource_name, "opened cluster crypto provider");
        Ok(Self { handle })
    }
}

// Copies out and frees a buffer returned by ClusterEncrypt/ClusterDecrypt.
fn take_buffer(operation: &'static str, code: u32, out: *mut u8, len: u32) -> Result<Vec<u8>, ClusterError> {
    if code != ERROR_SUCCESS {
        return Err(ClusterError::Native { operation, code });
    }
    // SAFETY: on success `out` points to `len` bytes allocated with
    // LocalAlloc; they are copied before the buffer is freed.
    unsafe {
        let result = std::slice::from_raw_parts(out, len as usize).to_vec();
        let _ = LocalFree(HLOCAL(out.cast()));
        Ok(result)
    }
}

impl ClusterCrypto for NativeProvider {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ClusterError> {
        let (mut out, mut len) = (std::ptr::null_mut(), 0_u32);
        // SAFETY: the handle is open for the lifetime of `self`.
        let code = unsafe { ClusterEncrypt(self.handle, data, &mut out, &mut len) };
        take_buffer("ClusterEncrypt", code, out, len)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ClusterError> {
        let (mut out, mut len) = (std::ptr::null_mut(), 0_u32);
        // SAFETY: the handle is open for the lifetime of `self`.
        let code = unsafe { ClusterDecrypt(self.handle, data, &mut out, &mut len) };
        take_buffer("ClusterDecrypt", code, out, len)
    }
}

impl Drop for NativeProvider {
    fn drop(&mut self) {
        // SAFETY: the handle was opened by `open` and is closed once.
        let code = unsafe { CloseClusterCryptProvider(self.handle) };
        if code != ERROR_SUCCESS {
            tracing::warn!(code, "failed to close cluster crypto provider");
        }
    }
}
