//! Secure credential material, grounded on `KmcSecureString.h`/`.cpp` and
//! `KmcDecryptor.h`/`.cpp`. The actual KMC/KMS backend is a deployment
//! detail behind [`CredentialDecryptor`]; this crate only defines the
//! contract and zeroizing storage.

use crate::error::LeaderLockResult;
use zeroize::Zeroizing;

/// Plaintext credential material (a decrypted TLS private key passphrase,
/// typically). Not `Clone`: every holder is responsible for its own copy,
/// and the backing buffer is zeroed on drop via `Zeroizing`.
pub struct SecureString {
    inner: Zeroizing<Vec<u8>>,
}

impl SecureString {
    pub fn from_plaintext(bytes: Vec<u8>) -> Self {
        Self { inner: Zeroizing::new(bytes) }
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.is_empty()
    }

    /// Exposes the plaintext. Callers must not persist the returned slice
    /// past the `SecureString`'s lifetime.
    pub fn expose(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureString").field("len", &self.inner.len()).finish()
    }
}

/// Pluggable credential decryption, standing in for `KmcDecryptor`'s direct
/// OpenSSL/KMC calls so the backend can be swapped (or faked in tests)
/// without this crate depending on a specific KMS SDK.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &[u8]) -> LeaderLockResult<SecureString>;
}

/// No-op decryptor for tests and for deployments where the etcd TLS key is
/// already stored in plaintext on disk.
pub struct PassthroughDecryptor;

impl CredentialDecryptor for PassthroughDecryptor {
    fn decrypt(&self, ciphertext: &[u8]) -> LeaderLockResult<SecureString> {
        Ok(SecureString::from_plaintext(ciphertext.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_round_trips() {
        let decryptor = PassthroughDecryptor;
        let secret = decryptor.decrypt(b"hunter2").expect("decrypt should succeed");
        assert_eq!(secret.expose(), b"hunter2");
        assert!(secret.is_valid());
    }

    #[test]
    fn empty_ciphertext_is_invalid() {
        let decryptor = PassthroughDecryptor;
        let secret = decryptor.decrypt(b"").expect("decrypt should succeed");
        assert!(!secret.is_valid());
    }
}
