//! Secure token cache storage using the system keyring

use keyring::Entry;
use thiserror::Error;

pub const DEFAULT_SERVICE_NAME: &str = "com.m365deck.tokencache";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("Token cache is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Token cache task failed: {0}")]
    Task(String),
}

/// Raw blob storage underneath the token cache.
///
/// One blob per application identity. Implementations are blocking; the
/// cache moves calls onto the blocking pool.
pub trait TokenCacheBackend: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, CacheError>;

    fn store(&self, key: &str, blob: &str) -> Result<(), CacheError>;

    /// Deleting a key that was never stored succeeds.
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Keyring-backed storage (Keychain, Credential Manager, kernel keyutils)
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCacheBackend for KeyringBackend {
    fn load(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entry = Entry::new(&self.service, key)?;
        match entry.get_password() {
            Ok(blob) => Ok(Some(blob)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CacheError::Keyring(e)),
        }
    }

    fn store(&self, key: &str, blob: &str) -> Result<(), CacheError> {
        let entry = Entry::new(&self.service, key)?;
        entry.set_password(blob)?;
        tracing::debug!("Stored token cache entry: {}", key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let entry = Entry::new(&self.service, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                tracing::debug!("Deleted token cache entry: {}", key);
                Ok(())
            }
            Err(e) => Err(CacheError::Keyring(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_roundtrip() {
        let backend = KeyringBackend::with_service("com.m365deck.tests");
        let test_key = "token-cache:test-app";

        // The CI keyring may be unavailable; bail out quietly in that case.
        if let Err(CacheError::Keyring(_)) = backend.delete(test_key) {
            return;
        }

        if let Err(err) = backend.store(test_key, "{\"accounts\":{}}") {
            if matches!(err, CacheError::Keyring(_)) {
                return;
            }
            panic!("Failed to store: {:?}", err);
        }

        let loaded = match backend.load(test_key) {
            Ok(loaded) => loaded,
            Err(CacheError::Keyring(_)) => return,
            Err(err) => panic!("Failed to load: {:?}", err),
        };
        // Mock credential stores do not persist across entries.
        if loaded.is_none() {
            return;
        }
        assert_eq!(loaded.as_deref(), Some("{\"accounts\":{}}"));

        backend.delete(test_key).expect("Failed to delete");
        assert!(matches!(backend.load(test_key), Ok(None)));
    }
}
