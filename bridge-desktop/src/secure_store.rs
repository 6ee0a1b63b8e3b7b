//! `SecureStore` over the OS keychain.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SecureStore,
};
use keyring::Entry;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Default keychain service the session is filed under.
pub const DEFAULT_SERVICE: &str = "auth-session-core";

/// Keychain-backed secret storage (macOS Keychain, Windows Credential
/// Manager, Secret Service on Linux).
///
/// Secrets are base64 encoded because keychain entries hold strings. The OS
/// cannot enumerate entries of one service, so `list_keys` and `clear_all`
/// only cover keys this instance has written or read.
pub struct KeyringSecureStore {
    service: String,
    seen: Mutex<BTreeSet<String>>,
}

impl KeyringSecureStore {
    pub fn new() -> Self {
        Self::with_service_name(DEFAULT_SERVICE)
    }

    pub fn with_service_name(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).map_err(keyring_error)
    }

    fn seen(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for KeyringSecureStore {
    fn default() -> Self {
        Self::new()
    }
}

fn keyring_error(e: keyring::Error) -> BridgeError {
    match e {
        keyring::Error::NoStorageAccess(inner) => {
            BridgeError::NotAvailable(format!("Keychain is locked or unreachable: {}", inner))
        }
        keyring::Error::PlatformFailure(inner) => {
            BridgeError::NotAvailable(format!("Keychain platform failure: {}", inner))
        }
        other => BridgeError::OperationFailed(format!("Keychain error: {}", other)),
    }
}

#[async_trait]
impl SecureStore for KeyringSecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entry(key)?
            .set_password(&STANDARD.encode(value))
            .map_err(keyring_error)?;

        self.seen().insert(key.to_string());
        debug!(key, bytes = value.len(), "Secret written to keychain");
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let encoded = match self.entry(key)?.get_password() {
            Ok(encoded) => encoded,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(keyring_error(e)),
        };

        let decoded = STANDARD.decode(encoded.as_bytes()).map_err(|e| {
            warn!(key, error = %e, "Keychain entry is not valid base64");
            BridgeError::OperationFailed(format!("Keychain entry '{}' is corrupted: {}", key, e))
        })?;

        self.seen().insert(key.to_string());
        Ok(Some(decoded))
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(keyring_error(e)),
        }

        self.seen().remove(key);
        debug!(key, "Secret removed from keychain");
        Ok(())
    }

    async fn has_secret(&self, key: &str) -> Result<bool> {
        match self.entry(key)?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(keyring_error(e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.seen().iter().cloned().collect())
    }

    async fn clear_all(&self) -> Result<()> {
        let keys = self.list_keys().await?;
        let mut failure = None;

        for key in keys {
            if let Err(e) = self.delete_secret(&key).await {
                warn!(key = %key, error = %e, "Failed to clear keychain entry");
                failure.get_or_insert(e);
            }
        }

        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service() {
        assert_eq!(KeyringSecureStore::new().service, DEFAULT_SERVICE);
    }

    #[test]
    fn test_locked_keychain_is_not_available() {
        let err = keyring_error(keyring::Error::NoStorageAccess("locked".into()));
        assert!(matches!(err, BridgeError::NotAvailable(_)));

        let err = keyring_error(keyring::Error::NoEntry);
        assert!(matches!(err, BridgeError::OperationFailed(_)));
    }

    #[tokio::test]
    async fn test_session_roundtrip_when_keychain_available() {
        // Headless CI machines usually have no keychain.
        let store = KeyringSecureStore::with_service_name("auth-session-core-test");
        let key = "test.session";
        let value = br#"{"access_token":"secret"}"#;

        if let Err(e) = store.set_secret(key, value).await {
            println!("Keychain not available ({}), skipping", e);
            return;
        }

        if let Ok(Some(read)) = store.get_secret(key).await {
            assert_eq!(read, value.to_vec());
        }
        assert_eq!(store.list_keys().await.unwrap(), vec![key.to_string()]);

        store.clear_all().await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());
    }
}
