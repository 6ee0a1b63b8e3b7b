//! Secret storage for the persisted session.

use async_trait::async_trait;

use crate::error::Result;

/// Key/value store for secrets, backed by the platform's protected storage
/// (Keychain, Keystore, Credential Manager, Secret Service).
///
/// The auth core keeps exactly one entry here: the current session as JSON.
/// Implementations must encrypt at rest and must not log values.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::SecureStore;
///
/// async fn store_session(store: &dyn SecureStore, json: &[u8]) -> Result<()> {
///     store.set_secret("auth.session", json).await
/// }
/// ```
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Writes `value` under `key`, replacing any previous value.
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()>;

    /// `Ok(None)` when nothing is stored under `key`.
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing key is not an error.
    async fn delete_secret(&self, key: &str) -> Result<()>;

    async fn has_secret(&self, key: &str) -> Result<bool> {
        Ok(self.get_secret(key).await?.is_some())
    }

    /// Keys currently held, without their values.
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Removes every entry in [`list_keys`](Self::list_keys).
    async fn clear_all(&self) -> Result<()>;
}
