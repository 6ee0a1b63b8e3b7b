//! Session Store
//!
//! The session store owns the current [`Session`]: it persists it, answers
//! "what is the session right now", revokes it, and tells subscribers about
//! every sign-in and sign-out.
//!
//! Listeners are plain synchronous callbacks. They run on whichever task
//! mutated the store and must not block.
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::session_store::{SecureSessionStore, SessionStore};
//! use core_auth::{AuthBackend, SessionChange};
//! use std::sync::Arc;
//! # use bridge_traits::storage::SecureStore;
//! # async fn example(
//! #     secure_store: Arc<dyn SecureStore>,
//! #     backend: Arc<dyn AuthBackend>,
//! # ) -> core_auth::Result<()> {
//! let store = SecureSessionStore::new(secure_store, backend, "auth.session");
//!
//! let subscription = store.subscribe(Arc::new(|change: SessionChange| {
//!     println!("session changed: {:?}", change);
//! }));
//!
//! if let Some(session) = store.read_current().await? {
//!     println!("signed in as {}", session.user.id);
//! }
//!
//! subscription.unsubscribe();
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bridge_traits::storage::SecureStore;
use bridge_traits::time::{Clock, SystemClock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::backend::AuthBackend;
use crate::error::{AuthError, Result};
use crate::types::{Session, SessionChange};

/// Callback invoked on every store-side session transition.
pub type SessionListener = Arc<dyn Fn(SessionChange) + Send + Sync>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The current session, if one exists and has not expired.
    async fn read_current(&self) -> Result<Option<Session>>;

    /// Registers a listener. It stays registered until the returned
    /// [`Subscription`] is cancelled or dropped.
    fn subscribe(&self, listener: SessionListener) -> Subscription;

    /// Makes `session` the current session and notifies `SignedIn`.
    async fn establish(&self, session: Session) -> Result<()>;

    /// Ends the current session server-side and locally, then notifies
    /// `SignedOut`.
    async fn revoke(&self) -> Result<()>;
}

/// Handle to a registered listener.
///
/// Cancelling is idempotent; dropping the handle cancels it.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Registry of session listeners, shared by store implementations.
#[derive(Clone, Default)]
pub struct SessionListeners {
    inner: Arc<ListenerRegistry>,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, SessionListener>>,
}

impl SessionListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: SessionListener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, listener);

        let registry = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry
                    .listeners
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&id);
            }
        })
    }

    /// Invokes every listener in registration order.
    pub fn notify(&self, change: SessionChange) {
        let listeners: Vec<SessionListener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        for listener in listeners {
            listener(change.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Session store persisted in platform secure storage.
///
/// The session is kept as JSON under a single key. Expired sessions are
/// discarded on read; corrupted data is deleted and reported.
pub struct SecureSessionStore {
    secure_store: Arc<dyn SecureStore>,
    backend: Arc<dyn AuthBackend>,
    key: String,
    listeners: SessionListeners,
    write_lock: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl SecureSessionStore {
    pub fn new(
        secure_store: Arc<dyn SecureStore>,
        backend: Arc<dyn AuthBackend>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            secure_store,
            backend,
            key: key.into(),
            listeners: SessionListeners::new(),
            write_lock: tokio::sync::Mutex::new(()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` instead of wall time when checking expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reads the persisted session without checking expiry.
    async fn load(&self) -> Result<Option<Session>> {
        let data = self.secure_store.get_secret(&self.key).await.map_err(|e| {
            warn!(error = %e, "Failed to read session from secure storage");
            AuthError::storage(e)
        })?;

        let Some(data) = data else {
            debug!("No session found in storage");
            return Ok(None);
        };

        match serde_json::from_slice::<Session>(&data) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "Failed to deserialize session, it may be corrupted");

                if let Err(delete_err) = self.secure_store.delete_secret(&self.key).await {
                    warn!(error = %delete_err, "Failed to delete corrupted session data");
                }

                Err(AuthError::Storage(format!("Stored session is corrupted: {}", e)))
            }
        }
    }

    async fn delete(&self) -> Result<()> {
        self.secure_store.delete_secret(&self.key).await.map_err(|e| {
            warn!(error = %e, "Failed to delete session from secure storage");
            AuthError::storage(e)
        })
    }
}

#[async_trait]
impl SessionStore for SecureSessionStore {
    async fn read_current(&self) -> Result<Option<Session>> {
        let Some(session) = self.load().await? else {
            return Ok(None);
        };

        if session.is_expired_at(self.clock.now()) {
            info!(user_id = %session.user.id, "Stored session expired, discarding");
            self.delete().await?;
            return Ok(None);
        }

        debug!(user_id = %session.user.id, "Session read from storage");
        Ok(Some(session))
    }

    fn subscribe(&self, listener: SessionListener) -> Subscription {
        self.listeners.register(listener)
    }

    async fn establish(&self, session: Session) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let json = serde_json::to_vec(&session).map_err(|e| {
            warn!(error = %e, "Failed to serialize session");
            AuthError::Internal(format!("Session serialization failed: {}", e))
        })?;

        let persisted = self.secure_store.set_secret(&self.key, &json).await;
        if let Err(e) = &persisted {
            warn!(error = %e, "Failed to persist session, keeping it for this run only");
        }

        info!(
            user_id = %session.user.id,
            has_refresh_token = session.refresh_token.is_some(),
            persisted = persisted.is_ok(),
            "Session established"
        );

        self.listeners.notify(SessionChange::SignedIn(session));
        persisted.map_err(AuthError::storage)
    }

    async fn revoke(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let current = match self.load().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Unreadable session during revoke, clearing locally");
                None
            }
        };

        if let Some(session) = &current {
            self.backend.sign_out(&session.access_token).await?;
        }

        self.delete().await?;

        info!(
            user_id = current.as_ref().map(|s| s.user.id.as_str()),
            "Session revoked"
        );

        self.listeners.notify(SessionChange::SignedOut);
        Ok(())
    }
}
