//! # Auth Configuration Module
//!
//! Provides configuration management for the session orchestrator.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an `AuthConfig`
//! instance that holds the backend endpoints, the injected bridge capabilities
//! and the orchestrator's tunables. It enforces fail-fast validation so a
//! misconfigured host finds out at startup rather than on the first sign-in.
//!
//! ## Required Settings
//!
//! - `auth_url` - Base URL of the auth service (`/auth/v1/*`, `/rest/v1/*`)
//! - `api_key` - Public (anon) API key sent as the `apikey` header
//! - `origin` - Application origin; redirect targets are derived from it
//!
//! ## Bridges (with platform defaults)
//!
//! - `HttpClient` - HTTP operations (desktop default: reqwest)
//! - `SecureStore` - Session persistence (desktop default: OS keychain)
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults for both
//! bridges are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::AuthConfig;
//!
//! let config = AuthConfig::builder()
//!     .auth_url("https://project.supabase.co")
//!     .api_key("public-anon-key")
//!     .origin("https://app.example.com")
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! The builder reports what is missing with an actionable message:
//!
//! ```should_panic
//! use core_runtime::config::AuthConfig;
//!
//! let config = AuthConfig::builder()
//!     .origin("https://app.example.com")
//!     .build()
//!     .expect("Should fail - missing auth_url");
//! ```

use crate::error::{Error, Result};
use bridge_traits::time::{Clock, SystemClock};
use bridge_traits::{HttpClient, SecureStore};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default secure-store key holding the serialized session.
pub const DEFAULT_SESSION_KEY: &str = "auth.session";

/// Default number of rejected verifications before a pending challenge is dropped.
pub const DEFAULT_MAX_VERIFY_ATTEMPTS: u32 = 5;

/// Default capacity of the auth event channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the session orchestrator.
///
/// Use [`AuthConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct AuthConfig {
    /// Auth service base URL, without trailing slash
    pub auth_url: String,

    /// Public API key sent with every request
    pub api_key: String,

    /// Base URL of the application API serving `/api/auth/*`, without trailing slash
    pub api_base_url: String,

    /// Application origin, without trailing slash
    pub origin: String,

    /// HTTP client for reaching the backend
    pub http_client: Arc<dyn HttpClient>,

    /// Secure storage used to persist the current session
    pub secure_store: Arc<dyn SecureStore>,

    /// Key under which the session is persisted
    pub session_key: String,

    /// Capacity of the auth event broadcast channel
    pub event_buffer_size: usize,

    /// Rejected verifications tolerated per pending challenge
    pub max_verify_attempts: u32,

    /// Timeout applied to every backend request
    pub request_timeout: Duration,

    /// Time source for session expiry checks
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("auth_url", &self.auth_url)
            .field("api_key", &"[REDACTED]")
            .field("api_base_url", &self.api_base_url)
            .field("origin", &self.origin)
            .field("http_client", &"HttpClient { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .field("session_key", &self.session_key)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("max_verify_attempts", &self.max_verify_attempts)
            .field("request_timeout", &self.request_timeout)
            .field("clock", &"Clock { ... }")
            .finish()
    }
}

impl AuthConfig {
    /// Creates a new builder for constructing an `AuthConfig`.
    pub fn builder() -> AuthConfigBuilder {
        AuthConfigBuilder::default()
    }

    /// Return target for OAuth and magic-link flows.
    pub fn callback_url(&self) -> String {
        format!("{}/auth/callback", self.origin)
    }

    /// Return target for password-reset mails.
    pub fn reset_password_url(&self) -> String {
        format!("{}/auth/reset-password", self.origin)
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - All URLs are absolute `http`/`https` URLs
    /// - The API key is not blank
    /// - Numeric tunables are within sane bounds
    pub fn validate(&self) -> Result<()> {
        validate_url("auth_url", &self.auth_url)?;
        validate_url("api_base_url", &self.api_base_url)?;
        validate_url("origin", &self.origin)?;

        if self.api_key.trim().is_empty() {
            return Err(Error::Config("API key cannot be empty".to_string()));
        }

        if self.session_key.trim().is_empty() {
            return Err(Error::Config("Session key cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.event_buffer_size > 10_000 {
            return Err(Error::Config(
                "Event buffer size exceeds maximum of 10,000".to_string(),
            ));
        }

        if self.max_verify_attempts == 0 {
            return Err(Error::Config(
                "Max verify attempts must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    let parsed = Url::parse(value)
        .map_err(|e| Error::Config(format!("{} is not a valid URL ({}): {}", field, value, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Config(format!(
            "{} must use http or https, got '{}'",
            field, other
        ))),
    }
}

fn normalize_base(value: String) -> String {
    value.trim().trim_end_matches('/').to_string()
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required to reach the auth backend. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Mobile: inject a URLSession/OkHttp-backed client. \
                 Web: inject a fetch-based client."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn secure_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "SecureStore implementation is required for session persistence. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default KeyringSecureStore. \
                 Mobile: inject platform-native secure storage (Keychain/Keystore). \
                 Web: inject WebCrypto-based secure storage."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::with_timeout(timeout));
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::KeyringSecureStore;

    let store: Arc<dyn SecureStore> = Arc::new(KeyringSecureStore::new());
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    Err(secure_store_missing_error())
}

/// Builder for constructing [`AuthConfig`] instances.
///
/// Use this builder to incrementally set configuration options and then
/// call [`build()`](AuthConfigBuilder::build) to create the final config.
#[derive(Default)]
pub struct AuthConfigBuilder {
    auth_url: Option<String>,
    api_key: Option<String>,
    api_base_url: Option<String>,
    origin: Option<String>,
    http_client: Option<Arc<dyn HttpClient>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    session_key: Option<String>,
    event_buffer_size: Option<usize>,
    max_verify_attempts: Option<u32>,
    request_timeout: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
}

impl AuthConfigBuilder {
    /// Seeds a builder from the process environment.
    ///
    /// Reads `AUTH_URL`, `AUTH_API_KEY`, `AUTH_ORIGIN` and `AUTH_API_BASE_URL`,
    /// falling back to `SUPABASE_URL` and `SUPABASE_KEY` for the first two.
    /// Unset variables leave the corresponding field empty so `build()` can
    /// report them.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |primary: &str, fallback: Option<&str>| {
            lookup(primary)
                .or_else(|| fallback.and_then(&lookup))
                .filter(|value| !value.trim().is_empty())
        };

        Self {
            auth_url: read("AUTH_URL", Some("SUPABASE_URL")),
            api_key: read("AUTH_API_KEY", Some("SUPABASE_KEY")),
            api_base_url: read("AUTH_API_BASE_URL", None),
            origin: read("AUTH_ORIGIN", None),
            ..Self::default()
        }
    }

    /// Sets the auth service base URL (required).
    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = Some(url.into());
        self
    }

    /// Sets the public API key (required).
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the application API base URL.
    ///
    /// Default: the configured `origin`.
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Sets the application origin (required).
    ///
    /// OAuth and magic-link flows return to `{origin}/auth/callback`;
    /// password-reset mails link to `{origin}/auth/reset-password`.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) will be used when
    /// the `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the secure store implementation.
    ///
    /// The secure store persists the current session between launches. It must
    /// provide platform-appropriate security (Keychain on macOS/iOS, Keystore on
    /// Android, etc.).
    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    /// Sets the secure-store key for the session.
    ///
    /// Default: `auth.session`
    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    /// Sets the auth event channel capacity.
    ///
    /// Default: 100
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Sets how many rejected verifications a pending challenge survives.
    ///
    /// Default: 5
    pub fn max_verify_attempts(mut self, attempts: u32) -> Self {
        self.max_verify_attempts = Some(attempts);
        self
    }

    /// Sets the per-request timeout.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the time source used to decide whether a stored session expired.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the final `AuthConfig` instance.
    ///
    /// Returns an error if:
    /// - `auth_url`, `api_key` or `origin` is missing
    /// - A bridge is missing and no platform default is available
    /// - Any value fails [`AuthConfig::validate`]
    pub fn build(self) -> Result<AuthConfig> {
        let auth_url = self.auth_url.map(normalize_base).ok_or_else(|| {
            Error::Config("Auth URL is required. Use .auth_url() to set it.".to_string())
        })?;

        let api_key = self.api_key.ok_or_else(|| {
            Error::Config("API key is required. Use .api_key() to set it.".to_string())
        })?;

        let origin = self.origin.map(normalize_base).ok_or_else(|| {
            Error::Config("Origin is required. Use .origin() to set it.".to_string())
        })?;

        let api_base_url = self
            .api_base_url
            .map(normalize_base)
            .unwrap_or_else(|| origin.clone());

        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(request_timeout)?,
        };

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store()?,
        };

        let config = AuthConfig {
            auth_url,
            api_key,
            api_base_url,
            origin,
            http_client,
            secure_store,
            session_key: self
                .session_key
                .unwrap_or_else(|| DEFAULT_SESSION_KEY.to_string()),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            max_verify_attempts: self
                .max_verify_attempts
                .unwrap_or(DEFAULT_MAX_VERIFY_ATTEMPTS),
            request_timeout,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}
