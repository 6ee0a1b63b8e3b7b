//! Redirect-based sign-in with PKCE (RFC 7636).
//!
//! # Overview
//!
//! Both OAuth providers and magic links finish by redirecting the browser to
//! the application's callback URL with a one-time `code`. The initiator:
//! - generates a PKCE verifier and sends only its challenge
//! - remembers the verifier for the single redirect in flight
//! - exchanges the callback `code` plus verifier for a session
//!
//! Starting a new redirect replaces the previous verifier; only the most
//! recent flow can be completed.
//!
//! # Security
//!
//! Verifiers and codes are never logged.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::backend::AuthBackend;
use crate::error::{AuthError, Result};
use crate::types::{OAuthProvider, OAuthRedirect, Session};

/// PKCE (Proof Key for Code Exchange) verifier.
///
/// # Security
///
/// The verifier must be kept secret and never transmitted to the authorization server.
/// Only the challenge (derived from the verifier) is sent during authorization.
#[derive(Clone)]
pub struct PkceVerifier {
    verifier: String,
}

impl PkceVerifier {
    /// Create a new PKCE verifier from 32 cryptographically secure random
    /// bytes, base64-url-encoded without padding (43 characters).
    pub fn new() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::thread_rng().fill(&mut verifier_bytes);

        Self {
            verifier: URL_SAFE_NO_PAD.encode(verifier_bytes),
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// Compute the code challenge from the verifier.
    ///
    /// Uses S256 method: BASE64URL(SHA256(code_verifier))
    pub fn challenge(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceVerifier")
            .field("verifier", &"[REDACTED]")
            .finish()
    }
}

/// Which redirect flow a verifier belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectFlow {
    OAuth(OAuthProvider),
    MagicLink,
}

impl RedirectFlow {
    /// Sign-in method label used in events.
    pub fn method(&self) -> &'static str {
        match self {
            RedirectFlow::OAuth(_) => "oauth",
            RedirectFlow::MagicLink => "magic_link",
        }
    }
}

#[derive(Debug)]
struct PendingRedirect {
    flow: RedirectFlow,
    verifier: PkceVerifier,
    started_at: DateTime<Utc>,
}

/// Query (or fragment) parameters of a callback URL.
#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    fn parse(callback_url: &str) -> Result<Self> {
        let url = Url::parse(callback_url)
            .map_err(|e| AuthError::Validation(format!("Invalid callback URL: {}", e)))?;

        let from_query: CallbackParams =
            serde_urlencoded::from_str(url.query().unwrap_or_default()).unwrap_or_default();
        if from_query.code.is_some() || from_query.error.is_some() {
            return Ok(from_query);
        }

        // Some providers report errors in the fragment.
        Ok(serde_urlencoded::from_str(url.fragment().unwrap_or_default()).unwrap_or_default())
    }
}

/// Starts and completes redirect-based sign-ins.
pub struct OAuthInitiator {
    backend: Arc<dyn AuthBackend>,
    callback_url: String,
    pending: Mutex<Option<PendingRedirect>>,
}

impl OAuthInitiator {
    pub fn new(backend: Arc<dyn AuthBackend>, callback_url: impl Into<String>) -> Self {
        Self {
            backend,
            callback_url: callback_url.into(),
            pending: Mutex::new(None),
        }
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    /// Produces the provider authorization URL the host must open.
    ///
    /// The provider must be enabled on the auth service; an unreachable
    /// service fails before any verifier is recorded.
    #[instrument(skip(self))]
    pub async fn begin(&self, provider: OAuthProvider) -> Result<OAuthRedirect> {
        if !self.backend.provider_enabled(provider).await? {
            warn!("OAuth provider is not enabled");
            return Err(AuthError::rejected(format!(
                "{} sign-in is not enabled",
                provider.display_name()
            )));
        }

        let verifier = PkceVerifier::new();
        let url = self
            .backend
            .authorize_url(provider, &self.callback_url, &verifier.challenge())?;

        self.remember(RedirectFlow::OAuth(provider), verifier);
        debug!("Built authorization URL");

        Ok(OAuthRedirect { provider, url })
    }

    /// Records a verifier for a magic link and returns its challenge.
    pub fn prepare_magic_link(&self) -> String {
        let verifier = PkceVerifier::new();
        let challenge = verifier.challenge();
        self.remember(RedirectFlow::MagicLink, verifier);
        challenge
    }

    pub fn pending_flow(&self) -> Option<RedirectFlow> {
        self.lock().as_ref().map(|pending| pending.flow)
    }

    /// Forgets the redirect in flight, if any.
    pub fn cancel(&self) {
        if let Some(pending) = self.lock().take() {
            debug!(flow = ?pending.flow, "Pending redirect cancelled");
        }
    }

    /// Completes the redirect in flight from its callback URL.
    ///
    /// The pending verifier is consumed whether or not the exchange succeeds;
    /// authorization codes are single-use.
    #[instrument(skip(self, callback_url))]
    pub async fn complete(&self, callback_url: &str) -> Result<(RedirectFlow, Session)> {
        let params = CallbackParams::parse(callback_url)?;

        if let Some(error) = params.error {
            self.cancel();
            let message = params.error_description.unwrap_or(error);
            warn!(error = %message, "Provider reported a sign-in error");
            return Err(AuthError::rejected(message));
        }

        let code = params
            .code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| {
                AuthError::Validation("Callback is missing the authorization code".to_string())
            })?;

        let pending = self.lock().take().ok_or_else(|| {
            AuthError::Validation("No sign-in redirect is in progress".to_string())
        })?;

        let session = self
            .backend
            .exchange_code(&code, pending.verifier.verifier())
            .await?;

        info!(
            flow = ?pending.flow,
            elapsed_secs = (Utc::now() - pending.started_at).num_seconds(),
            "Redirect sign-in completed"
        );

        Ok((pending.flow, session))
    }

    fn remember(&self, flow: RedirectFlow, verifier: PkceVerifier) {
        let previous = self.lock().replace(PendingRedirect {
            flow,
            verifier,
            started_at: Utc::now(),
        });
        if let Some(previous) = previous {
            debug!(flow = ?previous.flow, "Replacing pending redirect");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PendingRedirect>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{session_for, MockBackend};
    use mockall::predicate::eq;

    const CALLBACK: &str = "https://app.example.com/auth/callback";

    fn enabled_backend() -> MockBackend {
        let mut backend = MockBackend::new();
        backend
            .expect_provider_enabled()
            .returning(|_| Ok(true));
        backend
            .expect_authorize_url()
            .returning(|provider, redirect_to, challenge| {
                Ok(format!(
                    "https://auth.example.com/auth/v1/authorize?provider={}&redirect_to={}&code_challenge={}",
                    provider.as_str(),
                    redirect_to,
                    challenge
                ))
            });
        backend
    }

    #[test]
    fn test_pkce_verifier_generation() {
        let verifier = PkceVerifier::new();

        assert_eq!(verifier.verifier().len(), 43);
        assert_eq!(verifier.challenge(), verifier.challenge());

        let verifier2 = PkceVerifier::new();
        assert_ne!(verifier.verifier(), verifier2.verifier());
        assert_ne!(verifier.challenge(), verifier2.challenge());
    }

    #[test]
    fn test_pkce_challenge_known_vector() {
        // RFC 7636 Appendix B
        let verifier = PkceVerifier {
            verifier: "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".to_string(),
        };

        assert_eq!(
            verifier.challenge(),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        assert!(!format!("{:?}", verifier).contains("dBjft"));
    }

    #[tokio::test]
    async fn test_begin_records_verifier() {
        let initiator = OAuthInitiator::new(Arc::new(enabled_backend()), CALLBACK);

        let redirect = initiator.begin(OAuthProvider::Google).await.unwrap();

        assert_eq!(redirect.provider, OAuthProvider::Google);
        assert!(redirect.url.contains("provider=google"));
        assert!(redirect.url.contains("code_challenge="));
        assert_eq!(
            initiator.pending_flow(),
            Some(RedirectFlow::OAuth(OAuthProvider::Google))
        );
    }

    #[tokio::test]
    async fn test_begin_fails_when_service_unreachable() {
        let mut backend = MockBackend::new();
        backend
            .expect_provider_enabled()
            .returning(|_| Err(AuthError::Network("connection refused".into())));
        backend.expect_authorize_url().times(0);

        let initiator = OAuthInitiator::new(Arc::new(backend), CALLBACK);
        let err = initiator.begin(OAuthProvider::GitHub).await.unwrap_err();

        assert!(matches!(err, AuthError::Network(_)));
        assert_eq!(initiator.pending_flow(), None);
    }

    #[tokio::test]
    async fn test_begin_rejects_disabled_provider() {
        let mut backend = MockBackend::new();
        backend.expect_provider_enabled().returning(|_| Ok(false));

        let initiator = OAuthInitiator::new(Arc::new(backend), CALLBACK);
        let err = initiator.begin(OAuthProvider::GitHub).await.unwrap_err();

        assert_eq!(err.to_string(), "GitHub sign-in is not enabled");
    }

    #[tokio::test]
    async fn test_complete_exchanges_code_with_verifier() {
        let mut backend = enabled_backend();
        backend
            .expect_exchange_code()
            .with(eq("abc123"), mockall::predicate::function(|v: &str| v.len() == 43))
            .times(1)
            .returning(|_, _| Ok(session_for("u1")));

        let initiator = OAuthInitiator::new(Arc::new(backend), CALLBACK);
        initiator.begin(OAuthProvider::GitHub).await.unwrap();

        let (flow, session) = initiator
            .complete("https://app.example.com/auth/callback?code=abc123")
            .await
            .unwrap();

        assert_eq!(flow, RedirectFlow::OAuth(OAuthProvider::GitHub));
        assert_eq!(session.user.id.as_str(), "u1");
        assert_eq!(initiator.pending_flow(), None);
    }

    #[tokio::test]
    async fn test_complete_without_pending_redirect() {
        let initiator = OAuthInitiator::new(Arc::new(MockBackend::new()), CALLBACK);

        let err = initiator
            .complete("https://app.example.com/auth/callback?code=abc123")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn test_complete_reports_provider_error() {
        let initiator = OAuthInitiator::new(Arc::new(MockBackend::new()), CALLBACK);
        initiator.prepare_magic_link();

        let err = initiator
            .complete("https://app.example.com/auth/callback#error=access_denied&error_description=Email+link+is+invalid+or+has+expired")
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Email link is invalid or has expired");
        assert_eq!(initiator.pending_flow(), None);
    }

    #[test]
    fn test_new_redirect_replaces_previous() {
        let initiator = OAuthInitiator::new(Arc::new(MockBackend::new()), CALLBACK);

        let first = initiator.prepare_magic_link();
        let second = initiator.prepare_magic_link();

        assert_ne!(first, second);
        assert_eq!(initiator.pending_flow(), Some(RedirectFlow::MagicLink));

        initiator.cancel();
        assert_eq!(initiator.pending_flow(), None);
    }
}
