//! # Auth Orchestrator
//!
//! Single owner of the user-visible authentication state.
//!
//! ## Overview
//!
//! The `AuthOrchestrator` combines the session store, the credential channels,
//! the redirect initiator and the profile accessor behind one UI-facing API.
//! It:
//! - restores the persisted session on startup
//! - follows the store's sign-in/sign-out notifications
//! - runs every operation as a detached task that finishes even if the caller
//!   stops waiting
//! - publishes [`OrchestratorState`] snapshots and [`AuthEvent`]s
//!
//! An explicit [`sign_out`](AuthOrchestrator::sign_out) always wins over
//! notifications that were already in flight; see [`crate::machine`].
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::AuthOrchestrator;
//! use core_runtime::config::AuthConfig;
//!
//! # async fn example() -> core_auth::Result<()> {
//! let config = AuthConfig::builder()
//!     .auth_url("https://project.auth.example.com")
//!     .api_key("public-anon-key")
//!     .origin("https://app.example.com")
//!     .build()?;
//!
//! let auth = AuthOrchestrator::from_config(&config)?;
//! let state = auth.ready().await;
//!
//! if !state.is_authenticated() {
//!     auth.send_email_otp("alice@example.com").await?;
//!     auth.verify_email_otp("alice@example.com", "123456").await?;
//! }
//! # Ok(())
//! # }
//! ```

use core_runtime::config::{AuthConfig, DEFAULT_MAX_VERIFY_ATTEMPTS};
use core_runtime::events::{AuthEvent, EventBus, Receiver};
use core_runtime::logging::redact_contact;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::backend::AuthBackend;
use crate::channel::CredentialChannel;
use crate::error::{AuthError, Result};
use crate::http_backend::HttpAuthBackend;
use crate::machine::{Sequencer, SessionMachine, Stamp};
use crate::oauth::{OAuthInitiator, RedirectFlow};
use crate::profile::ProfileAccessor;
use crate::session_store::{SecureSessionStore, SessionListener, SessionStore, Subscription};
use crate::types::{
    AuthOutcome, AuthPhase, AuthProviders, ChallengeKind, InfoNotice, OAuthProvider,
    OAuthRedirect, OrchestratorState, PendingChallenge, Profile, Session, SessionChange, User,
};

/// Application URLs and limits the orchestrator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Where redirect sign-ins return to
    pub callback_url: String,
    /// Where password reset emails link to
    pub reset_password_url: String,
    /// Rejected verifications tolerated per pending challenge
    pub max_verify_attempts: u32,
}

impl OrchestratorOptions {
    pub fn for_origin(origin: &str) -> Self {
        let origin = origin.trim_end_matches('/');
        Self {
            callback_url: format!("{}/auth/callback", origin),
            reset_password_url: format!("{}/auth/reset-password", origin),
            max_verify_attempts: DEFAULT_MAX_VERIFY_ATTEMPTS,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            callback_url: config.callback_url(),
            reset_password_url: config.reset_password_url(),
            max_verify_attempts: config.max_verify_attempts,
        }
    }

    pub fn with_max_verify_attempts(mut self, attempts: u32) -> Self {
        self.max_verify_attempts = attempts;
        self
    }
}

/// State shared between the orchestrator handle and its tasks.
struct Inner {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn AuthBackend>,
    channel: CredentialChannel,
    oauth: OAuthInitiator,
    profiles: ProfileAccessor,
    options: OrchestratorOptions,
    event_bus: EventBus,
    sequencer: Arc<Sequencer>,
    machine: Mutex<SessionMachine>,
    state_tx: watch::Sender<OrchestratorState>,
}

/// Keeps `loading` on while alive.
struct LoadingGuard {
    inner: Arc<Inner>,
}

impl LoadingGuard {
    fn operation(inner: &Arc<Inner>) -> Self {
        inner.update(|machine| machine.begin_operation());
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.inner.update(|machine| machine.end_load());
    }
}

/// UI-facing authentication API.
///
/// Must be created inside a Tokio runtime. Dropping it detaches from the
/// session store and stops following notifications; operations already
/// running still complete.
pub struct AuthOrchestrator {
    inner: Arc<Inner>,
    subscription: Subscription,
    pump: JoinHandle<()>,
    restore: JoinHandle<()>,
}

impl AuthOrchestrator {
    /// Creates an orchestrator and starts restoring the persisted session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] when called outside a Tokio runtime.
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn AuthBackend>,
        event_bus: EventBus,
        options: OrchestratorOptions,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            AuthError::Configuration(
                "AuthOrchestrator must be created inside a Tokio runtime".to_string(),
            )
        })?;

        let machine = SessionMachine::new(options.max_verify_attempts);
        let (state_tx, _) = watch::channel(machine.state().clone());

        let inner = Arc::new(Inner {
            store: Arc::clone(&store),
            channel: CredentialChannel::new(Arc::clone(&backend)),
            oauth: OAuthInitiator::new(Arc::clone(&backend), options.callback_url.clone()),
            profiles: ProfileAccessor::new(Arc::clone(&backend)),
            backend,
            options,
            event_bus,
            sequencer: Arc::new(Sequencer::new()),
            machine: Mutex::new(machine),
            state_tx,
        });

        // Subscribe before restoring so nothing between the two is missed.
        let (notice_tx, notice_rx) = mpsc::unbounded_channel::<(Stamp, SessionChange)>();
        let sequencer = Arc::clone(&inner.sequencer);
        let listener: SessionListener = Arc::new(move |change| {
            let stamp = sequencer.next();
            if notice_tx.send((stamp, change)).is_err() {
                debug!(stamp, "Notification arrived after orchestrator shut down");
            }
        });
        let subscription = store.subscribe(listener);

        let pump = runtime.spawn(Self::pump(Arc::clone(&inner), notice_rx).in_current_span());

        // Phase and loading settle in the same snapshot.
        inner.update(|machine| machine.begin_load());
        let restore_inner = Arc::clone(&inner);
        let restore = runtime.spawn(
            async move {
                let result = restore_inner.store.read_current().await;
                match &result {
                    Ok(Some(session)) => info!(user_id = %session.user.id, "Session restored"),
                    Ok(None) => info!("No session to restore"),
                    Err(e) => warn!(error = %e, "Session restore failed"),
                }
                restore_inner.update(|machine| {
                    machine.apply_restore(result);
                    machine.end_load();
                });
            }
            .in_current_span(),
        );

        Ok(Self {
            inner,
            subscription,
            pump,
            restore,
        })
    }

    /// Wires the HTTP backend and secure-storage session store from `config`.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn AuthBackend> = Arc::new(HttpAuthBackend::from_config(config));
        let store = Arc::new(SecureSessionStore::new(
            Arc::clone(&config.secure_store),
            Arc::clone(&backend),
            config.session_key.clone(),
        )
        .with_clock(Arc::clone(&config.clock)));

        Self::new(
            store,
            backend,
            EventBus::new(config.event_buffer_size),
            OrchestratorOptions::from_config(config),
        )
    }

    async fn pump(inner: Arc<Inner>, mut notices: mpsc::UnboundedReceiver<(Stamp, SessionChange)>) {
        while let Some((stamp, change)) = notices.recv().await {
            let applied = inner.update(|machine| machine.apply_notice(stamp, change));
            debug!(stamp, applied, "Session notification processed");
        }
    }

    // ------------------------------------------------------------------------
    // State access
    // ------------------------------------------------------------------------

    /// Current snapshot.
    pub fn state(&self) -> OrchestratorState {
        self.inner.state_tx.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<OrchestratorState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> Receiver<AuthEvent> {
        self.inner.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    /// Waits for the initial restore (or a notification) to decide the phase.
    pub async fn ready(&self) -> OrchestratorState {
        let mut rx = self.watch();
        let settled = match rx.wait_for(|state| state.phase != AuthPhase::Unknown).await {
            Ok(state) => OrchestratorState::clone(&state),
            Err(_) => self.state(),
        };
        settled
    }

    pub fn clear_error(&self) {
        self.inner.update(|machine| machine.clear_error());
    }

    pub fn clear_notice(&self) {
        self.inner.update(|machine| machine.clear_notice());
    }

    // ------------------------------------------------------------------------
    // Redirect sign-in
    // ------------------------------------------------------------------------

    /// Returns the Google authorization URL the host must open.
    pub async fn sign_in_with_google(&self) -> Result<OAuthRedirect> {
        self.sign_in_with_oauth(OAuthProvider::Google).await
    }

    /// Returns the GitHub authorization URL the host must open.
    pub async fn sign_in_with_github(&self) -> Result<OAuthRedirect> {
        self.sign_in_with_oauth(OAuthProvider::GitHub).await
    }

    #[instrument(skip(self))]
    pub async fn sign_in_with_oauth(&self, provider: OAuthProvider) -> Result<OAuthRedirect> {
        self.detach(true, move |inner| async move {
            let redirect = inner.oauth.begin(provider).await?;
            inner.update(|machine| machine.redirect_started(provider));
            info!(provider = %provider, "OAuth redirect ready");
            Ok(redirect)
        })
        .await
    }

    /// Finishes an OAuth or magic-link sign-in from the URL the browser was
    /// sent back to.
    #[instrument(skip(self, callback_url))]
    pub async fn complete_oauth_callback(&self, callback_url: &str) -> Result<AuthOutcome> {
        let callback_url = callback_url.to_string();
        self.detach(true, move |inner| async move {
            let (flow, session) = inner.oauth.complete(&callback_url).await?;
            let user = inner.install_session(session, flow.method()).await;
            Ok(AuthOutcome::user(user))
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Password
    // ------------------------------------------------------------------------

    #[instrument(skip(self, email, password), fields(email = %redact_contact(email)))]
    pub async fn sign_in_with_email(&self, email: &str, password: &str) -> Result<AuthOutcome> {
        let (email, password) = (email.to_string(), password.to_string());
        self.detach(true, move |inner| async move {
            let session = inner.channel.sign_in_with_password(&email, &password).await?;
            let user = inner.install_session(session, "password").await;
            Ok(AuthOutcome::user(user))
        })
        .await
    }

    /// Registers a new account. Without email auto-confirmation the user is
    /// set but no session exists until the address is confirmed.
    #[instrument(skip(self, email, password), fields(email = %redact_contact(email)))]
    pub async fn sign_up_with_email(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<AuthOutcome> {
        let (email, password, username) =
            (email.to_string(), password.to_string(), username.to_string());
        self.detach(true, move |inner| async move {
            let reply = inner.channel.sign_up(&email, &password, &username).await?;

            if let Some(session) = reply.session {
                let user = inner.install_session(session, "sign_up").await;
                return Ok(AuthOutcome::user(user));
            }

            let notice = InfoNotice::confirmation_required();
            inner.update(|machine| {
                if let Some(user) = reply.user.clone() {
                    machine.set_user(user, "sign_up");
                }
                machine.record_notice(notice.clone());
            });
            info!("Account created, awaiting email confirmation");

            Ok(AuthOutcome {
                user: reply.user,
                notice: Some(notice),
            })
        })
        .await
    }

    #[instrument(skip(self, email), fields(email = %redact_contact(email)))]
    pub async fn reset_password(&self, email: &str) -> Result<AuthOutcome> {
        let email = email.to_string();
        self.detach(true, move |inner| async move {
            inner
                .channel
                .reset_password(&email, &inner.options.reset_password_url)
                .await?;
            let notice = InfoNotice::password_reset_sent();
            inner.update(|machine| machine.record_notice(notice.clone()));
            Ok(AuthOutcome::notice(notice))
        })
        .await
    }

    #[instrument(skip(self, new_password))]
    pub async fn update_password(&self, new_password: &str) -> Result<User> {
        let new_password = new_password.to_string();
        self.detach(true, move |inner| async move {
            let session = inner.current_session().ok_or(AuthError::NotAuthenticated)?;
            if new_password.is_empty() {
                return Err(AuthError::Validation("Password is required".to_string()));
            }

            let user = inner
                .backend
                .update_password(&session.access_token, &new_password)
                .await?;
            inner.update(|machine| machine.refresh_user(user.clone()));
            info!(user_id = %user.id, "Password updated");
            Ok(user)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // One-time codes and magic links
    // ------------------------------------------------------------------------

    #[instrument(skip(self, email), fields(email = %redact_contact(email)))]
    pub async fn send_email_otp(&self, email: &str) -> Result<AuthOutcome> {
        self.send_code(ChallengeKind::EmailOtp, email).await
    }

    #[instrument(skip(self, email, code), fields(email = %redact_contact(email)))]
    pub async fn verify_email_otp(&self, email: &str, code: &str) -> Result<AuthOutcome> {
        self.verify_code(ChallengeKind::EmailOtp, email, code).await
    }

    #[instrument(skip(self, phone), fields(phone = %redact_contact(phone)))]
    pub async fn send_phone_otp(&self, phone: &str) -> Result<AuthOutcome> {
        self.send_code(ChallengeKind::PhoneOtp, phone).await
    }

    #[instrument(skip(self, phone, code), fields(phone = %redact_contact(phone)))]
    pub async fn verify_phone_otp(&self, phone: &str, code: &str) -> Result<AuthOutcome> {
        self.verify_code(ChallengeKind::PhoneOtp, phone, code).await
    }

    /// Emails a sign-in link. The link lands on the callback URL and is
    /// finished with [`complete_oauth_callback`](Self::complete_oauth_callback).
    #[instrument(skip(self, email), fields(email = %redact_contact(email)))]
    pub async fn sign_in_with_magic_link(&self, email: &str) -> Result<AuthOutcome> {
        let email = email.trim().to_string();
        self.detach(true, move |inner| async move {
            let challenge = inner.oauth.prepare_magic_link();
            if let Err(e) = inner
                .channel
                .send_magic_link(&email, inner.oauth.callback_url(), &challenge)
                .await
            {
                if inner.oauth.pending_flow() == Some(RedirectFlow::MagicLink) {
                    inner.oauth.cancel();
                }
                return Err(e);
            }

            let notice = InfoNotice::magic_link_sent();
            inner.update(|machine| {
                machine.challenge_sent(PendingChallenge::new(ChallengeKind::MagicLink, email.clone()));
                machine.record_notice(notice.clone());
            });
            info!("Magic link sent");
            Ok(AuthOutcome::notice(notice))
        })
        .await
    }

    async fn send_code(&self, kind: ChallengeKind, contact: &str) -> Result<AuthOutcome> {
        let contact = contact.trim().to_string();
        self.detach(true, move |inner| async move {
            inner.channel.send_code(kind, &contact).await?;

            let notice = InfoNotice::code_sent(kind);
            inner.update(|machine| {
                machine.challenge_sent(PendingChallenge::new(kind, contact.clone()));
                machine.record_notice(notice.clone());
            });
            info!(kind = %kind, "Verification code sent");
            Ok(AuthOutcome::notice(notice))
        })
        .await
    }

    async fn verify_code(&self, kind: ChallengeKind, contact: &str, code: &str) -> Result<AuthOutcome> {
        let (contact, code) = (contact.trim().to_string(), code.to_string());
        self.detach(true, move |inner| async move {
            let identity = match inner.channel.verify_code(kind, &contact, &code).await {
                Ok(identity) => identity,
                Err(err @ AuthError::BackendRejected { .. }) => {
                    if inner.update(|machine| machine.challenge_rejected(kind)) {
                        warn!(kind = %kind, "Too many rejected codes, challenge discarded");
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            };

            inner.update(|machine| machine.challenge_verified(kind));

            if let Some(session) = identity.session {
                let user = inner.install_session(session, kind.as_str()).await;
                return Ok(AuthOutcome::user(user));
            }

            match identity.user {
                Some(user) => {
                    inner.update(|machine| machine.set_user(user.clone(), kind.as_str()));
                    info!(user_id = %user.id, kind = %kind, "Code verified");
                    Ok(AuthOutcome::user(user))
                }
                None => {
                    info!(kind = %kind, "Code verified without user");
                    Ok(AuthOutcome::default())
                }
            }
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Sign-out
    // ------------------------------------------------------------------------

    /// Ends the session. Once this returns `Ok`, the state is `Anonymous`
    /// and no notification received earlier can change that.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        self.detach(true, move |inner| async move {
            inner.store.revoke().await?;

            let stamp = inner.sequencer.next();
            inner.oauth.cancel();
            inner.update(|machine| machine.force_signed_out(stamp));

            info!(barrier = stamp, "User signed out");
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Profile and deployment info
    // ------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_user_profile(&self) -> Result<Profile> {
        self.detach(false, move |inner| async move {
            let session = inner.current_session();
            inner.profiles.fetch(session.as_ref()).await
        })
        .await
    }

    #[instrument(skip(self, updates))]
    pub async fn update_user_profile(&self, updates: Map<String, Value>) -> Result<Profile> {
        self.detach(false, move |inner| async move {
            let session = inner.current_session();
            inner.profiles.update(session.as_ref(), &updates).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_auth_providers(&self) -> Result<AuthProviders> {
        self.detach(false, move |inner| async move { inner.backend.auth_providers().await })
            .await
    }

    /// Runs `op` on its own task so it completes even if the caller's future
    /// is dropped. Failures land in `last_error`.
    async fn detach<T, F, Fut>(&self, track_loading: bool, op: F) -> Result<T>
    where
        F: FnOnce(Arc<Inner>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let guard = track_loading.then(|| LoadingGuard::operation(&inner));

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                let result = op(Arc::clone(&inner)).await;
                if let Err(err) = &result {
                    inner.update(|machine| machine.record_error(err));
                }
                result
            }
            .in_current_span(),
        );

        match task.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(error = %join_err, "Auth operation task failed");
                let err = AuthError::Internal(format!("Auth operation task failed: {}", join_err));
                self.inner.update(|machine| machine.record_error(&err));
                Err(err)
            }
        }
    }
}

impl Drop for AuthOrchestrator {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        self.pump.abort();
        self.restore.abort();
        debug!("Auth orchestrator dropped");
    }
}

impl Inner {
    /// Applies `f` to the machine, then publishes the snapshot (if it
    /// changed) and the queued events while still holding the lock.
    fn update<R>(&self, f: impl FnOnce(&mut SessionMachine) -> R) -> R {
        let mut machine = self
            .machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = f(&mut machine);

        let snapshot = machine.state().clone();
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });

        for event in machine.take_events() {
            debug!(event = event.description(), severity = ?event.severity(), "Auth event");
            let _ = self.event_bus.emit(event);
        }

        result
    }

    fn current_session(&self) -> Option<Session> {
        self.state_tx.borrow().session.clone()
    }

    /// Installs a fresh session locally, then hands it to the store. The
    /// store's own `SignedIn` notification is a no-op afterwards; a failure
    /// to persist leaves the session valid for this run.
    async fn install_session(&self, session: Session, method: &str) -> User {
        let user = session.user.clone();
        self.update(|machine| machine.adopt_session(session.clone(), method));

        if let Err(e) = self.store.establish(session).await {
            warn!(error = %e, "Session could not be persisted");
        }

        info!(user_id = %user.id, method, "User signed in");
        user
    }
}
