//! End-to-end flows through `AuthOrchestrator` with a mocked backend and an
//! in-memory session store.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use core_auth::{
    ApiReply, AuthBackend, AuthError, AuthOrchestrator, AuthPhase, AuthProviders, ChallengeKind,
    NoticeKind, OAuthProvider, OrchestratorOptions, OrchestratorState, OtpTarget, Profile,
    Result, Session, SessionChange, SessionListener, SessionListeners, SessionStore, SignUpReply,
    Subscription, User,
};
use core_runtime::events::{AuthEvent, EventBus, Receiver};
use mockall::mock;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

mock! {
    pub Backend {}

    #[async_trait]
    impl AuthBackend for Backend {
        async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;
        async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<SignUpReply>;
        async fn send_email_otp(&self, email: &str) -> Result<ApiReply>;
        async fn send_phone_otp(&self, phone: &str) -> Result<ApiReply>;
        async fn verify_otp(&self, target: &OtpTarget, code: &str) -> Result<ApiReply>;
        async fn send_magic_link(&self, email: &str, redirect_to: &str, code_challenge: &str) -> Result<()>;
        async fn provider_enabled(&self, provider: OAuthProvider) -> Result<bool>;
        fn authorize_url(&self, provider: OAuthProvider, redirect_to: &str, code_challenge: &str) -> Result<String>;
        async fn exchange_code(&self, auth_code: &str, code_verifier: &str) -> Result<Session>;
        async fn sign_out(&self, access_token: &str) -> Result<()>;
        async fn reset_password(&self, email: &str, redirect_to: &str) -> Result<()>;
        async fn update_password(&self, access_token: &str, new_password: &str) -> Result<User>;
        async fn fetch_profile(&self, access_token: &str, user_id: &str) -> Result<Profile>;
        async fn update_profile(&self, access_token: &str, user_id: &str, updates: &Map<String, Value>) -> Result<Profile>;
        async fn auth_providers(&self) -> Result<AuthProviders>;
    }
}

/// Session store kept in memory. Can be told to fail reads, to hold
/// `establish` until released, or to report a late sign-in while revoking.
#[derive(Default)]
struct FakeStore {
    session: Mutex<Option<Session>>,
    listeners: SessionListeners,
    fail_read: bool,
    establish_gate: Option<Arc<Notify>>,
    stale_sign_in: Mutex<Option<Session>>,
}

impl FakeStore {
    fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            ..Self::default()
        }
    }

    fn stored(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    fn emit(&self, change: SessionChange) {
        self.listeners.notify(change);
    }
}

#[async_trait]
impl SessionStore for FakeStore {
    async fn read_current(&self) -> Result<Option<Session>> {
        if self.fail_read {
            return Err(AuthError::Storage("keychain locked".to_string()));
        }
        Ok(self.stored())
    }

    fn subscribe(&self, listener: SessionListener) -> Subscription {
        self.listeners.register(listener)
    }

    async fn establish(&self, session: Session) -> Result<()> {
        if let Some(gate) = &self.establish_gate {
            gate.notified().await;
        }
        *self.session.lock().unwrap() = Some(session.clone());
        self.emit(SessionChange::SignedIn(session));
        Ok(())
    }

    async fn revoke(&self) -> Result<()> {
        if let Some(stale) = self.stale_sign_in.lock().unwrap().take() {
            self.emit(SessionChange::SignedIn(stale));
        }
        *self.session.lock().unwrap() = None;
        self.emit(SessionChange::SignedOut);
        Ok(())
    }
}

fn user(id: &str) -> User {
    User::new(id).with_email(format!("{}@example.com", id))
}

fn session_for(id: &str) -> Session {
    Session {
        access_token: format!("access-{}", id),
        refresh_token: Some(format!("refresh-{}", id)),
        expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        user: user(id),
    }
}

fn api_ok() -> ApiReply {
    ApiReply {
        success: true,
        ..ApiReply::default()
    }
}

fn options() -> OrchestratorOptions {
    OrchestratorOptions::for_origin("https://app.example.com").with_max_verify_attempts(2)
}

fn start(store: Arc<FakeStore>, backend: MockBackend) -> (AuthOrchestrator, Receiver<AuthEvent>) {
    let auth = AuthOrchestrator::new(store, Arc::new(backend), EventBus::new(64), options())
        .expect("inside runtime");
    let events = auth.subscribe_events();
    (auth, events)
}

async fn ready(auth: &AuthOrchestrator) -> OrchestratorState {
    tokio::time::timeout(Duration::from_secs(1), auth.ready())
        .await
        .expect("restore settles")
}

/// Lets the notification pump catch up.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn drain(events: &mut Receiver<AuthEvent>) -> Vec<AuthEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn sign_ins(events: &[AuthEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, AuthEvent::SignedIn { .. }))
        .count()
}

#[tokio::test]
async fn test_restores_persisted_session() {
    let store = Arc::new(FakeStore::with_session(session_for("u1")));
    let (auth, mut events) = start(store, MockBackend::new());

    let state = ready(&auth).await;
    assert_eq!(state.phase, AuthPhase::Authenticated);
    assert_eq!(state.user.unwrap().id.as_str(), "u1");
    assert!(!state.loading);

    let events = drain(&mut events);
    assert_eq!(
        events[0],
        AuthEvent::Restored {
            user_id: Some("u1".to_string())
        }
    );
}

#[tokio::test]
async fn test_starts_loading_and_anonymous_without_session() {
    let (auth, _events) = start(Arc::new(FakeStore::default()), MockBackend::new());

    let initial = auth.state();
    assert_eq!(initial.phase, AuthPhase::Unknown);
    assert!(initial.loading);

    let state = ready(&auth).await;
    assert_eq!(state.phase, AuthPhase::Anonymous);
    assert!(state.user.is_none());
    assert!(!state.loading);
    assert!(state.last_error.is_none());
}

#[tokio::test]
async fn test_restore_failure_is_recorded() {
    let store = Arc::new(FakeStore {
        fail_read: true,
        ..FakeStore::default()
    });
    let (auth, _events) = start(store, MockBackend::new());

    let state = ready(&auth).await;
    assert_eq!(state.phase, AuthPhase::Anonymous);
    let error = state.last_error.expect("restore error recorded");
    assert!(error.message.contains("keychain locked"));
}

#[test]
fn test_new_outside_runtime_fails() {
    let result = AuthOrchestrator::new(
        Arc::new(FakeStore::default()),
        Arc::new(MockBackend::new()),
        EventBus::new(8),
        options(),
    );
    assert!(matches!(result, Err(AuthError::Configuration(_))));
}

#[tokio::test]
async fn test_password_sign_in_persists_session_once() {
    let mut backend = MockBackend::new();
    backend
        .expect_sign_in_with_password()
        .withf(|email, password| email == "u1@example.com" && password == "hunter22")
        .times(1)
        .returning(|_, _| Ok(session_for("u1")));
    let store = Arc::new(FakeStore::default());
    let (auth, mut events) = start(Arc::clone(&store), backend);
    ready(&auth).await;

    let outcome = auth
        .sign_in_with_email("u1@example.com", "hunter22")
        .await
        .unwrap();
    settle().await;

    assert_eq!(outcome.user.unwrap().id.as_str(), "u1");
    assert_eq!(store.stored().unwrap().access_token, "access-u1");

    let state = auth.state();
    assert!(state.is_authenticated());
    assert!(!state.loading);

    // The store's own SignedIn notification must not produce a second event.
    assert_eq!(sign_ins(&drain(&mut events)), 1);
}

#[tokio::test]
async fn test_failed_sign_in_records_error_and_stops_loading() {
    let mut backend = MockBackend::new();
    backend.expect_sign_in_with_password().returning(|_, _| {
        Err(AuthError::BackendRejected {
            status: Some(400),
            message: "Invalid login credentials".to_string(),
        })
    });
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let err = auth
        .sign_in_with_email("u1@example.com", "wrong")
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Invalid login credentials");
    let state = auth.state();
    assert_eq!(state.phase, AuthPhase::Anonymous);
    assert!(!state.loading);
    assert_eq!(
        state.last_error.unwrap().message,
        "Invalid login credentials"
    );
}

#[tokio::test]
async fn test_email_otp_send_then_verify() {
    let mut backend = MockBackend::new();
    backend
        .expect_send_email_otp()
        .times(1)
        .returning(|_| Ok(api_ok()));
    backend
        .expect_verify_otp()
        .withf(|target, code| {
            *target == OtpTarget::Email("u1@example.com".to_string()) && code == "123456"
        })
        .times(1)
        .returning(|_, _| {
            Ok(ApiReply {
                session: Some(session_for("u1")),
                ..api_ok()
            })
        });
    let store = Arc::new(FakeStore::default());
    let (auth, _events) = start(Arc::clone(&store), backend);
    ready(&auth).await;

    let sent = auth.send_email_otp("u1@example.com").await.unwrap();
    assert_eq!(sent.notice.unwrap().kind, NoticeKind::CodeSent);
    assert!(auth.state().pending(ChallengeKind::EmailOtp).is_some());

    let outcome = auth.verify_email_otp("u1@example.com", "123456").await.unwrap();
    assert_eq!(outcome.user.unwrap().id.as_str(), "u1");

    let state = auth.state();
    assert!(state.is_authenticated());
    assert!(state.pending(ChallengeKind::EmailOtp).is_none());
    assert!(store.stored().is_some());
}

#[tokio::test]
async fn test_short_code_never_reaches_backend() {
    let mut backend = MockBackend::new();
    backend.expect_verify_otp().times(0);
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let err = auth.verify_phone_otp("+15551234567", "123").await.unwrap_err();

    assert!(matches!(err, AuthError::Validation(_)));
    assert_eq!(auth.state().phase, AuthPhase::Anonymous);
}

#[tokio::test]
async fn test_rejected_codes_exhaust_challenge() {
    let mut backend = MockBackend::new();
    backend.expect_send_phone_otp().returning(|_| Ok(api_ok()));
    backend.expect_verify_otp().times(2).returning(|_, _| {
        Ok(ApiReply {
            success: false,
            error: Some("Invalid or expired code".to_string()),
            ..ApiReply::default()
        })
    });
    let (auth, mut events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    auth.send_phone_otp("+15551234567").await.unwrap();

    let first = auth.verify_phone_otp("+15551234567", "000000").await.unwrap_err();
    assert_eq!(first.to_string(), "Invalid or expired code");
    assert_eq!(
        auth.state()
            .pending(ChallengeKind::PhoneOtp)
            .unwrap()
            .failed_attempts,
        1
    );

    auth.verify_phone_otp("+15551234567", "111111").await.unwrap_err();
    assert!(auth.state().pending(ChallengeKind::PhoneOtp).is_none());

    let cleared = drain(&mut events).into_iter().any(|e| {
        e == AuthEvent::ChallengeCleared {
            kind: "phone_otp".to_string(),
            reason: "exhausted".to_string(),
        }
    });
    assert!(cleared);
}

#[tokio::test]
async fn test_verified_user_without_session_is_authenticated() {
    let mut backend = MockBackend::new();
    backend.expect_verify_otp().returning(|_, _| {
        Ok(ApiReply {
            user: Some(user("u7")),
            ..api_ok()
        })
    });
    let store = Arc::new(FakeStore::default());
    let (auth, _events) = start(Arc::clone(&store), backend);
    ready(&auth).await;

    auth.verify_phone_otp("+15551234567", "654321").await.unwrap();

    let state = auth.state();
    assert_eq!(state.phase, AuthPhase::Authenticated);
    assert_eq!(state.user.unwrap().id.as_str(), "u7");
    assert!(state.session.is_none());
    assert!(store.stored().is_none());
}

#[tokio::test]
async fn test_magic_link_completes_through_callback() {
    let mut backend = MockBackend::new();
    backend
        .expect_send_magic_link()
        .withf(|email, redirect_to, challenge| {
            email == "u3@example.com"
                && redirect_to == "https://app.example.com/auth/callback"
                && !challenge.is_empty()
        })
        .times(1)
        .returning(|_, _, _| Ok(()));
    backend
        .expect_exchange_code()
        .withf(|code, verifier| code == "link-code" && !verifier.is_empty())
        .times(1)
        .returning(|_, _| Ok(session_for("u3")));
    let (auth, mut events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let sent = auth.sign_in_with_magic_link("u3@example.com").await.unwrap();
    assert_eq!(sent.notice.unwrap().kind, NoticeKind::MagicLinkSent);
    assert!(auth.state().pending(ChallengeKind::MagicLink).is_some());

    let outcome = auth
        .complete_oauth_callback("https://app.example.com/auth/callback?code=link-code")
        .await
        .unwrap();
    assert_eq!(outcome.user.unwrap().id.as_str(), "u3");

    let state = auth.state();
    assert!(state.is_authenticated());
    assert!(state.pending(ChallengeKind::MagicLink).is_none());

    let method = drain(&mut events).into_iter().find_map(|e| match e {
        AuthEvent::SignedIn { method, .. } => Some(method),
        _ => None,
    });
    assert_eq!(method.as_deref(), Some("magic_link"));
}

#[tokio::test]
async fn test_oauth_redirect_then_callback() {
    let mut backend = MockBackend::new();
    backend
        .expect_provider_enabled()
        .returning(|_| Ok(true));
    backend
        .expect_authorize_url()
        .returning(|provider, redirect_to, challenge| {
            Ok(format!(
                "https://auth.example.com/authorize?provider={}&redirect_to={}&code_challenge={}",
                provider.as_str(), redirect_to, challenge
            ))
        });
    backend
        .expect_exchange_code()
        .times(1)
        .returning(|_, _| Ok(session_for("g1")));
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let redirect = auth.sign_in_with_google().await.unwrap();
    assert_eq!(redirect.provider, OAuthProvider::Google);
    assert!(redirect.url.contains("provider=google"));
    // The redirect alone does not sign anyone in.
    assert_eq!(auth.state().phase, AuthPhase::Anonymous);

    auth.complete_oauth_callback("https://app.example.com/auth/callback#code=abc")
        .await
        .unwrap();
    assert_eq!(auth.state().user.unwrap().id.as_str(), "g1");
}

#[tokio::test]
async fn test_oauth_unreachable_backend_surfaces_error() {
    let mut backend = MockBackend::new();
    backend
        .expect_provider_enabled()
        .returning(|_| Err(AuthError::Network("connection refused".to_string())));
    backend.expect_authorize_url().times(0);
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let err = auth.sign_in_with_github().await.unwrap_err();

    assert!(matches!(err, AuthError::Network(_)));
    assert!(auth.state().last_error.is_some());
    assert!(!auth.state().loading);
}

#[tokio::test]
async fn test_callback_without_redirect_is_rejected() {
    let mut backend = MockBackend::new();
    backend.expect_exchange_code().times(0);
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let err = auth
        .complete_oauth_callback("https://app.example.com/auth/callback?code=abc")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Validation(_)));
}

#[tokio::test]
async fn test_sign_out_wins_over_stale_sign_in() {
    let mut backend = MockBackend::new();
    backend.expect_sign_out().times(0);
    let store = Arc::new(FakeStore::with_session(session_for("u1")));
    *store.stale_sign_in.lock().unwrap() = Some(session_for("u1"));
    let (auth, mut events) = start(Arc::clone(&store), backend);
    ready(&auth).await;
    drain(&mut events);

    auth.sign_out().await.unwrap();
    settle().await;

    let state = auth.state();
    assert_eq!(state.phase, AuthPhase::Anonymous);
    assert!(state.session.is_none());
    assert!(state.user.is_none());

    let events = drain(&mut events);
    assert_eq!(sign_ins(&events), 0);
    assert!(events
        .iter()
        .any(|e| matches!(e, AuthEvent::SignedOut { .. })));
}

#[tokio::test]
async fn test_sign_in_after_sign_out_is_accepted() {
    let store = Arc::new(FakeStore::with_session(session_for("u1")));
    let (auth, _events) = start(Arc::clone(&store), MockBackend::new());
    ready(&auth).await;

    auth.sign_out().await.unwrap();
    settle().await;

    // A notification received after the sign-out is new information.
    store.emit(SessionChange::SignedIn(session_for("u2")));
    settle().await;

    assert_eq!(auth.state().user.unwrap().id.as_str(), "u2");
}

#[tokio::test]
async fn test_sign_out_clears_pending_challenges() {
    let mut backend = MockBackend::new();
    backend.expect_send_email_otp().returning(|_| Ok(api_ok()));
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    auth.send_email_otp("u1@example.com").await.unwrap();
    assert!(!auth.state().pending_challenges.is_empty());

    auth.sign_out().await.unwrap();
    assert!(auth.state().pending_challenges.is_empty());
}

#[tokio::test]
async fn test_sign_up_without_session_asks_for_confirmation() {
    let mut backend = MockBackend::new();
    backend.expect_sign_up().returning(|_, _, _| {
        Ok(SignUpReply {
            user: Some(user("new")),
            session: None,
        })
    });
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let outcome = auth
        .sign_up_with_email("new@example.com", "hunter22", "newbie")
        .await
        .unwrap();

    assert_eq!(
        outcome.notice.unwrap().kind,
        NoticeKind::ConfirmationRequired
    );
    let state = auth.state();
    assert_eq!(state.last_notice.unwrap().kind, NoticeKind::ConfirmationRequired);
    assert!(state.session.is_none());
}

#[tokio::test]
async fn test_profile_requires_session() {
    let mut backend = MockBackend::new();
    backend.expect_fetch_profile().times(0);
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let err = auth.get_user_profile().await.unwrap_err();
    assert_eq!(err, AuthError::NotAuthenticated);
}

#[tokio::test]
async fn test_profile_update_uses_current_session() {
    let mut backend = MockBackend::new();
    backend
        .expect_update_profile()
        .withf(|token, user_id, updates| {
            token == "access-u1" && user_id == "u1" && updates.contains_key("bio")
        })
        .times(1)
        .returning(|_, user_id, updates| {
            Ok(Profile {
                id: user_id.into(),
                fields: updates.clone(),
            })
        });
    let store = Arc::new(FakeStore::with_session(session_for("u1")));
    let (auth, _events) = start(store, backend);
    ready(&auth).await;

    let mut updates = Map::new();
    updates.insert("bio".to_string(), Value::String("hello".to_string()));
    let profile = auth.update_user_profile(updates).await.unwrap();

    assert_eq!(profile.get("bio"), Some(&Value::String("hello".to_string())));
}

#[tokio::test]
async fn test_operation_completes_after_caller_gives_up() {
    let mut backend = MockBackend::new();
    backend
        .expect_sign_in_with_password()
        .returning(|_, _| Ok(session_for("u1")));
    let gate = Arc::new(Notify::new());
    let store = Arc::new(FakeStore {
        establish_gate: Some(Arc::clone(&gate)),
        ..FakeStore::default()
    });
    let (auth, _events) = start(Arc::clone(&store), backend);
    ready(&auth).await;

    tokio::select! {
        biased;
        _ = auth.sign_in_with_email("u1@example.com", "hunter22") => {
            panic!("sign-in finished while persistence was held")
        }
        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
    }

    assert!(auth.state().loading);
    gate.notify_one();

    let mut rx = auth.watch();
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| !s.loading))
        .await
        .expect("operation finishes")
        .unwrap();

    assert!(auth.state().is_authenticated());
    assert_eq!(store.stored().unwrap().user.id.as_str(), "u1");
}

#[tokio::test]
async fn test_clear_error_resets_feedback() {
    let mut backend = MockBackend::new();
    backend
        .expect_sign_in_with_password()
        .returning(|_, _| Err(AuthError::Network("offline".to_string())));
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    auth.sign_in_with_email("u1@example.com", "pw").await.unwrap_err();
    assert!(auth.state().last_error.is_some());

    auth.clear_error();
    assert!(auth.state().last_error.is_none());
}

#[tokio::test]
async fn test_second_send_replaces_pending_challenge() {
    let mut backend = MockBackend::new();
    backend.expect_send_phone_otp().times(2).returning(|_| Ok(api_ok()));
    backend
        .expect_verify_otp()
        .withf(|target, code| {
            *target == OtpTarget::Phone("+15550000002".to_string()) && code == "111111"
        })
        .times(1)
        .returning(|_, _| {
            Ok(ApiReply {
                success: false,
                error: Some("Invalid or expired code".to_string()),
                ..ApiReply::default()
            })
        });
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    auth.send_phone_otp("+15550000001").await.unwrap();
    auth.send_phone_otp("+15550000002").await.unwrap();

    let state = auth.state();
    assert_eq!(state.pending_challenges.len(), 1);
    let pending = state.pending(ChallengeKind::PhoneOtp).unwrap();
    assert_eq!(pending.contact, "+15550000002");
    assert_eq!(pending.failed_attempts, 0);

    let err = auth.verify_phone_otp("+15550000002", "111111").await.unwrap_err();
    assert!(matches!(err, AuthError::BackendRejected { .. }));
    assert_eq!(auth.state().phase, AuthPhase::Anonymous);
}

#[tokio::test]
async fn test_reset_password_is_a_notice() {
    let mut backend = MockBackend::new();
    backend
        .expect_reset_password()
        .withf(|email, redirect_to| {
            email == "u1@example.com" && redirect_to == "https://app.example.com/auth/reset-password"
        })
        .times(1)
        .returning(|_, _| Ok(()));
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let outcome = auth.reset_password("u1@example.com").await.unwrap();

    assert_eq!(outcome.notice.unwrap().kind, NoticeKind::PasswordResetSent);
    let state = auth.state();
    assert!(state.last_error.is_none());
    assert_eq!(state.last_notice.unwrap().kind, NoticeKind::PasswordResetSent);

    auth.clear_notice();
    assert!(auth.state().last_notice.is_none());
}

#[tokio::test]
async fn test_update_password_requires_session() {
    let mut backend = MockBackend::new();
    backend.expect_update_password().times(0);
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let err = auth.update_password("n3w-secret").await.unwrap_err();
    assert_eq!(err, AuthError::NotAuthenticated);
}

#[tokio::test]
async fn test_update_password_refreshes_user() {
    let mut backend = MockBackend::new();
    backend
        .expect_update_password()
        .withf(|token, password| token == "access-u1" && password == "n3w-secret")
        .times(1)
        .returning(|_, _| Ok(User::new("u1").with_email("renamed@example.com")));
    let store = Arc::new(FakeStore::with_session(session_for("u1")));
    let (auth, _events) = start(store, backend);
    ready(&auth).await;

    let updated = auth.update_password("n3w-secret").await.unwrap();
    assert_eq!(updated.email.as_deref(), Some("renamed@example.com"));

    let state = auth.state();
    assert_eq!(
        state.user.unwrap().email.as_deref(),
        Some("renamed@example.com")
    );
    assert_eq!(
        state.session.unwrap().user.email.as_deref(),
        Some("renamed@example.com")
    );
}

#[tokio::test]
async fn test_auth_providers_pass_through() {
    let mut backend = MockBackend::new();
    backend.expect_auth_providers().times(1).returning(|| {
        Ok(AuthProviders {
            google: true,
            email: true,
            ..AuthProviders::default()
        })
    });
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    let providers = auth.get_auth_providers().await.unwrap();
    assert!(providers.google && providers.email);
    assert!(!providers.github && !providers.phone);
    assert!(!auth.state().loading);
}

#[tokio::test]
async fn test_repeated_signed_out_notices_are_idempotent() {
    let store = Arc::new(FakeStore::with_session(session_for("u1")));
    let (auth, mut events) = start(Arc::clone(&store), MockBackend::new());
    ready(&auth).await;
    drain(&mut events);

    store.emit(SessionChange::SignedOut);
    settle().await;
    let after_first = auth.state();
    assert!(after_first.session.is_none());
    assert!(after_first.user.is_none());

    store.emit(SessionChange::SignedOut);
    settle().await;
    assert_eq!(auth.state(), after_first);

    let signed_out = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, AuthEvent::SignedOut { .. }))
        .count();
    assert_eq!(signed_out, 1);
}

#[tokio::test]
async fn test_outages_do_not_exhaust_challenge() {
    let mut backend = MockBackend::new();
    backend.expect_send_email_otp().returning(|_| Ok(api_ok()));
    backend
        .expect_verify_otp()
        .times(3)
        .returning(|_, _| Err(AuthError::Network("Auth service unavailable (status 503)".to_string())));
    let (auth, _events) = start(Arc::new(FakeStore::default()), backend);
    ready(&auth).await;

    auth.send_email_otp("u1@example.com").await.unwrap();
    for _ in 0..3 {
        let err = auth.verify_email_otp("u1@example.com", "123456").await.unwrap_err();
        assert!(matches!(err, AuthError::Network(_)));
    }

    let state = auth.state();
    let pending = state.pending(ChallengeKind::EmailOtp).expect("challenge kept");
    assert_eq!(pending.failed_attempts, 0);
}
