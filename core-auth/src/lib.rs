//! # Authentication Module
//!
//! Session and credential orchestration for the application's users.
//!
//! ## Overview
//!
//! This module owns "who is signed in". It restores the persisted session,
//! follows the session store's notifications, and offers every sign-in
//! modality the deployment supports behind one [`AuthOrchestrator`].
//!
//! ## Features
//!
//! - Email/password sign-in and sign-up
//! - Email and SMS one-time codes with pending-challenge tracking
//! - Magic links and OAuth (Google, GitHub) with PKCE
//! - Profile read and partial update
//! - Secure session persistence via platform-specific secure stores
//! - Auth state snapshots and event emission

pub mod backend;
pub mod channel;
pub mod error;
pub mod http_backend;
pub mod machine;
pub mod oauth;
pub mod orchestrator;
pub mod profile;
pub mod session_store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use backend::{ApiReply, AuthBackend, OtpTarget, SignUpReply};
pub use channel::{CredentialChannel, VerifiedIdentity, OTP_CODE_LENGTH};
pub use error::{AuthError, ErrorInfo, ErrorKind, Result};
pub use http_backend::HttpAuthBackend;
pub use oauth::{OAuthInitiator, PkceVerifier, RedirectFlow};
pub use orchestrator::{AuthOrchestrator, OrchestratorOptions};
pub use profile::ProfileAccessor;
pub use session_store::{
    SecureSessionStore, SessionListener, SessionListeners, SessionStore, Subscription,
};
pub use types::{
    AuthOutcome, AuthPhase, AuthProviders, ChallengeKind, InfoNotice, NoticeKind, OAuthProvider,
    OAuthRedirect, OrchestratorState, PendingChallenge, Profile, Session, SessionChange, User,
    UserId,
};
