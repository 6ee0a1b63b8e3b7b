//! Backend seam: the raw exchanges the auth core performs.
//!
//! Implementations translate transport and HTTP failures into
//! [`AuthError::Network`](crate::AuthError::Network) and
//! [`AuthError::BackendRejected`](crate::AuthError::BackendRejected). Replies
//! from the application API are returned as-is in [`ApiReply`]; deciding what
//! a `success: false` means is left to the caller.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::{AuthProviders, OAuthProvider, Profile, Session, User};

/// Where a one-time code was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpTarget {
    Email(String),
    Phone(String),
}

impl OtpTarget {
    pub fn contact(&self) -> &str {
        match self {
            OtpTarget::Email(email) => email,
            OtpTarget::Phone(phone) => phone,
        }
    }
}

/// Reply envelope of the application API (`/api/auth/*`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub session: Option<Session>,
}

impl ApiReply {
    /// The reason given for a failure, preferring `error` over `message`.
    pub fn failure_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .filter(|m| !m.trim().is_empty())
    }
}

/// Result of a registration. Without a session the account still awaits
/// email confirmation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignUpReply {
    pub user: Option<User>,
    pub session: Option<Session>,
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;

    async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<SignUpReply>;

    async fn send_email_otp(&self, email: &str) -> Result<ApiReply>;

    async fn send_phone_otp(&self, phone: &str) -> Result<ApiReply>;

    async fn verify_otp(&self, target: &OtpTarget, code: &str) -> Result<ApiReply>;

    /// Emails a sign-in link that redirects to `redirect_to` with a PKCE code.
    async fn send_magic_link(
        &self,
        email: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<()>;

    /// Whether the provider is enabled on the auth service.
    async fn provider_enabled(&self, provider: OAuthProvider) -> Result<bool>;

    fn authorize_url(
        &self,
        provider: OAuthProvider,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<String>;

    /// Exchanges a PKCE authorization code for a session.
    async fn exchange_code(&self, auth_code: &str, code_verifier: &str) -> Result<Session>;

    /// Revokes the session identified by `access_token` server-side.
    async fn sign_out(&self, access_token: &str) -> Result<()>;

    async fn reset_password(&self, email: &str, redirect_to: &str) -> Result<()>;

    async fn update_password(&self, access_token: &str, new_password: &str) -> Result<User>;

    async fn fetch_profile(&self, access_token: &str, user_id: &str) -> Result<Profile>;

    async fn update_profile(
        &self,
        access_token: &str,
        user_id: &str,
        updates: &Map<String, Value>,
    ) -> Result<Profile>;

    async fn auth_providers(&self) -> Result<AuthProviders>;
}
