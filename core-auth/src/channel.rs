//! Credential channels: password, one-time code and magic-link exchanges.
//!
//! Each call performs at most one backend exchange and normalizes the reply
//! into `Result`. Malformed input is rejected before any request is made.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{ApiReply, AuthBackend, OtpTarget, SignUpReply};
use crate::error::{AuthError, Result};
use crate::types::{ChallengeKind, Session, User};

/// Length of the one-time codes issued by the application API.
pub const OTP_CODE_LENGTH: usize = 6;

/// What a successful code verification yielded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifiedIdentity {
    pub user: Option<User>,
    /// Present when the API issued a full session alongside the user
    pub session: Option<Session>,
}

/// Checks a one-time code before it is sent anywhere.
///
/// The code must be exactly [`OTP_CODE_LENGTH`] characters as typed;
/// padding is not stripped.
///
/// # Examples
///
/// ```
/// use core_auth::channel::validate_code;
///
/// assert_eq!(validate_code("123456").unwrap(), "123456");
/// assert!(validate_code(" 123456 ").is_err());
/// assert!(validate_code("12345").is_err());
/// ```
pub fn validate_code(code: &str) -> Result<&str> {
    if code.chars().count() != OTP_CODE_LENGTH {
        return Err(AuthError::Validation(format!(
            "Code must be {} characters",
            OTP_CODE_LENGTH
        )));
    }
    Ok(code)
}

fn require_present<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AuthError::Validation(format!("{} is required", field)));
    }
    Ok(value)
}

/// Turns an application API envelope into a result.
fn normalize(reply: ApiReply, fallback: &str) -> Result<ApiReply> {
    if reply.success {
        return Ok(reply);
    }

    let message = reply.failure_message().unwrap_or(fallback).to_string();
    debug!(message = %message, "Application API reported failure");
    Err(AuthError::rejected(message))
}

pub struct CredentialChannel {
    backend: Arc<dyn AuthBackend>,
}

impl CredentialChannel {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        Self { backend }
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let email = require_present("Email", email)?;
        if password.is_empty() {
            return Err(AuthError::Validation("Password is required".to_string()));
        }
        self.backend.sign_in_with_password(email, password).await
    }

    pub async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<SignUpReply> {
        let email = require_present("Email", email)?;
        let username = require_present("Username", username)?;
        if password.is_empty() {
            return Err(AuthError::Validation("Password is required".to_string()));
        }
        self.backend.sign_up(email, password, username).await
    }

    /// Delivers a one-time code to an email address or phone number.
    pub async fn send_code(&self, kind: ChallengeKind, contact: &str) -> Result<()> {
        let reply = match kind {
            ChallengeKind::EmailOtp => {
                let email = require_present("Email", contact)?;
                normalize(
                    self.backend.send_email_otp(email).await?,
                    "Failed to send verification code",
                )?
            }
            ChallengeKind::PhoneOtp => {
                let phone = require_present("Phone number", contact)?;
                normalize(
                    self.backend.send_phone_otp(phone).await?,
                    "Failed to send SMS",
                )?
            }
            ChallengeKind::MagicLink => {
                warn!("send_code called for a magic link");
                return Err(AuthError::Internal(
                    "Magic links are not delivered as codes".to_string(),
                ));
            }
        };

        debug!(kind = %kind, message = ?reply.message, "Code delivered");
        Ok(())
    }

    /// Verifies a one-time code. A malformed code never reaches the backend.
    pub async fn verify_code(
        &self,
        kind: ChallengeKind,
        contact: &str,
        code: &str,
    ) -> Result<VerifiedIdentity> {
        let code = validate_code(code)?;
        let target = match kind {
            ChallengeKind::EmailOtp => OtpTarget::Email(require_present("Email", contact)?.to_string()),
            ChallengeKind::PhoneOtp => {
                OtpTarget::Phone(require_present("Phone number", contact)?.to_string())
            }
            ChallengeKind::MagicLink => {
                return Err(AuthError::Internal(
                    "Magic links are completed through the callback".to_string(),
                ));
            }
        };

        let reply = normalize(
            self.backend.verify_otp(&target, code).await?,
            "Invalid verification code",
        )?;

        Ok(VerifiedIdentity {
            user: reply
                .user
                .or_else(|| reply.session.as_ref().map(|s| s.user.clone())),
            session: reply.session,
        })
    }

    pub async fn send_magic_link(
        &self,
        email: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<()> {
        let email = require_present("Email", email)?;
        self.backend
            .send_magic_link(email, redirect_to, code_challenge)
            .await
    }

    pub async fn reset_password(&self, email: &str, redirect_to: &str) -> Result<()> {
        let email = require_present("Email", email)?;
        self.backend.reset_password(email, redirect_to).await
    }
}
