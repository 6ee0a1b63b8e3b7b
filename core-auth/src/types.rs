use chrono::{DateTime, Utc};
use core_runtime::logging::redact_contact;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ErrorInfo;

/// Identifier of an authenticated user.
///
/// The auth service issues UUID strings, while the application API may
/// report numeric ids. Both are accepted and kept as their string form.
///
/// # Examples
///
/// ```
/// use core_auth::UserId;
///
/// let from_text: UserId = serde_json::from_str("\"5f0c...\"").unwrap();
/// let from_number: UserId = serde_json::from_str("42").unwrap();
/// assert_eq!(from_number.as_str(), "42");
/// # let _ = from_text;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => UserId(text),
            RawId::Signed(n) => UserId(n.to_string()),
            RawId::Unsigned(n) => UserId(n.to_string()),
        })
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Accepts both unix seconds (as the auth service sends) and RFC 3339 (as
/// the session is persisted).
fn timestamp_or_rfc3339<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTime {
        Seconds(i64),
        Text(DateTime<Utc>),
    }

    match Option::<RawTime>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawTime::Text(at)) => Ok(Some(at)),
        Some(RawTime::Seconds(secs)) => DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expires_at out of range")),
    }
}

/// An authenticated user as reported by the auth backend.
///
/// Verification is tracked as confirmation timestamps; a contact method is
/// verified once its timestamp is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phone_confirmed_at: Option<DateTime<Utc>>,
    /// Display metadata (`username`, `display_name`, `avatar_url`, ...)
    #[serde(default, alias = "metadata")]
    pub user_metadata: Map<String, Value>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            email: None,
            phone: None,
            email_confirmed_at: None,
            phone_confirmed_at: None,
            user_metadata: Map::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn email_verified(&self) -> bool {
        self.email_confirmed_at.is_some()
    }

    pub fn phone_verified(&self) -> bool {
        self.phone_confirmed_at.is_some()
    }

    /// Best available name for display: `display_name`, then `username`,
    /// then `full_name`, falling back to the email address.
    pub fn display_name(&self) -> Option<&str> {
        ["display_name", "username", "full_name"]
            .iter()
            .find_map(|key| self.user_metadata.get(*key).and_then(Value::as_str))
            .or(self.email.as_deref())
    }
}

/// An authenticated session issued by the auth backend.
///
/// # Security
///
/// Tokens should be stored securely and never logged. The `Debug` implementation
/// redacts them.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// When the access token expires (UTC); `None` if the backend did not say
    #[serde(default, deserialize_with = "timestamp_or_rfc3339")]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: User,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user.id)
            .finish()
    }
}

/// Store-side session transition delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    SignedIn(Session),
    SignedOut,
}

/// A user's profile record: an id plus whatever columns the table holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Profile {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// OAuth identity providers offered to users.
///
/// # Examples
///
/// ```
/// use core_auth::OAuthProvider;
///
/// assert_eq!(OAuthProvider::GitHub.as_str(), "github");
/// assert_eq!(OAuthProvider::parse("Google"), Some(OAuthProvider::Google));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    GitHub,
}

impl OAuthProvider {
    pub fn display_name(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "Google",
            OAuthProvider::GitHub => "GitHub",
        }
    }

    /// Provider identifier understood by the auth service
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::GitHub => "github",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "google" => Some(OAuthProvider::Google),
            "github" => Some(OAuthProvider::GitHub),
            _ => None,
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// URL the host must open to continue an OAuth sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthRedirect {
    pub provider: OAuthProvider,
    pub url: String,
}

/// Which sign-in modalities the deployment has enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProviders {
    #[serde(default)]
    pub google: bool,
    #[serde(default)]
    pub github: bool,
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub phone: bool,
}

/// Kinds of out-of-band verification the user can be asked to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    EmailOtp,
    PhoneOtp,
    MagicLink,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::EmailOtp => "email_otp",
            ChallengeKind::PhoneOtp => "phone_otp",
            ChallengeKind::MagicLink => "magic_link",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A code or link that was sent and not yet consumed.
///
/// Holds no secret: the expected code lives only on the backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChallenge {
    pub kind: ChallengeKind,
    /// Email address or phone number the challenge was sent to
    pub contact: String,
    pub sent_at: DateTime<Utc>,
    /// Verifications the backend rejected for this challenge so far
    pub failed_attempts: u32,
}

impl PendingChallenge {
    pub fn new(kind: ChallengeKind, contact: impl Into<String>) -> Self {
        Self {
            kind,
            contact: contact.into(),
            sent_at: Utc::now(),
            failed_attempts: 0,
        }
    }
}

impl fmt::Debug for PendingChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingChallenge")
            .field("kind", &self.kind)
            .field("contact", &redact_contact(&self.contact))
            .field("sent_at", &self.sent_at)
            .field("failed_attempts", &self.failed_attempts)
            .finish()
    }
}

/// Non-error confirmations surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    CodeSent,
    MagicLinkSent,
    PasswordResetSent,
    ConfirmationRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoNotice {
    pub kind: NoticeKind,
    pub message: String,
}

impl InfoNotice {
    pub fn code_sent(kind: ChallengeKind) -> Self {
        let message = match kind {
            ChallengeKind::PhoneOtp => "Verification code sent to your phone",
            _ => "Verification code sent to your email",
        };
        Self {
            kind: NoticeKind::CodeSent,
            message: message.to_string(),
        }
    }

    pub fn magic_link_sent() -> Self {
        Self {
            kind: NoticeKind::MagicLinkSent,
            message: "Check your email for the login link".to_string(),
        }
    }

    pub fn password_reset_sent() -> Self {
        Self {
            kind: NoticeKind::PasswordResetSent,
            message: "Password reset email sent".to_string(),
        }
    }

    pub fn confirmation_required() -> Self {
        Self {
            kind: NoticeKind::ConfirmationRequired,
            message: "Check your email to confirm your account".to_string(),
        }
    }
}

/// Successful result of a credential operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthOutcome {
    /// The user the operation produced, if any
    pub user: Option<User>,
    /// Confirmation to show, if any
    pub notice: Option<InfoNotice>,
}

impl AuthOutcome {
    pub fn user(user: User) -> Self {
        Self {
            user: Some(user),
            notice: None,
        }
    }

    pub fn notice(notice: InfoNotice) -> Self {
        Self {
            user: None,
            notice: Some(notice),
        }
    }
}

/// Coarse lifecycle of the orchestrator.
///
/// # State Transitions
///
/// ```text
/// Unknown ──restore──> Authenticated <──notifications──> Anonymous
///    └─────restore──────────────────────────────────────────^
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthPhase {
    /// The initial session restore has not resolved yet
    #[default]
    Unknown,
    Authenticated,
    Anonymous,
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPhase::Unknown => write!(f, "Unknown"),
            AuthPhase::Authenticated => write!(f, "Authenticated"),
            AuthPhase::Anonymous => write!(f, "Anonymous"),
        }
    }
}

/// Snapshot of everything the UI renders.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorState {
    pub phase: AuthPhase,
    pub session: Option<Session>,
    pub user: Option<User>,
    /// True while the restore or any credential operation is in flight
    pub loading: bool,
    pub last_error: Option<ErrorInfo>,
    pub last_notice: Option<InfoNotice>,
    pub pending_challenges: BTreeMap<ChallengeKind, PendingChallenge>,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            phase: AuthPhase::Unknown,
            session: None,
            user: None,
            loading: true,
            last_error: None,
            last_notice: None,
            pending_challenges: BTreeMap::new(),
        }
    }
}

impl OrchestratorState {
    pub fn is_authenticated(&self) -> bool {
        self.phase == AuthPhase::Authenticated
    }

    pub fn pending(&self, kind: ChallengeKind) -> Option<&PendingChallenge> {
        self.pending_challenges.get(&kind)
    }
}
