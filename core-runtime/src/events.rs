//! # Event Bus System
//!
//! Broadcasts session lifecycle events from the orchestrator using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! [`AuthEvent`] has one variant per observable transition of the session
//! orchestrator; [`EventBus`] fans them out to any number of subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    emit     ┌───────────┐   subscribe   ┌────────────┐
//! │ AuthOrchestrator ├────────────>│ EventBus  ├──────────────>│ UI / Host  │
//! └──────────────────┘             │ (broadcast│               └────────────┘
//!                                  │  channel) │   subscribe   ┌────────────┐
//!                                  │           ├──────────────>│ Analytics  │
//!                                  └───────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{AuthEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(AuthEvent::SignedIn {
//!         user_id: "user-123".to_string(),
//!         method: "password".to_string(),
//!     })
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "User signed in");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitting with no subscribers returns an error which publishers ignore.
//! Events are transitions; the current state is always available from the
//! orchestrator's watch channel, so a lagged subscriber loses history but
//! never the present.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Authentication Events
// ============================================================================

/// Observable transitions of the session orchestrator.
///
/// Identifiers are plain strings so hosts can forward events across FFI
/// without depending on the auth crate's types. Contacts are redacted before
/// they are placed in an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// The initial session restore resolved.
    Restored {
        /// The restored user, or `None` when no session was found.
        user_id: Option<String>,
    },
    /// A user became authenticated.
    SignedIn {
        /// The authenticated user.
        user_id: String,
        /// How the session was obtained (e.g. "password", "email_otp", "session").
        method: String,
    },
    /// The session ended.
    SignedOut {
        /// The user that was signed out, if one was known.
        user_id: Option<String>,
    },
    /// A one-time code or magic link was delivered.
    ChallengeSent {
        /// Challenge kind ("email_otp", "phone_otp", "magic_link").
        kind: String,
        /// Redacted destination.
        contact: String,
    },
    /// A pending challenge was destroyed.
    ChallengeCleared {
        /// Challenge kind.
        kind: String,
        /// Why it was cleared ("verified", "exhausted", "signed_out").
        reason: String,
    },
    /// An OAuth provider redirect URL was produced.
    OAuthRedirectStarted {
        /// Provider name ("google", "github").
        provider: String,
    },
    /// A non-error confirmation for the UI.
    Notice {
        /// Human-readable message.
        message: String,
    },
    /// An operation failed.
    AuthError {
        /// Error category.
        kind: String,
        /// Human-readable error message.
        message: String,
        /// Whether the error is recoverable (e.g., retry possible).
        recoverable: bool,
    },
}

impl AuthEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            AuthEvent::Restored { .. } => "Session restore completed",
            AuthEvent::SignedIn { .. } => "User signed in",
            AuthEvent::SignedOut { .. } => "User signed out",
            AuthEvent::ChallengeSent { .. } => "Verification challenge sent",
            AuthEvent::ChallengeCleared { .. } => "Verification challenge cleared",
            AuthEvent::OAuthRedirectStarted { .. } => "OAuth redirect started",
            AuthEvent::Notice { .. } => "Notice",
            AuthEvent::AuthError { .. } => "Authentication error",
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            AuthEvent::AuthError {
                recoverable: false, ..
            } => EventSeverity::Error,
            AuthEvent::AuthError { .. } => EventSeverity::Warning,
            AuthEvent::SignedIn { .. } | AuthEvent::SignedOut { .. } => EventSeverity::Info,
            AuthEvent::Restored { .. } | AuthEvent::Notice { .. } => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for broadcasting auth events.
///
/// Cloning the bus shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AuthEvent>,
}

impl EventBus {
    /// A subscriber more than `capacity` events behind gets
    /// `RecvError::Lagged` and resumes from the oldest retained event.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Returns how many subscribers received the event; `Err` when there
    /// are none, which publishers treat as normal.
    pub fn emit(&self, event: AuthEvent) -> Result<usize, SendError<AuthEvent>> {
        self.sender.send(event)
    }

    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<AuthEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.subscriber_count(), 0);
    ///
    /// let _subscriber = event_bus.subscribe();
    /// assert_eq!(event_bus.subscriber_count(), 1);
    /// ```
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
