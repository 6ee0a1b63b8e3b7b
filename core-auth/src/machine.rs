//! Session state machine.
//!
//! All state transitions happen here, synchronously, on a value the
//! orchestrator keeps behind a lock. Nothing in this module performs I/O;
//! transitions queue [`AuthEvent`]s which the owner drains and broadcasts.
//!
//! # Ordering
//!
//! Every store notification carries a [`Stamp`] taken from a shared
//! [`Sequencer`] when it was received. An explicit sign-out takes a stamp too
//! and raises a barrier to it: notifications stamped before the barrier are
//! discarded when they are finally applied, so a late `SignedIn` can never
//! resurrect a session the user just ended.

use core_runtime::events::AuthEvent;
use core_runtime::logging::redact_contact;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::AuthError;
use crate::types::{
    AuthPhase, ChallengeKind, InfoNotice, OAuthProvider, OrchestratorState, PendingChallenge,
    Session, SessionChange, User,
};

/// Position of an input in the global order.
pub type Stamp = u64;

#[derive(Debug, Default)]
pub struct Sequencer(AtomicU64);

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Stamp {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct SessionMachine {
    state: OrchestratorState,
    in_flight: usize,
    barrier: Stamp,
    max_verify_attempts: u32,
    outbox: Vec<AuthEvent>,
}

impl SessionMachine {
    pub fn new(max_verify_attempts: u32) -> Self {
        let mut machine = Self {
            state: OrchestratorState::default(),
            in_flight: 0,
            barrier: 0,
            max_verify_attempts: max_verify_attempts.max(1),
            outbox: Vec::new(),
        };
        machine.sync_loading();
        machine
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn barrier(&self) -> Stamp {
        self.barrier
    }

    /// Drains the events queued by transitions since the last call.
    pub fn take_events(&mut self) -> Vec<AuthEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub fn begin_load(&mut self) {
        self.in_flight += 1;
        self.sync_loading();
    }

    pub fn end_load(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.sync_loading();
    }

    /// Starts a user-initiated operation: loading on, stale feedback cleared.
    pub fn begin_operation(&mut self) {
        self.begin_load();
        self.state.last_error = None;
        self.state.last_notice = None;
    }

    /// Resolves the initial restore. Ignored once anything else has decided
    /// the phase.
    pub fn apply_restore(&mut self, result: Result<Option<Session>, AuthError>) {
        if self.state.phase != AuthPhase::Unknown {
            debug!(phase = %self.state.phase, "Restore resolved after phase was decided, ignoring");
            return;
        }

        let user_id = match result {
            Ok(Some(session)) => {
                let user_id = session.user.id.to_string();
                self.state.user = Some(session.user.clone());
                self.state.session = Some(session);
                self.state.phase = AuthPhase::Authenticated;
                Some(user_id)
            }
            Ok(None) => {
                self.state.phase = AuthPhase::Anonymous;
                None
            }
            Err(err) => {
                self.state.phase = AuthPhase::Anonymous;
                self.record_error(&err);
                None
            }
        };

        self.outbox.push(AuthEvent::Restored { user_id });
    }

    /// Applies a store notification. Returns whether it was applied.
    pub fn apply_notice(&mut self, stamp: Stamp, change: SessionChange) -> bool {
        if stamp < self.barrier {
            debug!(stamp, barrier = self.barrier, "Discarding notification older than sign-out");
            return false;
        }

        match change {
            SessionChange::SignedIn(session) => {
                let user = session.user.clone();
                self.authenticate(Some(session), user, "session");
            }
            SessionChange::SignedOut => self.sign_out_locally(),
        }
        true
    }

    /// Installs a session obtained by an explicit sign-in.
    pub fn adopt_session(&mut self, session: Session, method: &str) {
        let user = session.user.clone();
        self.authenticate(Some(session), user, method);
    }

    /// Marks `user` authenticated before (or without) a session arriving.
    pub fn set_user(&mut self, user: User, method: &str) {
        self.authenticate(None, user, method);
    }

    /// Replaces the cached user record of the signed-in user.
    pub fn refresh_user(&mut self, user: User) {
        if self.state.user.as_ref().map(|u| &u.id) != Some(&user.id) {
            return;
        }
        if let Some(session) = self.state.session.as_mut() {
            session.user = user.clone();
        }
        self.state.user = Some(user);
    }

    /// Completes an explicit sign-out taken at `stamp`.
    pub fn force_signed_out(&mut self, stamp: Stamp) {
        self.barrier = self.barrier.max(stamp);
        self.sign_out_locally();

        let kinds: Vec<ChallengeKind> = self.state.pending_challenges.keys().copied().collect();
        for kind in kinds {
            self.clear_challenge(kind, "signed_out");
        }
    }

    pub fn redirect_started(&mut self, provider: OAuthProvider) {
        self.outbox.push(AuthEvent::OAuthRedirectStarted {
            provider: provider.as_str().to_string(),
        });
    }

    pub fn record_error(&mut self, err: &AuthError) {
        let info = err.to_info();
        self.outbox.push(AuthEvent::AuthError {
            kind: info.kind.as_str().to_string(),
            message: info.message.clone(),
            recoverable: err.is_recoverable(),
        });
        self.state.last_error = Some(info);
    }

    pub fn record_notice(&mut self, notice: InfoNotice) {
        self.outbox.push(AuthEvent::Notice {
            message: notice.message.clone(),
        });
        self.state.last_notice = Some(notice);
    }

    pub fn clear_error(&mut self) {
        self.state.last_error = None;
    }

    pub fn clear_notice(&mut self) {
        self.state.last_notice = None;
    }

    /// Records a delivered challenge, replacing any pending one of its kind.
    pub fn challenge_sent(&mut self, challenge: PendingChallenge) {
        self.outbox.push(AuthEvent::ChallengeSent {
            kind: challenge.kind.as_str().to_string(),
            contact: redact_contact(&challenge.contact),
        });
        self.state
            .pending_challenges
            .insert(challenge.kind, challenge);
    }

    pub fn challenge_verified(&mut self, kind: ChallengeKind) {
        self.clear_challenge(kind, "verified");
    }

    /// Counts a rejected verification. Returns `true` when the challenge was
    /// destroyed because it ran out of attempts.
    pub fn challenge_rejected(&mut self, kind: ChallengeKind) -> bool {
        let Some(challenge) = self.state.pending_challenges.get_mut(&kind) else {
            return false;
        };

        challenge.failed_attempts += 1;
        if challenge.failed_attempts < self.max_verify_attempts {
            return false;
        }

        self.clear_challenge(kind, "exhausted");
        true
    }

    fn authenticate(&mut self, session: Option<Session>, user: User, method: &str) {
        let already_signed_in = self.state.phase == AuthPhase::Authenticated
            && self.state.user.as_ref().map(|u| &u.id) == Some(&user.id);

        match session {
            Some(session) => self.state.session = Some(session),
            None => {
                // A session for someone else cannot stay next to this user.
                if self
                    .state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.user.id != user.id)
                {
                    self.state.session = None;
                }
            }
        }

        let user_id = user.id.to_string();
        self.state.user = Some(user);
        self.state.phase = AuthPhase::Authenticated;
        self.clear_challenge(ChallengeKind::MagicLink, "signed_in");

        if !already_signed_in {
            self.outbox.push(AuthEvent::SignedIn {
                user_id,
                method: method.to_string(),
            });
        }
    }

    fn sign_out_locally(&mut self) {
        let had_identity = self.state.session.is_some() || self.state.user.is_some();
        let user_id = self.state.user.take().map(|u| u.id.to_string());
        self.state.session = None;
        self.state.phase = AuthPhase::Anonymous;

        if had_identity {
            self.outbox.push(AuthEvent::SignedOut { user_id });
        }
    }

    fn clear_challenge(&mut self, kind: ChallengeKind, reason: &str) {
        if self.state.pending_challenges.remove(&kind).is_some() {
            self.outbox.push(AuthEvent::ChallengeCleared {
                kind: kind.as_str().to_string(),
                reason: reason.to_string(),
            });
        }
    }

    fn sync_loading(&mut self) {
        self.state.loading = self.in_flight > 0;
    }
}
