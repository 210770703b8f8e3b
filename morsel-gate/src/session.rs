//! Search session lifecycle.
//!
//! A session carries the provider's bundling token across one interactive
//! flow (type into the search box, pick a suggestion). Its states are
//! Created -> Active -> {Consumed | Invalidated | Expired}; the three
//! terminal states are final and mutually exclusive.
//!
//! Each session also hands out cancellation signals. Issuing a new signal
//! cancels the previous one, so a new keystroke supersedes the request for
//! the last keystroke.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use morsel_core::{Clock, SessionError, SessionToken, Timestamp};
use tokio::sync::watch;

// ============================================================================
// REQUEST SIGNAL
// ============================================================================

/// Cancellation signal for one request.
#[derive(Debug, Clone)]
pub struct RequestSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl RequestSignal {
    /// A signal that is never cancelled.
    pub fn never() -> Self {
        Self { rx: None }
    }

    fn pair() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx: Some(rx) })
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Resolves once the signal is cancelled or its session is gone.
    pub async fn cancelled(&self) {
        match &self.rx {
            Some(rx) => {
                let mut rx = rx.clone();
                // A closed channel means the owning session was dropped.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// SEARCH SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Consumed,
    Invalidated,
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Consumed | SessionState::Invalidated | SessionState::Expired
        )
    }
}

/// One interactive search flow.
#[derive(Debug)]
pub struct SearchSession {
    token: SessionToken,
    created_at: Timestamp,
    max_age: Duration,
    state: SessionState,
    cancel: Option<watch::Sender<bool>>,
}

impl SearchSession {
    pub fn new(created_at: Timestamp, max_age: Duration) -> Self {
        Self {
            token: SessionToken::generate(),
            created_at,
            max_age,
            state: SessionState::Created,
            cancel: None,
        }
    }

    /// A session that has already seen its first interaction.
    pub fn start(now: Timestamp, max_age: Duration) -> Self {
        let mut session = Self::new(now, max_age);
        session.activate();
        session
    }

    /// Created -> Active. No effect in any other state.
    pub fn activate(&mut self) {
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// State as of `now`. An active session past its max age reads as
    /// expired.
    pub fn state(&self, now: Timestamp) -> SessionState {
        if self.state == SessionState::Active && self.is_past_max_age(now) {
            SessionState::Expired
        } else {
            self.state
        }
    }

    fn is_past_max_age(&self, now: Timestamp) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() >= self.max_age.as_millis() as i64
    }

    /// Move a lapsed active session to `Expired` and cancel its request.
    fn settle_expiry(&mut self, now: Timestamp) {
        if self.state(now) == SessionState::Expired && self.state != SessionState::Expired {
            self.state = SessionState::Expired;
            self.cancel_pending();
        }
    }

    fn terminal_error(&self) -> SessionError {
        match self.state {
            SessionState::Consumed => SessionError::Consumed,
            SessionState::Invalidated => SessionError::Invalidated,
            SessionState::Expired => SessionError::Expired,
            SessionState::Created | SessionState::Active => SessionError::NotActive,
        }
    }

    /// The bundling token. Only an active, unexpired session hands it out.
    pub fn token(&mut self, now: Timestamp) -> Result<SessionToken, SessionError> {
        self.settle_expiry(now);
        match self.state {
            SessionState::Active => Ok(self.token),
            _ => Err(self.terminal_error()),
        }
    }

    /// Cancel the previous request signal and issue a new one.
    pub fn new_request_signal(&mut self) -> RequestSignal {
        self.cancel_pending();
        let (tx, signal) = RequestSignal::pair();
        self.cancel = Some(tx);
        signal
    }

    /// Active -> Consumed. The token counts as spent and any pending request
    /// is cancelled. Returns the spent token.
    pub fn consume(&mut self, now: Timestamp) -> Result<SessionToken, SessionError> {
        self.settle_expiry(now);
        if self.state != SessionState::Active {
            return Err(self.terminal_error());
        }
        self.state = SessionState::Consumed;
        self.cancel_pending();
        Ok(self.token)
    }

    /// Abandon the flow. Cancels any pending request; a session already in
    /// a terminal state keeps that state.
    pub fn invalidate(&mut self, now: Timestamp) {
        self.settle_expiry(now);
        if !self.state.is_terminal() {
            self.state = SessionState::Invalidated;
        }
        self.cancel_pending();
    }

    fn cancel_pending(&mut self) {
        if let Some(tx) = self.cancel.take() {
            tx.send_replace(true);
        }
    }
}

// ============================================================================
// SESSION MANAGER
// ============================================================================

/// Holds at most one session for a client context and replaces it whenever
/// it is no longer usable.
pub struct SessionManager {
    clock: Arc<dyn Clock>,
    max_age: Duration,
    current: Mutex<Option<SearchSession>>,
    sessions_started: AtomicU64,
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>, max_age: Duration) -> Self {
        Self {
            clock,
            max_age,
            current: Mutex::new(None),
            sessions_started: AtomicU64::new(0),
        }
    }

    /// Run `f` against the live session, starting a new one if the current
    /// session is missing, finished, or expired.
    fn with_live_session<R>(&self, f: impl FnOnce(&mut SearchSession, Timestamp) -> R) -> R {
        let now = self.clock.now();
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        let live = guard
            .as_ref()
            .is_some_and(|session| session.state(now) == SessionState::Active);
        if !live {
            if let Some(mut stale) = guard.take() {
                stale.invalidate(now);
            }
            self.sessions_started.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Starting new search session");
        }

        let session = guard.get_or_insert_with(|| SearchSession::start(now, self.max_age));
        f(session, now)
    }

    /// Token of the live session.
    pub fn token(&self) -> Result<SessionToken, SessionError> {
        self.with_live_session(|session, now| session.token(now))
    }

    /// New request signal on the live session, cancelling the previous one.
    pub fn new_request_signal(&self) -> RequestSignal {
        self.with_live_session(|session, _| session.new_request_signal())
    }

    /// Token and a fresh request signal from the same live session.
    pub fn begin_request(&self) -> Result<(SessionToken, RequestSignal), SessionError> {
        self.with_live_session(|session, now| {
            let token = session.token(now)?;
            Ok((token, session.new_request_signal()))
        })
    }

    /// Consume the current session. The next call starts a new one.
    pub fn consume(&self) -> Result<SessionToken, SessionError> {
        let now = self.clock.now();
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(session) => session.consume(now),
            None => Err(SessionError::NotActive),
        }
    }

    /// Invalidate the current session, if any.
    pub fn invalidate(&self) {
        let now = self.clock.now();
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = guard.as_mut() {
            session.invalidate(now);
        }
    }

    /// Sessions started since construction.
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }
}
