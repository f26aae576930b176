//! Session Store
//!
//! One authoritative state instance and everything that hangs off it: the
//! seeded generator, the open journal, the subscriber set with each
//! subscriber's last-sent view, and the responses waiting for the next
//! publish sweep.
//!
//! ```text
//! Uninitialized ──new_session──► Active ──last unsubscribe──► Retired
//!                                  │
//!                                  └──journal write fails──► Failed
//! ```
//!
//! All operations take `&mut self`; the supervisor wraps each store in its
//! own mutex, which is what serializes calls against one session.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::app::{
    apply_working, tick_working, AppError, Application, Context, MethodCall, MethodError, TICK_TAG,
};
use crate::core::diff::changeset_since;
use crate::core::hash::{short_hex, view_digest};
use crate::core::ids::{SessionId, UserId};
use crate::core::rng::DeterministicRng;
use crate::journal::{replay, Journal, JournalError, LogRecord, ReplayError, SessionLog};
use crate::network::update::{CallResult, StateUpdate};

/// Lifecycle of a session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, no state yet.
    Uninitialized,
    /// Accepting calls and ticks.
    Active,
    /// Last subscriber left; journal closed.
    Retired,
    /// Journal write failed; the store must be evicted.
    Failed,
}

/// Session store errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation not allowed in the current phase.
    #[error("session {session} is {phase:?}")]
    NotActive {
        /// Session id.
        session: SessionId,
        /// Phase at the time of the call.
        phase: SessionPhase,
    },

    /// The application refused to create the session.
    #[error("initialize failed: {0}")]
    Initialize(#[from] AppError),

    /// Journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Recovery from the journal failed.
    #[error("replay failed: {0}")]
    Replay(#[from] ReplayError),
}

/// Per-subscriber sync cursor.
#[derive(Debug)]
struct Subscriber<V> {
    /// View as of the last update sent; `None` forces a full view.
    last_view: Option<V>,
    /// `changed_at` carried by the last update sent.
    last_changed_at: Option<u64>,
}

impl<V> Subscriber<V> {
    fn fresh() -> Self {
        Self {
            last_view: None,
            last_changed_at: None,
        }
    }
}

/// One session's state machine.
pub struct SessionStore<A: Application> {
    id: SessionId,
    app: Arc<A>,
    phase: SessionPhase,
    state: Option<A::State>,
    rng: DeterministicRng,
    seed: u64,
    journal: Option<SessionLog>,
    subscribers: BTreeMap<UserId, Subscriber<A::UserView>>,
    pending: BTreeMap<UserId, Vec<CallResult>>,
    dirty: bool,
    changed_at: u64,
}

impl<A: Application> SessionStore<A> {
    /// Empty store awaiting `new_session`.
    pub fn new(id: SessionId, app: Arc<A>) -> Self {
        Self {
            id,
            app,
            phase: SessionPhase::Uninitialized,
            state: None,
            rng: DeterministicRng::default(),
            seed: 0,
            journal: None,
            subscribers: BTreeMap::new(),
            pending: BTreeMap::new(),
            dirty: false,
            changed_at: 0,
        }
    }

    /// Rebuild an Active store from its journal.
    pub fn recover(id: SessionId, app: Arc<A>, journal: &Journal) -> Result<Self, SessionError> {
        let entries = journal.load(id)?;
        let replayed = replay(app.as_ref(), &entries)?;
        let log = journal.open_append(id)?;

        let digest = view_digest(&app.project(&replayed.state, &replayed.creator));
        info!(
            "Recovered session {} ({} records, creator view {})",
            id,
            replayed.records,
            short_hex(&digest)
        );

        Ok(Self {
            id,
            app,
            phase: SessionPhase::Active,
            state: Some(replayed.state),
            rng: replayed.rng,
            seed: replayed.seed,
            journal: Some(log),
            subscribers: BTreeMap::new(),
            pending: BTreeMap::new(),
            dirty: false,
            changed_at: replayed.last_timestamp,
        })
    }

    /// Initialize state and write the genesis record.
    pub fn new_session(
        &mut self,
        journal: &Journal,
        seed: u64,
        user: &UserId,
        args: &[u8],
        now: u64,
    ) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Uninitialized {
            return Err(self.not_active());
        }

        let mut rng = DeterministicRng::new(seed);
        let state = {
            let mut ctx = Context::new(&mut rng, now);
            self.app.initialize(&mut ctx, user, args)?
        };

        let genesis = LogRecord::Genesis {
            seed,
            user: user.clone(),
            args: args.to_vec(),
        };
        self.journal = Some(journal.create(self.id, now, &genesis)?);
        self.state = Some(state);
        self.rng = rng;
        self.seed = seed;
        self.phase = SessionPhase::Active;
        self.changed_at = now;

        // Anyone subscribed before creation gets a full view
        for subscriber in self.subscribers.values_mut() {
            *subscriber = Subscriber::fresh();
        }
        self.dirty = !self.subscribers.is_empty();

        info!("Session {} created by {} (seed {:016x})", self.id, user, seed);
        Ok(())
    }

    /// Add a subscriber. Returns false if already subscribed.
    pub fn subscribe(&mut self, user: &UserId) -> Result<bool, SessionError> {
        if self.phase != SessionPhase::Active {
            return Err(self.not_active());
        }
        if self.subscribers.contains_key(user) {
            return Ok(false);
        }
        self.subscribers.insert(user.clone(), Subscriber::fresh());
        self.dirty = true;
        debug!("{} subscribed to session {}", user, self.id);
        Ok(true)
    }

    /// Remove a subscriber. Returns true if this retired the session.
    pub fn unsubscribe(&mut self, user: &UserId) -> Result<bool, SessionError> {
        if self.phase != SessionPhase::Active {
            return Err(self.not_active());
        }
        if self.subscribers.remove(user).is_none() {
            return Ok(false);
        }
        self.pending.remove(user);
        debug!("{} unsubscribed from session {}", user, self.id);

        if !self.subscribers.is_empty() {
            return Ok(false);
        }

        self.phase = SessionPhase::Retired;
        self.pending.clear();
        self.dirty = false;
        if let Some(log) = self.journal.take() {
            log.unload()?;
        }
        info!("Session {} retired", self.id);
        Ok(true)
    }

    /// Run one method call.
    ///
    /// Decode and application errors become an error response for `user`;
    /// only a journal failure is returned as `Err`. [`TICK_TAG`] is refused
    /// before the application sees it.
    pub fn invoke(
        &mut self,
        user: &UserId,
        method: u8,
        correlation_id: u32,
        args: &[u8],
        now: u64,
    ) -> Result<(), SessionError> {
        let state = self.active_state()?;

        // The tick marker tag can never be journaled as a call
        let decoded = if method == TICK_TAG {
            Err(MethodError::UnknownMethod(method))
        } else {
            A::Method::decode(method, args)
        };
        let call = match decoded {
            Ok(call) => call,
            Err(e) => {
                debug!("Session {}: rejected call from {}: {}", self.id, user, e);
                self.queue_response(user, correlation_id, Some(e.to_string()));
                return Ok(());
            }
        };

        let (outcome, commit) = apply_working(self.app.as_ref(), state, &self.rng, now, user, call);

        if let Some((next, next_rng)) = commit {
            let record = LogRecord::Invoke {
                method,
                user: user.clone(),
                args: args.to_vec(),
            };
            self.append(now, &record)?;
            self.state = Some(next);
            self.rng = next_rng;
            self.changed_at = now;
        }

        let error = outcome.response.error_message().map(str::to_string);
        self.queue_response(user, correlation_id, error);
        Ok(())
    }

    /// Advance time. Returns whether the tick changed anything.
    pub fn tick(&mut self, elapsed_ms: u64, now: u64) -> Result<bool, SessionError> {
        let state = self.active_state()?;
        let Some((next, next_rng)) =
            tick_working(self.app.as_ref(), state, &self.rng, now, elapsed_ms)
        else {
            return Ok(false);
        };

        self.append(now, &LogRecord::Tick { elapsed_ms })?;
        self.state = Some(next);
        self.rng = next_rng;
        self.changed_at = now;
        self.dirty = true;
        Ok(true)
    }

    /// Build one update per subscriber with something to send, and clear
    /// the dirty flag and pending responses.
    pub fn encode_updates(&mut self) -> Vec<(UserId, Vec<u8>)> {
        if !self.dirty {
            return Vec::new();
        }
        self.dirty = false;
        let mut pending = std::mem::take(&mut self.pending);

        let Some(state) = self.state.as_ref() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for (user, subscriber) in self.subscribers.iter_mut() {
            let view = self.app.project(state, user);
            let changeset = changeset_since(&view, subscriber.last_view.as_ref());
            let responses = pending.remove(user).unwrap_or_default();
            if changeset.is_none() && responses.is_empty() && subscriber.last_view.is_some() {
                continue;
            }

            let changed_at_delta = match subscriber.last_changed_at {
                Some(previous) => self.changed_at.saturating_sub(previous),
                None => self.changed_at,
            };
            let update = StateUpdate {
                changed_at_delta,
                changeset,
                responses,
            };
            out.push((user.clone(), update.to_bytes()));
            subscriber.last_view = Some(view);
            subscriber.last_changed_at = Some(self.changed_at);
        }
        out
    }

    /// Forget every subscriber's last view so the next sweep sends full views.
    pub fn resync_all(&mut self) {
        for subscriber in self.subscribers.values_mut() {
            *subscriber = Subscriber::fresh();
        }
        self.dirty = !self.subscribers.is_empty();
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether the store accepts calls.
    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    /// Whether a publish sweep has work to do.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Generator seed from genesis.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Authoritative state, once initialized.
    pub fn state(&self) -> Option<&A::State> {
        self.state.as_ref()
    }

    /// Generator as of the last committed record.
    pub fn rng(&self) -> &DeterministicRng {
        &self.rng
    }

    /// Subscribed users, sorted.
    pub fn subscribers(&self) -> impl Iterator<Item = &UserId> {
        self.subscribers.keys()
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Current projection for one user.
    pub fn view_for(&self, user: &UserId) -> Option<A::UserView> {
        self.state.as_ref().map(|s| self.app.project(s, user))
    }

    // -------------------------------------------------------------------------

    fn not_active(&self) -> SessionError {
        SessionError::NotActive {
            session: self.id,
            phase: self.phase,
        }
    }

    fn active_state(&self) -> Result<&A::State, SessionError> {
        match (&self.phase, &self.state) {
            (SessionPhase::Active, Some(state)) => Ok(state),
            _ => Err(self.not_active()),
        }
    }

    fn queue_response(&mut self, user: &UserId, correlation_id: u32, error: Option<String>) {
        self.pending
            .entry(user.clone())
            .or_default()
            .push(CallResult {
                correlation_id,
                error,
            });
        self.dirty = true;
    }

    fn append(&mut self, now: u64, record: &LogRecord) -> Result<(), SessionError> {
        let Some(log) = self.journal.as_mut() else {
            return Err(self.not_active());
        };
        if let Err(e) = log.append(now, record) {
            error!("Session {} journal write failed: {}", self.id, e);
            self.phase = SessionPhase::Failed;
            self.journal = None;
            return Err(e.into());
        }
        Ok(())
    }
}
