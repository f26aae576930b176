//! Store Supervisor
//!
//! Process-wide registry of active sessions. Routes coordinator messages to
//! session stores, recovers sessions from their journals on demand, and runs
//! the tick and publish sweeps.
//!
//! Lock order is always map, then session. Sweeps snapshot the map and
//! release it before touching any session, and nothing is sent to the
//! coordinator while a session lock is held.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::app::Application;
use crate::core::ids::{SessionId, UserId};
use crate::core::rng::fresh_seed;
use crate::journal::{Journal, JournalError};
use crate::network::coordinator::{CoordinatorEvent, CoordinatorHandle};
use crate::network::protocol::Inbound;

use super::now_millis;
use super::session::{SessionError, SessionPhase, SessionStore};

/// A session store behind its own lock.
pub type SharedSession<A> = Arc<Mutex<SessionStore<A>>>;

/// Owns every active session of one application.
pub struct StoreSupervisor<A: Application> {
    app: Arc<A>,
    journal: Journal,
    sessions: RwLock<BTreeMap<SessionId, SharedSession<A>>>,
    outbound: CoordinatorHandle,
}

impl<A: Application> StoreSupervisor<A> {
    /// Supervisor over a journal directory, publishing through `outbound`.
    pub fn new(app: Arc<A>, journal: Journal, outbound: CoordinatorHandle) -> Self {
        Self {
            app,
            journal,
            sessions: RwLock::new(BTreeMap::new()),
            outbound,
        }
    }

    /// Route one coordinator message.
    pub async fn handle(&self, message: Inbound, now: u64) {
        match message {
            Inbound::NewSession { session, user, args } => {
                self.new_session(session, &user, &args, now).await
            }
            Inbound::Subscribe { session, user } => self.subscribe(session, user).await,
            Inbound::Unsubscribe { session, user } => self.unsubscribe(session, &user).await,
            Inbound::Invoke {
                session,
                user,
                method,
                correlation_id,
                args,
            } => {
                self.invoke(session, user, method, correlation_id, &args, now)
                    .await
            }
        }
    }

    async fn new_session(&self, id: SessionId, user: &UserId, args: &[u8], now: u64) {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            warn!("Ignoring NEW_SESSION for active session {}", id);
            return;
        }

        let (app, journal) = (self.app.clone(), self.journal.clone());
        let (user, args) = (user.clone(), args.to_vec());
        let created = self
            .offload(false, move || {
                let mut store = SessionStore::new(id, app);
                store
                    .new_session(&journal, fresh_seed(), &user, &args, now)
                    .map(|()| store)
            })
            .await;
        let Some(created) = created else {
            return;
        };

        match created {
            Ok(store) => {
                sessions.insert(id, Arc::new(Mutex::new(store)));
            }
            Err(SessionError::Journal(JournalError::AlreadyExists(_))) => {
                warn!("Ignoring NEW_SESSION for existing session {}", id);
            }
            Err(e) => {
                warn!("Session {} not created: {}", id, e);
            }
        }
    }

    async fn subscribe(&self, id: SessionId, user: UserId) {
        for attempt in 0..2 {
            let Some(session) = self.get_or_recover(id).await else {
                self.outbound.unknown_session(id, user);
                return;
            };

            let result = session.lock().await.subscribe(&user);
            match result {
                Ok(_) => return,
                Err(SessionError::NotActive {
                    phase: SessionPhase::Retired,
                    ..
                }) if attempt == 0 => {
                    // Retired but not yet removed; recover from the journal
                    debug!("Session {} retired during subscribe, reloading", id);
                    self.remove_if(id, SessionPhase::Retired).await;
                }
                Err(e) => {
                    warn!("Subscribe of {} to {} failed: {}", user, id, e);
                    self.outbound.unknown_session(id, user);
                    return;
                }
            }
        }
    }

    async fn unsubscribe(&self, id: SessionId, user: &UserId) {
        let Some(session) = self.get(id).await else {
            debug!("Unsubscribe from unknown session {}", id);
            return;
        };

        let result = session.lock().await.unsubscribe(user);
        match result {
            Ok(true) => self.remove_if(id, SessionPhase::Retired).await,
            Ok(false) => {}
            Err(e) => {
                error!("Unsubscribe from {} failed: {}", id, e);
                self.evict(id).await;
            }
        }
    }

    async fn invoke(
        &self,
        id: SessionId,
        user: UserId,
        method: u8,
        correlation_id: u32,
        args: &[u8],
        now: u64,
    ) {
        let Some(session) = self.get(id).await else {
            self.outbound.unknown_session(id, user);
            return;
        };

        let mut store = session.lock_owned().await;
        let args = args.to_vec();
        let result = self
            .offload(false, move || {
                store.invoke(&user, method, correlation_id, &args, now)
            })
            .await;
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!("Session {} failed during call: {}", id, e);
                self.evict(id).await;
            }
            None => self.evict(id).await,
        }
    }

    /// Tick every active session once.
    pub async fn tick_all(&self, elapsed_ms: u64, now: u64) {
        let mut failed = Vec::new();
        for (id, session) in self.snapshot().await {
            let mut store = session.lock_owned().await;
            let result = self
                .offload(false, move || store.tick(elapsed_ms, now))
                .await;
            match result {
                Some(Ok(_)) => {}
                Some(Err(SessionError::NotActive { .. })) => {}
                Some(Err(e)) => {
                    error!("Session {} failed during tick: {}", id, e);
                    failed.push(id);
                }
                None => failed.push(id),
            }
        }
        for id in failed {
            self.evict(id).await;
        }
    }

    /// Encode and send updates for every dirty session. Returns the number
    /// of messages queued.
    pub async fn publish_dirty(&self) -> usize {
        let mut sent = 0;
        for (id, session) in self.snapshot().await {
            let updates = {
                let mut store = session.lock().await;
                if !store.is_dirty() {
                    continue;
                }
                store.encode_updates()
            };
            for (user, data) in updates {
                if self.outbound.publish(id, user, data) {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Schedule a full view for every subscriber of every session.
    pub async fn resync_all(&self) {
        let sessions = self.snapshot().await;
        for (_, session) in &sessions {
            session.lock().await.resync_all();
        }
        info!("Resyncing {} sessions", sessions.len());
    }

    /// Number of sessions in memory.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Shared handle to an in-memory session.
    pub async fn get(&self, id: SessionId) -> Option<SharedSession<A>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Drive the supervisor from coordinator events until the event stream
    /// ends or shutdown is signalled.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<CoordinatorEvent>,
        tick_interval: Duration,
        publish_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut tick_timer = interval(tick_interval);
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut publish_timer = interval(publish_interval);
        publish_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        info!(
            "Store supervisor running (tick {:?}, publish {:?})",
            tick_interval, publish_interval
        );

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(CoordinatorEvent::Connected { reconnect: true }) => self.resync_all().await,
                        Some(CoordinatorEvent::Connected { reconnect: false }) => {}
                        Some(CoordinatorEvent::Message(message)) => self.handle(message, now_millis()).await,
                        None => {
                            info!("Coordinator event stream closed");
                            break;
                        }
                    }
                }
                _ = tick_timer.tick() => {
                    // Whole milliseconds only; the remainder carries to the next sweep
                    let elapsed_ms = last_tick.elapsed().as_millis() as u64;
                    last_tick += Duration::from_millis(elapsed_ms);
                    if elapsed_ms > 0 {
                        self.tick_all(elapsed_ms, now_millis()).await;
                    }
                }
                _ = publish_timer.tick() => {
                    self.publish_dirty().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.close_all().await;
    }

    /// Drop every session, flushing its journal.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        info!("Closed {} sessions", count);
    }

    // -------------------------------------------------------------------------

    async fn snapshot(&self) -> Vec<(SessionId, SharedSession<A>)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }

    async fn get_or_recover(&self, id: SessionId) -> Option<SharedSession<A>> {
        if let Some(session) = self.get(id).await {
            return Some(session);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&id) {
            return Some(session.clone());
        }

        // Replay reads the whole file; keep it off the async workers
        let (app, journal) = (self.app.clone(), self.journal.clone());
        let recovered = self
            .offload(true, move || SessionStore::recover(id, app, &journal))
            .await?;
        match recovered {
            Ok(store) => {
                let session = Arc::new(Mutex::new(store));
                sessions.insert(id, session.clone());
                Some(session)
            }
            Err(SessionError::Journal(JournalError::NotFound(_))) => {
                info!("No journal for session {}", id);
                None
            }
            Err(e) => {
                error!("Recovering session {} failed: {}", id, e);
                None
            }
        }
    }

    /// Run journal work on the blocking pool when it reads whole files
    /// (`always`) or may fsync. `None` if the blocking task panicked.
    async fn offload<R, F>(&self, always: bool, work: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !always && !self.journal.sync_writes() {
            return Some(work());
        }
        match task::spawn_blocking(work).await {
            Ok(result) => Some(result),
            Err(e) => {
                error!("Journal task failed: {}", e);
                None
            }
        }
    }

    async fn remove_if(&self, id: SessionId, phase: SessionPhase) {
        let mut sessions = self.sessions.write().await;
        let matches = match sessions.get(&id) {
            Some(session) => session.lock().await.phase() == phase,
            None => false,
        };
        if matches {
            sessions.remove(&id);
            debug!("Removed session {} ({:?})", id, phase);
        }
    }

    async fn evict(&self, id: SessionId) {
        if self.sessions.write().await.remove(&id).is_some() {
            warn!("Evicted session {}", id);
        }
    }
}
