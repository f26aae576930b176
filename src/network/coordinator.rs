//! Coordinator Client
//!
//! Maintains the single TCP link to the coordinator. The client task owns the
//! socket; the rest of the process talks to it through channels:
//!
//! ```text
//!   StoreSupervisor ──CoordinatorHandle (unbounded mpsc)──► client task ──► socket
//!   StoreSupervisor ◄──CoordinatorEvent (unbounded mpsc)─── client task ◄── socket
//! ```
//!
//! Connecting retries with exponential backoff. An unexpected disconnect goes
//! back through the same backoff; after `max_reconnect_attempts` consecutive
//! failures the task gives up and returns an error.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::core::ids::{SessionId, UserId};
use crate::network::auth::{AuthProviders, Registration};
use crate::network::protocol::{encode_frame, FrameBuffer, Inbound, Outbound, ProtocolError};

/// First retry delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Retry delay ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

const READ_BUFFER: usize = 16 * 1024;

/// Coordinator link errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Socket failure.
    #[error("coordinator I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The coordinator sent something unparseable.
    #[error("coordinator protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Registration payload could not be built.
    #[error("registration encoding failed: {0}")]
    Registration(#[from] serde_json::Error),

    /// Too many consecutive connection failures.
    #[error("gave up on coordinator {addr} after {attempts} attempts")]
    ReconnectExhausted {
        /// Coordinator address.
        addr: String,
        /// Attempts made.
        attempts: u32,
    },
}

/// Connection settings.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// `host:port`.
    pub addr: String,
    /// Registration secret.
    pub app_secret: String,
    /// Identity of this store process.
    pub store_id: Uuid,
    /// Login providers announced at registration.
    pub auth: AuthProviders,
    /// Consecutive failures tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// First retry delay.
    pub initial_backoff: Duration,
    /// Retry delay ceiling.
    pub max_backoff: Duration,
}

impl CoordinatorConfig {
    /// Settings for a store process.
    pub fn from_store_config(config: &StoreConfig, store_id: Uuid) -> Self {
        Self {
            addr: config.coordinator_addr(),
            app_secret: config.app_secret.clone(),
            store_id,
            auth: config.auth.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    fn registration(&self) -> Registration {
        Registration {
            app_secret: self.app_secret.clone(),
            store_id: self.store_id,
            auth_info: self.auth.clone(),
        }
    }
}

// =============================================================================
// BACKOFF
// =============================================================================

/// Exponential backoff with a ceiling and an attempt budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
    max_attempts: u32,
}

impl Backoff {
    /// Fresh backoff.
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            current: initial,
            failures: 0,
            max_attempts,
        }
    }

    /// Record a failure; returns the delay before the next attempt, or
    /// `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.failures >= self.max_attempts {
            return None;
        }
        self.failures += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}

// =============================================================================
// CHANNELS
// =============================================================================

/// What the client task reports to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Registered on a fresh connection.
    Connected {
        /// Whether an earlier connection existed (subscribers need a resync).
        reconnect: bool,
    },
    /// Inbound message.
    Message(Inbound),
}

/// Cheap, cloneable sender for outbound messages.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl CoordinatorHandle {
    /// Handle plus the receiving end, for wiring up a client or a test.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue any outbound message. Returns false if the client is gone.
    pub fn send(&self, message: Outbound) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Queue data for one user. Never blocks; delivery is at most once.
    pub fn publish(&self, session: SessionId, user: UserId, data: Vec<u8>) -> bool {
        self.send(Outbound::Publish { session, user, data })
    }

    /// Tell the coordinator a session does not exist here.
    pub fn unknown_session(&self, session: SessionId, user: UserId) -> bool {
        self.send(Outbound::UnknownSession { session, user })
    }
}

/// Build a client with its handle and event stream.
pub fn client(
    config: CoordinatorConfig,
) -> (
    CoordinatorClient,
    CoordinatorHandle,
    mpsc::UnboundedReceiver<CoordinatorEvent>,
) {
    let (handle, outbound) = CoordinatorHandle::channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let client = CoordinatorClient {
        config,
        outbound,
        events: events_tx,
    };
    (client, handle, events_rx)
}

// =============================================================================
// CLIENT TASK
// =============================================================================

enum Exit {
    Shutdown,
    Closed,
}

/// Owns the coordinator socket.
pub struct CoordinatorClient {
    config: CoordinatorConfig,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl CoordinatorClient {
    /// Run until shutdown, until every handle and the event receiver are
    /// dropped, or until reconnecting fails too many times.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), CoordinatorError> {
        let mut backoff = Backoff::new(
            self.config.initial_backoff,
            self.config.max_backoff,
            self.config.max_reconnect_attempts,
        );
        let mut connected_before = false;

        loop {
            let Some(stream) = self.connect(&mut backoff, &mut shutdown).await? else {
                return Ok(());
            };
            backoff.reset();

            // Anything queued for the old connection is stale; a resync follows
            let mut dropped = 0usize;
            while self.outbound.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!("Dropped {} stale outbound messages", dropped);
            }

            let event = CoordinatorEvent::Connected {
                reconnect: connected_before,
            };
            if self.events.send(event).is_err() {
                return Ok(());
            }
            connected_before = true;

            match self.serve(stream, &mut shutdown).await {
                Ok(Exit::Shutdown) => {
                    info!("Coordinator client shutting down");
                    return Ok(());
                }
                Ok(Exit::Closed) => warn!("Coordinator closed the connection"),
                Err(e) => warn!("Coordinator connection lost: {}", e),
            }
        }
    }

    async fn connect(
        &self,
        backoff: &mut Backoff,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Option<TcpStream>, CoordinatorError> {
        let registration = encode_frame(&self.config.registration().to_json()?);

        loop {
            let attempt = async {
                let mut stream = TcpStream::connect(&self.config.addr).await?;
                stream.set_nodelay(true)?;
                stream.write_all(&registration).await?;
                Ok::<_, std::io::Error>(stream)
            };

            match attempt.await {
                Ok(stream) => {
                    info!("Registered with coordinator {}", self.config.addr);
                    return Ok(Some(stream));
                }
                Err(e) => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(CoordinatorError::ReconnectExhausted {
                            addr: self.config.addr.clone(),
                            attempts: backoff.failures(),
                        });
                    };
                    warn!(
                        "Connecting to coordinator failed ({}), retry {} in {:?}",
                        e,
                        backoff.failures(),
                        delay
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.recv() => return Ok(None),
                    }
                }
            }
        }
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Exit, CoordinatorError> {
        let (mut reader, mut writer) = stream.into_split();
        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; READ_BUFFER];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(Exit::Closed);
                    }
                    frames.extend(&buf[..n]);
                    while let Some(payload) = frames.next_frame()? {
                        let message = Inbound::from_bytes(&payload)?;
                        if self.events.send(CoordinatorEvent::Message(message)).is_err() {
                            return Ok(Exit::Shutdown);
                        }
                    }
                }
                outbound = self.outbound.recv() => {
                    match outbound {
                        Some(message) => writer.write_all(&encode_frame(&message.to_bytes())).await?,
                        None => return Ok(Exit::Shutdown),
                    }
                }
                _ = shutdown.recv() => {
                    return Ok(Exit::Shutdown);
                }
            }
        }
    }
}
