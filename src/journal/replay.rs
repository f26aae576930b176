//! Deterministic Replay
//!
//! Rebuilds a session from its journal. The genesis record seeds the
//! generator and feeds `initialize`; every later record is re-applied through
//! the same working-copy path the live session uses, with the record's own
//! timestamp as `Context::time`. Given the same records the result is
//! bit-identical to the state the live session held.

use thiserror::Error;
use tracing::debug;

use crate::app::{apply_working, tick_working, AppError, Application, Context, MethodCall, MethodError};
use crate::core::ids::UserId;
use crate::core::rng::DeterministicRng;

use super::record::{JournalEntry, LogRecord};

/// Replay failures.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The first record is not a genesis record (or there are no records).
    #[error("journal does not start with a genesis record")]
    MissingGenesis,

    /// `initialize` refused the journaled arguments.
    #[error("initialize failed: {0}")]
    Initialize(#[from] AppError),

    /// A journaled method no longer decodes.
    #[error("record {index}: {source}")]
    Method {
        /// Position in the journal.
        index: usize,
        /// Decode failure.
        #[source]
        source: MethodError,
    },

    /// A record produced a different outcome than when it was written.
    #[error("record {index} diverged: {message}")]
    Diverged {
        /// Position in the journal.
        index: usize,
        /// What differed.
        message: String,
    },
}

/// A session rebuilt from its journal.
pub struct Replayed<A: Application> {
    /// Reconstructed state.
    pub state: A::State,
    /// Generator positioned after the last record.
    pub rng: DeterministicRng,
    /// Seed from the genesis record.
    pub seed: u64,
    /// User who created the session.
    pub creator: UserId,
    /// Timestamp of the last record.
    pub last_timestamp: u64,
    /// Records applied, genesis included.
    pub records: usize,
}

/// Replay a full journal.
pub fn replay<A: Application>(
    app: &A,
    entries: &[JournalEntry],
) -> Result<Replayed<A>, ReplayError> {
    let (first, rest) = entries.split_first().ok_or(ReplayError::MissingGenesis)?;
    let LogRecord::Genesis { seed, user, args } = &first.record else {
        return Err(ReplayError::MissingGenesis);
    };

    let mut rng = DeterministicRng::new(*seed);
    let mut state = {
        let mut ctx = Context::new(&mut rng, first.timestamp);
        app.initialize(&mut ctx, user, args)?
    };

    for (offset, entry) in rest.iter().enumerate() {
        let index = offset + 1;
        match &entry.record {
            LogRecord::Genesis { .. } => {
                return Err(ReplayError::Diverged {
                    index,
                    message: "second genesis record".to_string(),
                });
            }
            LogRecord::Invoke { method, user, args } => {
                let call = A::Method::decode(*method, args)
                    .map_err(|source| ReplayError::Method { index, source })?;
                let (outcome, commit) =
                    apply_working(app, &state, &rng, entry.timestamp, user, call);
                if let Some(message) = outcome.response.error_message() {
                    return Err(ReplayError::Diverged {
                        index,
                        message: format!("journaled call now rejected: {}", message),
                    });
                }
                if let Some((next, next_rng)) = commit {
                    state = next;
                    rng = next_rng;
                }
            }
            LogRecord::Tick { elapsed_ms } => {
                if let Some((next, next_rng)) =
                    tick_working(app, &state, &rng, entry.timestamp, *elapsed_ms)
                {
                    state = next;
                    rng = next_rng;
                }
            }
        }
    }

    let last_timestamp = entries.last().map(|e| e.timestamp).unwrap_or(first.timestamp);
    debug!("Replayed {} records", entries.len());

    Ok(Replayed {
        state,
        rng,
        seed: *seed,
        creator: user.clone(),
        last_timestamp,
        records: entries.len(),
    })
}
