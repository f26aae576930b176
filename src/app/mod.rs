//! Application Contract
//!
//! The store hosts exactly one [`Application`], injected at startup. The
//! application supplies pure state transitions; the store supplies ordering,
//! persistence and fan-out.
//!
//! ## Determinism rules
//!
//! - All randomness comes from [`Context::rng`], seeded from the journal.
//! - All time comes from [`Context::time`], the journaled record timestamp.
//! - `apply` may return [`Response::Error`] after mutating: the store runs it
//!   on a working copy and discards that copy on error.

use thiserror::Error;

use crate::core::codec::CodecError;
use crate::core::diff::Diffable;
use crate::core::ids::UserId;
use crate::core::rng::DeterministicRng;

pub mod dice;

/// Method tag reserved for journal tick markers.
pub const TICK_TAG: u8 = 0xFF;

/// Per-call execution context.
pub struct Context<'a> {
    rng: &'a mut DeterministicRng,
    time: u64,
}

impl<'a> Context<'a> {
    /// Context over a session's generator at a journaled timestamp.
    pub fn new(rng: &'a mut DeterministicRng, time: u64) -> Self {
        Self { rng, time }
    }

    /// The session's seeded generator.
    pub fn rng(&mut self) -> &mut DeterministicRng {
        self.rng
    }

    /// Milliseconds since the Unix epoch at which this call was recorded.
    pub fn time(&self) -> u64 {
        self.time
    }
}

/// Outcome of a method call, delivered to the calling user only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The call was accepted.
    Ok,
    /// The call was rejected; the message goes back verbatim.
    Error(String),
}

impl Response {
    /// Shorthand for a rejection.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Whether the call was accepted.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Rejection message, if any.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Error(message) => Some(message),
        }
    }
}

/// Why a `(tag, args)` pair could not become a method.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodError {
    /// No method has this tag.
    #[error("unknown method tag {0}")]
    UnknownMethod(u8),
    /// The arguments did not match the method's schema.
    #[error("malformed arguments: {0}")]
    Malformed(#[from] CodecError),
}

/// Closed set of methods an application accepts.
pub trait MethodCall: Sized + Send {
    /// Decode a method from its tag and tracked argument bytes.
    fn decode(tag: u8, args: &[u8]) -> Result<Self, MethodError>;
}

/// Errors raised while creating a session's initial state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    /// Initialization arguments did not decode.
    #[error("malformed initialization arguments: {0}")]
    Malformed(#[from] CodecError),
    /// The application refused to start a session.
    #[error("{0}")]
    Rejected(String),
}

/// State-transition functions hosted by the store.
pub trait Application: Send + Sync + 'static {
    /// Authoritative session state.
    type State: Clone + PartialEq + Send + 'static;
    /// Closed enum of callable methods.
    type Method: MethodCall;
    /// Per-user projection sent to clients.
    type UserView: Diffable + Default + Send + 'static;

    /// Build the initial state for a new session.
    fn initialize(
        &self,
        ctx: &mut Context<'_>,
        user: &UserId,
        args: &[u8],
    ) -> Result<Self::State, AppError>;

    /// Apply one method call.
    fn apply(
        &self,
        state: &mut Self::State,
        ctx: &mut Context<'_>,
        user: &UserId,
        method: Self::Method,
    ) -> Response;

    /// Advance time-driven state.
    fn on_tick(&self, _state: &mut Self::State, _ctx: &mut Context<'_>, _elapsed_secs: f32) {}

    /// Redacted view of the state for one user.
    fn project(&self, state: &Self::State, user: &UserId) -> Self::UserView;
}

// =============================================================================
// WORKING-COPY EXECUTION
// =============================================================================

/// Result of running one method call against a working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// What the application answered.
    pub response: Response,
    /// Whether committed state or generator state changed.
    pub mutated: bool,
}

/// Apply a method to a copy of `state` and `rng`.
///
/// Nothing is written back here: on `Ok` with changes the caller receives the
/// copies and decides when to commit (after the journal append succeeds).
pub fn apply_working<A: Application>(
    app: &A,
    state: &A::State,
    rng: &DeterministicRng,
    time: u64,
    user: &UserId,
    method: A::Method,
) -> (Outcome, Option<(A::State, DeterministicRng)>) {
    let mut working = state.clone();
    let mut working_rng = rng.clone();
    let response = {
        let mut ctx = Context::new(&mut working_rng, time);
        app.apply(&mut working, &mut ctx, user, method)
    };

    if !response.is_ok() {
        return (
            Outcome {
                response,
                mutated: false,
            },
            None,
        );
    }

    let mutated = working != *state || working_rng != *rng;
    let commit = mutated.then_some((working, working_rng));
    (Outcome { response, mutated }, commit)
}

/// Run `on_tick` on a copy; returns the copies only if anything changed.
pub fn tick_working<A: Application>(
    app: &A,
    state: &A::State,
    rng: &DeterministicRng,
    time: u64,
    elapsed_ms: u64,
) -> Option<(A::State, DeterministicRng)> {
    let mut working = state.clone();
    let mut working_rng = rng.clone();
    {
        let mut ctx = Context::new(&mut working_rng, time);
        app.on_tick(&mut working, &mut ctx, elapsed_ms as f32 / 1000.0);
    }
    (working != *state || working_rng != *rng).then_some((working, working_rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dice::{DiceConfig, DiceGame, DiceMethod};
    use crate::core::codec::encode_to_vec;

    fn started_game() -> (DiceGame, <DiceGame as Application>::State, DeterministicRng) {
        let app = DiceGame;
        let mut rng = DeterministicRng::new(99);
        let args = encode_to_vec(&DiceConfig { target: 20 });
        let state = {
            let mut ctx = Context::new(&mut rng, 0);
            app.initialize(&mut ctx, &UserId::from("alice"), &args).unwrap()
        };
        (app, state, rng)
    }

    #[test]
    fn test_rejected_call_commits_nothing() {
        let (app, state, rng) = started_game();
        // Bob has not joined, so rolling is refused
        let (outcome, commit) =
            apply_working(&app, &state, &rng, 1, &UserId::from("bob"), DiceMethod::Roll);
        assert!(!outcome.response.is_ok());
        assert!(!outcome.mutated);
        assert!(commit.is_none());
    }

    #[test]
    fn test_accepted_call_returns_copies() {
        let (app, state, rng) = started_game();
        let (outcome, commit) =
            apply_working(&app, &state, &rng, 1, &UserId::from("bob"), DiceMethod::Join);
        assert!(outcome.response.is_ok());
        assert!(outcome.mutated);
        let (next, _) = commit.unwrap();
        assert_ne!(next, state);
    }

    #[test]
    fn test_idle_tick_reports_no_change() {
        let (app, state, rng) = started_game();
        // A single player has no turn clock running
        assert!(tick_working(&app, &state, &rng, 5, 100).is_none());
    }

    #[test]
    fn test_response_helpers() {
        assert!(Response::Ok.is_ok());
        let rejected = Response::error("not your turn");
        assert!(!rejected.is_ok());
        assert_eq!(rejected.error_message(), Some("not your turn"));
    }

    #[test]
    fn test_context_exposes_rng_and_time() {
        let mut rng = DeterministicRng::new(7);
        let expected = DeterministicRng::new(7).next_u64();
        let mut ctx = Context::new(&mut rng, 1234);
        assert_eq!(ctx.time(), 1234);
        assert_eq!(ctx.rng().next_u64(), expected);
    }
}
