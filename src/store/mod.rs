//! Session Stores
//!
//! [`SessionStore`] is the per-session state machine; [`StoreSupervisor`]
//! owns all of them and drives the sweeps.

pub mod session;
pub mod supervisor;

pub use session::{SessionError, SessionPhase, SessionStore};
pub use supervisor::{SharedSession, StoreSupervisor};

/// Wall-clock milliseconds since the Unix epoch.
///
/// Taken once per call or tick and journaled, so replay never reads the clock.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
