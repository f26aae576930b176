//! # Statesync Store
//!
//! Authoritative session store for real-time multiplayer state sync.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     STATESYNC STORE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── codec.rs    - Varints, strings, tracked bit flags       │
//! │  ├── diff.rs     - Structural diff / patch                   │
//! │  ├── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │  ├── hash.rs     - View digests                              │
//! │  └── ids.rs      - Session and user ids                      │
//! │                                                              │
//! │  app/            - Hosted application contract               │
//! │  └── dice.rs     - Reference application                     │
//! │                                                              │
//! │  journal/        - Append-only session history               │
//! │  ├── frame.rs    - Record framing                            │
//! │  ├── record.rs   - Genesis / invoke / tick records           │
//! │  └── replay.rs   - Deterministic rebuild                     │
//! │                                                              │
//! │  store/          - Session state machines                    │
//! │  ├── session.rs  - One session: calls, ticks, fan-out        │
//! │  └── supervisor.rs - Registry, recovery, sweeps              │
//! │                                                              │
//! │  network/        - Coordinator link (non-deterministic)      │
//! │  ├── coordinator.rs - TCP client with backoff                │
//! │  ├── protocol.rs - Framing and messages                      │
//! │  ├── update.rs   - Client state update payload               │
//! │  └── auth.rs     - Registration payload                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! A session's state is a pure function of its journal:
//! - All randomness from the session's seeded Xorshift128+
//! - All time from journaled record timestamps
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - Rejected calls never reach the journal
//!
//! Replaying a journal therefore yields **identical state** to the live
//! session that wrote it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod app;
pub mod config;
pub mod core;
pub mod journal;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use app::{Application, Context, MethodCall, Response};
pub use config::{ConfigError, StoreConfig};
pub use core::codec::{Decode, Encode, Reader, Writer};
pub use core::diff::Diffable;
pub use core::ids::{SessionId, UserId};
pub use core::rng::DeterministicRng;
pub use journal::Journal;
pub use store::{SessionStore, StoreSupervisor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
