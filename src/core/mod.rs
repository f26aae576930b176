//! Core primitives.
//!
//! Encoding, structural diffing and deterministic randomness. Nothing in
//! here touches the network, the filesystem or the clock.

pub mod codec;
pub mod diff;
pub mod hash;
pub mod ids;
pub mod rng;

// Re-export core types
pub use codec::{CodecError, CodecResult, Decode, Encode, Reader, Writer};
pub use diff::{changeset_since, ArrayDiff, Diffable, OptionDiff};
pub use hash::{view_digest, ViewDigest};
pub use ids::{SessionId, UserId};
pub use rng::DeterministicRng;
