//! View Digests
//!
//! SHA-256 over the codec encoding of a value. Used to log a compact
//! fingerprint after journal recovery and to compare live and replayed views.

use sha2::{Digest, Sha256};

use super::codec::{encode_to_vec, Encode};

/// Hash output type (256 bits / 32 bytes).
pub type ViewDigest = [u8; 32];

const VIEW_DOMAIN: &[u8] = b"STATESYNC_VIEW_V1";

/// Digest of a value's tracked encoding.
pub fn view_digest<T: Encode + ?Sized>(value: &T) -> ViewDigest {
    let mut hasher = Sha256::new();
    hasher.update(VIEW_DOMAIN);
    hasher.update(encode_to_vec(value));
    hasher.finalize().into()
}

/// Short hex prefix for log lines.
pub fn short_hex(digest: &ViewDigest) -> String {
    hex::encode(&digest[..8])
}
