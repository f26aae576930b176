//! Session and user identifiers.

use std::fmt;

use super::codec::{CodecResult, Decode, Encode, Reader, Writer};

/// Session identifier assigned by the coordinator.
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Parse the 16-digit hex form used for journal file names.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// User identifier as resolved by the coordinator's auth layer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UserId(String);

impl UserId {
    /// Wrap a raw id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Encode for UserId {
    fn encode(&self, writer: &mut Writer) {
        writer.write_string(&self.0);
    }
}

impl Decode for UserId {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        reader.read_string().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_hex_roundtrip() {
        let id = SessionId(0xdead_beef);
        let text = id.to_string();
        assert_eq!(text, "00000000deadbeef");
        assert_eq!(SessionId::from_hex(&text), Some(id));
        assert_eq!(SessionId::from_hex("beef"), None);
        assert_eq!(SessionId::from_hex("zzzzzzzzzzzzzzzz"), None);
    }
}
