//! Journal Records
//!
//! Payload layouts:
//!
//! ```text
//! genesis : u64 seed (LE) │ string user │ raw init args
//! invoke  : u8 method tag │ string user │ raw method args
//! tick    : 0xFF          │ UVarint elapsed millis
//! ```
//!
//! The genesis record is recognised by position (always first), the others
//! by their leading byte.

use crate::app::TICK_TAG;
use crate::core::codec::{CodecResult, Reader, Writer};
use crate::core::ids::UserId;

/// One entry of a session's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Session creation.
    Genesis {
        /// Seed for the session's generator.
        seed: u64,
        /// User who created the session.
        user: UserId,
        /// Initialization arguments as received.
        args: Vec<u8>,
    },
    /// A committed method call.
    Invoke {
        /// Method tag (never [`TICK_TAG`]).
        method: u8,
        /// Calling user.
        user: UserId,
        /// Method arguments as received.
        args: Vec<u8>,
    },
    /// A tick that changed state.
    Tick {
        /// Elapsed time passed to `on_tick`.
        elapsed_ms: u64,
    },
}

impl LogRecord {
    /// Encode the payload.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        match self {
            Self::Genesis { seed, user, args } => {
                writer
                    .write_u64(*seed)
                    .write_string(user.as_str())
                    .write_buffer(args);
            }
            Self::Invoke { method, user, args } => {
                debug_assert_ne!(*method, TICK_TAG, "tick tag used as a method");
                writer
                    .write_u8(*method)
                    .write_string(user.as_str())
                    .write_buffer(args);
            }
            Self::Tick { elapsed_ms } => {
                writer.write_u8(TICK_TAG).write_uvarint(*elapsed_ms);
            }
        }
        writer.into_bytes()
    }

    /// Decode a payload; `first` selects the genesis layout.
    pub fn decode_payload(payload: &[u8], first: bool) -> CodecResult<Self> {
        let mut reader = Reader::new(payload);
        if first {
            let seed = reader.read_u64()?;
            let user = UserId::new(reader.read_string()?);
            let args = reader.read_remaining().to_vec();
            return Ok(Self::Genesis { seed, user, args });
        }

        match reader.read_u8()? {
            TICK_TAG => Ok(Self::Tick {
                elapsed_ms: reader.read_uvarint()?,
            }),
            method => {
                let user = UserId::new(reader.read_string()?);
                let args = reader.read_remaining().to_vec();
                Ok(Self::Invoke { method, user, args })
            }
        }
    }
}

/// A record with the wall-clock time it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The record.
    pub record: LogRecord,
}
