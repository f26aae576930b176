//! Coordinator Protocol
//!
//! Framing and messages on the store ↔ coordinator TCP link.
//!
//! ```text
//! frame   : [length: u32 LE][payload: length bytes]
//! payload : [tag: u8][session: u64 LE][user: UVarint len + UTF-8][rest...]
//! ```
//!
//! Several frames may arrive in one read and one frame may span several;
//! [`FrameBuffer`] reassembles them.

use thiserror::Error;

use crate::core::codec::{CodecError, Reader, Writer};
use crate::core::ids::{SessionId, UserId};

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame length prefix size.
pub const LENGTH_PREFIX: usize = 4;

/// Inbound message tags (coordinator → store).
pub mod inbound_tags {
    /// Create a session.
    pub const NEW_SESSION: u8 = 0;
    /// A user starts watching a session.
    pub const SUBSCRIBE: u8 = 1;
    /// A user stops watching a session.
    pub const UNSUBSCRIBE: u8 = 2;
    /// A user calls a method.
    pub const INVOKE: u8 = 3;
}

/// Outbound message tags (store → coordinator).
pub mod outbound_tags {
    /// Data for one user.
    pub const PUBLISH: u8 = 0;
    /// The session cannot be found or recovered.
    pub const UNKNOWN_SESSION: u8 = 1;
}

/// Protocol errors. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Length prefix above [`MAX_FRAME_LEN`].
    #[error("frame too large: {len} bytes (max {MAX_FRAME_LEN})")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
    },

    /// Unrecognized message tag.
    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    /// Message body did not decode.
    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),
}

// =============================================================================
// FRAMING
// =============================================================================

/// Prefix a payload with its length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reassembles frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { len });
        }
        if self.buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        let payload = self.buf[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec();
        self.buf.drain(..LENGTH_PREFIX + len);
        Ok(Some(payload))
    }

    /// Drop any partial data (after a reconnect).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Messages from the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Create a session with its creator and init args.
    NewSession {
        /// New session id.
        session: SessionId,
        /// Creating user.
        user: UserId,
        /// Application init args.
        args: Vec<u8>,
    },
    /// Start sending updates to a user.
    Subscribe {
        /// Session id.
        session: SessionId,
        /// Subscribing user.
        user: UserId,
    },
    /// Stop sending updates to a user.
    Unsubscribe {
        /// Session id.
        session: SessionId,
        /// Leaving user.
        user: UserId,
    },
    /// Call a method.
    Invoke {
        /// Session id.
        session: SessionId,
        /// Calling user.
        user: UserId,
        /// Method tag.
        method: u8,
        /// Echoed back with the response.
        correlation_id: u32,
        /// Method args.
        args: Vec<u8>,
    },
}

impl Inbound {
    /// Target session.
    pub fn session(&self) -> SessionId {
        match self {
            Self::NewSession { session, .. }
            | Self::Subscribe { session, .. }
            | Self::Unsubscribe { session, .. }
            | Self::Invoke { session, .. } => *session,
        }
    }

    /// Encode a payload (without the length prefix).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        match self {
            Self::NewSession { session, user, args } => {
                write_header(&mut writer, inbound_tags::NEW_SESSION, *session, user);
                writer.write_buffer(args);
            }
            Self::Subscribe { session, user } => {
                write_header(&mut writer, inbound_tags::SUBSCRIBE, *session, user);
            }
            Self::Unsubscribe { session, user } => {
                write_header(&mut writer, inbound_tags::UNSUBSCRIBE, *session, user);
            }
            Self::Invoke {
                session,
                user,
                method,
                correlation_id,
                args,
            } => {
                write_header(&mut writer, inbound_tags::INVOKE, *session, user);
                writer
                    .write_u8(*method)
                    .write_u32(*correlation_id)
                    .write_buffer(args);
            }
        }
        writer.into_bytes()
    }

    /// Decode a payload.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload);
        let tag = reader.read_u8()?;
        let session = SessionId(reader.read_u64()?);
        let user = UserId::new(reader.read_string()?);
        match tag {
            inbound_tags::NEW_SESSION => Ok(Self::NewSession {
                session,
                user,
                args: reader.read_remaining().to_vec(),
            }),
            inbound_tags::SUBSCRIBE => Ok(Self::Subscribe { session, user }),
            inbound_tags::UNSUBSCRIBE => Ok(Self::Unsubscribe { session, user }),
            inbound_tags::INVOKE => {
                let method = reader.read_u8()?;
                let correlation_id = reader.read_u32()?;
                Ok(Self::Invoke {
                    session,
                    user,
                    method,
                    correlation_id,
                    args: reader.read_remaining().to_vec(),
                })
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Messages to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Deliver bytes to one user.
    Publish {
        /// Session id.
        session: SessionId,
        /// Recipient.
        user: UserId,
        /// Encoded state update.
        data: Vec<u8>,
    },
    /// The session does not exist here.
    UnknownSession {
        /// Session id.
        session: SessionId,
        /// User who asked for it.
        user: UserId,
    },
}

impl Outbound {
    /// Encode a payload (without the length prefix).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        match self {
            Self::Publish { session, user, data } => {
                write_header(&mut writer, outbound_tags::PUBLISH, *session, user);
                writer.write_buffer(data);
            }
            Self::UnknownSession { session, user } => {
                write_header(&mut writer, outbound_tags::UNKNOWN_SESSION, *session, user);
            }
        }
        writer.into_bytes()
    }

    /// Decode a payload.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload);
        let tag = reader.read_u8()?;
        let session = SessionId(reader.read_u64()?);
        let user = UserId::new(reader.read_string()?);
        match tag {
            outbound_tags::PUBLISH => Ok(Self::Publish {
                session,
                user,
                data: reader.read_remaining().to_vec(),
            }),
            outbound_tags::UNKNOWN_SESSION => Ok(Self::UnknownSession { session, user }),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn write_header(writer: &mut Writer, tag: u8, session: SessionId, user: &UserId) {
    writer
        .write_u8(tag)
        .write_u64(session.0)
        .write_string(user.as_str());
}
