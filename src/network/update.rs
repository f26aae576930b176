//! Client State Updates
//!
//! The payload a store publishes to one user. One tracked message:
//!
//! ```text
//! UVarint changed_at_delta │ Option<changeset> │ { u32 corr id │ Option<string error> }*
//! ```
//!
//! Response pairs run until the body is exhausted. `changed_at_delta` is the
//! number of milliseconds since the previous update sent to the same user, or
//! the full timestamp on the first one.

use crate::core::codec::{CodecResult, Decode, Encode, Reader, Writer};

/// A correlated answer to one method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    /// Correlation id chosen by the client.
    pub correlation_id: u32,
    /// `None` on success, the rejection message otherwise.
    pub error: Option<String>,
}

/// Everything one user receives in a publish sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate<D> {
    /// Milliseconds since the last update to this user.
    pub changed_at_delta: u64,
    /// View changes; `None` if only responses are being flushed.
    pub changeset: Option<D>,
    /// Call results queued since the last sweep.
    pub responses: Vec<CallResult>,
}

impl<D: Encode> StateUpdate<D> {
    /// Encode as a tracked message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.write_uvarint(self.changed_at_delta);
        self.changeset.encode(&mut writer);
        for response in &self.responses {
            writer.write_u32(response.correlation_id);
            response.error.encode(&mut writer);
        }
        writer.finish()
    }
}

impl<D: Decode> StateUpdate<D> {
    /// Decode a tracked message.
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = Reader::tracked(bytes)?;
        let changed_at_delta = reader.read_uvarint()?;
        let changeset = Option::<D>::decode(&mut reader)?;
        let mut responses = Vec::new();
        while !reader.is_empty() {
            let correlation_id = reader.read_u32()?;
            let error = Option::<String>::decode(&mut reader)?;
            responses.push(CallResult {
                correlation_id,
                error,
            });
        }
        Ok(Self {
            changed_at_delta,
            changeset,
            responses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dice::{DiceView, DiceViewDiff, PlayerView};
    use crate::core::diff::{changeset_since, Diffable};

    #[test]
    fn test_full_view_then_patch() {
        let view = DiceView {
            players: vec![PlayerView {
                id: "alice".into(),
                score: 3,
                is_you: true,
            }],
            current_turn: Some("alice".into()),
            your_turn: true,
            target: 50,
            ..Default::default()
        };

        let update = StateUpdate {
            changed_at_delta: 1_700_000_000_000,
            changeset: changeset_since(&view, None),
            responses: vec![CallResult {
                correlation_id: 7,
                error: None,
            }],
        };
        let decoded = StateUpdate::<DiceViewDiff>::from_bytes(&update.to_bytes()).unwrap();
        assert_eq!(decoded, update);

        let mut client = DiceView::default();
        client.patch(decoded.changeset.unwrap());
        assert_eq!(client, view);
    }

    #[test]
    fn test_responses_only() {
        let update: StateUpdate<DiceViewDiff> = StateUpdate {
            changed_at_delta: 50,
            changeset: None,
            responses: vec![
                CallResult {
                    correlation_id: 1,
                    error: Some("not your turn".into()),
                },
                CallResult {
                    correlation_id: u32::MAX,
                    error: None,
                },
            ],
        };
        let decoded = StateUpdate::<DiceViewDiff>::from_bytes(&update.to_bytes()).unwrap();
        assert_eq!(decoded.responses, update.responses);
        assert!(decoded.changeset.is_none());
    }

    #[test]
    fn test_truncated_response_fails() {
        let update: StateUpdate<DiceViewDiff> = StateUpdate {
            changed_at_delta: 0,
            changeset: None,
            responses: vec![CallResult {
                correlation_id: 9,
                error: None,
            }],
        };
        let bytes = update.to_bytes();
        assert!(StateUpdate::<DiceViewDiff>::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
