//! Record framing: `{UVarint payload length}{u64 LE timestamp}{payload}`.

use crate::core::codec::{CodecError, CodecResult, Reader, Writer};

/// Largest payload a record may declare. Coordinator frames are capped at
/// 16 MiB, so no committed call can exceed this.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Frame one payload.
pub fn encode_frame(timestamp: u64, payload: &[u8]) -> Vec<u8> {
    let mut writer = Writer::new();
    writer
        .write_uvarint(payload.len() as u64)
        .write_u64(timestamp)
        .write_buffer(payload);
    writer.into_bytes()
}

/// Read one frame, returning its timestamp and payload.
///
/// `UnexpectedEof` means the frame runs past the end of the buffer. A
/// declared length above [`MAX_RECORD_LEN`] is `OutOfRange`, never EOF.
pub fn read_frame<'a>(reader: &mut Reader<'a>) -> CodecResult<(u64, &'a [u8])> {
    let len = reader.read_len()?;
    if len > MAX_RECORD_LEN {
        return Err(CodecError::OutOfRange {
            kind: "journal record length",
            value: len as i128,
        });
    }
    let timestamp = reader.read_u64()?;
    let payload = reader.read_buffer(len)?;
    Ok((timestamp, payload))
}
