//! Binary Codec
//!
//! Compact, schema-driven encoding shared by the wire protocol and the journal.
//! Nothing is tagged: the reader must know the shape it is decoding.
//!
//! ## Layout of a tracked message
//!
//! ```text
//! ┌──────────────┬──────────────────────┬─────────────────────────┐
//! │ UVarint bits │ packed bits (MSB 1st)│ body (bytes, in order)  │
//! └──────────────┴──────────────────────┴─────────────────────────┘
//! ```
//!
//! Every boolean written through [`Writer::write_bit`] (bool values, optional
//! flags, diff presence bits) lands in the bit tracker instead of the body.
//! [`Reader::tracked`] unpacks the tracker up front and hands the flags back
//! one at a time, in the order they were written.

use std::collections::VecDeque;
use thiserror::Error;

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Tried to read past the end of the buffer.
    #[error("unexpected end of buffer: need {needed} bytes at offset {offset}, {available} available")]
    UnexpectedEof {
        /// Read position.
        offset: usize,
        /// Bytes requested.
        needed: usize,
        /// Bytes left.
        available: usize,
    },
    /// A tracked read popped more flags than were written.
    #[error("bit tracker exhausted")]
    BitsExhausted,
    /// A varint ran longer than 64 bits.
    #[error("varint overflows 64 bits")]
    VarintOverflow,
    /// String bytes were not valid UTF-8.
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    /// Decoded a value outside the target type's range.
    #[error("value {value} out of range for {kind}")]
    OutOfRange {
        /// Target type name.
        kind: &'static str,
        /// The offending value.
        value: i128,
    },
}

// =============================================================================
// WRITER
// =============================================================================

/// Append-only binary writer.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    bits: Vec<bool>,
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a flag onto the bit tracker.
    #[inline]
    pub fn write_bit(&mut self, bit: bool) -> &mut Self {
        self.bits.push(bit);
        self
    }

    /// Write a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Write a fixed-width little-endian u32.
    #[inline]
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a fixed-width little-endian u64.
    #[inline]
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a signed LEB128 integer.
    pub fn write_varint(&mut self, value: i64) -> &mut Self {
        let mut value = value;
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.buf.push(byte);
                return self;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Write an unsigned LEB128 integer.
    pub fn write_uvarint(&mut self, value: u64) -> &mut Self {
        let mut value = value;
        while value >= 0x80 {
            self.buf.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
        self
    }

    /// Write a little-endian f32.
    #[inline]
    pub fn write_float(&mut self, value: f32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a UVarint length followed by UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_uvarint(value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Write raw bytes with no length prefix.
    #[inline]
    pub fn write_buffer(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Pack booleans into the body, most significant bit first.
    pub fn write_bits(&mut self, bits: &[bool]) -> &mut Self {
        self.buf.extend(pack_bits(bits));
        self
    }

    /// Body bytes written so far (tracker excluded).
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of flags on the tracker.
    pub fn tracked_bits(&self) -> usize {
        self.bits.len()
    }

    /// Take the raw body.
    ///
    /// Only valid for untracked messages; tracked flags would be lost.
    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.bits.is_empty(), "tracked bits dropped by into_bytes");
        self.buf
    }

    /// Emit `UVarint(bit count) ‖ packed bits ‖ body`.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Writer::new();
        out.write_uvarint(self.bits.len() as u64);
        out.write_bits(&self.bits);
        out.buf.extend_from_slice(&self.buf);
        out.buf
    }
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 0x80 >> (i % 8);
        }
    }
    packed
}

// =============================================================================
// READER
// =============================================================================

/// Cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    bits: VecDeque<bool>,
}

impl<'a> Reader<'a> {
    /// Reader over an untracked buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            bits: VecDeque::new(),
        }
    }

    /// Reader over a tracked message; consumes the bit header eagerly.
    pub fn tracked(buf: &'a [u8]) -> CodecResult<Self> {
        let mut reader = Self::new(buf);
        let count = reader.read_len()?;
        reader.bits = reader.read_bits(count)?;
        Ok(reader)
    }

    /// Pop the next tracked flag.
    #[inline]
    pub fn read_bit(&mut self) -> CodecResult<bool> {
        self.bits.pop_front().ok_or(CodecError::BitsExhausted)
    }

    fn take(&mut self, needed: usize) -> CodecResult<&'a [u8]> {
        let available = self.buf.len() - self.pos;
        if needed > available {
            return Err(CodecError::UnexpectedEof {
                offset: self.pos,
                needed,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a fixed-width little-endian u32.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read a fixed-width little-endian u64.
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Read a signed LEB128 integer.
    pub fn read_varint(&mut self) -> CodecResult<i64> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(CodecError::VarintOverflow);
            }
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Read an unsigned LEB128 integer.
    pub fn read_uvarint(&mut self) -> CodecResult<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(CodecError::VarintOverflow);
            }
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Read a UVarint used as a length or count.
    pub fn read_len(&mut self) -> CodecResult<usize> {
        let value = self.read_uvarint()?;
        usize::try_from(value).map_err(|_| CodecError::OutOfRange {
            kind: "usize",
            value: value as i128,
        })
    }

    /// Read a little-endian f32.
    pub fn read_float(&mut self) -> CodecResult<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Read a UVarint-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> CodecResult<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read exactly `len` raw bytes.
    pub fn read_buffer(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        self.take(len)
    }

    /// Read everything left in the body.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Unpack `count` booleans from the body, in the order they were packed.
    pub fn read_bits(&mut self, count: usize) -> CodecResult<VecDeque<bool>> {
        let packed = self.take(count.div_ceil(8))?;
        Ok((0..count)
            .map(|i| packed[i / 8] & (0x80 >> (i % 8)) != 0)
            .collect())
    }

    /// Bytes left in the body.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once the body is exhausted.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.pos
    }
}

// =============================================================================
// ENCODE / DECODE TRAITS
// =============================================================================

/// Types with a schema-driven binary encoding.
pub trait Encode {
    /// Append this value to the writer.
    fn encode(&self, writer: &mut Writer);
}

/// Types that can be read back from their [`Encode`] form.
pub trait Decode: Sized {
    /// Read one value.
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self>;
}

/// Encode a value as a complete tracked message.
pub fn encode_to_vec<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut writer = Writer::new();
    value.encode(&mut writer);
    writer.finish()
}

/// Decode a complete tracked message.
pub fn decode_from_slice<T: Decode>(bytes: &[u8]) -> CodecResult<T> {
    let mut reader = Reader::tracked(bytes)?;
    T::decode(&mut reader)
}

impl Encode for bool {
    fn encode(&self, writer: &mut Writer) {
        writer.write_bit(*self);
    }
}

impl Decode for bool {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        reader.read_bit()
    }
}

impl Encode for u8 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }
}

impl Decode for u8 {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        reader.read_u8()
    }
}

impl Encode for u32 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_uvarint(*self as u64);
    }
}

impl Decode for u32 {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let value = reader.read_uvarint()?;
        u32::try_from(value).map_err(|_| CodecError::OutOfRange {
            kind: "u32",
            value: value as i128,
        })
    }
}

impl Encode for u64 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_uvarint(*self);
    }
}

impl Decode for u64 {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        reader.read_uvarint()
    }
}

impl Encode for i32 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_varint(*self as i64);
    }
}

impl Decode for i32 {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let value = reader.read_varint()?;
        i32::try_from(value).map_err(|_| CodecError::OutOfRange {
            kind: "i32",
            value: value as i128,
        })
    }
}

impl Encode for i64 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_varint(*self);
    }
}

impl Decode for i64 {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        reader.read_varint()
    }
}

impl Encode for f32 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_float(*self);
    }
}

impl Decode for f32 {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        reader.read_float()
    }
}

impl Encode for String {
    fn encode(&self, writer: &mut Writer) {
        writer.write_string(self);
    }
}

impl Decode for String {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        reader.read_string()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, writer: &mut Writer) {
        writer.write_bit(self.is_some());
        if let Some(inner) = self {
            inner.encode(writer);
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        if reader.read_bit()? {
            Ok(Some(T::decode(reader)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, writer: &mut Writer) {
        writer.write_uvarint(self.len() as u64);
        for item in self {
            item.encode(writer);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let count = reader.read_len()?;
        // Zero-width elements (bools) live in the tracker, so cap the hint.
        let mut items = Vec::with_capacity(count.min(reader.remaining() + 1));
        for _ in 0..count {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}
