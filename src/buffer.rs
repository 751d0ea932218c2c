//! # Wire Buffer and Varint Codec
//!
//! The byte-level foundation of the protocol: a mutable byte container with
//! independent reader and writer indices, and the typed primitives every
//! packet is built from.
//!
//! ## Encoding Summary
//!
//! | value | encoding |
//! |-------|----------|
//! | unsigned int/long | base-128 varint, low-order group first, MSB = continuation |
//! | signed int/long | zig-zag mapped, then varint |
//! | short / char | fixed 16-bit big-endian |
//! | byte array | varint length + raw bytes |
//! | string | UTF-8 byte array |
//! | UUID | two zig-zag varint longs (msb, lsb) |
//! | public key | byte array of X.509 SubjectPublicKeyInfo |
//! | nested buffer | varint readable-length + raw bytes |
//!
//! Varints are capped at 5 bytes for 32-bit values and 10 bytes for 64-bit
//! values; exceeding the cap on read is a [`DecodeError::VarintOverflow`],
//! never a silent truncation.
//!
//! ## Framing Oracle
//!
//! [`Buffer::is_u32_varint_available`] answers "is a complete length prefix
//! buffered?" without consuming bytes. The frame codec uses it to decide
//! whether another frame can be extracted from a partially received datagram
//! stream.
//!
//! ## Threading
//!
//! A buffer is single-threaded by contract: every accessor takes `&mut self`
//! and instances are meant to be short-lived, owned by whichever stage of the
//! pipeline currently holds the frame.

use uuid::Uuid;

use crate::identity::PublicKey;

/// Maximum encoded length of a 32-bit varint.
pub const MAX_VARINT32_LEN: usize = 5;

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT64_LEN: usize = 10;

// ============================================================================
// Error Type
// ============================================================================

/// Failures of the wire codec, both directions.
///
/// Reads fail on truncated or malformed input; writes fail only when a
/// bounded buffer would exceed its capacity limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough readable bytes for the requested value.
    ShortRead,
    /// A varint ran past its maximum encoded length.
    VarintOverflow { limit: usize },
    /// A bounded buffer would grow past its configured maximum.
    CapacityExceeded,
    /// A packet carried a kind string with no registered decoder.
    UnknownPacket(String),
    /// Key bytes did not parse as an acceptable public key.
    MalformedKey,
    /// A string or character was not valid UTF-8 / not a scalar value.
    BadUtf8,
    /// A socket address field did not parse.
    MalformedAddress,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::ShortRead => write!(f, "not enough readable bytes"),
            DecodeError::VarintOverflow { limit } => {
                write!(f, "varint exceeded its maximum of {} bytes", limit)
            }
            DecodeError::CapacityExceeded => write!(f, "buffer capacity limit exceeded"),
            DecodeError::UnknownPacket(kind) => {
                write!(f, "no decoder registered for packet kind {:?}", kind)
            }
            DecodeError::MalformedKey => write!(f, "malformed public key"),
            DecodeError::BadUtf8 => write!(f, "invalid UTF-8 or character data"),
            DecodeError::MalformedAddress => write!(f, "malformed socket address"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Buffer
// ============================================================================

/// Growable byte buffer with independent reader and writer indices.
#[derive(Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
    marked_reader: usize,
    marked_writer: usize,
    limit: Option<usize>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preferred over [`Buffer::new`] when the final size is roughly known:
    /// avoids regrowing the backing storage mid-encode.
    pub fn with_capacity(initial: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial),
            ..Self::default()
        }
    }

    /// A bounded buffer: writes that would push the writer index past `max`
    /// fail with [`DecodeError::CapacityExceeded`].
    pub fn with_limit(initial: usize, max: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial.min(max)),
            limit: Some(max),
            ..Self::default()
        }
    }

    /// Wrap an existing byte vector; the readable region is the whole vector.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let writer = data.len();
        Self {
            data,
            writer,
            ..Self::default()
        }
    }

    /// The readable region as a slice (reader index up to writer index).
    pub fn readable(&self) -> &[u8] {
        &self.data[self.reader..self.writer]
    }

    /// Consume the buffer, returning the readable region.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.writer);
        self.data.drain(..self.reader);
        self.data
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    #[inline]
    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// Move the reader index.
    ///
    /// # Panics
    /// Panics if `index` is past the writer index; that is a programming
    /// error, not a wire condition.
    pub fn set_reader_index(&mut self, index: usize) -> &mut Self {
        assert!(index <= self.writer, "reader index {} past writer index {}", index, self.writer);
        self.reader = index;
        self
    }

    /// Move the writer index within the already written region.
    ///
    /// # Panics
    /// Panics if `index` is past the end of the backing storage or before the
    /// reader index.
    pub fn set_writer_index(&mut self, index: usize) -> &mut Self {
        assert!(
            index >= self.reader && index <= self.data.len(),
            "writer index {} outside [{}, {}]",
            index,
            self.reader,
            self.data.len()
        );
        self.writer = index;
        self
    }

    /// Remember the current reader index for a later
    /// [`Buffer::reset_reader_index`]. One mark at a time.
    pub fn mark_reader_index(&mut self) -> &mut Self {
        self.marked_reader = self.reader;
        self
    }

    pub fn reset_reader_index(&mut self) -> &mut Self {
        self.reader = self.marked_reader;
        self
    }

    /// Remember the current writer index for a later
    /// [`Buffer::reset_writer_index`]. One mark at a time.
    pub fn mark_writer_index(&mut self) -> &mut Self {
        self.marked_writer = self.writer;
        self
    }

    pub fn reset_writer_index(&mut self) -> &mut Self {
        self.writer = self.marked_writer;
        self
    }

    // ------------------------------------------------------------------
    // Raw byte access
    // ------------------------------------------------------------------

    fn push(&mut self, byte: u8) -> Result<(), DecodeError> {
        if let Some(limit) = self.limit {
            if self.writer + 1 > limit {
                return Err(DecodeError::CapacityExceeded);
            }
        }
        if self.writer < self.data.len() {
            self.data[self.writer] = byte;
        } else {
            self.data.push(byte);
        }
        self.writer += 1;
        Ok(())
    }

    fn push_slice(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        if let Some(limit) = self.limit {
            if self.writer + bytes.len() > limit {
                return Err(DecodeError::CapacityExceeded);
            }
        }
        for &byte in bytes {
            if self.writer < self.data.len() {
                self.data[self.writer] = byte;
            } else {
                self.data.push(byte);
            }
            self.writer += 1;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.reader >= self.writer {
            return Err(DecodeError::ShortRead);
        }
        let byte = self.data[self.reader];
        self.reader += 1;
        Ok(byte)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<&mut Self, DecodeError> {
        self.push(value)?;
        Ok(self)
    }

    /// Read exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        if self.readable_bytes() < len {
            return Err(DecodeError::ShortRead);
        }
        let out = self.data[self.reader..self.reader + len].to_vec();
        self.reader += len;
        Ok(out)
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<&mut Self, DecodeError> {
        self.push_slice(bytes)?;
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Fixed-width primitives
    // ------------------------------------------------------------------

    /// 16-bit big-endian, fixed width (not a varint). Carries broadcast TTLs.
    pub fn read_short(&mut self) -> Result<u16, DecodeError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(((hi as u16) << 8) | lo as u16)
    }

    pub fn write_short(&mut self, value: u16) -> Result<&mut Self, DecodeError> {
        self.push((value >> 8) as u8)?;
        self.push(value as u8)?;
        Ok(self)
    }

    /// 16-bit big-endian character. Surrogate code units are rejected.
    pub fn read_char(&mut self) -> Result<char, DecodeError> {
        let unit = self.read_short()?;
        char::from_u32(unit as u32).ok_or(DecodeError::BadUtf8)
    }

    /// Writes the low 16 bits of the character; values outside the BMP are
    /// rejected rather than silently truncated.
    pub fn write_char(&mut self, value: char) -> Result<&mut Self, DecodeError> {
        let scalar = value as u32;
        if scalar > 0xFFFF {
            return Err(DecodeError::BadUtf8);
        }
        self.write_short(scalar as u16)
    }

    // ------------------------------------------------------------------
    // Varints
    // ------------------------------------------------------------------

    fn read_varint(&mut self, max_len: usize) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        for i in 0..max_len {
            let current = self.read_u8()?;
            value |= ((current & 0x7F) as u64) << (7 * i);
            if current & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::VarintOverflow { limit: max_len })
    }

    fn write_varint(&mut self, mut value: u64) -> Result<(), DecodeError> {
        loop {
            let mut current = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                current |= 0x80;
            }
            self.push(current)?;
            if value == 0 {
                return Ok(());
            }
        }
    }

    pub fn read_var_u32(&mut self) -> Result<u32, DecodeError> {
        Ok((self.read_varint(MAX_VARINT32_LEN)? & 0xFFFF_FFFF) as u32)
    }

    pub fn write_var_u32(&mut self, value: u32) -> Result<&mut Self, DecodeError> {
        self.write_varint(value as u64)?;
        Ok(self)
    }

    pub fn read_var_u64(&mut self) -> Result<u64, DecodeError> {
        self.read_varint(MAX_VARINT64_LEN)
    }

    pub fn write_var_u64(&mut self, value: u64) -> Result<&mut Self, DecodeError> {
        self.write_varint(value)?;
        Ok(self)
    }

    /// Zig-zag mapped signed 32-bit integer.
    pub fn read_var_i32(&mut self) -> Result<i32, DecodeError> {
        let encoded = self.read_var_u32()?;
        Ok(((encoded >> 1) as i32) ^ -((encoded & 1) as i32))
    }

    pub fn write_var_i32(&mut self, value: i32) -> Result<&mut Self, DecodeError> {
        self.write_var_u32(((value << 1) ^ (value >> 31)) as u32)
    }

    /// Zig-zag mapped signed 64-bit integer.
    pub fn read_var_i64(&mut self) -> Result<i64, DecodeError> {
        let encoded = self.read_var_u64()?;
        Ok(((encoded >> 1) as i64) ^ -((encoded & 1) as i64))
    }

    pub fn write_var_i64(&mut self, value: i64) -> Result<&mut Self, DecodeError> {
        self.write_var_u64(((value << 1) ^ (value >> 63)) as u64)
    }

    // ------------------------------------------------------------------
    // Framing oracle
    // ------------------------------------------------------------------

    fn is_varint_available(&self, max_len: usize) -> bool {
        for i in 0..max_len {
            match self.data[..self.writer].get(self.reader + i) {
                None => return false,
                Some(byte) if byte & 0x80 == 0 => return true,
                Some(_) => {}
            }
        }
        // max_len continuation bytes are buffered; the read will report the
        // overflow, but as far as framing goes the varint is "complete".
        true
    }

    /// Whether a complete 32-bit varint is buffered at the reader index.
    /// Does not consume bytes.
    pub fn is_u32_varint_available(&self) -> bool {
        self.is_varint_available(MAX_VARINT32_LEN)
    }

    /// Whether a complete 64-bit varint is buffered at the reader index.
    pub fn is_u64_varint_available(&self) -> bool {
        self.is_varint_available(MAX_VARINT64_LEN)
    }

    // ------------------------------------------------------------------
    // Composite values
    // ------------------------------------------------------------------

    /// Varint length prefix + raw bytes.
    pub fn read_byte_array(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_var_u32()? as usize;
        self.read_raw(len)
    }

    pub fn write_byte_array(&mut self, bytes: &[u8]) -> Result<&mut Self, DecodeError> {
        self.write_var_u32(bytes.len() as u32)?;
        self.push_slice(bytes)?;
        Ok(self)
    }

    /// UTF-8 string as a length-prefixed byte array.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_byte_array()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::BadUtf8)
    }

    pub fn write_string(&mut self, value: &str) -> Result<&mut Self, DecodeError> {
        self.write_byte_array(value.as_bytes())
    }

    /// UUID as two zig-zag varint longs: most significant bits first.
    pub fn read_uuid(&mut self) -> Result<Uuid, DecodeError> {
        let msb = self.read_var_i64()?;
        let lsb = self.read_var_i64()?;
        Ok(Uuid::from_u64_pair(msb as u64, lsb as u64))
    }

    pub fn write_uuid(&mut self, value: &Uuid) -> Result<&mut Self, DecodeError> {
        let (msb, lsb) = value.as_u64_pair();
        self.write_var_i64(msb as i64)?.write_var_i64(lsb as i64)
    }

    /// Public key as a length-prefixed X.509 SubjectPublicKeyInfo byte array.
    pub fn read_public_key(&mut self) -> Result<PublicKey, DecodeError> {
        let der = self.read_byte_array()?;
        PublicKey::from_der(&der).map_err(|_| DecodeError::MalformedKey)
    }

    pub fn write_public_key(&mut self, key: &PublicKey) -> Result<&mut Self, DecodeError> {
        self.write_byte_array(key.encoded_der())
    }

    /// A nested buffer: varint readable-length + raw bytes. This is the
    /// framing boundary.
    pub fn read_buffer(&mut self) -> Result<Buffer, DecodeError> {
        let len = self.read_var_u32()? as usize;
        Ok(Buffer::from_vec(self.read_raw(len)?))
    }

    pub fn write_buffer(&mut self, other: &Buffer) -> Result<&mut Self, DecodeError> {
        self.write_var_u32(other.readable_bytes() as u32)?;
        self.push_slice(other.readable())?;
        Ok(self)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .field("readable", &self.readable_bytes())
            .finish()
    }
}
