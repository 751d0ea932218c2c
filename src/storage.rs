//! # Self-Describing Storage Values
//!
//! A [`StorageValue`] knows how to write its own encoded form into a
//! [`Buffer`] and how to reconstruct itself from one. Packets embed storage
//! values without the codec knowing their layout; the concrete type is chosen
//! by the reading code, which replaces the original design's reflective
//! constructor lookup with a plain generic call
//! ([`Buffer::read_value`] / [`Buffer::write_value`]).

use crate::buffer::{Buffer, DecodeError};

/// A value with a self-describing wire form.
pub trait StorageValue: Sized {
    /// Append the encoded form to `buf`.
    fn write_to(&self, buf: &mut Buffer) -> Result<(), DecodeError>;

    /// Reconstruct a value, consuming exactly the bytes `write_to` produced.
    fn read_from(buf: &mut Buffer) -> Result<Self, DecodeError>;
}

impl Buffer {
    /// Read an embedded storage value of a caller-chosen type.
    pub fn read_value<V: StorageValue>(&mut self) -> Result<V, DecodeError> {
        V::read_from(self)
    }

    /// Write an embedded storage value by delegating to its own writer.
    pub fn write_value<V: StorageValue>(&mut self, value: &V) -> Result<&mut Self, DecodeError> {
        value.write_to(self)?;
        Ok(self)
    }
}

// ============================================================================
// Version
// ============================================================================

/// Protocol version triple with a 1–3 byte encoding.
///
/// Each component carries 7 payload bits; the high bit of a byte is set
/// exactly when another component follows. A byte is only emitted for a
/// component when it, or any later component, is non-zero, so `1.0.0` costs
/// one byte and `1.2.3` costs three.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Version {
    major: u8,
    minor: u8,
    patch: u8,
}

impl Version {
    /// Components are 7-bit; the high bit is reserved for continuation.
    ///
    /// # Panics
    /// Panics if any component exceeds 127.
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        assert!(
            major <= 0x7F && minor <= 0x7F && patch <= 0x7F,
            "version components are 7-bit"
        );
        Self { major, minor, patch }
    }

    #[inline]
    pub fn major(&self) -> u8 {
        self.major
    }

    #[inline]
    pub fn minor(&self) -> u8 {
        self.minor
    }

    #[inline]
    pub fn patch(&self) -> u8 {
        self.patch
    }

    /// Compatible iff the major components match; minor and patch changes
    /// are additive by convention.
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Lexicographic by priority: major, then minor, then patch. A higher
    /// component never outweighs a lower one of higher priority.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        (self.major, self.minor, self.patch) > (other.major, other.minor, other.patch)
    }

    pub fn is_older_than(&self, other: &Version) -> bool {
        (self.major, self.minor, self.patch) < (other.major, other.minor, other.patch)
    }
}

impl StorageValue for Version {
    fn write_to(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        let continue_after_major = self.minor != 0 || self.patch != 0;
        buf.write_u8(self.major | if continue_after_major { 0x80 } else { 0 })?;

        if continue_after_major {
            let continue_after_minor = self.patch != 0;
            buf.write_u8(self.minor | if continue_after_minor { 0x80 } else { 0 })?;

            if continue_after_minor {
                buf.write_u8(self.patch)?;
            }
        }
        Ok(())
    }

    fn read_from(buf: &mut Buffer) -> Result<Self, DecodeError> {
        let major = buf.read_u8()?;
        let mut minor = 0;
        let mut patch = 0;

        if major & 0x80 != 0 {
            minor = buf.read_u8()?;
            if minor & 0x80 != 0 {
                patch = buf.read_u8()? & 0x7F;
            }
        }

        Ok(Self {
            major: major & 0x7F,
            minor: minor & 0x7F,
            patch,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
