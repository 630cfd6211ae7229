//! Opaque encrypted entry names.
//!
//! Clients encrypt filenames before upload; the store compares and persists
//! them as raw byte strings and never interprets the contents.

use std::fmt;
use std::io::{Read, Write};

use crate::wire;

/// Maximum accepted name length in bytes.
pub const MAX_NAME_LEN: u32 = 16 * 1024;

/// An opaque encrypted name, as stored in directory entries.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectName(Vec<u8>);

impl ObjectName {
    /// Wraps raw encrypted name bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Synthetic name for objects re-homed into `lost+found`.
    ///
    /// Not valid ciphertext for any client key; restore tools show it
    /// verbatim.
    pub fn synthetic_lost_found(serial: u32) -> Self {
        Self(format!("lost{serial:08x}").into_bytes())
    }

    /// The raw name bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty name, which no valid entry carries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes as a length-prefixed blob.
    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        wire::write_blob(w, &self.0)
    }

    /// Reads a length-prefixed name.
    pub fn read_from(r: &mut impl Read) -> std::io::Result<Self> {
        Ok(Self(wire::read_blob(r, MAX_NAME_LEN)?))
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectName(")?;
        for b in self.0.iter().take(12) {
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > 12 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}
