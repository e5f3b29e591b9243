//! Small-string storage for section and label names.
//!
//! Names in a code image are overwhelmingly short, so they are stored inline
//! up to a fixed embedded capacity and only spill to a heap allocation past
//! that. Section names never spill (they are capped below the embedded
//! capacity); label names may.

use core::fmt;
use smallvec::SmallVec;

/// Bytes stored inline before a name spills.
pub(crate) const INLINE_CAPACITY: usize = 36;

/// A short, immutable UTF-8 string with inline storage for the common case.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct SmallString {
    bytes: SmallVec<[u8; INLINE_CAPACITY]>,
}

impl SmallString {
    /// Create an empty string.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a string holding a copy of `s`.
    pub fn from_str(s: &str) -> Self {
        Self {
            bytes: SmallVec::from_slice(s.as_bytes()),
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the string is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The string contents.
    pub fn as_str(&self) -> &str {
        // Construction goes through `&str` only, so the bytes stay UTF-8.
        unsafe { core::str::from_utf8_unchecked(&self.bytes) }
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the contents live inline rather than on the heap.
    #[cfg(test)]
    pub(crate) fn is_inline(&self) -> bool {
        !self.bytes.spilled()
    }
}

impl From<&str> for SmallString {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl PartialEq<str> for SmallString {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl fmt::Display for SmallString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SmallString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}
