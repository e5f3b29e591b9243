//! Result and error types representing the outcome of every fallible
//! operation in this crate.
//!
//! The error space is a single flat enumeration with stable `u32` codes so
//! that embedders can forward errors across FFI or serialization boundaries
//! without translation. No operation in this crate panics on a recoverable
//! condition; `debug_assert!` is reserved for programmer errors.

use core::fmt;

/// An error produced while emitting, holding, relocating, or installing
/// machine code.
///
/// The discriminants are wire-stable; `0` is reserved for "no error" and is
/// represented by `Ok(..)` on the Rust side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Error {
    /// A heap allocation failed.
    NoHeapMemory = 1,
    /// The operating system refused to map or commit virtual memory.
    NoVirtualMemory = 2,
    /// An argument was out of the accepted domain.
    InvalidArgument = 3,
    /// The operation is not valid in the current state.
    InvalidState = 4,
    /// The requested architecture is unknown or not supported.
    InvalidArch = 5,
    /// The code holder has not been initialized.
    NotInitialized = 6,
    /// The code holder has already been initialized.
    AlreadyInitialized = 7,
    /// The requested functionality was compiled out.
    FeatureNotEnabled = 8,
    /// An emitter of this kind is already attached.
    SlotOccupied = 9,
    /// There is no code to relocate or install.
    NoCodeGenerated = 10,
    /// The code image exceeds a hard size limit or a fixed-size buffer.
    CodeTooLarge = 11,
    /// A label id does not refer to a live label.
    InvalidLabel = 12,
    /// No more label ids can be allocated.
    LabelIndexOverflow = 13,
    /// The label has already been bound to a section and offset.
    LabelAlreadyBound = 14,
    /// A named label with the same name and parent already exists.
    LabelAlreadyDefined = 15,
    /// The label name exceeds the maximum length.
    LabelNameTooLong = 16,
    /// The label name is empty, malformed, or used with the wrong label type.
    InvalidLabelName = 17,
    /// The parent label id does not refer to a live label.
    InvalidParentLabel = 18,
    /// Only local labels may carry a parent label.
    NonLocalLabelCantHaveParent = 19,
    /// No more relocation ids can be allocated.
    RelocIndexOverflow = 20,
    /// A relocation entry is malformed or cannot be applied.
    InvalidRelocEntry = 21,
    /// A displacement does not fit the width the instruction encodes.
    InvalidDisplacement = 22,
    /// An address is not managed by this allocator or is misaligned.
    InvalidAddress = 23,
}

impl Error {
    /// The stable numeric code of this error. `0` means success and is never
    /// produced by this function.
    pub fn code(self) -> u32 {
        self as u32
    }
}

// Implementing Error and Display by hand instead of using thiserror keeps the
// dependency footprint of the core down.
impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            Self::NoHeapMemory => "out of heap memory",
            Self::NoVirtualMemory => "out of virtual memory",
            Self::InvalidArgument => "invalid argument",
            Self::InvalidState => "invalid state",
            Self::InvalidArch => "invalid or unsupported architecture",
            Self::NotInitialized => "code holder is not initialized",
            Self::AlreadyInitialized => "code holder is already initialized",
            Self::FeatureNotEnabled => "feature not enabled",
            Self::SlotOccupied => "emitter slot is already occupied",
            Self::NoCodeGenerated => "no code generated",
            Self::CodeTooLarge => "code too large",
            Self::InvalidLabel => "invalid label",
            Self::LabelIndexOverflow => "label index overflow",
            Self::LabelAlreadyBound => "label is already bound",
            Self::LabelAlreadyDefined => "label is already defined",
            Self::LabelNameTooLong => "label name too long",
            Self::InvalidLabelName => "invalid label name",
            Self::InvalidParentLabel => "invalid parent label",
            Self::NonLocalLabelCantHaveParent => "non-local label cannot have a parent",
            Self::RelocIndexOverflow => "relocation index overflow",
            Self::InvalidRelocEntry => "invalid relocation entry",
            Self::InvalidDisplacement => "invalid displacement",
            Self::InvalidAddress => "invalid address",
        };
        f.write_str(s)
    }
}

/// A convenient alias for a `Result` whose error is [`Error`].
pub type AsmResult<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_wire_stable() {
        assert_eq!(Error::NoHeapMemory.code(), 1);
        assert_eq!(Error::SlotOccupied.code(), 9);
        assert_eq!(Error::CodeTooLarge.code(), 11);
        assert_eq!(Error::NonLocalLabelCantHaveParent.code(), 19);
        assert_eq!(Error::InvalidAddress.code(), 23);
    }

    #[test]
    fn display_is_lowercase_prose() {
        assert_eq!(Error::InvalidDisplacement.to_string(), "invalid displacement");
    }
}
