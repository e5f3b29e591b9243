//! Sections of a code image.
//!
//! A section is a contiguous byte stream with flags, an alignment
//! requirement, and an optional virtual size for zero-initialized regions.
//! Sections are owned by the holder, identified by a stable 32-bit id
//! assigned in insertion order, and their ids are never reused. Section 0 is
//! always the default `.text` section.

use crate::buffer::{CodeBuffer, CodeOffset};
use crate::strings::SmallString;
use bitflags::bitflags;

/// Sentinel section id meaning "no section".
pub const INVALID_SECTION_ID: u32 = u32::MAX;

/// Longest accepted section name, in bytes.
pub const MAX_SECTION_NAME_LEN: usize = 35;

bitflags! {
    /// Properties of a section. The bit values are wire-stable.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SectionFlags: u32 {
        /// The section contains executable code.
        const EXEC = 0x1;
        /// The section contains read-only data.
        const CONST = 0x2;
        /// The section is zero-initialized; it may carry a virtual size
        /// larger than its physical contents.
        const ZERO = 0x4;
        /// The section carries information only and is not part of the
        /// loaded image.
        const INFO = 0x8;
        /// The section was created by the holder itself.
        const IMPLICIT = 0x8000_0000;
    }
}

/// A named, flagged, aligned byte stream inside a holder.
#[derive(Debug)]
pub struct Section {
    id: u32,
    name: SmallString,
    flags: SectionFlags,
    alignment: u32,
    virtual_size: CodeOffset,
    buffer: CodeBuffer,
}

impl Section {
    pub(crate) fn new(id: u32, name: &str, flags: SectionFlags, alignment: u32) -> Self {
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(name.len() <= MAX_SECTION_NAME_LEN);
        Self {
            id,
            name: SmallString::from_str(name),
            flags,
            alignment,
            virtual_size: 0,
            buffer: CodeBuffer::new(),
        }
    }

    /// The stable id of this section.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The section name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// The section flags.
    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    /// Alignment requirement in bytes; always a power of two.
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Raise the alignment requirement to at least `alignment`.
    pub fn set_alignment(&mut self, alignment: u32) {
        debug_assert!(alignment.is_power_of_two());
        if alignment > self.alignment {
            self.alignment = alignment;
        }
    }

    /// Size of the zero-initialized region, when it exceeds the physical
    /// contents.
    pub fn virtual_size(&self) -> CodeOffset {
        self.virtual_size
    }

    /// Declare the zero-initialized size of the section.
    pub fn set_virtual_size(&mut self, size: CodeOffset) {
        self.virtual_size = size;
    }

    /// Physical size: the number of bytes actually emitted.
    pub fn physical_size(&self) -> CodeOffset {
        self.buffer.len() as CodeOffset
    }

    /// The larger of the physical and virtual sizes; what layout reserves
    /// for this section.
    pub fn effective_size(&self) -> CodeOffset {
        self.physical_size().max(self.virtual_size)
    }

    /// The section's code buffer.
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    /// The section's code buffer, mutably.
    pub fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_wire_stable() {
        assert_eq!(SectionFlags::EXEC.bits(), 0x1);
        assert_eq!(SectionFlags::CONST.bits(), 0x2);
        assert_eq!(SectionFlags::ZERO.bits(), 0x4);
        assert_eq!(SectionFlags::INFO.bits(), 0x8);
        assert_eq!(SectionFlags::IMPLICIT.bits(), 0x8000_0000);
    }

    #[test]
    fn effective_size_honours_virtual() {
        let mut s = Section::new(1, ".bss", SectionFlags::ZERO, 8);
        assert_eq!(s.effective_size(), 0);
        s.set_virtual_size(128);
        assert_eq!(s.effective_size(), 128);
        s.buffer_mut().emit_fill(0xAA, 200).unwrap();
        assert_eq!(s.effective_size(), 200);
    }

    #[test]
    fn alignment_only_raises() {
        let mut s = Section::new(0, ".text", SectionFlags::EXEC, 1);
        s.set_alignment(16);
        assert_eq!(s.alignment(), 16);
        s.set_alignment(4);
        assert_eq!(s.alignment(), 16);
    }
}
