//! The contract between a code holder and its emitters.
//!
//! An emitter is anything that streams bytes into a holder: the raw byte
//! [`Assembler`](crate::assembler::Assembler) shipped here, or an external
//! architecture encoder or IR builder. Emitters interact with the holder
//! exclusively through its public operations — labels, links, relocations,
//! buffers — and never reach into holder state directly.
//!
//! Attachment is a mutable borrow of the holder, so the borrow checker
//! guarantees an attached emitter cannot outlive or race a holder reset.
//! The holder still tracks which *kinds* of emitter are attached: a given
//! kind occupies at most one slot, and re-attaching it fails with
//! `SlotOccupied`.

use crate::buffer::CodeOffset;
use crate::const_pool::ConstPool;
use crate::label::Label;
use crate::result::{AsmResult, Error};

/// The kinds of emitter a holder distinguishes for slot occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmitterKind {
    /// A streaming byte assembler.
    Assembler,
    /// An intermediate-representation builder that serializes later.
    Builder,
}

/// How [`Emitter::align`] pads the gap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlignMode {
    /// Padding will be executed if reached; filled with NOPs where the
    /// target has a single-byte one, zeroes otherwise.
    Code,
    /// Padding is data; filled with zeroes.
    Data,
    /// Padding must read as zeroes.
    Zero,
}

/// The capability set every emitter exposes.
///
/// Every fallible operation routes its error through the holder's installed
/// [`ErrorHandler`](crate::holder::ErrorHandler) before returning it, and
/// resets any transient per-instruction state (such as a pending inline
/// comment) so the next emission starts clean.
pub trait Emitter {
    /// Which slot this emitter occupies while attached.
    fn kind(&self) -> EmitterKind;

    /// Current emission offset in the active section.
    fn offset(&self) -> CodeOffset;

    /// Move the emission cursor within already-emitted bytes.
    fn set_offset(&mut self, offset: CodeOffset) -> AsmResult<()>;

    /// Create a new anonymous label owned by the holder.
    fn new_label(&mut self) -> AsmResult<Label>;

    /// Bind `label` to the current section and offset, resolving its
    /// pending links.
    fn bind(&mut self, label: Label) -> AsmResult<()>;

    /// Append raw instruction bytes.
    fn emit_bytes(&mut self, bytes: &[u8]) -> AsmResult<()>;

    /// Append raw data bytes.
    fn embed(&mut self, data: &[u8]) -> AsmResult<()>;

    /// Append an address-sized slot that will hold the absolute address of
    /// `label` after relocation.
    fn embed_label(&mut self, label: Label) -> AsmResult<()>;

    /// Bind `label` to the start of `pool`'s contents and append them,
    /// aligned as the pool requires.
    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> AsmResult<()>;

    /// Pad the active section to an `alignment`-byte boundary.
    fn align(&mut self, mode: AlignMode, alignment: u32) -> AsmResult<()>;

    /// Attach a comment to the next emission; consumed (and logged) by it.
    fn comment(&mut self, text: &str);
}

/// Validate an alignment argument for [`Emitter::align`]: a power of two no
/// larger than the supported maximum (64).
pub(crate) fn check_alignment(alignment: u32) -> AsmResult<()> {
    if alignment == 0 || !alignment.is_power_of_two() || alignment > 64 {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_domain() {
        assert!(check_alignment(1).is_ok());
        assert!(check_alignment(64).is_ok());
        assert_eq!(check_alignment(0).unwrap_err(), Error::InvalidArgument);
        assert_eq!(check_alignment(3).unwrap_err(), Error::InvalidArgument);
        assert_eq!(check_alignment(128).unwrap_err(), Error::InvalidArgument);
    }
}
