//! A streaming byte assembler.
//!
//! [`Assembler`] is the reference emitter: it attaches to a holder by
//! borrowing it mutably, streams raw bytes into the active section, and
//! goes through the holder's label, link, and relocation operations for
//! everything symbolic. Architecture encoders are expected to layer their
//! instruction selection on top of exactly this surface.
//!
//! Every failing operation notifies the holder's installed error handler,
//! resets the pending inline comment, and returns the error; the assembler
//! stays usable, but the caller is expected to stop emitting.

use crate::buffer::CodeOffset;
use crate::const_pool::ConstPool;
use crate::emitter::{check_alignment, AlignMode, Emitter, EmitterKind};
use crate::holder::CodeHolder;
use crate::label::Label;
use crate::reloc::RelocKind;
use crate::result::{AsmResult, Error};
use target_lexicon::Architecture;

/// An emitter that writes bytes straight into a holder's sections.
///
/// Dropping the assembler vacates its holder slot.
pub struct Assembler<'a> {
    holder: &'a mut CodeHolder,
    section_id: u32,
    inline_comment: Option<String>,
}

impl<'a> Assembler<'a> {
    /// Attach to `holder`, which must be initialized and must not already
    /// have an assembler attached.
    pub fn new(holder: &'a mut CodeHolder) -> AsmResult<Self> {
        holder.attach(EmitterKind::Assembler)?;
        Ok(Self {
            holder,
            section_id: 0,
            inline_comment: None,
        })
    }

    /// The holder this assembler writes into.
    pub fn holder(&self) -> &CodeHolder {
        self.holder
    }

    /// The id of the section subsequent emissions go to.
    pub fn section_id(&self) -> u32 {
        self.section_id
    }

    /// Redirect subsequent emissions to another section.
    pub fn switch_section(&mut self, section_id: u32) -> AsmResult<()> {
        if let Err(e) = self.holder.section(section_id) {
            return Err(self.fail(e, "switch_section"));
        }
        self.section_id = section_id;
        Ok(())
    }

    /// Emit one byte.
    pub fn emit_u8(&mut self, value: u8) -> AsmResult<()> {
        self.emit_bytes(&[value])
    }

    /// Emit a little-endian 16-bit value.
    pub fn emit_u16(&mut self, value: u16) -> AsmResult<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Emit a little-endian 32-bit value.
    pub fn emit_u32(&mut self, value: u32) -> AsmResult<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Emit a little-endian 64-bit value.
    pub fn emit_u64(&mut self, value: u64) -> AsmResult<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Emit a `size`-byte reference to `label`, resolved as a displacement
    /// relative to the end of the field plus `rel`.
    ///
    /// If the label is already bound the displacement is written directly
    /// (and must fit); otherwise a zeroed field is emitted and a link is
    /// queued for bind time.
    pub fn emit_label_displacement(
        &mut self,
        label: Label,
        size: u8,
        rel: i32,
    ) -> AsmResult<()> {
        let comment = self.inline_comment.take();
        let result = self.emit_label_displacement_inner(label, size, rel, comment);
        if let Err(e) = result {
            return Err(self.fail(e, "emit_label_displacement"));
        }
        Ok(())
    }

    fn emit_label_displacement_inner(
        &mut self,
        label: Label,
        size: u8,
        rel: i32,
        comment: Option<String>,
    ) -> AsmResult<()> {
        if !self.holder.is_label_valid(label) {
            return Err(Error::InvalidLabel);
        }
        let offset = self.offset();
        self.section_buffer()?.emit_fill(0, size as usize)?;
        if let Some(comment) = comment {
            log::trace!("asm: [{}]+{offset:#x} {comment}", self.section_id);
        }
        if self.holder.is_label_bound(label) {
            // Backward reference: resolve in place.
            if self.holder.label_section_id(label)? != self.section_id {
                return Err(Error::InvalidRelocEntry);
            }
            let target = self.holder.label_offset(label)?;
            let disp = i64::from(target)
                - (i64::from(offset) + i64::from(size) + i64::from(rel));
            if !crate::reloc::fits_signed(disp, size) {
                return Err(Error::InvalidDisplacement);
            }
            self.section_buffer()?.patch_uint(offset, disp as u64, size)
        } else {
            self.holder
                .new_label_link(label, self.section_id, offset, rel, size, None)
        }
    }

    /// Current offset in the active section.
    pub fn offset(&self) -> CodeOffset {
        self.holder.sections()[self.section_id as usize].physical_size()
    }

    fn section_buffer(&mut self) -> AsmResult<&mut crate::buffer::CodeBuffer> {
        Ok(self.holder.section_mut(self.section_id)?.buffer_mut())
    }

    fn fail(&mut self, error: Error, op: &str) -> Error {
        self.inline_comment = None;
        self.holder.report_error(error, op)
    }
}

impl Emitter for Assembler<'_> {
    fn kind(&self) -> EmitterKind {
        EmitterKind::Assembler
    }

    fn offset(&self) -> CodeOffset {
        Assembler::offset(self)
    }

    fn set_offset(&mut self, offset: CodeOffset) -> AsmResult<()> {
        let result = self.section_buffer().and_then(|b| b.set_len(offset));
        if let Err(e) = result {
            return Err(self.fail(e, "set_offset"));
        }
        Ok(())
    }

    fn new_label(&mut self) -> AsmResult<Label> {
        match self.holder.new_label() {
            Ok(label) => Ok(label),
            Err(e) => Err(self.fail(e, "new_label")),
        }
    }

    fn bind(&mut self, label: Label) -> AsmResult<()> {
        let offset = Assembler::offset(self);
        let section_id = self.section_id;
        if let Err(e) = self.holder.bind_label(label, section_id, offset) {
            return Err(self.fail(e, "bind"));
        }
        Ok(())
    }

    fn emit_bytes(&mut self, bytes: &[u8]) -> AsmResult<()> {
        if let Some(comment) = self.inline_comment.take() {
            log::trace!(
                "asm: [{}]+{:#x} {comment}",
                self.section_id,
                Assembler::offset(self)
            );
        }
        let result = self.section_buffer().and_then(|b| b.emit_bytes(bytes));
        if let Err(e) = result {
            return Err(self.fail(e, "emit_bytes"));
        }
        Ok(())
    }

    fn embed(&mut self, data: &[u8]) -> AsmResult<()> {
        self.emit_bytes(data)
    }

    fn embed_label(&mut self, label: Label) -> AsmResult<()> {
        let result = self.embed_label_inner(label);
        if let Err(e) = result {
            return Err(self.fail(e, "embed_label"));
        }
        Ok(())
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> AsmResult<()> {
        let result = self.embed_const_pool_inner(label, pool);
        if let Err(e) = result {
            return Err(self.fail(e, "embed_const_pool"));
        }
        Ok(())
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> AsmResult<()> {
        let result = self.align_inner(mode, alignment);
        if let Err(e) = result {
            return Err(self.fail(e, "align"));
        }
        Ok(())
    }

    fn comment(&mut self, text: &str) {
        self.inline_comment = Some(text.to_owned());
    }
}

impl Assembler<'_> {
    fn embed_label_inner(&mut self, label: Label) -> AsmResult<()> {
        if !self.holder.is_label_valid(label) {
            return Err(Error::InvalidLabel);
        }
        let size = self.holder.info()?.gp_register_width();
        let offset = Assembler::offset(self);
        let section_id = self.section_id;
        let reloc_id = self.holder.new_reloc(RelocKind::RelToAbs, size)?;
        self.holder.reloc_mut(reloc_id)?.set_source(section_id, offset);
        self.section_buffer()?.emit_fill(0, size as usize)?;
        if self.holder.is_label_bound(label) {
            let target_section = self.holder.label_section_id(label)?;
            let target_offset = self.holder.label_offset(label)?;
            self.holder
                .reloc_mut(reloc_id)?
                .set_target_offset(target_section, u64::from(target_offset));
            self.holder
                .section_mut(section_id)?
                .buffer_mut()
                .patch_uint(offset, u64::from(target_offset), size)?;
        } else {
            self.holder
                .new_label_link(label, section_id, offset, 0, size, Some(reloc_id))?;
        }
        Ok(())
    }

    fn embed_const_pool_inner(&mut self, label: Label, pool: &ConstPool) -> AsmResult<()> {
        if pool.is_empty() {
            return Ok(());
        }
        self.align_inner(AlignMode::Data, pool.alignment())?;
        let offset = Assembler::offset(self);
        let section_id = self.section_id;
        self.holder.bind_label(label, section_id, offset)?;
        self.section_buffer()?.emit_bytes(pool.data())
    }

    fn align_inner(&mut self, mode: AlignMode, alignment: u32) -> AsmResult<()> {
        check_alignment(alignment)?;
        let fill = match mode {
            // A single-byte NOP exists on x86; elsewhere executable padding
            // is zeroes, which encoders may overwrite with proper NOPs.
            AlignMode::Code => match self.holder.info()?.arch() {
                Architecture::X86_64 | Architecture::X86_32(_) => 0x90,
                _ => 0,
            },
            AlignMode::Data | AlignMode::Zero => 0,
        };
        self.section_buffer()?.align(alignment, fill)
    }
}

impl Drop for Assembler<'_> {
    fn drop(&mut self) {
        let _ = self.holder.detach(EmitterKind::Assembler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::ErrorHandler;
    use crate::target::CodeInfo;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn holder() -> CodeHolder {
        CodeHolder::with_info(CodeInfo::new(Architecture::X86_64).unwrap())
    }

    #[test]
    fn slot_is_held_while_attached() {
        let mut h = holder();
        {
            let asm = Assembler::new(&mut h).unwrap();
            assert_eq!(asm.holder().attached_kinds(), &[EmitterKind::Assembler]);
        }
        // Dropping the assembler vacated the slot.
        assert!(h.attached_kinds().is_empty());
        let _asm = Assembler::new(&mut h).unwrap();
    }

    #[test]
    fn forward_call_is_patched_at_bind() {
        let mut h = holder();
        let mut asm = Assembler::new(&mut h).unwrap();
        let target = asm.new_label().unwrap();
        asm.emit_u8(0xE8).unwrap();
        asm.emit_label_displacement(target, 4, 0).unwrap();
        assert_eq!(asm.holder().unresolved_label_count(), 1);
        asm.bind(target).unwrap();
        assert_eq!(asm.holder().unresolved_label_count(), 0);
        drop(asm);
        let data = h.section(0).unwrap().buffer().data();
        assert_eq!(data, &[0xE8, 0, 0, 0, 0]);
    }

    #[test]
    fn backward_reference_resolves_immediately() {
        let mut h = holder();
        let mut asm = Assembler::new(&mut h).unwrap();
        let top = asm.new_label().unwrap();
        asm.bind(top).unwrap();
        asm.emit_bytes(&[0x90, 0x90]).unwrap();
        asm.emit_u8(0xE9).unwrap();
        asm.emit_label_displacement(top, 4, 0).unwrap();
        assert_eq!(asm.holder().unresolved_label_count(), 0);
        drop(asm);
        let data = h.section(0).unwrap().buffer().data();
        assert_eq!(&data[3..7], &(-7i32).to_le_bytes());
    }

    #[test]
    fn offset_rewind_round_trips() {
        let mut h = holder();
        let mut asm = Assembler::new(&mut h).unwrap();
        asm.emit_u32(0xAAAA_AAAA).unwrap();
        let mark = Emitter::offset(&asm);
        asm.emit_u32(0xBBBB_BBBB).unwrap();
        asm.set_offset(mark).unwrap();
        assert_eq!(Emitter::offset(&asm), mark);
        asm.emit_u32(0xCCCC_CCCC).unwrap();
        drop(asm);
        let data = h.section(0).unwrap().buffer().data();
        assert_eq!(&data[4..8], &0xCCCC_CCCCu32.to_le_bytes());
    }

    #[test]
    fn embed_label_creates_an_address_slot() {
        let mut h = holder();
        let mut asm = Assembler::new(&mut h).unwrap();
        let data_label = asm.new_label().unwrap();
        asm.embed_label(data_label).unwrap();
        asm.emit_u8(0xC3).unwrap();
        asm.bind(data_label).unwrap();
        drop(asm);
        assert_eq!(h.relocs().len(), 1);
        let reloc = h.reloc(0).unwrap();
        assert_eq!(reloc.kind(), RelocKind::RelToAbs);
        assert_eq!(reloc.size(), 8);
        assert_eq!(reloc.target_section_id(), 0);
        assert_eq!(reloc.payload(), 9);
        // After relocation the slot holds the absolute address.
        let mut dst = vec![0u8; h.code_size().unwrap()];
        h.relocate(&mut dst, 0x7700_0000).unwrap();
        assert_eq!(&dst[..8], &0x7700_0009u64.to_le_bytes());
    }

    #[test]
    fn const_pool_is_bound_and_emitted() {
        let mut h = holder();
        let mut asm = Assembler::new(&mut h).unwrap();
        let mut pool = ConstPool::new();
        pool.add(&1.5f64.to_le_bytes()).unwrap();
        let pool_label = asm.new_label().unwrap();
        asm.emit_u8(0xC3).unwrap();
        asm.embed_const_pool(pool_label, &pool).unwrap();
        assert!(asm.holder().is_label_bound(pool_label));
        let offset = asm.holder().label_offset(pool_label).unwrap();
        assert_eq!(offset, 8);
        drop(asm);
        let data = h.section(0).unwrap().buffer().data();
        assert_eq!(&data[8..16], &1.5f64.to_le_bytes());
    }

    #[test]
    fn code_align_pads_with_nops_on_x86() {
        let mut h = holder();
        let mut asm = Assembler::new(&mut h).unwrap();
        asm.emit_u8(0xC3).unwrap();
        asm.align(AlignMode::Code, 8).unwrap();
        asm.align(AlignMode::Code, 128).unwrap_err();
        drop(asm);
        let data = h.section(0).unwrap().buffer().data();
        assert_eq!(data.len(), 8);
        assert!(data[1..].iter().all(|&b| b == 0x90));
    }

    #[test]
    fn errors_reach_the_installed_handler() {
        struct Counter(Arc<AtomicU32>);
        impl ErrorHandler for Counter {
            fn handle_error(&mut self, error: Error, _message: &str) {
                assert_eq!(error, Error::InvalidLabel);
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        let seen = Arc::new(AtomicU32::new(0));
        let mut h = holder();
        h.set_error_handler(Box::new(Counter(Arc::clone(&seen))));
        let mut asm = Assembler::new(&mut h).unwrap();
        asm.comment("this comment is cleared by the failure");
        assert_eq!(
            asm.emit_label_displacement(Label::INVALID, 4, 0).unwrap_err(),
            Error::InvalidLabel
        );
        assert_eq!(seen.load(Ordering::Relaxed), 1);
        // The emitter remains usable after an error.
        asm.emit_u8(0x90).unwrap();
    }
}
