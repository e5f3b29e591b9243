//! The relocation engine.
//!
//! Turns a fully emitted holder into a byte-exact image at a chosen base
//! address in three ordered phases: *layout* assigns every section its
//! final offset, *copy* moves the section bytes (zero-filling virtual
//! tails), and *patch* rewrites every relocation slot, synthesizing
//! trampolines for relative references that cannot reach their target.
//!
//! The engine is a pure function of the holder state and the base address:
//! it mutates only the destination buffer and its own zone-allocated
//! scratch, so concurrent invocations on one holder are safe. Patches are
//! applied in id order but commute, each writing a disjoint slot.

use crate::holder::{align_up, CodeHolder};
use crate::reloc::{fits_signed, fits_unsigned, RelocKind};
use crate::section::INVALID_SECTION_ID;
use crate::trampoline::{self, POOL_ALIGNMENT};
use crate::result::{AsmResult, Error};
use crate::zone::Zone;

pub(crate) fn relocate(holder: &CodeHolder, dst: &mut [u8], base_address: u64) -> AsmResult<usize> {
    let info = holder.info()?;
    if holder.unresolved_label_count() != 0 {
        return Err(Error::InvalidState);
    }
    let code_size = holder.code_size()?;
    if code_size == 0 {
        return Err(Error::NoCodeGenerated);
    }
    if dst.len() < code_size {
        return Err(Error::CodeTooLarge);
    }

    let zone = Zone::with_capacity(holder.section_count() * core::mem::size_of::<usize>());
    let mut offsets = bumpalo::collections::Vec::new_in(zone.bump());

    // Phase 1: layout. Sections take their final offsets in id order; the
    // trampoline pool goes after the last section.
    let mut cursor = 0usize;
    for section in holder.sections() {
        cursor = align_up(cursor, section.alignment() as usize);
        offsets.push(cursor);
        cursor += section.effective_size() as usize;
    }
    let pool_start = align_up(cursor, POOL_ALIGNMENT);
    log::debug!(
        "relocate: {} sections, {} relocations, base {base_address:#x}",
        holder.section_count(),
        holder.relocs().len()
    );

    // Phase 2: copy. Zero first so alignment padding and virtual tails
    // read as zeroes no matter what the caller handed us.
    dst[..code_size].fill(0);
    for (section, &offset) in holder.sections().iter().zip(offsets.iter()) {
        let data = section.buffer().data();
        dst[offset..offset + data.len()].copy_from_slice(data);
    }

    // Phase 3: patch.
    let mut pool_cursor = pool_start;
    for entry in holder.relocs() {
        if entry.kind() == RelocKind::None {
            continue;
        }
        let size = entry.size();
        let source = entry.source_section_id() as usize;
        if source >= holder.section_count() {
            return Err(Error::InvalidRelocEntry);
        }
        let source_offset = offsets[source] + entry.source_offset() as usize;
        // The slot must lie inside the bytes copied for its section.
        let physical_end =
            offsets[source] + holder.sections()[source].physical_size() as usize;
        if source_offset + size as usize > physical_end {
            return Err(Error::InvalidRelocEntry);
        }

        // Resolve the target to an absolute address.
        let target = match entry.target_section_id() {
            INVALID_SECTION_ID => entry.payload(),
            id if (id as usize) < holder.section_count() => base_address
                .wrapping_add(offsets[id as usize] as u64)
                .wrapping_add(entry.payload()),
            _ => return Err(Error::InvalidRelocEntry),
        };

        let value = match entry.kind() {
            RelocKind::None => unreachable!(),
            RelocKind::AbsToAbs => entry.payload(),
            RelocKind::RelToAbs => {
                if !fits_unsigned(target, size) {
                    return Err(Error::InvalidRelocEntry);
                }
                target
            }
            RelocKind::AbsToRel | RelocKind::Trampoline => {
                let from = base_address
                    .wrapping_add(source_offset as u64)
                    .wrapping_add(u64::from(size));
                let disp = target.wrapping_sub(from) as i64;
                if fits_signed(disp, size) {
                    disp as u64
                } else if entry.kind() == RelocKind::Trampoline {
                    // Out of range: route through a thunk in the pool.
                    let emitter = trampoline::for_arch(info.arch())
                        .ok_or(Error::InvalidRelocEntry)?;
                    let slot = emitter.slot_size() as usize;
                    debug_assert!(pool_cursor + slot <= code_size);
                    emitter.emit(&mut dst[pool_cursor..pool_cursor + slot], target);
                    let disp = (base_address.wrapping_add(pool_cursor as u64))
                        .wrapping_sub(from) as i64;
                    if !fits_signed(disp, size) {
                        return Err(Error::InvalidRelocEntry);
                    }
                    log::trace!(
                        "relocate: trampoline at +{pool_cursor:#x} for reloc #{} -> {target:#x}",
                        entry.id()
                    );
                    pool_cursor += slot;
                    disp as u64
                } else {
                    return Err(Error::InvalidRelocEntry);
                }
            }
        };
        write_uint(&mut dst[source_offset..], value, size);
    }

    let used = if pool_cursor != pool_start {
        pool_cursor
    } else {
        cursor
    };
    log::debug!(
        "relocate: image uses {used:#x} of {code_size:#x} bytes ({} trampoline bytes)",
        pool_cursor - pool_start
    );
    Ok(used)
}

fn write_uint(dst: &mut [u8], value: u64, size: u8) {
    dst[..size as usize].copy_from_slice(&value.to_le_bytes()[..size as usize]);
}

#[cfg(test)]
mod tests {
    use crate::holder::CodeHolder;
    use crate::reloc::RelocKind;
    use crate::section::SectionFlags;
    use crate::target::CodeInfo;
    use crate::result::Error;
    use target_lexicon::Architecture;

    fn holder() -> CodeHolder {
        CodeHolder::with_info(CodeInfo::new(Architecture::X86_64).unwrap())
    }

    #[test]
    fn cross_section_absolute_relocation() {
        let mut h = holder();
        h.section_mut(0).unwrap().buffer_mut().emit_u64(0).unwrap();
        let data = h.add_section(".data", SectionFlags::CONST, 64).unwrap();
        h.section_mut(data)
            .unwrap()
            .buffer_mut()
            .emit_fill(0xAB, 0x40)
            .unwrap();
        let id = h.new_reloc(RelocKind::RelToAbs, 8).unwrap();
        {
            let r = h.reloc_mut(id).unwrap();
            r.set_source(0, 0);
            r.set_target_offset(data, 0x20);
        }
        // Section 0 holds 8 bytes; .data is aligned to 64, so it lands at
        // image offset 0x40.
        let mut dst = vec![0u8; h.code_size().unwrap()];
        let used = h.relocate(&mut dst, 0x1000_0000).unwrap();
        assert_eq!(used, 0x40 + 0x40);
        assert_eq!(&dst[..8], &0x1000_0060u64.to_le_bytes());
    }

    #[test]
    fn in_range_trampoline_relocation_stays_direct() {
        let mut h = holder();
        h.section_mut(0).unwrap().buffer_mut().emit_u32(0).unwrap();
        let id = h.new_reloc(RelocKind::Trampoline, 4).unwrap();
        {
            let r = h.reloc_mut(id).unwrap();
            r.set_source(0, 0);
            r.set_target_address(0x1000_1000);
        }
        // Reserved pool space exists but goes unused.
        let size = h.code_size().unwrap();
        assert_eq!(size, 8 + 16);
        let mut dst = vec![0u8; size];
        let used = h.relocate(&mut dst, 0x1000_0000).unwrap();
        assert_eq!(used, 4);
        // disp = 0x1000_1000 - (0x1000_0000 + 0 + 4)
        assert_eq!(&dst[..4], &0xFFCu32.to_le_bytes());
    }

    #[test]
    fn out_of_range_trampoline_is_synthesized() {
        let mut h = holder();
        h.section_mut(0).unwrap().buffer_mut().emit_u32(0).unwrap();
        // Past the +2 GiB reach of a 32-bit displacement.
        let target = 0x1000_0000u64 + 0x8000_1000;
        let id = h.new_reloc(RelocKind::Trampoline, 4).unwrap();
        {
            let r = h.reloc_mut(id).unwrap();
            r.set_source(0, 0);
            r.set_target_address(target);
        }
        let size = h.code_size().unwrap();
        let mut dst = vec![0u8; size];
        let used = h.relocate(&mut dst, 0x1000_0000).unwrap();
        assert_eq!(used, size);
        // The slot now reaches the trampoline at image offset 8.
        let disp = i32::from_le_bytes(dst[..4].try_into().unwrap());
        assert_eq!(disp, 8 - 4);
        // The trampoline jumps through an inline literal holding the true
        // target.
        assert_eq!(&dst[8..14], &[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&dst[16..24], &target.to_le_bytes());
    }

    #[test]
    fn out_of_range_without_trampoline_is_an_error() {
        let mut h = holder();
        h.section_mut(0).unwrap().buffer_mut().emit_u32(0).unwrap();
        let id = h.new_reloc(RelocKind::AbsToRel, 4).unwrap();
        {
            let r = h.reloc_mut(id).unwrap();
            r.set_source(0, 0);
            r.set_target_address(0x1000_0000u64 + 0x8000_1000);
        }
        let mut dst = vec![0u8; h.code_size().unwrap()];
        assert_eq!(
            h.relocate(&mut dst, 0x1000_0000).unwrap_err(),
            Error::InvalidRelocEntry
        );
    }

    #[test]
    fn abs_to_abs_copies_the_payload() {
        let mut h = holder();
        h.section_mut(0).unwrap().buffer_mut().emit_u16(0).unwrap();
        let id = h.new_reloc(RelocKind::AbsToAbs, 2).unwrap();
        {
            let r = h.reloc_mut(id).unwrap();
            r.set_source(0, 0);
            r.set_target_address(0xBEEF);
        }
        let mut dst = vec![0u8; h.code_size().unwrap()];
        h.relocate(&mut dst, 0).unwrap();
        assert_eq!(&dst[..2], &0xBEEFu16.to_le_bytes());
    }

    #[test]
    fn unresolved_labels_block_relocation() {
        let mut h = holder();
        let label = h.new_label().unwrap();
        h.section_mut(0).unwrap().buffer_mut().emit_u32(0).unwrap();
        h.new_label_link(label, 0, 0, 0, 4, None).unwrap();
        let mut dst = vec![0u8; 64];
        assert_eq!(h.relocate(&mut dst, 0).unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn undersized_destination_is_rejected() {
        let mut h = holder();
        h.section_mut(0).unwrap().buffer_mut().emit_u64(0).unwrap();
        let mut dst = vec![0u8; 4];
        assert_eq!(h.relocate(&mut dst, 0).unwrap_err(), Error::CodeTooLarge);
    }

    #[test]
    fn empty_holder_has_no_code() {
        let h = holder();
        let mut dst = vec![0u8; 16];
        assert_eq!(h.relocate(&mut dst, 0).unwrap_err(), Error::NoCodeGenerated);
    }

    #[test]
    fn relocation_is_idempotent() {
        let mut h = holder();
        h.section_mut(0)
            .unwrap()
            .buffer_mut()
            .emit_bytes(&[0x48, 0xC7, 0xC0, 0x2A, 0, 0, 0, 0xC3])
            .unwrap();
        let id = h.new_reloc(RelocKind::AbsToAbs, 4).unwrap();
        {
            let r = h.reloc_mut(id).unwrap();
            r.set_source(0, 3);
            r.set_target_address(7);
        }
        let size = h.code_size().unwrap();
        let mut a = vec![0u8; size];
        let mut b = vec![0xFFu8; size];
        let ua = h.relocate(&mut a, 0x4000).unwrap();
        let ub = h.relocate(&mut b, 0x4000).unwrap();
        assert_eq!(ua, ub);
        assert_eq!(a, b);
    }

    #[test]
    fn virtual_tail_is_zero_filled() {
        let mut h = holder();
        h.section_mut(0).unwrap().buffer_mut().emit_u8(0xC3).unwrap();
        let bss = h.add_section(".bss", SectionFlags::ZERO, 8).unwrap();
        {
            let s = h.section_mut(bss).unwrap();
            s.buffer_mut().emit_bytes(&[0x11, 0x22]).unwrap();
            s.set_virtual_size(32);
        }
        let size = h.code_size().unwrap();
        assert_eq!(size, 8 + 32);
        let mut dst = vec![0xEEu8; size];
        let used = h.relocate(&mut dst, 0).unwrap();
        assert_eq!(used, size);
        assert_eq!(&dst[8..10], &[0x11, 0x22]);
        assert!(dst[10..40].iter().all(|&b| b == 0));
    }
}
