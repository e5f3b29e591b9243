//! Architecture-specific trampoline thunks.
//!
//! When a relative control transfer cannot reach its target, the relocation
//! engine synthesizes a trampoline nearby: a short sequence that jumps
//! indirectly through an inline 64-bit literal holding the true target. The
//! per-architecture encoding lives behind [`TrampolineEmitter`]; the engine
//! only needs the slot size and an emit call.

use target_lexicon::Architecture;

/// Trampoline pools are aligned so every inline literal is 8-byte aligned.
pub(crate) const POOL_ALIGNMENT: usize = 8;

/// Encoder for one architecture's trampoline form.
pub(crate) trait TrampolineEmitter {
    /// Bytes one trampoline occupies; a multiple of [`POOL_ALIGNMENT`].
    fn slot_size(&self) -> u32;

    /// Write a trampoline jumping to the absolute `target` into `dst`,
    /// which holds exactly `slot_size()` bytes.
    fn emit(&self, dst: &mut [u8], target: u64);
}

/// x86-64: `jmp qword [rip+2]`, two bytes of padding, then the 64-bit
/// target literal.
struct X64Trampoline;

impl TrampolineEmitter for X64Trampoline {
    fn slot_size(&self) -> u32 {
        16
    }

    fn emit(&self, dst: &mut [u8], target: u64) {
        debug_assert_eq!(dst.len(), 16);
        // FF /4 with a RIP-relative displacement of +2 skips the padding
        // and lands on the literal.
        dst[..8].copy_from_slice(&[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0xCC, 0xCC]);
        dst[8..].copy_from_slice(&target.to_le_bytes());
    }
}

/// aarch64: `ldr x16, #8; br x16`, then the 64-bit target literal.
struct Aarch64Trampoline;

impl TrampolineEmitter for Aarch64Trampoline {
    fn slot_size(&self) -> u32 {
        16
    }

    fn emit(&self, dst: &mut [u8], target: u64) {
        debug_assert_eq!(dst.len(), 16);
        dst[..4].copy_from_slice(&0x5800_0050u32.to_le_bytes()); // ldr x16, pc+8
        dst[4..8].copy_from_slice(&0xD61F_0200u32.to_le_bytes()); // br x16
        dst[8..].copy_from_slice(&target.to_le_bytes());
    }
}

/// The trampoline encoder for `arch`, if the crate carries one.
pub(crate) fn for_arch(arch: Architecture) -> Option<&'static dyn TrampolineEmitter> {
    match arch {
        Architecture::X86_64 => Some(&X64Trampoline),
        Architecture::Aarch64(_) => Some(&Aarch64Trampoline),
        _ => None,
    }
}

/// Slot size for `arch`, if trampolines are supported there.
pub(crate) fn slot_size(arch: Architecture) -> Option<u32> {
    for_arch(arch).map(|t| t.slot_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x64_trampoline_layout() {
        let t = for_arch(Architecture::X86_64).unwrap();
        let mut slot = [0u8; 16];
        t.emit(&mut slot, 0x1122_3344_5566_7788);
        // Indirect jump through the literal that follows the padding.
        assert_eq!(&slot[..6], &[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&slot[8..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn aarch64_trampoline_layout() {
        let t = for_arch(Architecture::Aarch64(
            target_lexicon::Aarch64Architecture::Aarch64,
        ))
        .unwrap();
        let mut slot = [0u8; 16];
        t.emit(&mut slot, 0xDEAD_BEEF);
        assert_eq!(&slot[..4], &0x5800_0050u32.to_le_bytes());
        assert_eq!(&slot[4..8], &0xD61F_0200u32.to_le_bytes());
        assert_eq!(&slot[8..], &0xDEAD_BEEFu64.to_le_bytes());
    }

    #[test]
    fn unsupported_arch_has_no_trampoline() {
        assert!(for_arch(Architecture::Sparc).is_none());
    }
}
