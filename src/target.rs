//! Target description.
//!
//! A [`CodeInfo`] pins down everything the holder and the relocation engine
//! need to know about the machine the code is for: the architecture, the
//! width of a general-purpose register, the natural stack alignment, the
//! default calling convention, and optionally the absolute address the image
//! will execute at. It is immutable once constructed and compared
//! structurally.

use crate::result::{AsmResult, Error};
use target_lexicon::{Aarch64Architecture, Architecture, PointerWidth};

/// Sentinel meaning "the image has no fixed base address"; such an image is
/// relocated against whatever base the caller supplies.
pub const NO_BASE_ADDRESS: u64 = u64::MAX;

/// A calling-convention identifier.
///
/// Only the identifiers themselves live in the core; argument assignment is
/// the business of the architecture encoders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// System V AMD64 ABI (unix on x86-64).
    SystemV,
    /// Microsoft x64 convention.
    WindowsFastcall,
    /// AAPCS64 (aarch64).
    Aarch64Aapcs,
    /// CDECL on 32-bit x86.
    Cdecl,
}

impl CallConv {
    /// The default convention for `arch` on the host operating system.
    pub fn default_for(arch: Architecture) -> CallConv {
        match arch {
            Architecture::X86_64 => {
                if cfg!(windows) {
                    CallConv::WindowsFastcall
                } else {
                    CallConv::SystemV
                }
            }
            Architecture::Aarch64(_) => CallConv::Aarch64Aapcs,
            _ => CallConv::Cdecl,
        }
    }
}

/// Immutable description of the machine code in a holder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CodeInfo {
    arch: Architecture,
    gp_register_width: u8,
    stack_alignment: u8,
    call_conv: CallConv,
    base_address: u64,
}

impl CodeInfo {
    /// Describe code for `arch` with no fixed base address.
    ///
    /// Returns `InvalidArch` for architectures this crate cannot emit
    /// relocatable code for.
    pub fn new(arch: Architecture) -> AsmResult<Self> {
        let gp_register_width = match arch.pointer_width() {
            Ok(PointerWidth::U32) => 4,
            Ok(PointerWidth::U64) => 8,
            _ => return Err(Error::InvalidArch),
        };
        let stack_alignment = match arch {
            Architecture::X86_64 | Architecture::Aarch64(_) => 16,
            Architecture::X86_32(_) => 4,
            _ => return Err(Error::InvalidArch),
        };
        Ok(Self {
            arch,
            gp_register_width,
            stack_alignment,
            call_conv: CallConv::default_for(arch),
            base_address: NO_BASE_ADDRESS,
        })
    }

    /// Describe code for the machine this process runs on.
    pub fn host() -> AsmResult<Self> {
        Self::new(host_arch())
    }

    /// The same description with a fixed base address.
    pub fn with_base_address(mut self, base_address: u64) -> Self {
        self.base_address = base_address;
        self
    }

    /// The target architecture.
    pub fn arch(&self) -> Architecture {
        self.arch
    }

    /// Width of a general-purpose register in bytes (4 or 8).
    pub fn gp_register_width(&self) -> u8 {
        self.gp_register_width
    }

    /// Natural stack alignment in bytes.
    pub fn stack_alignment(&self) -> u8 {
        self.stack_alignment
    }

    /// The default calling convention.
    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    /// The fixed base address, or [`NO_BASE_ADDRESS`].
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Whether the image has a fixed base address.
    pub fn has_base_address(&self) -> bool {
        self.base_address != NO_BASE_ADDRESS
    }

    /// Whether general-purpose registers are 64 bits wide.
    pub fn is_64bit(&self) -> bool {
        self.gp_register_width == 8
    }
}

/// The architecture of the running process.
pub fn host_arch() -> Architecture {
    if cfg!(target_arch = "x86_64") {
        Architecture::X86_64
    } else if cfg!(target_arch = "aarch64") {
        Architecture::Aarch64(Aarch64Architecture::Aarch64)
    } else {
        target_lexicon::HOST.architecture
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x64_description() {
        let info = CodeInfo::new(Architecture::X86_64).unwrap();
        assert_eq!(info.gp_register_width(), 8);
        assert_eq!(info.stack_alignment(), 16);
        assert!(info.is_64bit());
        assert!(!info.has_base_address());
    }

    #[test]
    fn base_address_is_structural() {
        let a = CodeInfo::new(Architecture::X86_64).unwrap();
        let b = a.with_base_address(0x1000_0000);
        assert_ne!(a, b);
        assert_eq!(b.base_address(), 0x1000_0000);
        assert_eq!(b, a.with_base_address(0x1000_0000));
    }

    #[test]
    fn unsupported_arch_is_rejected() {
        assert_eq!(
            CodeInfo::new(Architecture::Sparc).unwrap_err(),
            Error::InvalidArch
        );
    }
}
