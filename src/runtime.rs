//! One-step installation of emitted code.
//!
//! [`JitRuntime`] owns an executable-memory allocator and turns a finished
//! holder into callable memory: compute the image size, allocate, relocate
//! against the allocation's own address, and trim whatever reserved
//! trampoline space went unused. Releasing a function returns its range to
//! the allocator.

use crate::holder::CodeHolder;
use crate::jit_allocator::{JitAllocator, JitAllocatorOptions};
use crate::result::{AsmResult, Error};
use crate::target::CodeInfo;
use core::ptr::NonNull;

/// An allocator plus the host target description.
///
/// The allocator maps its blocks writable and executable at once; on hosts
/// that enforce W^X, construct the runtime with `JitAllocatorOptions` using
/// write-only access and flip the pages yourself after `add`.
pub struct JitRuntime {
    allocator: JitAllocator,
    info: CodeInfo,
}

impl JitRuntime {
    /// Create a runtime for the host architecture.
    pub fn new() -> AsmResult<Self> {
        Ok(Self {
            allocator: JitAllocator::new(),
            info: CodeInfo::host()?,
        })
    }

    /// Create a runtime with explicit allocator options.
    pub fn with_options(options: JitAllocatorOptions) -> AsmResult<Self> {
        Ok(Self {
            allocator: JitAllocator::with_options(options),
            info: CodeInfo::host()?,
        })
    }

    /// The target description new holders should be initialized with.
    pub fn code_info(&self) -> CodeInfo {
        self.info
    }

    /// The underlying allocator.
    pub fn allocator(&self) -> &JitAllocator {
        &self.allocator
    }

    /// Install the holder's image into executable memory and return its
    /// entry pointer.
    ///
    /// The image is relocated against the allocation address; unused
    /// reserved space is shrunk away. On any failure the allocation is
    /// released and the error returned.
    pub fn add(&self, holder: &CodeHolder) -> AsmResult<NonNull<u8>> {
        let size = holder.code_size()?;
        if size == 0 {
            return Err(Error::NoCodeGenerated);
        }
        let ptr = self.allocator.alloc(size)?;
        // The allocation is granule-rounded; expose exactly the image size.
        let dst = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
        let used = match holder.relocate(dst, ptr.as_ptr() as u64) {
            Ok(used) => used,
            Err(e) => {
                let _ = self.allocator.release(ptr);
                return Err(e);
            }
        };
        if used < size {
            // Never fails for a shrink of a live allocation.
            self.allocator.shrink(ptr, used)?;
        }
        log::debug!("runtime: installed {used:#x} bytes at {ptr:p}");
        Ok(ptr)
    }

    /// Release a function previously returned by [`JitRuntime::add`].
    pub fn release(&self, ptr: NonNull<u8>) -> AsmResult<()> {
        self.allocator.release(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reloc::RelocKind;

    #[test]
    fn add_rejects_empty_holders() {
        let rt = JitRuntime::new().unwrap();
        let holder = CodeHolder::with_info(rt.code_info());
        assert_eq!(rt.add(&holder).unwrap_err(), Error::NoCodeGenerated);
    }

    #[test]
    fn failed_relocation_releases_the_allocation() {
        let rt = JitRuntime::new().unwrap();
        let mut holder = CodeHolder::with_info(rt.code_info());
        holder
            .section_mut(0)
            .unwrap()
            .buffer_mut()
            .emit_u32(0)
            .unwrap();
        // A relocation against a section that does not exist.
        let id = holder.new_reloc(RelocKind::RelToAbs, 4).unwrap();
        {
            let r = holder.reloc_mut(id).unwrap();
            r.set_source(0, 0);
            r.set_target_offset(9, 0);
        }
        assert_eq!(rt.add(&holder).unwrap_err(), Error::InvalidRelocEntry);
        assert_eq!(rt.allocator().statistics().used_size, 0);
    }

    #[test]
    fn install_and_release_round_trip() {
        let rt = JitRuntime::new().unwrap();
        let mut holder = CodeHolder::with_info(rt.code_info());
        holder
            .section_mut(0)
            .unwrap()
            .buffer_mut()
            .emit_bytes(&[0xC3; 32])
            .unwrap();
        let ptr = rt.add(&holder).unwrap();
        assert!(rt.allocator().statistics().used_size > 0);
        unsafe {
            assert_eq!(*ptr.as_ptr(), 0xC3);
        }
        rt.release(ptr).unwrap();
        assert_eq!(rt.allocator().statistics().used_size, 0);
    }
}
