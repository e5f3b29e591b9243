//! Virtual-memory primitive.
//!
//! Thin, OS-level page management: anonymous mappings with read/write/execute
//! permission sets, permission flips, and unmapping. Unix goes through
//! `rustix::mm`; Windows through `VirtualAlloc` and friends. Everything above
//! this module works in terms of [`Access`] and never sees an OS error —
//! failures collapse into `NoVirtualMemory` / `InvalidArgument`.

use crate::result::{AsmResult, Error};
use core::ptr::NonNull;

bitflags::bitflags! {
    /// Memory access flags. Readability is implied; platforms that forbid
    /// `WRITE | EXECUTE` mappings surface that as `NoVirtualMemory`, and the
    /// caller is expected to stage through `WRITE` and flip to `EXECUTE`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        /// The pages may be written.
        const WRITE = 0x1;
        /// The pages may be executed.
        const EXECUTE = 0x2;
    }
}

/// Size of a host page in bytes.
pub fn page_size() -> usize {
    imp::page_size()
}

/// Round `size` up to a whole number of pages.
pub fn align_to_page(size: usize) -> usize {
    let page = page_size();
    size.checked_add(page - 1).map_or(usize::MAX, |s| s & !(page - 1))
}

/// Map `size` bytes of zeroed, committed anonymous memory with `access`.
///
/// `size` is rounded up to a whole number of pages.
pub fn alloc(size: usize, access: Access) -> AsmResult<NonNull<u8>> {
    if size == 0 {
        return Err(Error::InvalidArgument);
    }
    let ptr = imp::alloc(align_to_page(size), access)?;
    log::trace!("vm: mapped {size:#x} bytes at {ptr:p} ({access:?})");
    Ok(ptr)
}

/// Unmap a range previously returned by [`alloc`].
///
/// # Safety
///
/// `ptr` and `size` must describe exactly one live mapping made by [`alloc`]
/// with the same size, and nothing may reference the range afterwards.
pub unsafe fn release(ptr: NonNull<u8>, size: usize) -> AsmResult<()> {
    log::trace!("vm: unmapping {size:#x} bytes at {ptr:p}");
    imp::release(ptr, align_to_page(size))
}

/// Change the permissions of a mapped range.
///
/// # Safety
///
/// `ptr` and `size` must lie within a live mapping made by [`alloc`], with
/// `ptr` page-aligned.
pub unsafe fn protect(ptr: NonNull<u8>, size: usize, access: Access) -> AsmResult<()> {
    log::trace!("vm: protecting {size:#x} bytes at {ptr:p} as {access:?}");
    imp::protect(ptr, align_to_page(size), access)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp {
            use super::Access;
            use crate::result::{AsmResult, Error};
            use core::ptr::NonNull;
            use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};

            pub fn page_size() -> usize {
                rustix::param::page_size()
            }

            fn prot_flags(access: Access) -> ProtFlags {
                let mut prot = ProtFlags::READ;
                if access.contains(Access::WRITE) {
                    prot |= ProtFlags::WRITE;
                }
                if access.contains(Access::EXECUTE) {
                    prot |= ProtFlags::EXEC;
                }
                prot
            }

            fn mprotect_flags(access: Access) -> MprotectFlags {
                let mut prot = MprotectFlags::READ;
                if access.contains(Access::WRITE) {
                    prot |= MprotectFlags::WRITE;
                }
                if access.contains(Access::EXECUTE) {
                    prot |= MprotectFlags::EXEC;
                }
                prot
            }

            pub fn alloc(size: usize, access: Access) -> AsmResult<NonNull<u8>> {
                let ptr = unsafe {
                    mmap_anonymous(
                        core::ptr::null_mut(),
                        size,
                        prot_flags(access),
                        MapFlags::PRIVATE,
                    )
                }
                .map_err(|_| Error::NoVirtualMemory)?;
                NonNull::new(ptr.cast::<u8>()).ok_or(Error::NoVirtualMemory)
            }

            pub unsafe fn release(ptr: NonNull<u8>, size: usize) -> AsmResult<()> {
                munmap(ptr.as_ptr().cast(), size).map_err(|_| Error::InvalidArgument)
            }

            pub unsafe fn protect(ptr: NonNull<u8>, size: usize, access: Access) -> AsmResult<()> {
                mprotect(ptr.as_ptr().cast(), size, mprotect_flags(access))
                    .map_err(|_| Error::InvalidArgument)
            }
        }
    } else if #[cfg(windows)] {
        mod imp {
            use super::Access;
            use crate::result::{AsmResult, Error};
            use core::ptr::NonNull;
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
                PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_READONLY, PAGE_READWRITE,
            };
            use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

            pub fn page_size() -> usize {
                unsafe {
                    let mut info: SYSTEM_INFO = core::mem::zeroed();
                    GetSystemInfo(&mut info);
                    info.dwPageSize as usize
                }
            }

            fn protect_flags(access: Access) -> u32 {
                match (access.contains(Access::WRITE), access.contains(Access::EXECUTE)) {
                    (false, false) => PAGE_READONLY,
                    (true, false) => PAGE_READWRITE,
                    (false, true) => PAGE_EXECUTE_READ,
                    (true, true) => PAGE_EXECUTE_READWRITE,
                }
            }

            pub fn alloc(size: usize, access: Access) -> AsmResult<NonNull<u8>> {
                let ptr = unsafe {
                    VirtualAlloc(
                        core::ptr::null(),
                        size,
                        MEM_COMMIT | MEM_RESERVE,
                        protect_flags(access),
                    )
                };
                NonNull::new(ptr.cast::<u8>()).ok_or(Error::NoVirtualMemory)
            }

            pub unsafe fn release(ptr: NonNull<u8>, _size: usize) -> AsmResult<()> {
                if VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) == 0 {
                    return Err(Error::InvalidArgument);
                }
                Ok(())
            }

            pub unsafe fn protect(ptr: NonNull<u8>, size: usize, access: Access) -> AsmResult<()> {
                let mut old = 0u32;
                if VirtualProtect(ptr.as_ptr().cast(), size, protect_flags(access), &mut old) == 0 {
                    return Err(Error::InvalidArgument);
                }
                Ok(())
            }
        }
    } else {
        mod imp {
            use super::Access;
            use crate::result::{AsmResult, Error};
            use core::ptr::NonNull;

            pub fn page_size() -> usize {
                4096
            }

            pub fn alloc(_size: usize, _access: Access) -> AsmResult<NonNull<u8>> {
                Err(Error::FeatureNotEnabled)
            }

            pub unsafe fn release(_ptr: NonNull<u8>, _size: usize) -> AsmResult<()> {
                Err(Error::FeatureNotEnabled)
            }

            pub unsafe fn protect(
                _ptr: NonNull<u8>,
                _size: usize,
                _access: Access,
            ) -> AsmResult<()> {
                Err(Error::FeatureNotEnabled)
            }
        }
    }
}
