//! Bump-pointer arena for short-lived data structures.
//!
//! A [`Zone`] hands out allocations in O(1) by bumping a pointer through
//! geometrically growing chunks and releases everything at once, either on
//! [`Zone::reset`] or on drop. The relocation engine uses a zone for its
//! per-invocation scratch (section layout table, trampoline records) so that
//! a `relocate` call performs a bounded number of real heap allocations no
//! matter how many sections and relocations the image carries.

use bumpalo::Bump;

/// A bump-pointer arena.
///
/// All allocations are aligned at least to the pointer size. There is no
/// per-allocation free; memory is reclaimed wholesale.
#[derive(Default)]
pub struct Zone {
    bump: Bump,
}

impl Zone {
    /// Create an empty zone. The first allocation maps the first chunk.
    pub fn new() -> Self {
        Self { bump: Bump::new() }
    }

    /// Create a zone with `capacity` bytes pre-reserved in its first chunk.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bump: Bump::with_capacity(capacity),
        }
    }

    /// Allocate a value in the zone.
    pub fn alloc<T>(&self, value: T) -> &mut T {
        self.bump.alloc(value)
    }

    /// Allocate a copy of `bytes` in the zone.
    pub fn alloc_slice(&self, bytes: &[u8]) -> &[u8] {
        self.bump.alloc_slice_copy(bytes)
    }

    /// Allocate a copy of `s` in the zone.
    pub fn alloc_str(&self, s: &str) -> &str {
        self.bump.alloc_str(s)
    }

    /// Allocate a zeroed, `len`-element slice in the zone.
    pub fn alloc_zeroed(&self, len: usize) -> &mut [u8] {
        self.bump.alloc_slice_fill_copy(len, 0u8)
    }

    /// Total bytes handed out since the last reset, across all chunks.
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    /// Release every allocation, retaining the largest chunk for reuse.
    pub fn reset(&mut self) {
        self.bump.reset();
    }

    /// The underlying bump allocator, for use with `bumpalo::collections`.
    pub(crate) fn bump(&self) -> &Bump {
        &self.bump
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_pointer_aligned() {
        let zone = Zone::new();
        for len in [1, 3, 7, 9] {
            let p = zone.alloc_slice(&vec![0xAB; len]);
            assert_eq!(p.len(), len);
        }
        let v = zone.alloc(0x1122_3344_5566_7788u64);
        assert_eq!(v as *mut u64 as usize % core::mem::align_of::<u64>(), 0);
    }

    #[test]
    fn reset_reclaims_everything() {
        let mut zone = Zone::with_capacity(256);
        zone.alloc_slice(&[1, 2, 3, 4]);
        zone.alloc_str("forward");
        assert!(zone.allocated_bytes() >= 11);
        zone.reset();
        assert_eq!(zone.allocated_bytes(), 0);
        // The zone is usable again after a reset.
        assert_eq!(zone.alloc_str("again"), "again");
    }

    #[test]
    fn zeroed_slices_are_zero() {
        let zone = Zone::new();
        assert!(zone.alloc_zeroed(64).iter().all(|&b| b == 0));
    }
}
