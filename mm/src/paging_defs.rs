//! Paging flags and constants handed to the page-mapping collaborator.
//!
//! The bit layout follows x86_64 page table entries so a platform mapper can
//! use `flags.bits()` directly as PTE flag bits.

use bitflags::bitflags;

bitflags! {
    /// x86_64 page table entry flags.
    ///
    /// ```ignore
    /// use ivshmem_mm::paging_defs::PageFlags;
    ///
    /// let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::CACHE_DISABLE;
    /// assert!(flags.contains(PageFlags::WRITABLE));
    /// ```
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// Page is present in memory (bit 0).
        const PRESENT       = 1 << 0;
        /// Page is writable (otherwise read-only) (bit 1).
        const WRITABLE      = 1 << 1;
        /// Write-through caching (vs write-back) (bit 3).
        const WRITE_THROUGH = 1 << 3;
        /// Disable caching for this page (bit 4).
        const CACHE_DISABLE = 1 << 4;
        /// Page is global (not flushed on CR3 change) (bit 8).
        const GLOBAL        = 1 << 8;
        /// Disable instruction fetch from this page (bit 63).
        const NO_EXECUTE    = 1 << 63;

        /// Kernel read-write page (PRESENT | WRITABLE).
        const KERNEL_RW = Self::PRESENT.bits() | Self::WRITABLE.bits();
        /// Device memory: read-write, uncached, never executable.
        const MMIO = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::CACHE_DISABLE.bits() | Self::NO_EXECUTE.bits();
    }
}

// =============================================================================
// Page Sizes
// =============================================================================

/// 4KB page size (standard).
pub const PAGE_SIZE_4KB: u64 = 0x1000;

/// Number of 4KB pages needed to cover `size` bytes starting `offset` bytes
/// into the first page.  Zero-sized ranges need no pages.
#[inline]
pub const fn pages_spanning(offset: u64, size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    (offset + size).div_ceil(PAGE_SIZE_4KB)
}
