use core::ptr::{read_volatile, write_volatile};

use ivshmem_lib::{klog_debug, klog_error};

use crate::addr::{PhysAddr, VirtAddr};
use crate::error::{MmError, MmResult};
use crate::paging_defs::{PAGE_SIZE_4KB, PageFlags, pages_spanning};

/// Page-mapping facility supplied by the platform.
///
/// `map` installs `pages` consecutive 4KB mappings starting at `virt`
/// (page-aligned) that translate to `phys` (page-aligned).
pub trait PageMapper: Sync {
    fn map(&self, virt: VirtAddr, phys: PhysAddr, pages: u64, flags: PageFlags) -> MmResult<()>;
}

/// A window of device registers accessed with volatile loads and stores.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRegion {
    virt_base: u64,
    phys_base: u64,
    size: usize,
}

impl MmioRegion {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            virt_base: 0,
            phys_base: 0,
            size: 0,
        }
    }

    /// Wrap an already-mapped window.
    ///
    /// # Safety
    ///
    /// `virt .. virt + size` must stay mapped and refer to `phys .. phys + size`
    /// for as long as the region (or any copy or sub-region of it) is used.
    #[inline]
    pub const unsafe fn from_raw(virt: VirtAddr, phys: PhysAddr, size: usize) -> Self {
        Self {
            virt_base: virt.as_u64(),
            phys_base: phys.as_u64(),
            size,
        }
    }

    #[inline]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        let size = core::mem::size_of::<T>();

        debug_assert!(
            self.is_valid_offset(offset, size),
            "MMIO read out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );

        debug_assert!(
            offset % size == 0,
            "MMIO read misaligned: offset={}, align={}",
            offset,
            size
        );

        let ptr = (self.virt_base + offset as u64) as *const T;
        unsafe { read_volatile(ptr) }
    }

    #[inline]
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        let size = core::mem::size_of::<T>();

        debug_assert!(
            self.is_valid_offset(offset, size),
            "MMIO write out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );

        debug_assert!(
            offset % size == 0,
            "MMIO write misaligned: offset={}, align={}",
            offset,
            size
        );

        let ptr = (self.virt_base + offset as u64) as *mut T;
        unsafe { write_volatile(ptr, value) }
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.read(offset)
    }

    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }

    #[inline]
    pub fn virt_base(&self) -> VirtAddr {
        VirtAddr::new(self.virt_base)
    }

    #[inline]
    pub fn phys_base(&self) -> PhysAddr {
        PhysAddr::new(self.phys_base)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.size != 0
    }

    #[inline]
    pub fn is_valid_offset(&self, offset: usize, access_size: usize) -> bool {
        offset
            .checked_add(access_size)
            .is_some_and(|end| end <= self.size)
    }

    pub fn sub_region(&self, offset: usize, size: usize) -> Option<MmioRegion> {
        let end = offset.checked_add(size)?;
        if end > self.size {
            return None;
        }
        Some(MmioRegion {
            virt_base: self.virt_base + offset as u64,
            phys_base: self.phys_base + offset as u64,
            size,
        })
    }
}

impl Default for MmioRegion {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// BAR mapper
// =============================================================================

/// Turns physical BAR ranges into dereferenceable [`MmioRegion`]s.
///
/// With a [`PageMapper`] the mapper hands out virtual space from a bump
/// cursor that only ever moves forward.  Without one, physical addresses are
/// used as-is (flat addressing).
pub struct MmioMapper {
    pager: Option<&'static dyn PageMapper>,
    next_virt: u64,
}

impl MmioMapper {
    /// Identity mapping: regions point straight at the physical address.
    pub const fn flat() -> Self {
        Self {
            pager: None,
            next_virt: 0,
        }
    }

    pub const fn paged(pager: &'static dyn PageMapper, base: VirtAddr) -> Self {
        Self {
            pager: Some(pager),
            next_virt: base.as_u64(),
        }
    }

    pub fn new(pager: Option<&'static dyn PageMapper>, base: VirtAddr) -> MmResult<Self> {
        match pager {
            Some(pager) => {
                if !base.is_aligned(PAGE_SIZE_4KB) {
                    return Err(MmError::NotAligned {
                        address: base.as_u64(),
                        required: PAGE_SIZE_4KB,
                    });
                }
                Ok(Self::paged(pager, base))
            }
            None => Ok(Self::flat()),
        }
    }

    #[inline]
    pub fn is_paged(&self) -> bool {
        self.pager.is_some()
    }

    /// Next virtual address the cursor will hand out (paged mode).
    #[inline]
    pub fn next_virt(&self) -> VirtAddr {
        VirtAddr::new(self.next_virt)
    }

    pub fn map(&mut self, phys: PhysAddr, size: u64) -> MmResult<MmioRegion> {
        let region_size = usize::try_from(size).map_err(|_| MmError::InvalidAddress)?;
        phys.checked_offset(size).ok_or(MmError::InvalidAddress)?;

        let Some(pager) = self.pager else {
            return Ok(MmioRegion {
                virt_base: phys.as_u64(),
                phys_base: phys.as_u64(),
                size: region_size,
            });
        };

        let offset = phys.page_offset();
        let pages = pages_spanning(offset, size);
        let virt = self.next_virt;

        if pages == 0 {
            return Ok(MmioRegion {
                virt_base: virt + offset,
                phys_base: phys.as_u64(),
                size: 0,
            });
        }

        let span = pages * PAGE_SIZE_4KB;
        self.next_virt = virt
            .checked_add(span)
            .ok_or(MmError::AddressSpaceExhausted)?;

        // The cursor has already moved: a failed range is never reused.
        if let Err(err) = pager.map(VirtAddr::new(virt), phys.page_base(), pages, PageFlags::MMIO) {
            klog_error!(
                "MMIO: mapping {} pages of phys {:#x} at {:#x} failed: {}",
                pages,
                phys.as_u64(),
                virt,
                err
            );
            return Err(MmError::MappingFailed);
        }

        klog_debug!(
            "MMIO: phys {:#x} (+{:#x}) -> virt {:#x}, {} pages",
            phys.as_u64(),
            size,
            virt + offset,
            pages
        );

        Ok(MmioRegion {
            virt_base: virt + offset,
            phys_base: phys.as_u64(),
            size: region_size,
        })
    }
}
