#![no_std]

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod error;
pub mod mmio;
pub mod paging_defs;

pub use addr::{PhysAddr, VirtAddr};
pub use error::{MmError, MmResult};
pub use mmio::{MmioMapper, MmioRegion, PageMapper};
pub use paging_defs::{PAGE_SIZE_4KB, PageFlags};
