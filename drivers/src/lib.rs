#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod irq;
pub mod ivshmem;
pub mod msix;
pub mod pci;
pub mod pci_bar;
mod pci_defs;

#[cfg(test)]
mod msix_tests;
#[cfg(test)]
mod test_fixtures;
