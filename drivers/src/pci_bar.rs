//! Base Address Register probing.
//!
//! Sizing follows the usual sequence: decode is switched off in the command
//! register, all-ones is written to the BAR, the read-back gives the size
//! mask, and the original value is restored before decode is switched back
//! on.  The caller must own the function's config space for the duration.

use core::fmt;

use ivshmem_lib::klog_debug;
use ivshmem_mm::PhysAddr;

use crate::pci::{
    PCI_BAR_IO_ADDR_MASK, PCI_BAR_IO_SPACE, PCI_BAR_MEM_ADDR_MASK, PCI_BAR_MEM_PREFETCHABLE,
    PCI_BAR_MEM_TYPE_1M, PCI_BAR_MEM_TYPE_64, PCI_BAR0_OFFSET, PCI_BAR5_OFFSET, PciCommand,
    PciFunction,
};

/// Where a memory BAR may be placed by firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locatable {
    /// Anywhere in the 32-bit address space.
    Locatable32,
    /// Below 1 MiB (legacy encoding).
    Locatable1M,
    /// Anywhere in the 64-bit address space; spans two BAR slots.
    Locatable64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarSpace {
    Memory {
        locatable: Locatable,
        prefetchable: bool,
    },
    Io,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarInfo {
    pub base: PhysAddr,
    pub size: u64,
    pub space: BarSpace,
}

impl BarInfo {
    #[inline]
    pub fn is_memory(&self) -> bool {
        matches!(self.space, BarSpace::Memory { .. })
    }

    #[inline]
    pub fn is_io(&self) -> bool {
        self.space == BarSpace::Io
    }

    /// Locatability of a memory BAR, `None` for I/O BARs.
    #[inline]
    pub fn locatable(&self) -> Option<Locatable> {
        match self.space {
            BarSpace::Memory { locatable, .. } => Some(locatable),
            BarSpace::Io => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarError {
    /// Not one of the six dword-aligned BAR slots.
    InvalidOffset(u8),
    /// A 64-bit BAR in the last slot has no register for its upper half.
    MissingUpperHalf(u8),
}

impl fmt::Display for BarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOffset(offset) => write!(f, "invalid BAR offset {:#04x}", offset),
            Self::MissingUpperHalf(offset) => {
                write!(f, "64-bit BAR at {:#04x} has no upper half", offset)
            }
        }
    }
}

#[inline]
pub fn pci_bar_offset_valid(bar_offset: u8) -> bool {
    (PCI_BAR0_OFFSET..=PCI_BAR5_OFFSET).contains(&bar_offset) && bar_offset % 4 == 0
}

/// Decode one BAR's address, type and size.
pub fn pci_probe_bar(func: &PciFunction<'_>, bar_offset: u8) -> Result<BarInfo, BarError> {
    if !pci_bar_offset_valid(bar_offset) {
        return Err(BarError::InvalidOffset(bar_offset));
    }

    let original = func.read32(bar_offset);

    let (space, mask) = if original & PCI_BAR_IO_SPACE != 0 {
        (BarSpace::Io, PCI_BAR_IO_ADDR_MASK)
    } else {
        let locatable = if original & PCI_BAR_MEM_TYPE_64 != 0 {
            Locatable::Locatable64
        } else if original & PCI_BAR_MEM_TYPE_1M != 0 {
            Locatable::Locatable1M
        } else {
            Locatable::Locatable32
        };
        let space = BarSpace::Memory {
            locatable,
            prefetchable: original & PCI_BAR_MEM_PREFETCHABLE != 0,
        };
        (space, PCI_BAR_MEM_ADDR_MASK)
    };

    let upper_offset = if matches!(
        space,
        BarSpace::Memory {
            locatable: Locatable::Locatable64,
            ..
        }
    ) {
        if bar_offset == PCI_BAR5_OFFSET {
            return Err(BarError::MissingUpperHalf(bar_offset));
        }
        Some(bar_offset + 4)
    } else {
        None
    };

    let original_hi = upper_offset.map(|offset| func.read32(offset));
    let base = ((original_hi.unwrap_or(0) as u64) << 32) | (original & mask) as u64;

    // Device must not decode while its BARs hold all-ones.
    let command = func.command();
    func.set_command(command.difference(PciCommand::DECODE));

    func.write32(bar_offset, 0xFFFF_FFFF);
    let size_lo = func.read32(bar_offset) & mask;
    func.write32(bar_offset, original);

    let size = match (upper_offset, original_hi) {
        (Some(offset), Some(hi)) => {
            func.write32(offset, 0xFFFF_FFFF);
            let size_hi = func.read32(offset);
            func.write32(offset, hi);
            (!(((size_hi as u64) << 32) | size_lo as u64)).wrapping_add(1)
        }
        _ => {
            // I/O BARs may only implement the low 16 address bits.
            let size_lo = if space == BarSpace::Io && size_lo & 0xFFFF_0000 == 0 {
                size_lo | 0xFFFF_0000
            } else {
                size_lo
            };
            (!size_lo).wrapping_add(1) as u64
        }
    };

    func.set_command(command | PciCommand::DECODE);

    klog_debug!(
        "PCI: [{}] BAR@{:#04x}: base={:#x} size={:#x} {:?}",
        func.address(),
        bar_offset,
        base,
        size,
        space
    );

    Ok(BarInfo {
        base: PhysAddr::new(base),
        size,
        space,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{PCI_BAR1_OFFSET, PCI_BAR2_OFFSET, PCI_COMMAND_OFFSET, PciAddress};
    use crate::test_fixtures::FakeConfigSpace;

    const ADDR: PciAddress = PciAddress::new(0, 3, 0);

    fn device() -> FakeConfigSpace {
        let cfg = FakeConfigSpace::new();
        cfg.add_function(ADDR, 0x1AF4, 0x1110);
        cfg
    }

    #[test]
    fn test_rejects_bad_offsets() {
        let cfg = device();
        let func = PciFunction::new(&cfg, ADDR);
        for offset in [0x00, 0x0C, 0x11, 0x16, 0x28, 0xFF] {
            assert_eq!(
                pci_probe_bar(&func, offset),
                Err(BarError::InvalidOffset(offset))
            );
        }
    }

    #[test]
    fn test_32bit_memory_bar_size_and_restore() {
        let cfg = device();
        let func = PciFunction::new(&cfg, ADDR);
        for shift in 4..32 {
            let size = 1u64 << shift;
            let base = 0xC000_0000u32 & !((size as u32).wrapping_sub(1));
            cfg.set_mem_bar32(ADDR, PCI_BAR2_OFFSET, base, size as u32, false);

            let bar = pci_probe_bar(&func, PCI_BAR2_OFFSET).expect("probe");
            assert_eq!(bar.size, size, "size 2^{}", shift);
            assert_eq!(bar.base, PhysAddr::new(base as u64));
            assert_eq!(cfg.peek32(ADDR, PCI_BAR2_OFFSET), base);
        }
    }

    #[test]
    fn test_memory_bar_classification() {
        let cfg = device();
        let func = PciFunction::new(&cfg, ADDR);
        cfg.set_mem_bar32(ADDR, PCI_BAR1_OFFSET, 0xFEBC_0000, 0x1000, true);

        let bar = pci_probe_bar(&func, PCI_BAR1_OFFSET).expect("probe");
        assert_eq!(
            bar.space,
            BarSpace::Memory {
                locatable: Locatable::Locatable32,
                prefetchable: true
            }
        );
        assert!(bar.is_memory());
        assert_eq!(bar.locatable(), Some(Locatable::Locatable32));
    }

    #[test]
    fn test_64bit_memory_bar_spans_two_registers() {
        let cfg = device();
        let func = PciFunction::new(&cfg, ADDR);
        cfg.set_mem_bar64(ADDR, PCI_BAR2_OFFSET, 0x0000_0008_0000_0000, 0x2_0000_0000);

        let bar = pci_probe_bar(&func, PCI_BAR2_OFFSET).expect("probe");
        assert_eq!(bar.base, PhysAddr::new(0x0000_0008_0000_0000));
        assert_eq!(bar.size, 0x2_0000_0000);
        assert_eq!(bar.locatable(), Some(Locatable::Locatable64));
        assert_eq!(cfg.peek32(ADDR, PCI_BAR2_OFFSET + 4), 0x8);
    }

    #[test]
    fn test_64bit_bar_in_last_slot_fails() {
        let cfg = device();
        let func = PciFunction::new(&cfg, ADDR);
        cfg.poke32(ADDR, PCI_BAR5_OFFSET, PCI_BAR_MEM_TYPE_64);

        assert_eq!(
            pci_probe_bar(&func, PCI_BAR5_OFFSET),
            Err(BarError::MissingUpperHalf(PCI_BAR5_OFFSET))
        );
    }

    #[test]
    fn test_io_bar() {
        let cfg = device();
        let func = PciFunction::new(&cfg, ADDR);
        cfg.set_io_bar(ADDR, PCI_BAR0_OFFSET, 0xC040, 0x20);

        let bar = pci_probe_bar(&func, PCI_BAR0_OFFSET).expect("probe");
        assert!(bar.is_io());
        assert_eq!(bar.base, PhysAddr::new(0xC040));
        assert_eq!(bar.size, 0x20);
        assert_eq!(bar.locatable(), None);
    }

    #[test]
    fn test_decode_disabled_while_sizing() {
        let cfg = device();
        let func = PciFunction::new(&cfg, ADDR);
        cfg.set_mem_bar32(ADDR, PCI_BAR2_OFFSET, 0xC000_0000, 0x10_0000, false);
        cfg.poke32(ADDR, PCI_COMMAND_OFFSET, PciCommand::BUS_MASTER.bits() as u32);
        cfg.clear_command_log();

        pci_probe_bar(&func, PCI_BAR2_OFFSET).expect("probe");

        let log = cfg.command_log();
        assert_eq!(log.len(), 2);
        assert!(!log[0].intersects(PciCommand::DECODE));
        assert!(log[0].contains(PciCommand::BUS_MASTER));
        assert!(log[1].contains(PciCommand::DECODE | PciCommand::BUS_MASTER));
        assert!(cfg.bar_probed_with_decode_off(ADDR, PCI_BAR2_OFFSET));
    }
}
