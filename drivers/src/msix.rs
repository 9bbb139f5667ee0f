//! MSI-X (Extended Message Signaled Interrupts) support for PCI devices.
//!
//! MSI-X keeps a per-vector table in BAR memory, supporting up to 2048
//! vectors per device with individual per-vector masking.  The table is
//! accessed via MMIO rather than configuration space registers.
//!
//! ## Register layout reference (PCI Local Bus Spec §6.8.2)
//!
//! ```text
//! Config space (capability header):
//! Offset  Size  Field
//! +0x00   8     Cap ID (0x11) | Next Pointer
//! +0x02   16    Message Control (table size, function mask, enable)
//! +0x04   32    Table Offset / BIR
//! +0x08   32    PBA Offset / BIR
//!
//! BAR memory (MSI-X table, 16 bytes per entry):
//! +0x00   32    Message Address (lower)
//! +0x04   32    Message Address (upper)
//! +0x08   32    Message Data
//! +0x0C   32    Vector Control (bit 0 = mask)
//! ```

use core::fmt;

use ivshmem_lib::{klog_error, klog_info, klog_warn};
use ivshmem_mm::{MmError, MmioMapper, MmioRegion};

use crate::pci::{PCI_BAR1_OFFSET, PCI_CAP_ID_MSIX, PCI_CONFIG_SPACE_SIZE, PciFunction};
use crate::pci_bar::{BarError, BarSpace, Locatable, pci_probe_bar};

// =============================================================================
// MSI-X Message Control register bits (offset +2 from capability base)
// =============================================================================

/// MSI-X enable bit (bit 15 of Message Control).
pub const MSIX_CTRL_ENABLE: u16 = 1 << 15;

/// Table size mask (bits 10:0 of Message Control).
/// Encoded as N-1: 0 means 1 entry, 2047 means 2048 entries.
pub const MSIX_CTRL_TABLE_SIZE_MASK: u16 = 0x7FF;

// =============================================================================
// Register offsets (relative to capability base)
// =============================================================================

pub const MSIX_REG_CONTROL: u8 = 0x02;
pub const MSIX_REG_TABLE_OFFSET: u8 = 0x04;

/// Bytes of config space the capability occupies.
const MSIX_CAP_LEN: u8 = 0x0C;

/// BAR Indicator Register mask (bits 2:0 of Table/PBA Offset register).
pub const MSIX_BIR_MASK: u32 = 0x7;

/// BAR that must hold the vector table.
pub const MSIX_EXPECTED_TABLE_BIR: u8 = 1;

// =============================================================================
// MSI-X table entry layout (16 bytes per entry, MMIO)
// =============================================================================

const MSIX_ENTRY_ADDR_LO: usize = 0x00;
const MSIX_ENTRY_ADDR_HI: usize = 0x04;
const MSIX_ENTRY_DATA: usize = 0x08;
const MSIX_ENTRY_VECTOR_CTRL: usize = 0x0C;

/// Size of a single MSI-X table entry in bytes.
pub const MSIX_ENTRY_SIZE: usize = 16;

/// Vector Control: mask bit (bit 0).  When set, the entry is masked.
pub const MSIX_ENTRY_CTRL_MASK: u32 = 1;

// =============================================================================
// x86 LAPIC message address/data format (Intel SDM Vol. 3A §10.11)
// =============================================================================

/// Fixed base address for MSI/MSI-X messages on x86: the LAPIC doorbell region.
pub const MSIX_ADDR_BASE: u32 = 0xFEE0_0000;

/// Shift for the destination APIC ID in the message address.
const MSIX_ADDR_DEST_ID_SHIFT: u32 = 12;

/// Message data mode bits: edge triggered (bit 15 clear), bit 14 set.
pub const MSIX_DATA_EDGE_DEASSERT: u32 = 1 << 14;

/// Message address targeting `cpu` in physical destination mode.
#[inline]
pub const fn msix_message_address(cpu: u32) -> u32 {
    MSIX_ADDR_BASE | (cpu << MSIX_ADDR_DEST_ID_SHIFT)
}

/// Message data for CPU vector `vector`, fixed delivery.
#[inline]
pub const fn msix_message_data(vector: u8) -> u32 {
    (vector as u32 & 0xFF) | MSIX_DATA_EDGE_DEASSERT
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsixError {
    /// The table entry index exceeds the configured vector count.
    InvalidEntry(u16),
    /// The capability does not fit in configuration space.
    CapabilityTruncated(u8),
    /// The vector table does not live in BAR1.
    UnexpectedBir(u8),
    /// BAR1 is not a 32-bit memory BAR.
    UnexpectedTableBar,
    /// The vector table runs past the end of BAR1.
    TableOutsideBar,
    BarProbe(BarError),
    MappingFailed(MmError),
}

impl fmt::Display for MsixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEntry(idx) => write!(f, "MSI-X entry {} out of range", idx),
            Self::CapabilityTruncated(offset) => {
                write!(f, "MSI-X capability at {:#04x} truncated", offset)
            }
            Self::UnexpectedBir(bir) => write!(f, "MSI-X table in BAR{}, expected BAR1", bir),
            Self::UnexpectedTableBar => write!(f, "BAR1 is not a 32-bit memory BAR"),
            Self::TableOutsideBar => write!(f, "MSI-X table exceeds BAR1"),
            Self::BarProbe(err) => write!(f, "BAR1 probe failed: {}", err),
            Self::MappingFailed(err) => write!(f, "BAR1 mapping failed: {}", err),
        }
    }
}

impl From<BarError> for MsixError {
    fn from(err: BarError) -> Self {
        Self::BarProbe(err)
    }
}

impl From<MmError> for MsixError {
    fn from(err: MmError) -> Self {
        Self::MappingFailed(err)
    }
}

// =============================================================================
// Vector table
// =============================================================================

/// The first `count` entries of a mapped MSI-X table.
///
/// Entries past `count` exist in hardware but are never read or written.
#[derive(Debug, Clone, Copy)]
pub struct MsixVectorTable {
    table: MmioRegion,
    count: u16,
}

impl MsixVectorTable {
    /// Wrap `count` entries starting at the base of `table`.
    ///
    /// Returns `None` if the region is too small.
    pub fn new(table: MmioRegion, count: u16) -> Option<Self> {
        let bytes = (count as usize) * MSIX_ENTRY_SIZE;
        let table = table.sub_region(0, bytes)?;
        Some(Self { table, count })
    }

    #[inline]
    pub const fn count(&self) -> u16 {
        self.count
    }

    #[inline]
    pub fn region(&self) -> &MmioRegion {
        &self.table
    }

    #[inline]
    fn entry_offset(&self, entry_idx: u16, field: usize) -> Result<usize, MsixError> {
        if entry_idx >= self.count {
            return Err(MsixError::InvalidEntry(entry_idx));
        }
        Ok((entry_idx as usize) * MSIX_ENTRY_SIZE + field)
    }

    pub fn mask(&self, entry_idx: u16) -> Result<(), MsixError> {
        let offset = self.entry_offset(entry_idx, MSIX_ENTRY_VECTOR_CTRL)?;
        let ctrl = self.table.read::<u32>(offset);
        self.table.write::<u32>(offset, ctrl | MSIX_ENTRY_CTRL_MASK);
        Ok(())
    }

    pub fn unmask(&self, entry_idx: u16) -> Result<(), MsixError> {
        let offset = self.entry_offset(entry_idx, MSIX_ENTRY_VECTOR_CTRL)?;
        let ctrl = self.table.read::<u32>(offset);
        self.table.write::<u32>(offset, ctrl & !MSIX_ENTRY_CTRL_MASK);
        Ok(())
    }

    pub fn is_masked(&self, entry_idx: u16) -> Option<bool> {
        let offset = self.entry_offset(entry_idx, MSIX_ENTRY_VECTOR_CTRL).ok()?;
        Some(self.table.read::<u32>(offset) & MSIX_ENTRY_CTRL_MASK != 0)
    }

    /// Program the 64-bit message address (low dword first).
    pub fn set_address(&self, entry_idx: u16, addr: u64) -> Result<(), MsixError> {
        let offset = self.entry_offset(entry_idx, MSIX_ENTRY_ADDR_LO)?;
        self.table.write::<u32>(offset, addr as u32);
        self.table
            .write::<u32>(offset - MSIX_ENTRY_ADDR_LO + MSIX_ENTRY_ADDR_HI, (addr >> 32) as u32);
        Ok(())
    }

    pub fn set_data(&self, entry_idx: u16, data: u32) -> Result<(), MsixError> {
        let offset = self.entry_offset(entry_idx, MSIX_ENTRY_DATA)?;
        self.table.write::<u32>(offset, data);
        Ok(())
    }

    pub fn read_address(&self, entry_idx: u16) -> Option<u64> {
        let offset = self.entry_offset(entry_idx, MSIX_ENTRY_ADDR_LO).ok()?;
        let lo = self.table.read::<u32>(offset) as u64;
        let hi = self
            .table
            .read::<u32>(offset - MSIX_ENTRY_ADDR_LO + MSIX_ENTRY_ADDR_HI) as u64;
        Some((hi << 32) | lo)
    }

    pub fn read_data(&self, entry_idx: u16) -> Option<u32> {
        let offset = self.entry_offset(entry_idx, MSIX_ENTRY_DATA).ok()?;
        Some(self.table.read::<u32>(offset))
    }
}

/// Result of a successful [`msix_setup`].
#[derive(Debug, Clone, Copy)]
pub struct MsixConfig {
    /// Byte offset of the MSI-X capability in config space.
    pub cap_offset: u8,
    /// Entries the hardware advertises (1-2048).
    pub table_size: u16,
    /// Clamped table; its `count()` is the usable vector count.
    pub vectors: MsixVectorTable,
}

impl MsixConfig {
    #[inline]
    pub fn vectors_count(&self) -> u16 {
        self.vectors.count()
    }
}

// =============================================================================
// Setup
// =============================================================================

/// Locate, map and enable the function's MSI-X vector table.
///
/// Returns `Ok(None)` when the function has no MSI-X capability.  On success
/// every usable vector is masked, MSI-X is enabled, and vector `n` targets
/// CPU `n % cpu_count`.
pub fn msix_setup(
    func: &PciFunction<'_>,
    mapper: &mut MmioMapper,
    max_vectors: u16,
    cpu_count: u32,
) -> Result<Option<MsixConfig>, MsixError> {
    let Some(cap_offset) = func.find_capability(PCI_CAP_ID_MSIX) else {
        return Ok(None);
    };
    if cap_offset as u16 + MSIX_CAP_LEN as u16 > PCI_CONFIG_SPACE_SIZE {
        klog_error!("MSI-X: [{}] capability at {:#04x} truncated", func.address(), cap_offset);
        return Err(MsixError::CapabilityTruncated(cap_offset));
    }

    let control = func.read16(cap_offset + MSIX_REG_CONTROL);
    let table_size = (control & MSIX_CTRL_TABLE_SIZE_MASK) + 1;
    let mut vectors_count = table_size;
    if vectors_count > max_vectors {
        klog_warn!(
            "MSI-X: [{}] device provides {} vectors, using only {}",
            func.address(),
            table_size,
            max_vectors
        );
        vectors_count = max_vectors;
    }

    let table_dword = func.read32(cap_offset + MSIX_REG_TABLE_OFFSET);
    let bir = (table_dword & MSIX_BIR_MASK) as u8;
    if bir != MSIX_EXPECTED_TABLE_BIR {
        klog_error!("MSI-X: [{}] unexpected table BIR {}", func.address(), bir);
        return Err(MsixError::UnexpectedBir(bir));
    }

    let bar1 = pci_probe_bar(func, PCI_BAR1_OFFSET)?;
    if !matches!(
        bar1.space,
        BarSpace::Memory {
            locatable: Locatable::Locatable32,
            ..
        }
    ) {
        klog_error!("MSI-X: [{}] unexpected configuration of BAR1", func.address());
        return Err(MsixError::UnexpectedTableBar);
    }

    let window = mapper.map(bar1.base, bar1.size)?;
    let table_offset = (table_dword & !MSIX_BIR_MASK) as usize;
    let table = window
        .sub_region(table_offset, window.size().saturating_sub(table_offset))
        .and_then(|region| MsixVectorTable::new(region, vectors_count))
        .ok_or(MsixError::TableOutsideBar)?;

    for vector in 0..vectors_count {
        table.mask(vector)?;
    }

    func.write16(cap_offset + MSIX_REG_CONTROL, control | MSIX_CTRL_ENABLE);

    let cpus = cpu_count.max(1);
    for vector in 0..vectors_count {
        let target = (vector as u32) % cpus;
        table.set_address(vector, msix_message_address(target) as u64)?;
    }

    klog_info!(
        "MSI-X: [{}] table at BAR1+{:#x}, {} of {} vectors enabled",
        func.address(),
        table_offset,
        vectors_count,
        table_size
    );

    Ok(Some(MsixConfig {
        cap_offset,
        table_size,
        vectors: table,
    }))
}
