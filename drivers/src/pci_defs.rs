//! PCI bus hardware definitions and configuration space constants.
//!
//! Single source of truth for PCI constants used across the driver subsystem.
//! Add new constants here only when a consumer exists.

use bitflags::bitflags;

// =============================================================================
// Configuration Space Register Offsets
// =============================================================================

/// Size of the conventional (non-extended) configuration space.
pub const PCI_CONFIG_SPACE_SIZE: u16 = 0x100;

/// Vendor ID register offset (16-bit).
pub const PCI_VENDOR_ID_OFFSET: u8 = 0x00;

/// Device ID register offset (16-bit).
pub const PCI_DEVICE_ID_OFFSET: u8 = 0x02;

/// Command register offset (16-bit).
pub const PCI_COMMAND_OFFSET: u8 = 0x04;

/// Status register offset (16-bit).
pub const PCI_STATUS_OFFSET: u8 = 0x06;

/// Header Type register offset (8-bit).
pub const PCI_HEADER_TYPE_OFFSET: u8 = 0x0E;

/// Base Address Register 0 offset.
pub const PCI_BAR0_OFFSET: u8 = 0x10;
pub const PCI_BAR1_OFFSET: u8 = 0x14;
pub const PCI_BAR2_OFFSET: u8 = 0x18;

/// Base Address Register 5 offset (last slot of a type 0 header).
pub const PCI_BAR5_OFFSET: u8 = 0x24;

/// Secondary bus number (8-bit, header type 1).
pub const PCI_SECONDARY_BUS_OFFSET: u8 = 0x19;

/// Capabilities pointer offset (8-bit, header type 0).
pub const PCI_CAP_PTR_OFFSET: u8 = 0x34;

/// Reserved low bits of capability pointers must be ignored.
pub const PCI_CAP_PTR_MASK: u8 = 0xFC;

// =============================================================================
// Header Type
// =============================================================================

pub const PCI_HEADER_TYPE_MASK: u8 = 0x7F;
pub const PCI_HEADER_TYPE_MULTIFUNCTION: u8 = 0x80;
pub const PCI_HEADER_TYPE_BRIDGE: u8 = 0x01;

// =============================================================================
// Command / Status Register Bits
// =============================================================================

bitflags! {
    /// PCI Command register (offset 0x04).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        /// Respond to I/O space accesses (bit 0).
        const IO_SPACE     = 1 << 0;
        /// Respond to memory space accesses (bit 1).
        const MEMORY_SPACE = 1 << 1;
        /// Enable bus master capability (bit 2).
        const BUS_MASTER   = 1 << 2;

        const DECODE = Self::IO_SPACE.bits() | Self::MEMORY_SPACE.bits();
    }
}

bitflags! {
    /// PCI Status register (offset 0x06).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PciStatus: u16 {
        /// Capabilities list present (bit 4).
        const CAP_LIST = 1 << 4;
    }
}

// =============================================================================
// BAR Encoding
// =============================================================================

/// BAR bit 0: the BAR decodes I/O space.
pub const PCI_BAR_IO_SPACE: u32 = 0x1;

/// Memory BAR type field (bits 2:1).
pub const PCI_BAR_MEM_TYPE_1M: u32 = 0x2;
pub const PCI_BAR_MEM_TYPE_64: u32 = 0x4;

/// Memory BAR bit 3.
pub const PCI_BAR_MEM_PREFETCHABLE: u32 = 0x8;

pub const PCI_BAR_IO_ADDR_MASK: u32 = !0x3;
pub const PCI_BAR_MEM_ADDR_MASK: u32 = !0xF;

// =============================================================================
// Capability IDs
// =============================================================================

/// PCI Capability ID: MSI-X.
pub const PCI_CAP_ID_MSIX: u8 = 0x11;

// =============================================================================
// Known IDs
// =============================================================================

/// Red Hat / Qumranet vendor ID (VirtIO and QEMU devices).
pub const PCI_VENDOR_ID_REDHAT_QUMRANET: u16 = 0x1AF4;

/// QEMU inter-VM shared memory device.
pub const PCI_DEVICE_ID_IVSHMEM: u16 = 0x1110;

/// Invalid vendor ID (no device present).
pub const PCI_VENDOR_ID_INVALID: u16 = 0xFFFF;

/// Wildcard id used by driver id-table terminators.
pub const PCI_ANY_ID: u16 = 0xFFFF;

// =============================================================================
// Enumeration Limits
// =============================================================================

/// Maximum number of PCI buses.
pub const PCI_MAX_BUSES: usize = 256;

pub const PCI_MAX_DEVICES_PER_BUS: u8 = 32;
pub const PCI_MAX_FUNCTIONS: u8 = 8;
