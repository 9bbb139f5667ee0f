//! The ivshmem register block in BAR0.
//!
//! ```text
//! Offset  Size  Field
//! +0x00   32    Interrupt mask   (unused with MSI-X)
//! +0x04   32    Interrupt status (unused with MSI-X)
//! +0x08   32    IVPosition: this VM's peer id, read-only
//! +0x0C   32    Doorbell: bits 15:0 vector, bits 31:16 peer id, write-only
//! +0x10         reserved up to 256 bytes
//! ```

use ivshmem_mm::MmioRegion;

/// Exact size BAR0 must report.
pub const IVSHMEM_DOORBELL_SIZE: u64 = 256;

const IVSHMEM_REG_IV_POSITION: usize = 0x08;
const IVSHMEM_REG_DOORBELL: usize = 0x0C;

#[derive(Debug, Clone, Copy)]
pub struct DoorbellRegs {
    regs: MmioRegion,
}

impl DoorbellRegs {
    /// Returns `None` unless `regs` covers the whole register block.
    pub fn new(regs: MmioRegion) -> Option<Self> {
        if (regs.size() as u64) < IVSHMEM_DOORBELL_SIZE {
            return None;
        }
        Some(Self { regs })
    }

    #[inline]
    pub fn region(&self) -> &MmioRegion {
        &self.regs
    }

    /// Peer id the host assigned to this VM.
    #[inline]
    pub fn iv_position(&self) -> u32 {
        self.regs.read_u32(IVSHMEM_REG_IV_POSITION)
    }

    /// Raise `vector` on `peer_id` with a single 32-bit store.
    #[inline]
    pub fn ring(&self, peer_id: u16, vector: u16) {
        self.regs
            .write_u32(IVSHMEM_REG_DOORBELL, doorbell_value(peer_id, vector));
    }
}

#[inline]
pub const fn doorbell_value(peer_id: u16, vector: u16) -> u32 {
    ((peer_id as u32) << 16) | vector as u32
}
